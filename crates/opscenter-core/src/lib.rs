//! Operations center core library
//!
//! Shared functionality for operations center components:
//! - Configuration file loading and environment overrides
//! - `SQLite` pool helpers and the shared `DatabaseError`
//! - Tracing initialisation
//! - Common error types

pub mod config;
pub mod db;
pub mod error;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
