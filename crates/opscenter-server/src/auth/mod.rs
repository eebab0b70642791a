//! Access control for the administrative API.
//!
//! Provides the authentication chain, the authorizer and bearer token
//! management.

pub mod access;
pub mod claims;
pub mod jwt;

pub use access::{AccessControl, Authenticator, Entitlement, Identity, check_permission};
pub use claims::{Claims, Role};
pub use jwt::JwtManager;
