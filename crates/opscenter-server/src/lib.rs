//! Operations Center Library
//!
//! Control plane for a fleet of machines:
//! - SQLite storage for tokens, servers, clusters, artifacts and inventory
//! - Token redemption, server registration and cluster formation
//! - Background reconciliation (probes, config push, inventory resync)
//! - gRPC services behind an access-control interceptor
//! - TLS listener with hot-swappable identity and client cert capture

pub mod auth;
pub mod config_store;
pub mod error;
pub mod ports;
pub mod provisioning;
pub mod scheduler;
pub mod server;
pub mod storage;
pub mod tls;
