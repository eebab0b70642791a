//! SQLite storage for the operations center.
//!
//! Persists tokens, servers, clusters, generated artifacts and the
//! aggregated inventory. Operations spanning several entities are single
//! methods that open and commit one transaction.

mod db;
pub mod etag;
mod models;
mod queries_clusters;
mod queries_inventory;
mod queries_servers;
mod queries_tokens;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests;

pub use db::{DatabaseError, FleetDatabase};
pub use models::*;
