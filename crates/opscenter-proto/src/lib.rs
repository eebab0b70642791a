//! Operations center Protocol Buffers
//!
//! Generated protobuf code for the operations center gRPC API.
//!
//! This crate contains:
//! - `TokenService`, `ServerService`, `ClusterService` for operators
//! - `ProvisioningService` for machines registering and updating themselves
//! - `InventoryService` for querying the aggregated cluster inventory

#![allow(clippy::derive_partial_eq_without_eq)]

/// Operations center v1 API definitions.
///
/// All generated types and services are included here.
pub mod v1 {
    tonic::include_proto!("opscenter.v1");
}

// Re-export v1 as the default API version for convenience
pub use v1::*;

// Re-export prost_types for downstream crates that need Timestamp conversion
pub use prost_types;
