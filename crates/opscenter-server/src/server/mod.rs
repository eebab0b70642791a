//! gRPC services for the operations center.

pub mod cluster_svc;
mod convert;
pub mod interceptor;
pub mod inventory_svc;
pub mod provisioning_svc;
pub mod server_svc;
pub mod token_svc;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub mod test_helpers;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod token_svc_tests;

pub use cluster_svc::ClusterServiceImpl;
pub use interceptor::access_interceptor;
pub use inventory_svc::InventoryServiceImpl;
pub use provisioning_svc::ProvisioningServiceImpl;
pub use server_svc::ServerServiceImpl;
pub use token_svc::TokenServiceImpl;
