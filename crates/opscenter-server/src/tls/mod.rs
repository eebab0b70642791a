//! TLS identity, listener configuration and accept loops.

pub mod certs;
pub mod config;
pub mod listener;

pub use certs::{CertificateStore, IdentitySource, ServerIdentity};
pub use config::{TlsConfigError, server_config};
pub use listener::{ConnectionInfo, LocalConnection, TlsConnection, tls_incoming, unix_incoming};
