//! Operations center certificate library
//!
//! Certificates are the long-term identity of every machine in the fleet:
//! a server's TLS client certificate is captured once at registration and
//! afterwards matched by fingerprint.
//!
//! - **PEM handling**: parse and validate PEM, encode captured DER as PEM
//! - **Fingerprints**: lower-case hex SHA-256 over the certificate DER
//! - **Identities** (`certs` feature): self-signed TLS identities

#[cfg(feature = "certs")]
pub mod certs;
pub mod error;
pub mod pem;

pub use error::CertError;
pub use pem::{
    certificate_fingerprint, der_fingerprint, der_to_pem, first_certificate_der,
    normalize_fingerprint,
};
