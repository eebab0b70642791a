//! Certificate error types.

/// Errors from certificate parsing and generation.
#[derive(Debug, thiserror::Error)]
pub enum CertError {
    #[error("Invalid PEM: {0}")]
    InvalidPem(String),

    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("Certificate generation error: {0}")]
    Generation(String),
}
