//! Shared HTTPS plumbing for the reference adapters.
//!
//! Every request is made with a client that presents the operations center
//! identity and accepts exactly one peer certificate, the one captured for
//! that machine or cluster. There is no CA chain in the fleet.

use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};

use super::TransportError;
use crate::tls::CertificateStore;

/// Accepts the handshake only if the leaf matches the pinned DER.
#[derive(Debug)]
struct PinnedCertVerifier {
    pinned: Vec<u8>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if end_entity.as_ref() == self.pinned.as_slice() {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(
                "peer certificate does not match pinned certificate".into(),
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Builds per-peer HTTPS clients.
#[derive(Clone)]
pub(super) struct PinnedClients {
    identity: CertificateStore,
    timeout: Duration,
}

impl PinnedClients {
    pub(super) fn new(identity: CertificateStore, timeout: Duration) -> Self {
        // reqwest is built with rustls-no-provider; Err means already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();
        Self { identity, timeout }
    }

    pub(super) const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// A client that trusts only `peer_certificate_pem`.
    pub(super) fn client_for(
        &self,
        peer_certificate_pem: &str,
    ) -> Result<reqwest::Client, TransportError> {
        let pinned = opscenter_crypto::first_certificate_der(peer_certificate_pem)
            .map_err(|e| TransportError::Rejected(format!("pinned certificate: {e}")))?;
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let identity = self.identity.current();

        let mut tls = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| TransportError::Rejected(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(PinnedCertVerifier { pinned, provider }))
            .with_client_auth_cert(identity.cert_chain.clone(), identity.key_der.clone_key())
            .map_err(|e| TransportError::Rejected(format!("client identity: {e}")))?;
        tls.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .timeout(self.timeout)
            .build()
            .map_err(|e| TransportError::Rejected(e.to_string()))
    }
}

/// Join a base URL and an absolute API path.
pub(super) fn join_url(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}

/// Classify a reqwest failure.
pub(super) fn send_error(err: &reqwest::Error, timeout: Duration) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(timeout)
    } else if err.is_connect() || err.is_request() {
        TransportError::Unreachable(err.to_string())
    } else {
        TransportError::Rejected(err.to_string())
    }
}

/// Map a non-success status to `Rejected`.
pub(super) fn check_status(resp: &reqwest::Response) -> Result<(), TransportError> {
    let status = resp.status();
    if !status.is_success() {
        return Err(TransportError::Rejected(format!(
            "{} {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or("Unknown")
        )));
    }
    Ok(())
}
