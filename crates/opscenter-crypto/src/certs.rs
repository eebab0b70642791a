//! TLS identity generation.
//!
//! The operations center presents one self-signed identity both as its
//! server certificate and as the client certificate handed to machines at
//! registration. Machines trust it by fingerprint, never through a CA.
//!
//! Requires the `certs` feature to be enabled.

use rcgen::{
    CertificateParams, DnType, ExtendedKeyUsagePurpose, KeyPair, KeyUsagePurpose, SanType,
};

use crate::error::CertError;
use crate::pem::certificate_fingerprint;

/// PEM-encoded certificate and private key.
pub struct IdentityBundle {
    /// PEM-encoded certificate.
    pub cert_pem: String,
    /// PEM-encoded PKCS#8 private key.
    pub key_pem: String,
    /// SHA-256 fingerprint of the certificate.
    pub fingerprint: String,
}

/// Generate a self-signed identity usable for both server and client auth.
///
/// `subject_alt_names` may mix DNS names and IP literals.
pub fn generate_self_signed_identity(
    common_name: &str,
    subject_alt_names: &[String],
) -> Result<IdentityBundle, CertError> {
    let mut params = CertificateParams::default();
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    params.subject_alt_names = subject_alt_names
        .iter()
        .map(|name| san_for(name))
        .collect::<Result<_, _>>()?;
    params.key_usages.push(KeyUsagePurpose::DigitalSignature);
    params.key_usages.push(KeyUsagePurpose::KeyEncipherment);
    params
        .extended_key_usages
        .push(ExtendedKeyUsagePurpose::ServerAuth);
    params
        .extended_key_usages
        .push(ExtendedKeyUsagePurpose::ClientAuth);

    let key_pair = KeyPair::generate().map_err(|e| CertError::Generation(e.to_string()))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CertError::Generation(e.to_string()))?;

    let cert_pem = cert.pem();
    let fingerprint = certificate_fingerprint(&cert_pem)?;

    Ok(IdentityBundle {
        cert_pem,
        key_pem: key_pair.serialize_pem(),
        fingerprint,
    })
}

fn san_for(name: &str) -> Result<SanType, CertError> {
    if let Ok(ip) = name.parse() {
        return Ok(SanType::IpAddress(ip));
    }
    let dns = name
        .to_string()
        .try_into()
        .map_err(|e: rcgen::Error| CertError::Generation(e.to_string()))?;
    Ok(SanType::DnsName(dns))
}
