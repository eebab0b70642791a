//! PEM parsing, DER→PEM encoding and certificate fingerprints.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha256};
use x509_parser::pem::parse_x509_pem;

use crate::error::CertError;

const PEM_LINE_WIDTH: usize = 64;

/// Extract and validate the DER of the first certificate in a PEM document.
pub fn first_certificate_der(pem: &str) -> Result<Vec<u8>, CertError> {
    let (_, block) =
        parse_x509_pem(pem.as_bytes()).map_err(|e| CertError::InvalidPem(e.to_string()))?;

    if block.label != "CERTIFICATE" {
        return Err(CertError::InvalidPem(format!(
            "expected CERTIFICATE block, found {}",
            block.label
        )));
    }

    x509_parser::parse_x509_certificate(&block.contents)
        .map_err(|e| CertError::InvalidCertificate(e.to_string()))?;

    Ok(block.contents)
}

/// SHA-256 fingerprint of certificate DER as lower-case hex.
pub fn der_fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

/// SHA-256 fingerprint of the first certificate in a PEM document.
pub fn certificate_fingerprint(pem: &str) -> Result<String, CertError> {
    first_certificate_der(pem).map(|der| der_fingerprint(&der))
}

/// Encode certificate DER as a PEM `CERTIFICATE` block.
pub fn der_to_pem(der: &[u8]) -> String {
    let encoded = STANDARD.encode(der);
    let mut out = String::with_capacity(encoded.len() + encoded.len() / PEM_LINE_WIDTH + 64);
    out.push_str("-----BEGIN CERTIFICATE-----\n");
    for line in encoded.as_bytes().chunks(PEM_LINE_WIDTH) {
        // base64 output is ASCII
        out.push_str(&String::from_utf8_lossy(line));
        out.push('\n');
    }
    out.push_str("-----END CERTIFICATE-----\n");
    out
}

/// Canonical form for operator-supplied fingerprints: lower-case hex, no
/// separators.
pub fn normalize_fingerprint(fingerprint: &str) -> String {
    fingerprint
        .chars()
        .filter(char::is_ascii_hexdigit)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn self_signed_pem(cn: &str) -> String {
        let key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::new(vec![cn.to_string()]).unwrap();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, cn);
        params.self_signed(&key).unwrap().pem()
    }

    #[test]
    fn der_round_trips_through_pem() {
        let pem = self_signed_pem("machine-a");
        let der = first_certificate_der(&pem).unwrap();
        let reencoded = der_to_pem(&der);
        assert_eq!(first_certificate_der(&reencoded).unwrap(), der);
    }

    #[test]
    fn fingerprint_is_stable_and_distinct() {
        let a = self_signed_pem("machine-a");
        let b = self_signed_pem("machine-b");

        let fa = certificate_fingerprint(&a).unwrap();
        assert_eq!(fa, certificate_fingerprint(&a).unwrap());
        assert_ne!(fa, certificate_fingerprint(&b).unwrap());
        assert_eq!(fa.len(), 64);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            first_certificate_der("not a certificate"),
            Err(CertError::InvalidPem(_))
        ));
    }

    #[test]
    fn private_key_block_is_rejected() {
        let key = rcgen::KeyPair::generate().unwrap();
        assert!(first_certificate_der(&key.serialize_pem()).is_err());
    }

    #[test]
    fn normalize_strips_separators() {
        assert_eq!(normalize_fingerprint("AB:cd:01"), "abcd01");
    }
}
