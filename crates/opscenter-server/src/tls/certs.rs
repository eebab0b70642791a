//! The control plane's own TLS identity and its hot-swappable store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use tokio::sync::watch;
use tracing::info;

use super::config::TlsConfigError;

const CERT_FILE: &str = "server.pem";
const KEY_FILE: &str = "server-key.pem";

/// A parsed certificate chain and private key.
///
/// Holds both the PEM text (returned to registering machines) and the
/// rustls forms used by the listener and outbound clients.
#[derive(Debug)]
pub struct ServerIdentity {
    pub cert_pem: String,
    pub key_pem: String,
    /// SHA-256 of the leaf certificate DER.
    pub fingerprint: String,
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key_der: PrivateKeyDer<'static>,
    pub certified_key: Arc<CertifiedKey>,
}

impl ServerIdentity {
    /// Parse and validate a PEM certificate chain and key.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, TlsConfigError> {
        let cert_chain = CertificateDer::pem_slice_iter(cert_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TlsConfigError::InvalidIdentity(format!("certificate: {e}")))?;
        let Some(leaf) = cert_chain.first() else {
            return Err(TlsConfigError::InvalidIdentity(
                "no certificate in PEM".into(),
            ));
        };
        let fingerprint = opscenter_crypto::der_fingerprint(leaf);

        let key_der = PrivateKeyDer::from_pem_slice(key_pem.as_bytes())
            .map_err(|e| TlsConfigError::InvalidIdentity(format!("private key: {e}")))?;

        let provider = rustls::crypto::ring::default_provider();
        let signing_key = provider
            .key_provider
            .load_private_key(key_der.clone_key())
            .map_err(|e| TlsConfigError::InvalidIdentity(format!("private key: {e}")))?;
        let certified_key = Arc::new(CertifiedKey::new(cert_chain.clone(), signing_key));

        Ok(Self {
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
            fingerprint,
            cert_chain,
            key_der,
            certified_key,
        })
    }
}

/// Where the control plane identity comes from.
#[derive(Debug, Clone)]
pub enum IdentitySource {
    /// Self-signed identity persisted in `dir`, generated on first start.
    Generated {
        dir: PathBuf,
        subject_alt_names: Vec<String>,
    },
    /// User-provided certificate and key files.
    Files { cert_path: PathBuf, key_path: PathBuf },
}

impl IdentitySource {
    pub fn load(&self) -> Result<ServerIdentity, TlsConfigError> {
        match self {
            Self::Generated {
                dir,
                subject_alt_names,
            } => load_or_generate(dir, subject_alt_names),
            Self::Files {
                cert_path,
                key_path,
            } => {
                let cert_pem = read_pem(cert_path)?;
                let key_pem = read_pem(key_path)?;
                info!(
                    cert = %cert_path.display(),
                    key = %key_path.display(),
                    "Loaded TLS identity"
                );
                ServerIdentity::from_pem(&cert_pem, &key_pem)
            }
        }
    }
}

fn read_pem(path: &Path) -> Result<String, TlsConfigError> {
    std::fs::read_to_string(path)
        .map_err(|e| TlsConfigError::FileRead(format!("{}: {e}", path.display())))
}

fn load_or_generate(
    dir: &Path,
    subject_alt_names: &[String],
) -> Result<ServerIdentity, TlsConfigError> {
    let cert_path = dir.join(CERT_FILE);
    let key_path = dir.join(KEY_FILE);
    if cert_path.exists() && key_path.exists() {
        let identity = ServerIdentity::from_pem(&read_pem(&cert_path)?, &read_pem(&key_path)?)?;
        info!(dir = %dir.display(), fingerprint = %identity.fingerprint, "Loaded generated TLS identity");
        return Ok(identity);
    }

    let bundle =
        opscenter_crypto::certs::generate_self_signed_identity("opscenter", subject_alt_names)
            .map_err(|e| TlsConfigError::CertGeneration(e.to_string()))?;

    std::fs::create_dir_all(dir)
        .map_err(|e| TlsConfigError::FileWrite(format!("{}: {e}", dir.display())))?;
    std::fs::write(&cert_path, &bundle.cert_pem)
        .map_err(|e| TlsConfigError::FileWrite(format!("{}: {e}", cert_path.display())))?;
    std::fs::write(&key_path, &bundle.key_pem)
        .map_err(|e| TlsConfigError::FileWrite(format!("{}: {e}", key_path.display())))?;

    // Owner-only access to the private key
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| TlsConfigError::FileWrite(format!("{}: {e}", key_path.display())))?;
    }

    info!(dir = %dir.display(), fingerprint = %bundle.fingerprint, "Generated TLS identity");
    ServerIdentity::from_pem(&bundle.cert_pem, &bundle.key_pem)
}

/// Current control plane identity, observed by the listener and transports.
#[derive(Debug, Clone)]
pub struct CertificateStore {
    tx: Arc<watch::Sender<Arc<ServerIdentity>>>,
}

impl CertificateStore {
    pub fn new(identity: ServerIdentity) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(identity));
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> Arc<ServerIdentity> {
        Arc::clone(&self.tx.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ServerIdentity>> {
        self.tx.subscribe()
    }

    /// Validate and publish a new identity; later handshakes use it.
    pub fn rotate(
        &self,
        cert_pem: &str,
        key_pem: &str,
    ) -> Result<Arc<ServerIdentity>, TlsConfigError> {
        let identity = Arc::new(ServerIdentity::from_pem(cert_pem, key_pem)?);
        self.tx.send_replace(Arc::clone(&identity));
        info!(fingerprint = %identity.fingerprint, "TLS identity rotated");
        Ok(identity)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn generated() -> opscenter_crypto::certs::IdentityBundle {
        opscenter_crypto::certs::generate_self_signed_identity(
            "opscenter-test",
            &["localhost".to_string()],
        )
        .unwrap()
    }

    #[test]
    fn parses_generated_identity() {
        let bundle = generated();
        let identity = ServerIdentity::from_pem(&bundle.cert_pem, &bundle.key_pem).unwrap();
        assert_eq!(identity.fingerprint, bundle.fingerprint);
        assert_eq!(identity.cert_chain.len(), 1);
    }

    #[test]
    fn rejects_garbage() {
        assert!(ServerIdentity::from_pem("nope", "nope").is_err());
    }

    #[test]
    fn rotate_publishes_to_subscribers() {
        let first = generated();
        let store =
            CertificateStore::new(ServerIdentity::from_pem(&first.cert_pem, &first.key_pem).unwrap());
        let rx = store.subscribe();

        let second = generated();
        store.rotate(&second.cert_pem, &second.key_pem).unwrap();

        assert_eq!(rx.borrow().fingerprint, second.fingerprint);
        assert_eq!(store.current().fingerprint, second.fingerprint);
    }

    #[test]
    fn failed_rotate_keeps_current() {
        let first = generated();
        let store =
            CertificateStore::new(ServerIdentity::from_pem(&first.cert_pem, &first.key_pem).unwrap());
        assert!(store.rotate("bad", "bad").is_err());
        assert_eq!(store.current().fingerprint, first.fingerprint);
    }

    #[test]
    fn generated_identity_is_persisted_and_reused() {
        let dir = tempfile::tempdir().unwrap();
        let source = IdentitySource::Generated {
            dir: dir.path().to_path_buf(),
            subject_alt_names: vec!["localhost".into()],
        };

        let first = source.load().unwrap();
        assert!(dir.path().join(CERT_FILE).exists());
        assert!(dir.path().join(KEY_FILE).exists());

        let second = source.load().unwrap();
        assert_eq!(first.fingerprint, second.fingerprint);
    }

    #[test]
    fn missing_files_are_an_error() {
        let source = IdentitySource::Files {
            cert_path: PathBuf::from("/nonexistent/cert.pem"),
            key_path: PathBuf::from("/nonexistent/key.pem"),
        };
        assert!(matches!(source.load(), Err(TlsConfigError::FileRead(_))));
    }

    #[cfg(unix)]
    #[test]
    fn generated_key_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        IdentitySource::Generated {
            dir: dir.path().to_path_buf(),
            subject_alt_names: vec!["localhost".into()],
        }
        .load()
        .unwrap();

        let mode = std::fs::metadata(dir.path().join(KEY_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
