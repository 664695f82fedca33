//! Key and certificate management for this node.
//!
//! Covers generating the node key pair, persisting it to disk, obtaining and
//! persisting the node certificate, the trust anchors used to validate peers,
//! and encrypting/decrypting small strings under the node key.
//!
//! Keys and certificates live in `<config_dir>/keys`:
//!
//! ```text
//! own/
//!     privatekey.pem   (our private key, PKCS#1)
//!     certificate.pem  (our certificate)
//! trusted/
//!     parentcert.pem   (our parent's certificate)
//! ```
//!
//! Any of these can be prepopulated. For child nodes `parentcert.pem` *must*
//! be prepopulated - that part of the exchange happens out of band (for
//! example via email). The private key and certificate are generated or
//! requested from the parent as necessary.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use openssl::pkey::{HasPublic, PKey, Private};
use openssl::rsa::{Padding, Rsa};
use openssl::x509::X509;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::certgen::LeafCertificateBuilder;

const KEY_BITS: u32 = 2048;

/// Errors surfaced by the keystore. The key-generation and persistence kinds
/// are fatal at startup; decryption failures are surfaced to the caller.
#[derive(Debug, Error)]
pub enum KeystoreError {
    #[error("Failed to generate private key: {0}")]
    KeyGenFailed(String),
    #[error("Unable to persist certificate: {0}")]
    CertPersistFailed(String),
    #[error("Unable to request certificate from parent: {0}")]
    CertRequestFailed(String),
    #[error("Unable to read parent certificate file from disk: {0}")]
    ParentAnchorMissing(String),
    #[error("Unable to encrypt value: {0}")]
    EncryptFailed(String),
    #[error("Unable to decrypt value: {0}")]
    DecryptFailed(String),
}

struct CertSlot {
    certificate: Option<X509>,
    waiters: Vec<oneshot::Sender<X509>>,
}

/// Persistent key pair and certificate for this node, plus the set of
/// certificates we accept as authoritative peers.
///
/// The private key is immutable after open. The certificate slot starts
/// empty on first run and is filled exactly once by [`install_certificate`];
/// callers that need the certificate before it exists wait on
/// [`wait_for_certificate`].
///
/// [`install_certificate`]: Keystore::install_certificate
/// [`wait_for_certificate`]: Keystore::wait_for_certificate
pub struct Keystore {
    private_key: PKey<Private>,
    private_key_file: PathBuf,
    certificate_file: PathBuf,
    cert: Mutex<CertSlot>,
    anchors: RwLock<Vec<X509>>,
}

impl Keystore {
    /// Load (or create) this node's keys under `<config_dir>/keys`.
    ///
    /// Non-root nodes must have a parent certificate at
    /// `keys/trusted/parentcert.pem`; its absence is fatal. The node's own
    /// certificate is loaded if present; otherwise the slot stays empty
    /// until the composition root installs one.
    pub fn open(config_dir: &Path, is_root: bool) -> Result<Self> {
        info!("Configuring keys");
        let own_dir = config_dir.join("keys").join("own");
        let trusted_dir = config_dir.join("keys").join("trusted");
        fs::create_dir_all(&own_dir)
            .with_context(|| format!("Unable to create directory {}", own_dir.display()))?;
        fs::create_dir_all(&trusted_dir)
            .with_context(|| format!("Unable to create directory {}", trusted_dir.display()))?;

        let private_key_file = own_dir.join("privatekey.pem");
        let certificate_file = own_dir.join("certificate.pem");
        let parent_cert_file = trusted_dir.join("parentcert.pem");

        let private_key = load_or_create_private_key(&private_key_file)?;

        let mut anchors = Vec::new();
        if !is_root {
            let parent = load_parent_cert(&parent_cert_file)?;
            info!("Added trusted parent cert");
            anchors.push(parent);
        }

        let keystore = Self {
            private_key,
            private_key_file,
            certificate_file,
            cert: Mutex::new(CertSlot {
                certificate: None,
                waiters: Vec::new(),
            }),
            anchors: RwLock::new(anchors),
        };

        if let Some(cert) = keystore.load_certificate_from_disk() {
            keystore.adopt_certificate(cert);
        }

        Ok(keystore)
    }

    /// This node's private key.
    pub fn private_key(&self) -> &PKey<Private> {
        &self.private_key
    }

    /// DER-encoded PKIX (SubjectPublicKeyInfo) form of our public key, the
    /// body of a certificate request to the parent.
    pub fn public_key_pkix_der(&self) -> Result<Vec<u8>> {
        self.private_key
            .public_key_to_der()
            .context("Unable to get DER encoded bytes for public key")
    }

    /// Path of the certificate PEM on disk.
    pub fn certificate_file(&self) -> &Path {
        &self.certificate_file
    }

    /// Path of the private key PEM on disk.
    pub fn private_key_file(&self) -> &Path {
        &self.private_key_file
    }

    /// Our certificate, if it has been loaded or installed.
    pub fn certificate(&self) -> Option<X509> {
        let slot = self.cert.lock().unwrap_or_else(|e| e.into_inner());
        slot.certificate.clone()
    }

    /// Wait until the certificate is available. Waiters registered before
    /// [`install_certificate`](Self::install_certificate) resolve when it
    /// runs; later callers resolve immediately.
    pub async fn wait_for_certificate(&self) -> Result<X509> {
        let rx = {
            let mut slot = self.cert.lock().unwrap_or_else(|e| e.into_inner());
            match &slot.certificate {
                Some(cert) => return Ok(cert.clone()),
                None => {
                    let (tx, rx) = oneshot::channel();
                    slot.waiters.push(tx);
                    rx
                }
            }
        };
        rx.await.context("Keystore closed before a certificate was installed")
    }

    /// Persist the given DER certificate as our own, add it to the trust
    /// anchors and resolve every waiter.
    pub fn install_certificate(&self, der: &[u8]) -> Result<X509, KeystoreError> {
        let cert = X509::from_der(der)
            .map_err(|e| KeystoreError::CertPersistFailed(format!("not a DER certificate: {}", e)))?;
        let pem = cert
            .to_pem()
            .map_err(|e| KeystoreError::CertPersistFailed(e.to_string()))?;
        fs::write(&self.certificate_file, pem)
            .map_err(|e| KeystoreError::CertPersistFailed(e.to_string()))?;
        info!("Wrote certificate to {}", self.certificate_file.display());

        self.adopt_certificate(cert.clone());
        Ok(cert)
    }

    /// Generate a self-signed certificate for this node (root nodes only).
    pub fn self_signed_certificate_der(&self) -> Result<Vec<u8>> {
        self.certificate_for_public_key("", self.private_key.clone())
    }

    /// Create a certificate for the given public key, signed by us. The
    /// email is encrypted under our own public key and stored as the CN so
    /// that we can associate the certificate with the email address later,
    /// without exposing it to other clients.
    pub fn certificate_for_public_key<T: HasPublic>(
        &self,
        email: &str,
        public_key: PKey<T>,
    ) -> Result<Vec<u8>> {
        let mut builder = LeafCertificateBuilder::new(self.private_key.clone(), public_key)
            .email(email.to_string());
        if let Some(cert) = self.certificate() {
            builder = builder.issued_by(cert);
        }
        builder.build()
    }

    /// Encrypt the given string under our own public key, base64-encoded.
    pub fn encrypt(&self, value: &str) -> Result<String, KeystoreError> {
        encrypt_with_key(&self.private_key, value)
            .map_err(|e| KeystoreError::EncryptFailed(e.to_string()))
    }

    /// Decrypt a base64-encoded string previously encrypted with
    /// [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, value: &str) -> Result<String, KeystoreError> {
        decrypt_with_key(&self.private_key, value)
    }

    /// Certificates we accept as authoritative peers: the parent's anchor
    /// plus, once loaded, our own certificate (so certs we issued validate).
    pub fn trust_anchors(&self) -> Vec<X509> {
        self.anchors.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn adopt_certificate(&self, cert: X509) {
        // Add ourselves to the trust store
        self.anchors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(cert.clone());

        let waiters = {
            let mut slot = self.cert.lock().unwrap_or_else(|e| e.into_inner());
            slot.certificate = Some(cert.clone());
            std::mem::take(&mut slot.waiters)
        };
        for waiter in waiters {
            // A dropped waiter just means the task stopped caring.
            let _ = waiter.send(cert.clone());
        }
    }

    fn load_certificate_from_disk(&self) -> Option<X509> {
        match fs::read(&self.certificate_file) {
            Err(e) => {
                info!("Unable to read certificate file from disk: {}", e);
                None
            }
            Ok(data) => match X509::from_pem(&data) {
                Err(e) => {
                    warn!("Unable to decode PEM encoded certificate: {}", e);
                    None
                }
                Ok(cert) => {
                    info!("Read certificate");
                    Some(cert)
                }
            },
        }
    }
}

/// Load the private key from disk, generating and persisting a fresh one on
/// any read or parse failure.
fn load_or_create_private_key(path: &Path) -> Result<PKey<Private>, KeystoreError> {
    match fs::read(path) {
        Err(_) => {
            info!("Unable to read private key file from disk, creating");
            create_private_key(path)
        }
        Ok(data) => match Rsa::private_key_from_pem(&data) {
            Err(_) => {
                info!("Unable to decode PEM encoded private key data, creating");
                create_private_key(path)
            }
            Ok(rsa) => {
                info!("Read private key");
                PKey::from_rsa(rsa).map_err(|e| KeystoreError::KeyGenFailed(e.to_string()))
            }
        },
    }
}

fn create_private_key(path: &Path) -> Result<PKey<Private>, KeystoreError> {
    let rsa = Rsa::generate(KEY_BITS).map_err(|e| KeystoreError::KeyGenFailed(e.to_string()))?;
    let pem = rsa
        .private_key_to_pem()
        .map_err(|e| KeystoreError::KeyGenFailed(e.to_string()))?;
    fs::write(path, pem).map_err(|e| {
        KeystoreError::KeyGenFailed(format!("failed to write {}: {}", path.display(), e))
    })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .map_err(|e| KeystoreError::KeyGenFailed(e.to_string()))?;
    }
    info!("Wrote private key to {}", path.display());
    PKey::from_rsa(rsa).map_err(|e| KeystoreError::KeyGenFailed(e.to_string()))
}

fn load_parent_cert(path: &Path) -> Result<X509, KeystoreError> {
    let data =
        fs::read(path).map_err(|e| KeystoreError::ParentAnchorMissing(format!("{}: {}", path.display(), e)))?;
    X509::from_pem(&data).map_err(|e| KeystoreError::ParentAnchorMissing(e.to_string()))
}

/// PKCS#1 v1.5 RSA-encrypt `value` under the public half of `key`,
/// base64-encoding the result.
pub(crate) fn encrypt_with_key(
    key: &PKey<Private>,
    value: &str,
) -> Result<String, openssl::error::ErrorStack> {
    let rsa = key.rsa()?;
    let mut ciphertext = vec![0u8; rsa.size() as usize];
    let len = rsa.public_encrypt(value.as_bytes(), &mut ciphertext, Padding::PKCS1)?;
    ciphertext.truncate(len);
    Ok(BASE64.encode(ciphertext))
}

/// Inverse of [`encrypt_with_key`].
pub(crate) fn decrypt_with_key(key: &PKey<Private>, value: &str) -> Result<String, KeystoreError> {
    let ciphertext = BASE64
        .decode(value)
        .map_err(|e| KeystoreError::DecryptFailed(e.to_string()))?;
    let rsa = key.rsa().map_err(|e| KeystoreError::DecryptFailed(e.to_string()))?;
    let mut plaintext = vec![0u8; rsa.size() as usize];
    let len = rsa
        .private_decrypt(&ciphertext, &mut plaintext, Padding::PKCS1)
        .map_err(|e| KeystoreError::DecryptFailed(e.to_string()))?;
    plaintext.truncate(len);
    String::from_utf8(plaintext).map_err(|e| KeystoreError::DecryptFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn root_keystore() -> (TempDir, Keystore) {
        let dir = TempDir::new().unwrap();
        let keystore = Keystore::open(dir.path(), true).unwrap();
        (dir, keystore)
    }

    #[test]
    fn test_generates_and_reloads_private_key() {
        let dir = TempDir::new().unwrap();
        let first = Keystore::open(dir.path(), true).unwrap();
        assert!(dir.path().join("keys/own/privatekey.pem").exists());

        let second = Keystore::open(dir.path(), true).unwrap();
        assert_eq!(
            first.private_key().public_key_to_der().unwrap(),
            second.private_key().public_key_to_der().unwrap()
        );
    }

    #[test]
    fn test_regenerates_on_garbage_key_file() {
        let dir = TempDir::new().unwrap();
        let key_file = dir.path().join("keys/own/privatekey.pem");
        fs::create_dir_all(key_file.parent().unwrap()).unwrap();
        fs::write(&key_file, b"not a pem").unwrap();

        let keystore = Keystore::open(dir.path(), true).unwrap();
        // the garbage was overwritten with a loadable key
        let data = fs::read(&key_file).unwrap();
        assert!(Rsa::private_key_from_pem(&data).is_ok());
        drop(keystore);
    }

    #[test]
    fn test_parent_anchor_required_for_child() {
        let dir = TempDir::new().unwrap();
        assert!(Keystore::open(dir.path(), false).is_err());
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let (_dir, keystore) = root_keystore();
        for value in ["", "a@example.org", "üñïçødé"] {
            let encrypted = keystore.encrypt(value).unwrap();
            assert_eq!(keystore.decrypt(&encrypted).unwrap(), value);
        }
    }

    #[test]
    fn test_decrypt_rejects_garbage() {
        let (_dir, keystore) = root_keystore();
        assert!(matches!(
            keystore.decrypt("!!! not base64 !!!"),
            Err(KeystoreError::DecryptFailed(_))
        ));
        assert!(matches!(
            keystore.decrypt(&BASE64.encode(b"short")),
            Err(KeystoreError::DecryptFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_install_resolves_waiters_and_extends_anchors() {
        let (dir, keystore) = root_keystore();
        assert!(keystore.certificate().is_none());
        assert!(keystore.trust_anchors().is_empty());

        let der = keystore.self_signed_certificate_der().unwrap();
        let installed = keystore.install_certificate(&der).unwrap();
        assert!(dir.path().join("keys/own/certificate.pem").exists());
        assert_eq!(keystore.trust_anchors().len(), 1);

        // late waiter resolves immediately from the slot
        let cert = keystore.wait_for_certificate().await.unwrap();
        assert_eq!(cert.to_der().unwrap(), installed.to_der().unwrap());

        // a reopened keystore picks the certificate up from disk
        drop(keystore);
        let reopened = Keystore::open(dir.path(), true).unwrap();
        assert!(reopened.certificate().is_some());
        assert_eq!(reopened.trust_anchors().len(), 1);
    }
}
