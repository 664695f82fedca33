//! TLS material shared by the proxies and the signaling uplink.
//!
//! Peers in the overlay are authenticated by membership of the certificate
//! tree, not by DNS identity: a peer is trusted iff its certificate chains
//! to one of our trust anchors (the parent's certificate plus our own).
//! Non-root certificates deliberately carry no host names or IP SANs, so
//! WebPKI host matching can never apply here; instead both directions use a
//! custom verifier that delegates chain validation to an OpenSSL
//! certificate store built from the anchors.
//!
//! Client certificates on the remote proxy are requested but not required;
//! connections without one are dealt with at the request layer.

use anyhow::{anyhow, Context, Result};
use openssl::stack::Stack;
use openssl::x509::store::{X509Store, X509StoreBuilder};
use openssl::x509::verify::X509VerifyFlags;
use openssl::x509::{X509StoreContext, X509};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs1KeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, DistinguishedName, Error as TlsError,
    ServerConfig, SignatureScheme,
};
use std::fmt;
use std::sync::Arc;

use crate::keystore::Keystore;

/// Certificate verifier that accepts any peer whose certificate chains to
/// one of this node's trust anchors. Used both for outbound connections
/// (validating the upstream peer) and inbound mTLS (validating children).
pub struct TrustAnchorVerifier {
    store: X509Store,
    subjects: Vec<DistinguishedName>,
    algs: WebPkiSupportedAlgorithms,
}

impl fmt::Debug for TrustAnchorVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustAnchorVerifier")
            .field("anchors", &self.subjects.len())
            .finish()
    }
}

impl TrustAnchorVerifier {
    pub fn new(anchors: &[X509]) -> Result<Self> {
        let mut builder = X509StoreBuilder::new().context("Failed to create X509 store")?;
        let mut subjects = Vec::with_capacity(anchors.len());
        for anchor in anchors {
            subjects.push(DistinguishedName::from(
                anchor
                    .subject_name()
                    .to_der()
                    .context("Failed to encode anchor subject")?,
            ));
            builder
                .add_cert(anchor.clone())
                .context("Failed to add trust anchor to store")?;
        }
        // Anchors are trusted directly, whether or not they are self-signed
        // roots; interior masters hand their own certificate to their
        // children, not the whole chain up to the root.
        builder
            .set_flags(X509VerifyFlags::PARTIAL_CHAIN)
            .context("Failed to configure trust store")?;
        Ok(Self {
            store: builder.build(),
            subjects,
            algs: default_provider().signature_verification_algorithms,
        })
    }

    fn verify_chain(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
    ) -> Result<(), TlsError> {
        let leaf = X509::from_der(end_entity.as_ref())
            .map_err(|_| TlsError::InvalidCertificate(CertificateError::BadEncoding))?;
        let mut chain = Stack::new()
            .map_err(|e| TlsError::General(format!("Unable to allocate cert stack: {}", e)))?;
        for der in intermediates {
            let cert = X509::from_der(der.as_ref())
                .map_err(|_| TlsError::InvalidCertificate(CertificateError::BadEncoding))?;
            chain
                .push(cert)
                .map_err(|e| TlsError::General(format!("Unable to build cert stack: {}", e)))?;
        }

        let mut context = X509StoreContext::new()
            .map_err(|e| TlsError::General(format!("Unable to create verify context: {}", e)))?;
        let verify_error = context
            .init(&self.store, &leaf, &chain, |c| {
                if c.verify_cert()? {
                    Ok(None)
                } else {
                    Ok(Some(c.error()))
                }
            })
            .map_err(|e| TlsError::General(format!("Certificate verification failed: {}", e)))?;

        match verify_error {
            None => Ok(()),
            Some(e) => {
                tracing::debug!("Peer certificate rejected: {}", e.error_string());
                Err(TlsError::InvalidCertificate(CertificateError::UnknownIssuer))
            }
        }
    }
}

impl ServerCertVerifier for TrustAnchorVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        self.verify_chain(end_entity, intermediates)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls12_signature(message, cert, dss, &self.algs)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls13_signature(message, cert, dss, &self.algs)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algs.supported_schemes()
    }
}

impl ClientCertVerifier for TrustAnchorVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &self.subjects
    }

    fn client_auth_mandatory(&self) -> bool {
        // request, not require: peers without a certificate are rejected at
        // the request layer, not during the handshake
        false
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, TlsError> {
        self.verify_chain(end_entity, intermediates)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls12_signature(message, cert, dss, &self.algs)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls13_signature(message, cert, dss, &self.algs)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algs.supported_schemes()
    }
}

/// Client configuration for the local proxy's upstream connections: our
/// leaf certificate for client auth, trust anchors for server validation.
pub fn proxy_client_config(keystore: &Keystore) -> Result<ClientConfig> {
    install_provider();
    let verifier = Arc::new(TrustAnchorVerifier::new(&keystore.trust_anchors())?);
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(own_cert_chain(keystore)?, own_private_key(keystore)?)
        .context("Unable to load our key pair for client auth")?;
    Ok(config)
}

/// Client configuration for the signaling uplink: trust anchors only, no
/// client certificate.
pub fn uplink_client_config(keystore: &Keystore) -> Result<ClientConfig> {
    install_provider();
    let verifier = Arc::new(TrustAnchorVerifier::new(&keystore.trust_anchors())?);
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    Ok(config)
}

/// Server configuration for the remote proxy: our leaf certificate,
/// client certificates requested and validated against the trust anchors.
pub fn proxy_server_config(keystore: &Keystore) -> Result<ServerConfig> {
    install_provider();
    let verifier = Arc::new(TrustAnchorVerifier::new(&keystore.trust_anchors())?);
    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(own_cert_chain(keystore)?, own_private_key(keystore)?)
        .context("Unable to load our key pair for the remote proxy")?;
    Ok(config)
}

fn own_cert_chain(keystore: &Keystore) -> Result<Vec<CertificateDer<'static>>> {
    let cert = keystore
        .certificate()
        .ok_or_else(|| anyhow!("No certificate available yet"))?;
    Ok(vec![CertificateDer::from(
        cert.to_der().context("Unable to DER-encode our certificate")?,
    )])
}

fn own_private_key(keystore: &Keystore) -> Result<PrivateKeyDer<'static>> {
    let der = keystore
        .private_key()
        .rsa()
        .context("Our private key is not RSA")?
        .private_key_to_der()
        .context("Unable to DER-encode our private key")?;
    Ok(PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(der)))
}

fn default_provider() -> rustls::crypto::CryptoProvider {
    rustls::crypto::ring::default_provider()
}

/// Make ring the process-default provider; harmless if already installed.
fn install_provider() {
    let _ = default_provider().install_default();
}
