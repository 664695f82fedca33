//! Leaf Certificate Generation
//!
//! Builds the X.509 certificates that tie nodes into the overlay's trust
//! tree. Parents sign certificates for their children; root nodes self-sign.
//!
//! # Certificate Properties
//! - **Subject CN**: the holder's email address, encrypted under the
//!   *issuer's* public key and base64-encoded, so only the issuer can
//!   associate the certificate with an email address
//! - **Organization**: `"Lantern Network"`
//! - **Validity**: one week in the past through two weeks in the future
//! - **Key Usage**: keyEncipherment, digitalSignature, keyCertSign
//! - **Extended Key Usage**: serverAuth
//! - **Basic Constraints**: CA=true (children issue to their own children)
//! - **Serial Number**: random 128-bit number
//! - **Version**: X.509v3, SHA-256 signature
//!
//! Self-signed (root) certificates additionally carry the loopback IP as a
//! subject alternative name; child certificates carry no IP SAN.

use anyhow::{anyhow, Result};
use openssl::asn1::{Asn1Time, Asn1Type};
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkey::{HasPublic, PKey, Private};
use openssl::x509::extension::{BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName};
use openssl::x509::{X509Name, X509};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::keystore;

const X509_VERSION_3: i32 = 2; // X509 version 3 is represented by 2
const ORGANIZATION: &str = "Lantern Network";
const ONE_WEEK_SECS: i64 = 7 * 24 * 60 * 60;
const TWO_WEEKS_SECS: i64 = 2 * ONE_WEEK_SECS;

/// Builder for leaf certificates signed with this node's private key.
///
/// Two modes:
/// - `issued_by(cert)` - sign a child certificate, issuer taken from our
///   own certificate
/// - no issuer - self-sign (root nodes), binding the loopback IP
///
/// # Example
/// ```rust,no_run
/// # use anyhow::Result;
/// # use openssl::pkey::PKey;
/// # use openssl::x509::X509;
/// # use lantern::certgen::LeafCertificateBuilder;
/// # fn example(our_key: PKey<openssl::pkey::Private>, our_cert: X509,
/// #            child_key: PKey<openssl::pkey::Public>) -> Result<()> {
/// let der = LeafCertificateBuilder::new(our_key, child_key)
///     .email("user@example.org".to_string())
///     .issued_by(our_cert)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct LeafCertificateBuilder<T: HasPublic> {
    email: String,
    subject_key: PKey<T>,
    signing_key: PKey<Private>,
    issuer_cert: Option<X509>,
}

impl<T: HasPublic> LeafCertificateBuilder<T> {
    /// Create a builder signing `subject_key` with `signing_key`.
    pub fn new(signing_key: PKey<Private>, subject_key: PKey<T>) -> Self {
        Self {
            email: String::new(),
            subject_key,
            signing_key,
            issuer_cert: None,
        }
    }

    /// Set the email address of the certificate holder (empty for nodes not
    /// bound to a user identity).
    pub fn email(mut self, email: String) -> Self {
        self.email = email;
        self
    }

    /// Use the given certificate as the issuer. Without this the
    /// certificate is self-signed and carries the loopback IP SAN.
    pub fn issued_by(mut self, issuer_cert: X509) -> Self {
        self.issuer_cert = Some(issuer_cert);
        self
    }

    /// Build the certificate, returning its DER bytes.
    pub fn build(self) -> Result<Vec<u8>> {
        let mut builder =
            X509::builder().map_err(|e| anyhow!("Failed to create X509 builder: {}", e))?;

        builder
            .set_version(X509_VERSION_3)
            .map_err(|e| anyhow!("Failed to set version: {}", e))?;

        // Generate random 128-bit (16-byte) serial number
        let mut serial = BigNum::new()?;
        serial.rand(128, MsbOption::MAYBE_ZERO, false)?;
        let asn1_serial = serial.to_asn1_integer()?;
        builder.set_serial_number(&asn1_serial)?;

        // The CN is an RSA block in base64, longer than the 64-character
        // directory-string bound, so the entry type has to be set explicitly.
        let encrypted_email = keystore::encrypt_with_key(&self.signing_key, &self.email)
            .map_err(|e| anyhow!("Failed to encrypt email for CN: {}", e))?;
        let mut name_builder =
            X509Name::builder().map_err(|e| anyhow!("Failed to create name builder: {}", e))?;
        name_builder
            .append_entry_by_nid_with_type(
                openssl::nid::Nid::COMMONNAME,
                &encrypted_email,
                Asn1Type::UTF8STRING,
            )
            .map_err(|e| anyhow!("Failed to set CN: {}", e))?;
        name_builder
            .append_entry_by_nid(openssl::nid::Nid::ORGANIZATIONNAME, ORGANIZATION)
            .map_err(|e| anyhow!("Failed to set organization: {}", e))?;
        let subject_name = name_builder.build();

        builder
            .set_subject_name(&subject_name)
            .map_err(|e| anyhow!("Failed to set subject: {}", e))?;

        match &self.issuer_cert {
            Some(issuer) => builder
                .set_issuer_name(issuer.subject_name())
                .map_err(|e| anyhow!("Failed to set issuer: {}", e))?,
            None => builder
                .set_issuer_name(&subject_name)
                .map_err(|e| anyhow!("Failed to set issuer: {}", e))?,
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| anyhow!("System clock before Unix epoch: {}", e))?
            .as_secs() as i64;
        let not_before = Asn1Time::from_unix(now - ONE_WEEK_SECS)
            .map_err(|e| anyhow!("Failed to create not_before: {}", e))?;
        builder
            .set_not_before(&not_before)
            .map_err(|e| anyhow!("Failed to set not_before: {}", e))?;
        let not_after = Asn1Time::from_unix(now + TWO_WEEKS_SECS)
            .map_err(|e| anyhow!("Failed to create not_after: {}", e))?;
        builder
            .set_not_after(&not_after)
            .map_err(|e| anyhow!("Failed to set not_after: {}", e))?;

        builder
            .set_pubkey(&self.subject_key)
            .map_err(|e| anyhow!("Failed to set public key: {}", e))?;

        let mut bc = BasicConstraints::new();
        bc.critical().ca();
        let bc_extension = bc
            .build()
            .map_err(|e| anyhow!("Failed to build BasicConstraints: {}", e))?;
        builder
            .append_extension(bc_extension)
            .map_err(|e| anyhow!("Failed to add BasicConstraints: {}", e))?;

        let mut ku = KeyUsage::new();
        ku.critical();
        ku.key_encipherment();
        ku.digital_signature();
        ku.key_cert_sign();
        let ku_extension = ku
            .build()
            .map_err(|e| anyhow!("Failed to build KeyUsage: {}", e))?;
        builder
            .append_extension(ku_extension)
            .map_err(|e| anyhow!("Failed to add KeyUsage: {}", e))?;

        let eku_extension = ExtendedKeyUsage::new()
            .server_auth()
            .build()
            .map_err(|e| anyhow!("Failed to build ExtendedKeyUsage: {}", e))?;
        builder
            .append_extension(eku_extension)
            .map_err(|e| anyhow!("Failed to add ExtendedKeyUsage: {}", e))?;

        // Self-signed certificates bind the host's loopback address
        if self.issuer_cert.is_none() {
            let san_extension = SubjectAlternativeName::new()
                .ip("127.0.0.1")
                .build(&builder.x509v3_context(None, None))
                .map_err(|e| anyhow!("Failed to build SubjectAlternativeName: {}", e))?;
            builder
                .append_extension(san_extension)
                .map_err(|e| anyhow!("Failed to add SubjectAlternativeName: {}", e))?;
        }

        builder
            .sign(&self.signing_key, MessageDigest::sha256())
            .map_err(|e| anyhow!("Failed to sign certificate: {}", e))?;

        let x509 = builder.build();
        x509.to_der()
            .map_err(|e| anyhow!("Failed to DER-encode certificate: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::decrypt_with_key;
    use openssl::rsa::Rsa;

    fn test_key() -> PKey<Private> {
        PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap()
    }

    #[test]
    fn test_self_signed_shape() {
        let key = test_key();
        let der = LeafCertificateBuilder::new(key.clone(), key.clone())
            .build()
            .unwrap();
        let cert = X509::from_der(&der).unwrap();

        let org = cert
            .subject_name()
            .entries_by_nid(openssl::nid::Nid::ORGANIZATIONNAME)
            .next()
            .unwrap();
        assert_eq!(org.data().as_utf8().unwrap().to_string(), "Lantern Network");
        // self-signed: issuer equals subject
        assert_eq!(
            cert.issuer_name().to_der().unwrap(),
            cert.subject_name().to_der().unwrap()
        );
        // loopback SAN present
        let sans = cert.subject_alt_names().unwrap();
        assert!(sans.iter().any(|san| san.ipaddress() == Some(&[127, 0, 0, 1][..])));
        // signature verifies under the signer's own key
        assert!(cert.verify(&key).unwrap());
    }

    #[test]
    fn test_child_cn_decrypts_under_issuer_key() {
        let issuer_key = test_key();
        let issuer_der = LeafCertificateBuilder::new(issuer_key.clone(), issuer_key.clone())
            .build()
            .unwrap();
        let issuer_cert = X509::from_der(&issuer_der).unwrap();

        let child_key = test_key();
        let der = LeafCertificateBuilder::new(issuer_key.clone(), child_key)
            .email("u@example.org".to_string())
            .issued_by(issuer_cert)
            .build()
            .unwrap();
        let cert = X509::from_der(&der).unwrap();

        let cn = cert
            .subject_name()
            .entries_by_nid(openssl::nid::Nid::COMMONNAME)
            .next()
            .unwrap()
            .data()
            .as_utf8()
            .unwrap()
            .to_string();
        assert_eq!(decrypt_with_key(&issuer_key, &cn).unwrap(), "u@example.org");
        // child certificates carry no IP SAN
        assert!(cert.subject_alt_names().is_none());
    }

    #[test]
    fn test_validity_window() {
        let key = test_key();
        let der = LeafCertificateBuilder::new(key.clone(), key).build().unwrap();
        let cert = X509::from_der(&der).unwrap();

        let now = Asn1Time::days_from_now(0).unwrap();
        assert!(cert.not_before() < &now);
        assert!(cert.not_after() > &now);
        let in_three_weeks = Asn1Time::days_from_now(21).unwrap();
        assert!(cert.not_after() < &in_three_weeks);
    }
}
