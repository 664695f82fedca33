//! Certificate enrollment between parent and child nodes.
//!
//! Children obtain their certificate by POSTing the DER bytes of their
//! public key to `https://<parent's signaling address>/mycert`. The parent
//! authenticates the child on the basis of an identity assertion carried in
//! the `X-Lantern-Identity` header, which it independently verifies with the
//! identity verifier before signing a certificate that binds the verified
//! email address (encrypted) into the subject CN.
//!
//! The handler side runs on the parent's signaling TLS listener; the client
//! side is a one-shot call in a non-root node's startup path.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use openssl::pkey::PKey;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::ConfigStore;
use crate::identity::{AssertionSource, VerifierClient};
use crate::keystore::{Keystore, KeystoreError};

/// Path at which the parent listens for certificate requests.
pub const PATH: &str = "/mycert";

/// Header that carries the identity assertion with certificate requests.
pub const X_LANTERN_IDENTITY: &str = "X-Lantern-Identity";

/// Shared state for the issuance endpoint.
pub struct EnrollmentState {
    pub keystore: Arc<Keystore>,
    pub verifier: VerifierClient,
    /// Audience the assertion must have been issued for: this node's
    /// signaling URL.
    pub audience: String,
}

/// Router fragment serving `POST /mycert`, to be merged into the signaling
/// listener's router.
pub fn router(state: Arc<EnrollmentState>) -> Router {
    Router::new()
        .route(PATH, post(generate_certificate))
        .with_state(state)
}

/// Handle a certificate request from a child.
async fn generate_certificate(
    State(state): State<Arc<EnrollmentState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let assertion = match headers.get(X_LANTERN_IDENTITY).and_then(|v| v.to_str().ok()) {
        Some(assertion) if !assertion.is_empty() => assertion.to_string(),
        _ => {
            return respond(
                StatusCode::BAD_REQUEST,
                format!("Request didn't include a {} header", X_LANTERN_IDENTITY),
            )
        }
    };

    let verified = match state.verifier.validate(&assertion, &state.audience).await {
        Ok(vr) => vr,
        Err(e) => {
            warn!("{}", e);
            return respond(
                StatusCode::BAD_REQUEST,
                "Identity failed to validate".to_string(),
            );
        }
    };

    let public_key = match PKey::public_key_from_der(&body) {
        Ok(key) if key.rsa().is_ok() => key,
        _ => {
            return respond(
                StatusCode::BAD_REQUEST,
                "Request didn't include a usable public key".to_string(),
            )
        }
    };

    match state
        .keystore
        .certificate_for_public_key(&verified.email, public_key)
    {
        Err(e) => respond(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Unable to generate certificate: {}", e),
        ),
        Ok(der) => {
            info!("Issued certificate for a child node");
            ([(header::CONTENT_TYPE, "application/octet-stream")], der).into_response()
        }
    }
}

fn respond(status: StatusCode, msg: String) -> Response {
    info!("{}", msg);
    (status, msg).into_response()
}

/// Request a certificate from the parent node for our public key.
///
/// Blocks first on the identity assertion (the UI flow has to finish), then
/// performs the HTTPS exchange trusting only our parent anchors. Returns the
/// DER bytes of the issued certificate.
pub async fn request_cert_from_parent(
    keystore: &Keystore,
    config: &ConfigStore,
    assertions: &AssertionSource,
) -> Result<Vec<u8>, KeystoreError> {
    let identity_assertion = assertions
        .wait()
        .await
        .map_err(|e| KeystoreError::CertRequestFailed(e.to_string()))?;

    let public_key_bytes = keystore
        .public_key_pkix_der()
        .map_err(|e| KeystoreError::CertRequestFailed(e.to_string()))?;

    let mut builder = reqwest::Client::builder().use_rustls_tls();
    for anchor in keystore.trust_anchors() {
        let der = anchor
            .to_der()
            .map_err(|e| KeystoreError::CertRequestFailed(e.to_string()))?;
        let cert = reqwest::Certificate::from_der(&der)
            .map_err(|e| KeystoreError::CertRequestFailed(e.to_string()))?;
        builder = builder.add_root_certificate(cert);
    }
    let client = builder
        .tls_built_in_root_certs(false)
        .build()
        .map_err(|e| KeystoreError::CertRequestFailed(e.to_string()))?;

    let url = format!("https://{}{}", config.parent_address(), PATH);
    info!("Requesting certificate from parent at {}", url);
    let response = client
        .post(&url)
        .header(X_LANTERN_IDENTITY, identity_assertion)
        .body(public_key_bytes)
        .send()
        .await
        .map_err(|e| KeystoreError::CertRequestFailed(e.to_string()))?;

    if response.status() != reqwest::StatusCode::OK {
        return Err(KeystoreError::CertRequestFailed(format!(
            "http request failed: {}",
            response.status()
        )));
    }
    let der = response
        .bytes()
        .await
        .map_err(|e| KeystoreError::CertRequestFailed(e.to_string()))?;
    Ok(der.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::assertion_channel;
    use axum::body::Body;
    use axum::http::Request;
    use openssl::rsa::Rsa;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn issuing_state(verifier_url: String) -> (TempDir, Arc<EnrollmentState>) {
        let dir = TempDir::new().unwrap();
        let keystore = Keystore::open(dir.path(), true).unwrap();
        let der = keystore.self_signed_certificate_der().unwrap();
        keystore.install_certificate(&der).unwrap();
        let state = Arc::new(EnrollmentState {
            keystore: Arc::new(keystore),
            verifier: VerifierClient::with_url(verifier_url),
            audience: "127.0.0.1:16100".to_string(),
        });
        (dir, state)
    }

    #[tokio::test]
    async fn test_missing_header_is_rejected() {
        // verifier never reached, any url will do
        let (_dir, state) = issuing_state("http://127.0.0.1:1/verify".to_string());
        let response = router(state)
            .oneshot(
                Request::post(PATH)
                    .body(Body::from(Vec::new()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_issues_cert_with_decryptable_cn() {
        // stub verifier that accepts any assertion
        let verifier_app = axum::Router::new().route(
            "/verify",
            post(|| async {
                axum::Json(serde_json::json!({
                    "status": "okay",
                    "email": "u@example.org",
                    "audience": "127.0.0.1:16100",
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, verifier_app).await.unwrap();
        });

        let (_dir, state) = issuing_state(format!("http://{}/verify", addr));
        let child_key = Rsa::generate(2048).unwrap();
        let child_pkey = PKey::from_rsa(child_key).unwrap();
        let body = child_pkey.public_key_to_der().unwrap();

        let response = router(state.clone())
            .oneshot(
                Request::post(PATH)
                    .header(X_LANTERN_IDENTITY, "A")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let der = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let cert = openssl::x509::X509::from_der(&der).unwrap();
        let cn = cert
            .subject_name()
            .entries_by_nid(openssl::nid::Nid::COMMONNAME)
            .next()
            .unwrap()
            .data()
            .as_utf8()
            .unwrap()
            .to_string();
        assert_eq!(state.keystore.decrypt(&cn).unwrap(), "u@example.org");
    }

    #[tokio::test]
    async fn test_bad_body_is_rejected() {
        let verifier_app = axum::Router::new().route(
            "/verify",
            post(|| async {
                axum::Json(serde_json::json!({"status": "okay", "email": "u@example.org"}))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, verifier_app).await.unwrap();
        });

        let (_dir, state) = issuing_state(format!("http://{}/verify", addr));
        let response = router(state)
            .oneshot(
                Request::post(PATH)
                    .header(X_LANTERN_IDENTITY, "A")
                    .body(Body::from(&b"not a public key"[..]))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_request_client_fails_without_assertion_sender() {
        let dir = TempDir::new().unwrap();
        let keystore = Keystore::open(dir.path(), true).unwrap();
        let config = ConfigStore::open(dir.path()).unwrap();
        let (tx, source) = assertion_channel();
        drop(tx); // channel closed: the wait fails instead of hanging
        let result = request_cert_from_parent(&keystore, &config, &source).await;
        assert!(matches!(result, Err(KeystoreError::CertRequestFailed(_))));
    }
}
