//! Identity assertions for node enrollment.
//!
//! The overlay identifies users by possession of an email address, proven by
//! an identity assertion from an external verifier (Mozilla Persona). This
//! module obtains assertions through a local web page and validates them
//! against the verifier's backend.
//!
//! Obtaining an assertion means walking the user through the verifier's
//! browser flow: a loopback HTTP page drives the flow and posts the
//! resulting assertion back to us, where it is handed to whoever is blocked
//! on [`AssertionSource::wait`] (in practice the certificate-request client
//! during startup).

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use maud::{html, Markup, PreEscaped, DOCTYPE};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info};

use crate::config::ConfigStore;

/// Backend endpoint that validates identity assertions.
pub const DEFAULT_VERIFIER_URL: &str = "https://verifier.login.persona.org/verify";

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Assertion failed to validate: {0}")]
    AssertionInvalid(String),
    #[error("Unable to reach identity verifier: {0}")]
    VerifierUnreachable(String),
}

/// Data returned by the verifier for an assertion.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct VerifierResponse {
    pub status: String,
    pub email: String,
    pub audience: String,
    pub expires: i64,
    pub issuer: String,
    pub reason: String,
}

/// Client for the external identity verifier.
#[derive(Clone)]
pub struct VerifierClient {
    http: reqwest::Client,
    url: String,
}

impl VerifierClient {
    pub fn new() -> Self {
        Self::with_url(DEFAULT_VERIFIER_URL.to_string())
    }

    /// Point the client at a different verifier endpoint (tests).
    pub fn with_url(url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            url,
        }
    }

    /// Validate an assertion for the given audience. Returns the verifier's
    /// response when its status is `"okay"`, an error otherwise.
    pub async fn validate(
        &self,
        assertion: &str,
        audience: &str,
    ) -> Result<VerifierResponse, IdentityError> {
        let response = self
            .http
            .post(&self.url)
            .form(&[("assertion", assertion), ("audience", audience)])
            .send()
            .await
            .map_err(|e| IdentityError::VerifierUnreachable(e.to_string()))?;
        let vr: VerifierResponse = response
            .json()
            .await
            .map_err(|e| IdentityError::VerifierUnreachable(e.to_string()))?;
        if vr.status == "okay" {
            Ok(vr)
        } else {
            Err(IdentityError::AssertionInvalid(vr.reason))
        }
    }
}

impl Default for VerifierClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving half of the assertion hand-off. The certificate-request client
/// blocks here until the browser flow completes; there is deliberately no
/// timeout - without an identity there is no point running a user node.
pub struct AssertionSource {
    rx: Mutex<mpsc::Receiver<String>>,
}

impl AssertionSource {
    pub async fn wait(&self) -> Result<String> {
        let mut rx = self.rx.lock().await;
        rx.recv()
            .await
            .context("Assertion channel closed before an assertion arrived")
    }
}

/// Create the assertion hand-off pair: the sender side lives in the UI
/// handlers, the source side in the certificate-request client.
pub fn assertion_channel() -> (mpsc::Sender<String>, AssertionSource) {
    let (tx, rx) = mpsc::channel(1);
    (tx, AssertionSource { rx: Mutex::new(rx) })
}

struct UiState {
    config: Arc<ConfigStore>,
    verifier: VerifierClient,
    assertion_tx: mpsc::Sender<String>,
}

#[derive(Deserialize)]
struct LoginForm {
    #[serde(default)]
    assertion: String,
}

/// Router for the loopback identity page: `GET /auth` renders the login
/// page, `POST /auth/login` receives the assertion from the page's script.
pub fn router(
    config: Arc<ConfigStore>,
    verifier: VerifierClient,
    assertion_tx: mpsc::Sender<String>,
) -> Router {
    let state = Arc::new(UiState {
        config,
        verifier,
        assertion_tx,
    });
    Router::new()
        .route("/auth", get(auth_page))
        .route("/auth/login", post(login))
        .with_state(state)
}

/// Serve the identity page on the configured UI address. The user has to
/// visit `/auth` in a browser to finish enrollment; we log the URL rather
/// than spawning a browser ourselves.
pub async fn serve(config: Arc<ConfigStore>, router: Router) -> Result<()> {
    let address = config.ui_address();
    let listener = tokio::net::TcpListener::bind(crate::config::listen_addr(&address)?)
        .await
        .with_context(|| format!("Unable to bind identity page to {}", address))?;
    info!("Identity page available at: http://{}/auth", address);
    axum::serve(listener, router)
        .await
        .context("Identity page server failed")
}

async fn auth_page() -> Html<String> {
    Html(render_auth_page().into_string())
}

async fn login(State(state): State<Arc<UiState>>, Form(form): Form<LoginForm>) -> Response {
    info!("Login handler called");
    if form.assertion.is_empty() {
        info!("Didn't get assertion");
        return (StatusCode::BAD_REQUEST, "Bad Request.").into_response();
    }

    // Pre-flight check with the UI address as audience; the parent performs
    // the authoritative validation against its own signaling URL.
    let audience = state.config.ui_address();
    match state.verifier.validate(&form.assertion, &audience).await {
        Err(e) => {
            error!("{}", e);
            (StatusCode::BAD_REQUEST, "Bad Request.").into_response()
        }
        Ok(vr) => {
            state.config.set_email(vr.email.clone());
            info!("Email saved");
            if state.assertion_tx.send(form.assertion).await.is_err() {
                error!("No one is waiting for the assertion");
            }
            Json(serde_json::json!({
                "status": vr.status,
                "email": vr.email,
                "audience": vr.audience,
            }))
            .into_response()
        }
    }
}

fn render_auth_page() -> Markup {
    html! {
        (DOCTYPE)
        html lang="en" {
            head {
                title { "Lantern - Log In" }
                meta http-equiv="X-UA-Compatible" content="IE=Edge";
            }
            body {
                div id="loggedOut" {
                    h1 { "Please log in to join the Lantern network." }
                    a href="#" id="login" { "login" }
                }
                div id="loggedIn" style="display: none;" {
                    h1 { "Thank you for logging in!" }
                }
                script src="https://login.persona.org/include.js" {}
                script {
                    (PreEscaped(r#"
                        var loggedOutDiv = document.getElementById('loggedOut');
                        var loggedInDiv = document.getElementById('loggedIn');
                        document.getElementById('login').onclick = function() {
                            navigator.id.request();
                        };

                        function sendAssertion(assertion) {
                            var xhr = new XMLHttpRequest();
                            xhr.open('POST', '/auth/login', true);
                            xhr.setRequestHeader('Content-type', 'application/x-www-form-urlencoded');
                            xhr.onreadystatechange = function() {
                                if (xhr.readyState == 4 && xhr.status == 200) {
                                    loggedOutDiv.style.display = 'none';
                                    loggedInDiv.style.display = 'inherit';
                                }
                            };
                            xhr.send('assertion=' + encodeURIComponent(assertion));
                        }

                        navigator.id.watch({
                            loggedInUser: null,
                            onlogin: sendAssertion,
                            onlogout: function() {}
                        });
                    "#))
                }
            }
        }
    }
}
