//! Composition root for a lantern node.
//!
//! Constructs the components in dependency order - config, keys, identity
//! page, certificate, TLS listeners, proxies, uplink - and keeps them
//! running until one of the listeners fails.

use anyhow::{Context, Result};
use axum_server::tls_rustls::RustlsConfig;
use lantern::config::{listen_addr, ConfigStore};
use lantern::identity::{assertion_channel, VerifierClient};
use lantern::keystore::Keystore;
use lantern::proxy::local::{LocalProxy, StaticUpstreams};
use lantern::proxy::remote::RemoteProxy;
use lantern::signaling::client::SignalingClient;
use lantern::signaling::server::SignalingServer;
use lantern::signaling::{Message, SignalingHub};
use lantern::{enrollment, identity, tls};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<()> {
    let config_dir = determine_config_dir()?;
    std::fs::create_dir_all(config_dir.join("logs"))
        .with_context(|| format!("Failed to create {}", config_dir.join("logs").display()))?;

    let file_appender =
        RollingFileAppender::new(Rotation::DAILY, config_dir.join("logs"), "lantern.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lantern=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stdout))
        .init();

    let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    runtime.block_on(run(config_dir))
}

/// The config directory is the first command line argument, defaulting to
/// `~/.lantern`.
fn determine_config_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::args().nth(1) {
        return Ok(PathBuf::from(dir));
    }
    let home = std::env::var_os("HOME").context("Unable to determine home directory")?;
    Ok(PathBuf::from(home).join(".lantern"))
}

async fn run(config_dir: PathBuf) -> Result<()> {
    let config = ConfigStore::open(&config_dir)?;
    let is_root = config.is_root_node();
    info!(
        "Starting {} node from {}",
        if is_root { "root" } else { "child" },
        config_dir.display()
    );

    let keystore = Arc::new(Keystore::open(config.config_dir(), is_root)?);

    // Identity page: serves the login flow that produces the assertion the
    // certificate request blocks on.
    let verifier = VerifierClient::new();
    let (assertion_tx, assertion_source) = assertion_channel();
    let identity_router = identity::router(config.clone(), verifier.clone(), assertion_tx);
    {
        let config = config.clone();
        tokio::spawn(async move {
            if let Err(e) = identity::serve(config, identity_router).await {
                error!("{:#}", e);
            }
        });
    }

    // Certificate: self-sign as a root, or block on the identity flow and
    // request one from the parent.
    if keystore.certificate().is_none() {
        let der = if is_root {
            info!("This is a root node, generating self-signed certificate");
            keystore.self_signed_certificate_der()?
        } else {
            info!("We have a parent, requesting a certificate from parent");
            enrollment::request_cert_from_parent(&keystore, &config, &assertion_source).await?
        };
        keystore.install_certificate(&der)?;
    }

    // TLS material, built once the certificate is in hand.
    let proxy_client_tls = Arc::new(tls::proxy_client_config(&keystore)?);
    let proxy_server_tls = Arc::new(tls::proxy_server_config(&keystore)?);

    // Signaling: the uplink's queue feeds the server's upward relay; the
    // hub routes locally produced messages into the overlay.
    let hub = SignalingHub::new();
    let (server, uplink) = if is_root {
        let server = SignalingServer::new(None);
        let (root_tx, mut root_rx) = mpsc::channel::<Message>(100);
        hub.receive_messages_at(root_tx).await;
        let fan_out = server.clone();
        tokio::spawn(async move {
            while let Some(msg) = root_rx.recv().await {
                fan_out.send_all(msg).await;
            }
        });
        (server, None)
    } else {
        let uplink_tls = Arc::new(tls::uplink_client_config(&keystore)?);
        let (uplink_tx, client) = SignalingClient::new(config.parent_address(), uplink_tls);
        hub.receive_messages_at(uplink_tx.clone()).await;
        let server = SignalingServer::new(Some(uplink_tx));
        (server, Some(client))
    };

    // One TLS listener carries both the certificate-issuance route and the
    // children's WebSocket endpoint.
    let enrollment_state = Arc::new(enrollment::EnrollmentState {
        keystore: keystore.clone(),
        verifier,
        audience: format!("https://{}", config.signaling_address()),
    });
    let signaling_app = enrollment::router(enrollment_state).merge(server.router());
    let signaling_addr = listen_addr(&config.signaling_address())?;
    let signaling_tls =
        RustlsConfig::from_pem_file(keystore.certificate_file(), keystore.private_key_file())
            .await
            .context("Unable to load TLS material for the signaling listener")?;
    info!(
        "Listening for signaling connections at: {}",
        config.signaling_address()
    );

    let local_proxy = Arc::new(LocalProxy::new(
        config.clone(),
        proxy_client_tls,
        Arc::new(StaticUpstreams::new(config.clone())),
    ));
    let remote_proxy = Arc::new(RemoteProxy::new(
        config.clone(),
        keystore.clone(),
        proxy_server_tls,
    ));

    if let Some(client) = uplink {
        let server = server.clone();
        tokio::spawn(client.run(server));
        // Announce which user this leaf delivers for; the registration
        // propagates up the chain of masters.
        let email = config.email();
        if !email.is_empty() {
            hub.send_message(Message::registration(email)).await;
        }
    }

    tokio::try_join!(
        async {
            axum_server::bind_rustls(signaling_addr, signaling_tls)
                .serve(signaling_app.into_make_service())
                .await
                .context("Signaling listener failed")
        },
        local_proxy.run(),
        remote_proxy.run(),
    )?;
    Ok(())
}
