//! Local proxy: the loopback HTTP proxy the browser is pointed at.
//!
//! Accepted requests are forwarded verbatim to an upstream peer proxy over
//! mutually-authenticated TLS and the two sockets are spliced. Upstream
//! selection sits behind [`UpstreamSelector`] so discovery can replace the
//! static list later.

use anyhow::{Context, Result};
use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsConnector;
use tracing::{info, warn};

use crate::config::ConfigStore;
use crate::proxy::{pipe, read_request_head, respond_bad_gateway, REQUEST_TIMEOUT};

/// Chooses the upstream proxy to tunnel a request through.
pub trait UpstreamSelector: Send + Sync {
    fn select(&self) -> Option<String>;
}

/// Static selection: the first configured fallback upstream.
pub struct StaticUpstreams {
    config: Arc<ConfigStore>,
}

impl StaticUpstreams {
    pub fn new(config: Arc<ConfigStore>) -> Self {
        Self { config }
    }
}

impl UpstreamSelector for StaticUpstreams {
    fn select(&self) -> Option<String> {
        self.config.static_proxy_addresses().into_iter().next()
    }
}

pub struct LocalProxy {
    config: Arc<ConfigStore>,
    tls: TlsConnector,
    upstreams: Arc<dyn UpstreamSelector>,
}

impl LocalProxy {
    pub fn new(
        config: Arc<ConfigStore>,
        tls: Arc<rustls::ClientConfig>,
        upstreams: Arc<dyn UpstreamSelector>,
    ) -> Self {
        Self {
            config,
            tls: TlsConnector::from(tls),
            upstreams,
        }
    }

    /// Accept browser connections until the listener fails.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let address = self.config.local_proxy_address();
        let listener = TcpListener::bind(crate::config::listen_addr(&address)?)
            .await
            .with_context(|| format!("Unable to start local proxy at {}", address))?;
        info!("About to start local proxy at: {}", address);
        self.serve(listener).await
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, _) = listener
                .accept()
                .await
                .context("Local proxy listener failed")?;
            let proxy = self.clone();
            tokio::spawn(async move {
                proxy.handle(stream).await;
            });
        }
    }

    async fn handle(&self, mut client: TcpStream) {
        let head = match read_request_head(&mut client).await {
            Ok(head) => head,
            Err(e) => {
                warn!("Unable to read request from browser: {}", e);
                return;
            }
        };

        let upstream = match self.upstreams.select() {
            Some(upstream) => upstream,
            None => {
                respond_bad_gateway(&mut client, "No upstream proxy configured".to_string()).await;
                return;
            }
        };

        let mut upstream_stream = match self.connect_upstream(&upstream).await {
            Ok(stream) => stream,
            Err(e) => {
                respond_bad_gateway(
                    &mut client,
                    format!("Unable to open socket to upstream proxy: {}", e),
                )
                .await;
                return;
            }
        };

        // Forward the request exactly as the browser sent it (the CONNECT
        // line included); the upstream proxy does its own parsing.
        let forwarded = tokio::time::timeout(
            REQUEST_TIMEOUT,
            upstream_stream.write_all(&head.raw),
        )
        .await;
        match forwarded {
            Ok(Ok(())) => pipe(client, upstream_stream).await,
            Ok(Err(e)) => {
                respond_bad_gateway(&mut client, format!("Unable to forward request: {}", e)).await
            }
            Err(_) => {
                respond_bad_gateway(&mut client, "Timed out forwarding request".to_string()).await
            }
        }
    }

    async fn connect_upstream(
        &self,
        upstream: &str,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
        let tcp = TcpStream::connect(upstream)
            .await
            .with_context(|| format!("tcp connect to {}", upstream))?;
        let host = upstream.split(':').next().unwrap_or(upstream);
        let server_name = ServerName::try_from(host.to_string())
            .with_context(|| format!("invalid upstream host {}", host))?;
        self.tls
            .connect(server_name, tcp)
            .await
            .with_context(|| format!("tls handshake with {}", upstream))
    }
}
