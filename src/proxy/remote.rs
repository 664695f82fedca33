//! Remote proxy: the mTLS listener that egresses peer traffic.
//!
//! Peers are authenticated by the client certificate presented during the
//! handshake; its CN decrypts under our private key to the email address we
//! issued the certificate for. Connections without a certificate are
//! dropped, ones with an undecryptable CN get a 502.

use anyhow::{Context, Result};
use openssl::x509::X509;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::config::ConfigStore;
use crate::keystore::Keystore;
use crate::proxy::{pipe, read_request_head, respond_bad_gateway, REQUEST_TIMEOUT};

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.0 200 OK\r\n\r\n";

pub struct RemoteProxy {
    config: Arc<ConfigStore>,
    keystore: Arc<Keystore>,
    tls: TlsAcceptor,
}

impl RemoteProxy {
    pub fn new(
        config: Arc<ConfigStore>,
        keystore: Arc<Keystore>,
        tls: Arc<rustls::ServerConfig>,
    ) -> Self {
        Self {
            config,
            keystore,
            tls: TlsAcceptor::from(tls),
        }
    }

    /// Accept peer connections until the listener fails.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let address = self.config.remote_proxy_address();
        let listener = TcpListener::bind(crate::config::listen_addr(&address)?)
            .await
            .with_context(|| format!("Unable to start remote proxy at {}", address))?;
        info!("About to start remote proxy at: {}", address);
        self.serve(listener).await
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, _) = listener
                .accept()
                .await
                .context("Remote proxy listener failed")?;
            let proxy = self.clone();
            tokio::spawn(async move {
                proxy.handle(stream).await;
            });
        }
    }

    async fn handle(&self, stream: TcpStream) {
        let mut client = match self.tls.accept(stream).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!("TLS handshake failed: {}", e);
                return;
            }
        };

        let email = match self.peer_email(&client) {
            PeerIdentity::Missing => {
                info!("No peer certificates provided");
                return;
            }
            PeerIdentity::Undecryptable(e) => {
                respond_bad_gateway(&mut client, format!("Unable to decrypt email: {}", e)).await;
                return;
            }
            PeerIdentity::Email(email) => email,
        };
        // TODO: check the peer email against issued-certificate records once
        // revocation is in place.
        debug!("Peer email is: {}", email);

        let head = match read_request_head(&mut client).await {
            Ok(head) => head,
            Err(e) => {
                warn!("Unable to read request from peer: {}", e);
                return;
            }
        };

        let host = match head.host_including_port() {
            Some(host) => host,
            None => {
                respond_bad_gateway(&mut client, "Request carries no destination host".to_string())
                    .await;
                return;
            }
        };

        let mut server = match TcpStream::connect(&host).await {
            Ok(stream) => stream,
            Err(e) => {
                respond_bad_gateway(&mut client, format!("Unable to open socket to server: {}", e))
                    .await;
                return;
            }
        };

        let opening = if head.is_connect() {
            tokio::time::timeout(REQUEST_TIMEOUT, client.write_all(CONNECT_ESTABLISHED)).await
        } else {
            tokio::time::timeout(REQUEST_TIMEOUT, server.write_all(&head.raw)).await
        };
        match opening {
            Ok(Ok(())) => pipe(client, server).await,
            Ok(Err(e)) => warn!("Unable to open tunnel to {}: {}", host, e),
            Err(_) => warn!("Timed out opening tunnel to {}", host),
        }
    }

    fn peer_email(&self, stream: &TlsStream<TcpStream>) -> PeerIdentity {
        let (_, connection) = stream.get_ref();
        let peer_der = match connection.peer_certificates().and_then(|certs| certs.first()) {
            Some(der) => der.clone(),
            None => return PeerIdentity::Missing,
        };
        let cn = X509::from_der(peer_der.as_ref())
            .ok()
            .and_then(|cert| {
                cert.subject_name()
                    .entries_by_nid(openssl::nid::Nid::COMMONNAME)
                    .next()
                    .and_then(|entry| entry.data().as_utf8().ok())
                    .map(|s| s.to_string())
            });
        let cn = match cn {
            Some(cn) => cn,
            None => return PeerIdentity::Undecryptable("certificate carries no CN".to_string()),
        };
        match self.keystore.decrypt(&cn) {
            Ok(email) => PeerIdentity::Email(email),
            Err(e) => PeerIdentity::Undecryptable(e.to_string()),
        }
    }
}

enum PeerIdentity {
    Missing,
    Undecryptable(String),
    Email(String),
}
