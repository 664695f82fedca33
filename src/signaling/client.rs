//! Uplink: the WebSocket connection to our parent's signaling endpoint.
//!
//! Non-root nodes keep a single outbound TLS WebSocket to the parent,
//! connected lazily when the first message is sent. Outbound messages are
//! forwarded upward; inbound messages from the parent are handed to the
//! local signaling server for downward fan-out.
//!
//! The link is best-effort. A write error or socket close marks it Broken
//! and a reconnect is attempted with jittered exponential backoff; messages
//! that raced with the breakage are dropped, like everything else on the
//! signaling channel.

use anyhow::{Context, Result};
use futures::{Sink, SinkExt, StreamExt};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};

use super::server::SignalingServer;
use super::Message;

/// Outbound queue capacity toward the parent.
const UPLINK_QUEUE_DEPTH: usize = 100;

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Connection state of the uplink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UplinkState {
    Disconnected,
    Connecting,
    Connected,
    Broken,
}

/// Jittered exponential backoff between reconnect attempts.
pub struct Backoff {
    attempt: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self { attempt: 0 }
    }

    /// The next delay: base doubling per attempt, capped, with +/-50%
    /// jitter so a rebooted subtree does not reconnect in lockstep.
    pub fn next_delay(&mut self) -> Duration {
        let exp = BACKOFF_BASE
            .saturating_mul(1u32 << self.attempt.min(5))
            .min(BACKOFF_MAX);
        self.attempt = self.attempt.saturating_add(1);
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        exp.mul_f64(jitter).min(BACKOFF_MAX)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum DriveEnd {
    OutboundClosed,
    Broken,
}

/// The uplink task. Root nodes have none.
pub struct SignalingClient {
    parent_address: String,
    tls: Arc<rustls::ClientConfig>,
    outbound_rx: mpsc::Receiver<Message>,
    state: UplinkState,
}

impl SignalingClient {
    /// Create the uplink and the sender used to queue messages onto it.
    pub fn new(
        parent_address: String,
        tls: Arc<rustls::ClientConfig>,
    ) -> (mpsc::Sender<Message>, Self) {
        let (tx, outbound_rx) = mpsc::channel(UPLINK_QUEUE_DEPTH);
        (
            tx,
            Self {
                parent_address,
                tls,
                outbound_rx,
                state: UplinkState::Disconnected,
            },
        )
    }

    /// Run until the outbound queue closes, fanning messages received from
    /// the parent down through `server`. Connects lazily on the first
    /// message and reconnects with backoff whenever the link breaks.
    pub async fn run(mut self, server: Arc<SignalingServer>) {
        let Some(first) = self.outbound_rx.recv().await else {
            return;
        };
        let mut pending = Some(first);
        let mut backoff = Backoff::new();
        loop {
            self.transition(UplinkState::Connecting);
            let ws = match self.connect().await {
                Err(e) => {
                    warn!("Unable to connect to signaling channel to parent: {}", e);
                    self.transition(UplinkState::Broken);
                    tokio::time::sleep(backoff.next_delay()).await;
                    continue;
                }
                Ok(ws) => ws,
            };
            backoff.reset();
            self.transition(UplinkState::Connected);

            match self.drive(ws, &server, &mut pending).await {
                DriveEnd::OutboundClosed => {
                    self.transition(UplinkState::Disconnected);
                    return;
                }
                DriveEnd::Broken => {
                    self.transition(UplinkState::Broken);
                    tokio::time::sleep(backoff.next_delay()).await;
                }
            }
        }
    }

    async fn connect(&self) -> Result<WsStream> {
        let url = format!("wss://{}/", self.parent_address);
        let mut request = url
            .clone()
            .into_client_request()
            .with_context(|| format!("Unable to parse server url {}", url))?;
        request
            .headers_mut()
            .insert("Origin", HeaderValue::from_static("https://127.0.0.1"));
        let (ws, _) = connect_async_tls_with_config(
            request,
            None,
            false,
            Some(Connector::Rustls(self.tls.clone())),
        )
        .await
        .context("WebSocket handshake with parent failed")?;
        Ok(ws)
    }

    /// Pump the connection until either side gives out.
    async fn drive(
        &mut self,
        ws: WsStream,
        server: &Arc<SignalingServer>,
        pending: &mut Option<Message>,
    ) -> DriveEnd {
        let (mut sink, mut stream) = ws.split();
        let outbound_rx = &mut self.outbound_rx;

        if let Some(msg) = pending.take() {
            if send_frame(&mut sink, &msg).await.is_err() {
                *pending = Some(msg);
                return DriveEnd::Broken;
            }
        }

        loop {
            tokio::select! {
                outbound = outbound_rx.recv() => match outbound {
                    None => {
                        let _ = sink.close().await;
                        return DriveEnd::OutboundClosed;
                    }
                    Some(msg) => {
                        if send_frame(&mut sink, &msg).await.is_err() {
                            *pending = Some(msg);
                            return DriveEnd::Broken;
                        }
                    }
                },
                inbound = stream.next() => match inbound {
                    None | Some(Err(_)) => return DriveEnd::Broken,
                    Some(Ok(WsMessage::Text(text))) => match serde_json::from_str::<Message>(&text) {
                        Ok(msg) => server.send_all(msg).await,
                        Err(e) => warn!("Undecodable message from parent: {}", e),
                    },
                    Some(Ok(_)) => {} // binary/ping/pong are ignored
                }
            }
        }
    }

    fn transition(&mut self, to: UplinkState) {
        if self.state != to {
            info!("Uplink {:?} -> {:?}", self.state, to);
            self.state = to;
        }
    }
}

async fn send_frame(
    sink: &mut (impl Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    msg: &Message,
) -> Result<()> {
    let json = serde_json::to_string(msg).context("Unable to marshal message to JSON")?;
    sink.send(WsMessage::Text(json))
        .await
        .context("Unable to write frame to parent")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_stays_within_bounds() {
        let mut backoff = Backoff::new();
        for _ in 0..10 {
            let delay = backoff.next_delay();
            assert!(delay >= BACKOFF_BASE.mul_f64(0.5), "delay too short: {:?}", delay);
            assert!(delay <= BACKOFF_MAX, "delay too long: {:?}", delay);
        }
        // late attempts sit at the cap (modulo jitter)
        let late = backoff.next_delay();
        assert!(late >= BACKOFF_MAX.mul_f64(0.5));
    }

    #[test]
    fn test_backoff_reset_starts_over() {
        let mut backoff = Backoff::new();
        for _ in 0..6 {
            backoff.next_delay();
        }
        backoff.reset();
        let delay = backoff.next_delay();
        assert!(delay <= BACKOFF_BASE.mul_f64(1.5));
    }
}
