//! WebSocket endpoint accepting signaling connections from child nodes.
//!
//! All server state (the client registry and the replay buffer) is owned by
//! a single dispatch task; every mutation arrives as a [`ServerEvent`] over
//! one channel, so there is no cross-task locking. Each accepted child gets
//! a reader and a writer task coordinated through a shared done flag; either
//! task tripping the flag winds down both and removes the child from the
//! registry.
//!
//! Backpressure: each child has a bounded outbound queue. A child that lets
//! its queue fill up is dropped - slow consumers do not get to stall the
//! fan-out for everyone else.

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::{Message, MessageType, SubscriptionSet};

/// Outbound queue capacity per child connection.
const CHANNEL_BUF_SIZE: usize = 100;

/// Events consumed by the dispatch task.
pub enum ServerEvent {
    /// A new child connection was accepted.
    Add(ChildHandle),
    /// A connection has failed or completed.
    Del(u64),
    /// Fan a message out to every child.
    SendAll(Message),
    /// A socket error was observed.
    Err(String),
    /// Shut the dispatch loop down.
    Done,
}

/// Registry entry for an accepted child connection.
pub struct ChildHandle {
    id: u64,
    outbound: mpsc::Sender<Message>,
    done: Arc<watch::Sender<bool>>,
}

/// State owned exclusively by the dispatch task.
#[derive(Default)]
struct ServerState {
    clients: HashMap<u64, ChildHandle>,
    messages: Vec<Message>,
}

impl ServerState {
    /// Apply one event; returns false when the loop should stop.
    fn handle_event(&mut self, event: ServerEvent) -> bool {
        match event {
            ServerEvent::Add(child) => {
                let id = child.id;
                self.clients.insert(id, child);
                info!("Added new client, now {} clients connected", self.clients.len());
                self.send_past_messages(id);
            }
            ServerEvent::Del(id) => {
                if let Some(child) = self.clients.remove(&id) {
                    debug!("Delete client {}", id);
                    let _ = child.done.send(true);
                }
            }
            ServerEvent::SendAll(msg) => {
                debug!("Send all: {:?}", msg);
                self.messages.push(msg.clone());
                let full: Vec<u64> = self
                    .clients
                    .values()
                    .filter(|child| child.outbound.try_send(msg.clone()).is_err())
                    .map(|child| child.id)
                    .collect();
                for id in full {
                    self.evict(id);
                }
            }
            ServerEvent::Err(e) => warn!("Signaling error: {}", e),
            ServerEvent::Done => return false,
        }
        true
    }

    /// Replay the broadcast history to a newly added child, in order.
    fn send_past_messages(&mut self, id: u64) {
        let overflow = match self.clients.get(&id) {
            Some(child) => self
                .messages
                .iter()
                .any(|msg| child.outbound.try_send(msg.clone()).is_err()),
            None => false,
        };
        if overflow {
            self.evict(id);
        }
    }

    /// Remove a child whose queue overflowed and trip its done flag.
    fn evict(&mut self, id: u64) {
        if let Some(child) = self.clients.remove(&id) {
            let _ = child.done.send(true);
            warn!("Child connection {} is disconnected", id);
        }
    }
}

/// The signaling server: owns the dispatch task and hands out the WebSocket
/// route for the signaling listener.
pub struct SignalingServer {
    events: mpsc::Sender<ServerEvent>,
    next_id: AtomicU64,
    /// Where to relay messages on their way toward the root (None on root
    /// nodes).
    upward: Option<mpsc::Sender<Message>>,
}

impl SignalingServer {
    pub fn new(upward: Option<mpsc::Sender<Message>>) -> Arc<Self> {
        let (events, mut events_rx) = mpsc::channel(CHANNEL_BUF_SIZE);
        tokio::spawn(async move {
            let mut state = ServerState::default();
            while let Some(event) = events_rx.recv().await {
                if !state.handle_event(event) {
                    return;
                }
            }
        });
        Arc::new(Self {
            events,
            next_id: AtomicU64::new(0),
            upward,
        })
    }

    /// Router fragment serving the WebSocket endpoint at `/`.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/", get(ws_endpoint))
            .with_state(self.clone())
    }

    /// Fan a message out to every connected child (also called with
    /// messages arriving from the parent over the uplink).
    pub async fn send_all(&self, msg: Message) {
        let _ = self.events.send(ServerEvent::SendAll(msg)).await;
    }

    /// Stop the dispatch loop.
    pub async fn shutdown(&self) {
        let _ = self.events.send(ServerEvent::Done).await;
    }

    async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_BUF_SIZE);
        let (done_tx, done_rx) = watch::channel(false);
        let done = Arc::new(done_tx);

        let accepted = self
            .events
            .send(ServerEvent::Add(ChildHandle {
                id,
                outbound: outbound_tx,
                done: done.clone(),
            }))
            .await;
        if accepted.is_err() {
            return;
        }

        let (sink, stream) = socket.split();
        let writer = tokio::spawn(listen_write(sink, outbound_rx, done.clone(), done_rx.clone()));
        self.listen_read(stream, id, done, done_rx).await;
        let _ = self.events.send(ServerEvent::Del(id)).await;
        let _ = writer.await;
    }

    /// Consume frames from a child until the connection ends or the done
    /// flag trips.
    async fn listen_read(
        &self,
        mut stream: SplitStream<WebSocket>,
        id: u64,
        done: Arc<watch::Sender<bool>>,
        mut done_rx: watch::Receiver<bool>,
    ) {
        let mut subscriptions = SubscriptionSet::default();
        loop {
            tokio::select! {
                changed = done_rx.changed() => {
                    if changed.is_err() || *done_rx.borrow() {
                        break;
                    }
                }
                frame = stream.next() => match frame {
                    None => break,
                    Some(Err(e)) => {
                        let _ = self.events.send(ServerEvent::Err(e.to_string())).await;
                        break;
                    }
                    Some(Ok(WsMessage::Close(_))) => break,
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<Message>(&text) {
                            Err(e) => {
                                let _ = self
                                    .events
                                    .send(ServerEvent::Err(format!("undecodable frame: {}", e)))
                                    .await;
                            }
                            Ok(msg) => self.handle_inbound(id, msg, &mut subscriptions).await,
                        }
                    }
                    Some(Ok(_)) => {} // binary/ping/pong are ignored
                }
            }
        }
        let _ = done.send(true);
    }

    async fn handle_inbound(&self, id: u64, msg: Message, subscriptions: &mut SubscriptionSet) {
        match msg.message_type {
            MessageType::Registration => {
                if subscriptions.add(&msg.data) {
                    debug!("Child {} registered {}", id, msg.data);
                }
                self.relay_upward(msg).await;
            }
            MessageType::Deregistration => {
                subscriptions.remove(&msg.data);
                debug!("Child {} deregistered {}", id, msg.data);
                self.relay_upward(msg).await;
            }
            MessageType::User(_) => {
                let _ = self.events.send(ServerEvent::SendAll(msg.clone())).await;
                self.relay_upward(msg).await;
            }
        }
    }

    /// Pass a message on toward the root. Registrations propagate this way
    /// recursively until the root is reached; user messages climb toward
    /// the lowest common ancestor of sender and recipient.
    async fn relay_upward(&self, msg: Message) {
        if let Some(upward) = &self.upward {
            if upward.try_send(msg).is_err() {
                warn!("Uplink queue is full, dropping message");
            }
        }
    }
}

async fn ws_endpoint(
    State(server): State<Arc<SignalingServer>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| server.handle_socket(socket))
}

/// Drain the outbound queue onto the socket until the queue closes, a write
/// fails, or the done flag trips.
async fn listen_write(
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut outbound_rx: mpsc::Receiver<Message>,
    done: Arc<watch::Sender<bool>>,
    mut done_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = done_rx.changed() => {
                if changed.is_err() || *done_rx.borrow() {
                    break;
                }
            }
            msg = outbound_rx.recv() => match msg {
                None => break,
                Some(msg) => {
                    let json = match serde_json::to_string(&msg) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!("Unable to encode message: {}", e);
                            continue;
                        }
                    };
                    if sink.send(WsMessage::Text(json)).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
    let _ = done.send(true);
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn child(id: u64, capacity: usize) -> (ChildHandle, mpsc::Receiver<Message>, watch::Receiver<bool>) {
        let (outbound, outbound_rx) = mpsc::channel(capacity);
        let (done_tx, done_rx) = watch::channel(false);
        (
            ChildHandle {
                id,
                outbound,
                done: Arc::new(done_tx),
            },
            outbound_rx,
            done_rx,
        )
    }

    fn user_message(data: &str) -> Message {
        Message {
            recipient: "a@example.org".to_string(),
            message_type: MessageType::User(3),
            data: data.to_string(),
        }
    }

    #[test]
    fn test_broadcast_reaches_every_client_once() {
        let mut state = ServerState::default();
        let (x, mut x_rx, _x_done) = child(1, 10);
        let (y, mut y_rx, _y_done) = child(2, 10);
        state.handle_event(ServerEvent::Add(x));
        state.handle_event(ServerEvent::Add(y));
        state.handle_event(ServerEvent::SendAll(user_message("M1")));

        assert_eq!(x_rx.try_recv().unwrap().data, "M1");
        assert_eq!(y_rx.try_recv().unwrap().data, "M1");
        assert!(x_rx.try_recv().is_err());
        assert!(y_rx.try_recv().is_err());
    }

    #[test]
    fn test_late_joiner_sees_replay_then_new_broadcasts() {
        let mut state = ServerState::default();
        let (x, mut x_rx, _x_done) = child(1, 10);
        state.handle_event(ServerEvent::Add(x));
        state.handle_event(ServerEvent::SendAll(user_message("M1")));

        let (y, mut y_rx, _y_done) = child(2, 10);
        state.handle_event(ServerEvent::Add(y));
        state.handle_event(ServerEvent::SendAll(user_message("M2")));

        assert_eq!(y_rx.try_recv().unwrap().data, "M1");
        assert_eq!(y_rx.try_recv().unwrap().data, "M2");
        assert_eq!(x_rx.try_recv().unwrap().data, "M1");
        assert_eq!(x_rx.try_recv().unwrap().data, "M2");
    }

    #[test]
    fn test_queue_overflow_evicts_only_the_slow_client() {
        let mut state = ServerState::default();
        let (slow, _slow_rx, slow_done) = child(1, 2);
        let (healthy, mut healthy_rx, healthy_done) = child(2, 10);
        state.handle_event(ServerEvent::Add(slow));
        state.handle_event(ServerEvent::Add(healthy));

        for i in 0..3 {
            state.handle_event(ServerEvent::SendAll(user_message(&format!("M{}", i))));
        }

        assert!(*slow_done.borrow());
        assert!(!*healthy_done.borrow());
        assert_eq!(state.clients.len(), 1);
        for i in 0..3 {
            assert_eq!(healthy_rx.try_recv().unwrap().data, format!("M{}", i));
        }
    }

    #[test]
    fn test_del_pairs_removal_with_done() {
        let mut state = ServerState::default();
        let (c, _rx, done) = child(1, 10);
        state.handle_event(ServerEvent::Add(c));
        assert_eq!(state.clients.len(), 1);
        state.handle_event(ServerEvent::Del(1));
        assert!(state.clients.is_empty());
        assert!(*done.borrow());
    }

    #[test]
    fn test_done_event_stops_the_loop() {
        let mut state = ServerState::default();
        assert!(state.handle_event(ServerEvent::Err("boom".to_string())));
        assert!(!state.handle_event(ServerEvent::Done));
    }

    #[tokio::test]
    async fn test_fan_out_with_replay_over_websocket() {
        use futures::{SinkExt, StreamExt};
        use tokio_tungstenite::tungstenite::Message as ClientFrame;

        let server = SignalingServer::new(None);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, server.router()).await.unwrap();
        });
        let url = format!("ws://{}/", addr);

        let (mut x, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        let m1 = serde_json::to_string(&user_message("M1")).unwrap();
        x.send(ClientFrame::Text(m1)).await.unwrap();
        // X observing M1 proves the broadcast was dispatched before Y joins
        let frame = x.next().await.unwrap().unwrap();
        let received: Message = serde_json::from_str(frame.to_text().unwrap()).unwrap();
        assert_eq!(received.data, "M1");

        let (mut y, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        let frame = y.next().await.unwrap().unwrap();
        let replayed: Message = serde_json::from_str(frame.to_text().unwrap()).unwrap();
        assert_eq!(replayed.data, "M1");

        let m2 = serde_json::to_string(&user_message("M2")).unwrap();
        x.send(ClientFrame::Text(m2)).await.unwrap();
        for peer in [&mut x, &mut y] {
            let frame = peer.next().await.unwrap().unwrap();
            let received: Message = serde_json::from_str(frame.to_text().unwrap()).unwrap();
            assert_eq!(received.data, "M2");
        }
    }
}
