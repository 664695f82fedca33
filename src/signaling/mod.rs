//! The signaling channel: a tree-structured message bus for presence.
//!
//! Nodes are organized into a tree of master nodes (the trusted messaging
//! backbone) and user nodes (leaves tied to one email address). Children
//! connect to their parent's WebSocket endpoint; all messaging rides that
//! channel.
//!
//! Children register with their parents to announce which email addresses
//! they can deliver. A user node registers only its own user; a master node
//! re-registers everything its subtree registered, up the chain until the
//! root is reached. Messages propagate up the tree and fan out downward
//! through registered children, terminating at the relevant user node.
//!
//! The channel does not store and forward: messages are passed immediately,
//! and any node on the path may be offline, so delivery is best-effort.
//! Senders never learn whether a message arrived, and presence-style
//! messages should simply be resent periodically. Messages are expected to
//! be small - this is not a bulk transfer mechanism.

pub mod client;
pub mod server;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Conventional upper bound on an encoded signaling message.
pub const MAX_MESSAGE_BYTES: usize = 1024;

/// Registration of a new email address.
pub const TYPE_REGISTRATION: u8 = 1;
/// Deregistration of an email address.
pub const TYPE_DEREGISTRATION: u8 = 2;

/// The kind of a signaling message. Anything that is not a registration or
/// deregistration is treated as a user message and fanned out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum MessageType {
    Registration,
    Deregistration,
    User(u8),
}

impl From<u8> for MessageType {
    fn from(value: u8) -> Self {
        match value {
            TYPE_REGISTRATION => MessageType::Registration,
            TYPE_DEREGISTRATION => MessageType::Deregistration,
            other => MessageType::User(other),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(value: MessageType) -> Self {
        match value {
            MessageType::Registration => TYPE_REGISTRATION,
            MessageType::Deregistration => TYPE_DEREGISTRATION,
            MessageType::User(other) => other,
        }
    }
}

/// A signaling message: recipient email, type, and a small payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// The recipient email address.
    #[serde(rename = "R")]
    pub recipient: String,
    /// The type of message.
    #[serde(rename = "T")]
    pub message_type: MessageType,
    /// The data payload (may or may not be JSON encoded).
    #[serde(rename = "D")]
    pub data: String,
}

impl Message {
    pub fn registration(email: impl Into<String>) -> Self {
        Self {
            recipient: String::new(),
            message_type: MessageType::Registration,
            data: email.into(),
        }
    }

    pub fn deregistration(email: impl Into<String>) -> Self {
        Self {
            recipient: String::new(),
            message_type: MessageType::Deregistration,
            data: email.into(),
        }
    }
}

/// The set of email addresses a child has registered for.
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    emails: HashSet<String>,
}

impl SubscriptionSet {
    /// Add an email, returning true if it was not present before.
    pub fn add(&mut self, email: &str) -> bool {
        self.emails.insert(email.to_string())
    }

    pub fn remove(&mut self, email: &str) {
        self.emails.remove(email);
    }

    pub fn contains(&self, email: &str) -> bool {
        self.emails.contains(email)
    }

    pub fn len(&self) -> usize {
        self.emails.len()
    }

    pub fn is_empty(&self) -> bool {
        self.emails.is_empty()
    }
}

/// Process-local dispatcher connecting the node's own message producers to
/// the overlay (typically the uplink on user nodes, the local fan-out on
/// the root).
pub struct SignalingHub {
    tx: mpsc::Sender<HubCommand>,
}

enum HubCommand {
    Register(mpsc::Sender<Message>),
    Send(Message),
}

impl SignalingHub {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(100);
        tokio::spawn(run(rx));
        Self { tx }
    }

    /// Send a message to the overlay.
    pub async fn send_message(&self, message: Message) {
        if serde_json::to_vec(&message).map(|b| b.len()).unwrap_or(0) > MAX_MESSAGE_BYTES {
            warn!("Signaling message exceeds {} bytes", MAX_MESSAGE_BYTES);
        }
        let _ = self.tx.send(HubCommand::Send(message)).await;
    }

    /// Register to receive messages sent through this hub.
    pub async fn receive_messages_at(&self, receiver: mpsc::Sender<Message>) {
        let _ = self.tx.send(HubCommand::Register(receiver)).await;
    }
}

impl Default for SignalingHub {
    fn default() -> Self {
        Self::new()
    }
}

async fn run(mut rx: mpsc::Receiver<HubCommand>) {
    let mut receivers: Vec<mpsc::Sender<Message>> = Vec::new();
    while let Some(command) = rx.recv().await {
        match command {
            HubCommand::Register(receiver) => {
                info!("Adding message receiver");
                receivers.push(receiver);
            }
            HubCommand::Send(message) => {
                receivers.retain(|receiver| receiver.try_send(message.clone()).is_ok());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let msg = Message {
            recipient: "a@example.org".to_string(),
            message_type: MessageType::User(3),
            data: "Hello World".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"R":"a@example.org","T":3,"D":"Hello World"}"#);
        assert_eq!(serde_json::from_str::<Message>(&json).unwrap(), msg);
    }

    #[test]
    fn test_type_codes() {
        assert_eq!(
            serde_json::from_str::<Message>(r#"{"R":"","T":1,"D":"a@b"}"#)
                .unwrap()
                .message_type,
            MessageType::Registration
        );
        assert_eq!(
            serde_json::from_str::<Message>(r#"{"R":"","T":2,"D":"a@b"}"#)
                .unwrap()
                .message_type,
            MessageType::Deregistration
        );
        assert_eq!(u8::from(MessageType::User(7)), 7);
    }

    #[test]
    fn test_subscription_set_idempotence() {
        let mut set = SubscriptionSet::default();
        assert!(set.add("a@example.org"));
        assert!(!set.add("a@example.org"));
        assert_eq!(set.len(), 1);
        set.remove("a@example.org");
        assert!(!set.contains("a@example.org"));
    }

    #[tokio::test]
    async fn test_hub_fans_to_receivers() {
        let hub = SignalingHub::new();
        let (tx, mut rx) = mpsc::channel(10);
        hub.receive_messages_at(tx).await;
        hub.send_message(Message::registration("a@example.org")).await;
        let received = rx.recv().await.unwrap();
        assert_eq!(received.data, "a@example.org");
    }
}
