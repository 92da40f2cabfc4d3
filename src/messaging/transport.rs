//! Transport boundary.
//!
//! The bus hands every accepted message to an optional [`Transport`] after
//! local fan-out. The transport is an injected collaborator: the bus only
//! assumes it accepts a [`Message`] and eventually resolves or rejects.

use super::Message;
use crate::config::BusSettings;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

/// Transport errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Channel closed")]
    Closed,
    #[error("Lagged behind by {0} messages")]
    Lagged(u64),
    #[error("Message rejected: {0}")]
    Rejected(String),
}

/// A sink that accepts messages.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport kind. Fusion only merges buses whose transports share a kind.
    fn kind(&self) -> &str;

    /// Send a message. Resolves to the number of receivers it reached.
    async fn send(&self, message: &Message) -> Result<usize, TransportError>;
}

/// Broadcast-channel transport for in-process consumers.
pub struct ChannelTransport {
    tx: broadcast::Sender<Message>,
    sent: AtomicU64,
}

impl ChannelTransport {
    /// Create a channel transport with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            sent: AtomicU64::new(0),
        }
    }

    /// Channel transport sized by `channel_capacity`.
    pub fn from_settings(settings: &BusSettings) -> Self {
        Self::new(settings.channel_capacity)
    }

    /// Subscribe to messages leaving the bus.
    pub fn subscribe(&self) -> ChannelReceiver {
        ChannelReceiver {
            rx: self.tx.subscribe(),
        }
    }

    /// Number of live receivers.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Messages accepted so far.
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

impl Default for ChannelTransport {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn kind(&self) -> &str {
        "channel"
    }

    async fn send(&self, message: &Message) -> Result<usize, TransportError> {
        let receivers = self
            .tx
            .send(message.clone())
            .map_err(|_| TransportError::Closed)?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(receivers)
    }
}

/// Receiving half of a [`ChannelTransport`].
pub struct ChannelReceiver {
    rx: broadcast::Receiver<Message>,
}

impl ChannelReceiver {
    /// Receive the next message.
    pub async fn recv(&mut self) -> Result<Message, TransportError> {
        self.rx.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => TransportError::Closed,
            broadcast::error::RecvError::Lagged(n) => TransportError::Lagged(n),
        })
    }

    /// Try to receive a message without waiting.
    pub fn try_recv(&mut self) -> Result<Option<Message>, TransportError> {
        match self.rx.try_recv() {
            Ok(msg) => Ok(Some(msg)),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(broadcast::error::TryRecvError::Closed) => Err(TransportError::Closed),
            Err(broadcast::error::TryRecvError::Lagged(n)) => Err(TransportError::Lagged(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_send_without_receivers_is_closed() {
        let transport = ChannelTransport::default();
        let result = transport.send(&Message::notice("a", json!({}))).await;
        assert!(matches!(result, Err(TransportError::Closed)));
        assert_eq!(transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_send_reaches_every_receiver() {
        let transport = ChannelTransport::default();
        let mut rx1 = transport.subscribe();
        let mut rx2 = transport.subscribe();

        let reached = transport
            .send(&Message::notice("a", json!({"n": 1})))
            .await
            .unwrap();
        assert_eq!(reached, 2);

        assert_eq!(rx1.recv().await.unwrap().topic(), "a");
        assert_eq!(rx2.try_recv().unwrap().unwrap().payload()["n"], 1);
        assert_eq!(transport.sent_count(), 1);
    }

    #[test]
    fn test_try_recv_empty() {
        let transport = ChannelTransport::default();
        let mut rx = transport.subscribe();
        assert!(rx.try_recv().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_receiver_reports_lag() {
        let transport = ChannelTransport::new(2);
        let mut rx = transport.subscribe();
        for i in 0..5 {
            transport
                .send(&Message::notice(format!("m{}", i), json!({})))
                .await
                .unwrap();
        }
        match rx.try_recv() {
            Err(TransportError::Lagged(n)) => assert!(n > 0),
            other => panic!("Expected Lagged, got {:?}", other.map(|m| m.map(|m| m.topic().to_string()))),
        }
    }

    #[tokio::test]
    async fn test_capacity_from_settings() {
        let settings = BusSettings {
            channel_capacity: 1,
            ..BusSettings::default()
        };
        let transport = ChannelTransport::from_settings(&settings);
        let mut rx = transport.subscribe();
        for topic in ["a", "b"] {
            transport.send(&Message::notice(topic, json!({}))).await.unwrap();
        }
        assert!(matches!(rx.try_recv(), Err(TransportError::Lagged(1))));
        assert_eq!(rx.try_recv().unwrap().unwrap().topic(), "b");
    }

    #[tokio::test]
    async fn test_receiver_closed_after_drop() {
        let transport = ChannelTransport::default();
        let mut rx = transport.subscribe();
        drop(transport);
        assert!(matches!(rx.recv().await, Err(TransportError::Closed)));
    }

    #[test]
    fn test_error_display() {
        assert_eq!(TransportError::Closed.to_string(), "Channel closed");
        assert_eq!(
            TransportError::Lagged(42).to_string(),
            "Lagged behind by 42 messages"
        );
    }

    #[test]
    fn test_kind() {
        assert_eq!(ChannelTransport::default().kind(), "channel");
    }
}
