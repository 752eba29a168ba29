//! `Connection`: the byte-frame transport abstraction (spec §4.4).
//!
//! Concrete transports (WebSocket/WebRTC) are out of scope (spec §1); the
//! crate ships the trait plus an in-memory test double, `ChannelConnection`,
//! built on paired `futures::channel::mpsc` endpoints — mirroring the
//! teacher's own `mpsc`-based internal command bus (`src/lib.rs`'s `Sdk`).

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::lock::Mutex;
use futures::SinkExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// An event from a `Connection`'s byte stream.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Data(Vec<u8>),
    Close(Option<String>),
}

/// A bidirectional byte-frame channel (spec §4.4). `send`/`close` are
/// caller-driven; inbound events arrive through `events`.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn send(&self, bytes: Vec<u8>) -> anyhow::Result<()>;
    async fn close(&self, reason: Option<String>);
    fn is_connected(&self) -> bool;
}

/// One end of an in-memory paired connection, for tests and embedding
/// without a real transport.
pub struct ChannelConnection {
    outbound: Mutex<mpsc::UnboundedSender<ConnectionEvent>>,
    connected: Arc<AtomicBool>,
}

impl ChannelConnection {
    /// Creates two connected ends; data sent on one arrives as an event on
    /// the other.
    pub fn pair() -> ((Self, mpsc::UnboundedReceiver<ConnectionEvent>), (Self, mpsc::UnboundedReceiver<ConnectionEvent>)) {
        let (tx_a, rx_a) = mpsc::unbounded();
        let (tx_b, rx_b) = mpsc::unbounded();
        let connected = Arc::new(AtomicBool::new(true));
        let a = Self {
            outbound: Mutex::new(tx_b),
            connected: connected.clone(),
        };
        let b = Self {
            outbound: Mutex::new(tx_a),
            connected,
        };
        ((a, rx_a), (b, rx_b))
    }
}

#[async_trait]
impl Connection for ChannelConnection {
    async fn send(&self, bytes: Vec<u8>) -> anyhow::Result<()> {
        if !self.is_connected() {
            anyhow::bail!("connection closed");
        }
        self.outbound
            .lock()
            .await
            .send(ConnectionEvent::Data(bytes))
            .await
            .ok();
        Ok(())
    }

    async fn close(&self, reason: Option<String>) {
        self.connected.store(false, Ordering::SeqCst);
        self.outbound.lock().await.send(ConnectionEvent::Close(reason)).await.ok();
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[async_std::test]
    async fn data_round_trips_between_ends() {
        let ((a, _rx_a), (b, mut rx_b)) = ChannelConnection::pair();
        a.send(b"hello".to_vec()).await.unwrap();
        match rx_b.next().await {
            Some(ConnectionEvent::Data(bytes)) => assert_eq!(bytes, b"hello"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[async_std::test]
    async fn close_marks_disconnected() {
        let ((a, _rx_a), (_b, _rx_b)) = ChannelConnection::pair();
        assert!(a.is_connected());
        a.close(Some("bye".into())).await;
        assert!(!a.is_connected());
    }
}
