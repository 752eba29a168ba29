//! `Peer` and `PeerManager`: WebRTC-like peer lifecycle (spec §4.6).
//!
//! The concrete RTC/data-channel transport is out of scope (spec §1); a
//! `Peer` here wraps whatever `Connection` the embedder's SDP/ICE exchange
//! eventually produces. This module owns gating, signaling-message
//! dispatch and peer bookkeeping, not the RTC negotiation itself.

use crate::address::DocumentId;
use crate::connection::{Connection, ConnectionEvent};
use crate::crypto::PublicKey;
use crate::exchanger::{IcePayload, SdpKind, SdpPayload, SignalKind};
use crate::header::DocumentHeader;
use crate::session::ClientId;
use futures::channel::mpsc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum PeerState {
    Connecting,
    Connected,
    Closed,
}

/// Key identifying one peer slot: a document shared with one remote
/// client instance (spec §4.6 — "not shared across documents").
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct PeerKey {
    pub document_id: DocumentId,
    pub remote_public_key: PublicKey,
    pub remote_client_id: ClientId,
}

/// A direct bidirectional byte channel between two clients, scoped to one
/// document.
pub struct Peer<C> {
    key: PeerKey,
    initiator: bool,
    connection: Arc<C>,
    state: Arc<AtomicU8>,
}

const STATE_CONNECTING: u8 = 0;
const STATE_CONNECTED: u8 = 1;
const STATE_CLOSED: u8 = 2;

#[cfg(test)]
pub mod test_support {
    //! Constructors used by other modules' tests to get a bare connected
    //! `Peer` without going through `PeerManager::register_peer`'s event
    //! plumbing.
    use super::*;

    pub fn new_connected_peer<C: Connection>(key: PeerKey, connection: C) -> Peer<C> {
        Peer {
            key,
            initiator: true,
            connection: Arc::new(connection),
            state: Arc::new(AtomicU8::new(STATE_CONNECTED)),
        }
    }
}

impl<C: Connection> Peer<C> {
    pub fn key(&self) -> &PeerKey {
        &self.key
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn state(&self) -> PeerState {
        match self.state.load(Ordering::SeqCst) {
            STATE_CONNECTED => PeerState::Connected,
            STATE_CLOSED => PeerState::Closed,
            _ => PeerState::Connecting,
        }
    }

    pub async fn send(&self, bytes: Vec<u8>) -> anyhow::Result<()> {
        self.connection.send(bytes).await
    }

    pub async fn close(&self) {
        self.state.store(STATE_CLOSED, Ordering::SeqCst);
        self.connection.close(None).await;
    }

    fn mark_connected(&self) {
        self.state
            .compare_exchange(STATE_CONNECTING, STATE_CONNECTED, Ordering::SeqCst, Ordering::SeqCst)
            .ok();
    }
}

/// Events the `PeerManager` emits (spec §4.6).
pub enum PeerManagerEvent<C> {
    PeerCreated { document_id: DocumentId, peer: Arc<Peer<C>> },
    PeerDestroyed { document_id: DocumentId, peer: Arc<Peer<C>> },
}

/// Gates an inbound signal before a non-initiator peer is created for it
/// (spec §4.6). The sharing client's implementation checks the document
/// exists locally and the sender is allowed; anything else is dropped
/// silently, never surfaced as an error (matches `SchemaRejected`'s "drop,
/// don't throw" policy for untrusted peer traffic).
pub trait SignalGate {
    fn verify_incoming_signal(&self, document_id: &DocumentId, sender: &PublicKey) -> bool;
}

/// Looks documents up by id and checks ACL membership; the concrete
/// `SharingClient` wires this to its `DocumentRegistry`.
pub struct RegistryGate<'a> {
    pub headers: &'a dyn Fn(&DocumentId) -> Option<DocumentHeader>,
}

impl<'a> SignalGate for RegistryGate<'a> {
    fn verify_incoming_signal(&self, document_id: &DocumentId, sender: &PublicKey) -> bool {
        (self.headers)(document_id)
            .map(|header| header.has_allowed_user(sender))
            .unwrap_or(false)
    }
}

/// Keys peers by `(documentId, remotePublicKey, remoteClientId)` and
/// drives the `{sdp|ice|bye}` signaling protocol (spec §4.6).
pub struct PeerManager<C> {
    peers: Arc<RwLock<HashMap<PeerKey, Arc<Peer<C>>>>>,
    events: mpsc::UnboundedSender<PeerManagerEvent<C>>,
}

impl<C: Connection + 'static> PeerManager<C> {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PeerManagerEvent<C>>) {
        let (tx, rx) = mpsc::unbounded();
        (
            Self {
                peers: Arc::new(RwLock::new(HashMap::new())),
                events: tx,
            },
            rx,
        )
    }

    pub fn get(&self, key: &PeerKey) -> Option<Arc<Peer<C>>> {
        self.peers.read().get(key).cloned()
    }

    pub fn peers_for_document(&self, document_id: &DocumentId) -> Vec<Arc<Peer<C>>> {
        self.peers
            .read()
            .values()
            .filter(|p| &p.key.document_id == document_id)
            .cloned()
            .collect()
    }

    /// Registers an already-negotiated connection as a peer and emits
    /// `peer-created`. The SDP/ICE exchange itself happens outside this
    /// crate (via `Connection`'s embedder-provided transport); this records
    /// the result and starts forwarding its data events.
    pub fn register_peer(
        &self,
        key: PeerKey,
        initiator: bool,
        connection: C,
        mut inbound: mpsc::UnboundedReceiver<ConnectionEvent>,
        on_data: impl Fn(PeerKey, Vec<u8>) + Send + 'static,
    ) -> Arc<Peer<C>> {
        let peer = Arc::new(Peer {
            key: key.clone(),
            initiator,
            connection: Arc::new(connection),
            state: Arc::new(AtomicU8::new(STATE_CONNECTING)),
        });
        peer.mark_connected();
        self.peers.write().insert(key.clone(), peer.clone());
        self.events
            .unbounded_send(PeerManagerEvent::PeerCreated {
                document_id: key.document_id,
                peer: peer.clone(),
            })
            .ok();

        let events = self.events.clone();
        let peers = self.peers.clone();
        let task_peer = peer.clone();
        let task_key = key.clone();
        async_global_executor::spawn(async move {
            use futures::StreamExt;
            while let Some(event) = inbound.next().await {
                match event {
                    ConnectionEvent::Data(bytes) => on_data(task_key.clone(), bytes),
                    ConnectionEvent::Close(_) => break,
                }
            }
            task_peer.close().await;
            peers.write().remove(&task_key);
            events
                .unbounded_send(PeerManagerEvent::PeerDestroyed {
                    document_id: task_key.document_id,
                    peer: task_peer,
                })
                .ok();
        })
        .detach();

        peer
    }

    /// Tears the peer down (spec §4.6 step 4: either side may send `bye`).
    pub async fn destroy_peer(&self, key: &PeerKey) {
        if let Some(peer) = self.peers.write().remove(key) {
            peer.close().await;
            self.events
                .unbounded_send(PeerManagerEvent::PeerDestroyed {
                    document_id: key.document_id,
                    peer,
                })
                .ok();
        }
    }
}

pub fn offer(sdp: String) -> SignalKind {
    SignalKind::Sdp {
        sdp: SdpPayload { kind: SdpKind::Offer, sdp },
    }
}

pub fn answer(sdp: String) -> SignalKind {
    SignalKind::Sdp {
        sdp: SdpPayload { kind: SdpKind::Answer, sdp },
    }
}

pub fn ice(candidate: String, sdp_mid: Option<String>, sdp_mline_index: Option<u32>) -> SignalKind {
    SignalKind::Ice {
        ice: IcePayload { candidate, sdp_mid, sdp_mline_index },
    }
}

pub fn bye() -> SignalKind {
    SignalKind::Bye { bye: true }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ChannelConnection;
    use crate::crypto::Keypair;
    use crate::session::ClientId;

    fn key() -> PeerKey {
        PeerKey {
            document_id: DocumentId::from_bytes([1u8; 32]),
            remote_public_key: Keypair::generate().public_key(),
            remote_client_id: ClientId::generate(),
        }
    }

    #[async_std::test]
    async fn register_emits_peer_created_and_forwards_data() {
        use futures::StreamExt;

        let (manager, mut events) = PeerManager::<ChannelConnection>::new();
        let ((conn_a, rx_a), (conn_b, _rx_b)) = ChannelConnection::pair();
        let k = key();
        let received = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let received2 = received.clone();
        let peer = manager.register_peer(k.clone(), true, conn_a, rx_a, move |_k, bytes| {
            received2.lock().push(bytes);
        });
        assert_eq!(peer.state(), PeerState::Connected);

        match events.next().await {
            Some(PeerManagerEvent::PeerCreated { document_id, .. }) => {
                assert_eq!(document_id, k.document_id)
            }
            _ => panic!("expected peer-created"),
        }

        conn_b.send(b"sync-bytes".to_vec()).await.unwrap();
        // give the forwarding task a turn
        futures_timer::Delay::new(std::time::Duration::from_millis(20)).await;
        assert_eq!(received.lock().as_slice(), [b"sync-bytes".to_vec()]);
    }
}
