//! `DocumentSynchronizer`: per-document CRDT sync protocol across peers
//! (spec §4.7).

use crate::address::DocumentId;
use crate::crdt::CrdtDoc;
use crate::peer::{Peer, PeerKey};
use crate::presence::{split_frame, tagged_frame, FRAME_TAG_SYNC};
use futures::channel::mpsc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

const HIGH_WATER_MARK: usize = 64;

struct PeerSyncSlot<D: CrdtDoc> {
    state: D::SyncState,
    outbound: Vec<Vec<u8>>,
    paused: bool,
}

impl<D: CrdtDoc> Default for PeerSyncSlot<D> {
    fn default() -> Self {
        Self {
            state: D::SyncState::default(),
            outbound: Vec::new(),
            paused: false,
        }
    }
}

/// Drives the CRDT sync protocol for one live document across all of its
/// peers: maintains per-peer sync state, coalesces outbound sync messages,
/// and applies backpressure per peer (spec §4.7).
pub struct DocumentSynchronizer<D: CrdtDoc, C> {
    document_id: DocumentId,
    slots: Mutex<HashMap<PeerKey, PeerSyncSlot<D>>>,
    _marker: std::marker::PhantomData<C>,
}

impl<D: CrdtDoc, C: crate::connection::Connection> DocumentSynchronizer<D, C> {
    pub fn new(document_id: DocumentId) -> Self {
        Self {
            document_id,
            slots: Mutex::new(HashMap::new()),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    /// Registers a newly created peer for this document (spec §4.7
    /// "subscribes to peer-created... filtered by its document id").
    pub fn add_peer(&self, key: PeerKey) {
        self.slots.lock().entry(key).or_default();
    }

    /// Drops a peer's sync state on close (spec §4.7 "on peer close: drops
    /// its sync state").
    pub fn remove_peer(&self, key: &PeerKey) {
        self.slots.lock().remove(key);
    }

    /// Called on the document's `change` event: generates the next sync
    /// message for every peer and sends it if non-empty and the peer is not
    /// currently paused for backpressure.
    pub async fn on_change(&self, doc: &D, peers: &HashMap<PeerKey, Arc<Peer<C>>>) {
        let keys: Vec<PeerKey> = self.slots.lock().keys().cloned().collect();
        for key in keys {
            self.generate_and_enqueue(doc, &key);
            self.drain_peer(&key, peers).await;
        }
    }

    fn generate_and_enqueue(&self, doc: &D, key: &PeerKey) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(key) {
            if let Some(message) = doc.generate_sync_message(&mut slot.state) {
                slot.outbound.push(message);
            }
        }
    }

    /// Sends queued messages to `key`'s peer, respecting backpressure: once
    /// the outbound queue exceeds the high-water mark, sending pauses until
    /// a future drain call finds room again. Per-peer ordering is strict
    /// FIFO; across peers there is no ordering (spec §4.7).
    async fn drain_peer(&self, key: &PeerKey, peers: &HashMap<PeerKey, Arc<Peer<C>>>) {
        let Some(peer) = peers.get(key) else { return };
        loop {
            let next = {
                let mut slots = self.slots.lock();
                let Some(slot) = slots.get_mut(key) else { return };
                if slot.paused && slot.outbound.len() <= HIGH_WATER_MARK / 2 {
                    slot.paused = false;
                }
                if slot.paused || slot.outbound.is_empty() {
                    None
                } else {
                    Some(slot.outbound.remove(0))
                }
            };
            let Some(message) = next else { return };
            let framed = tagged_frame(FRAME_TAG_SYNC, &message);
            if peer.send(framed).await.is_err() {
                return;
            }
            let mut slots = self.slots.lock();
            if let Some(slot) = slots.get_mut(key) {
                if slot.outbound.len() > HIGH_WATER_MARK {
                    slot.paused = true;
                }
            }
        }
    }

    /// Feeds inbound bytes (already stripped of the sync frame tag by the
    /// caller's `split_frame` dispatch) to the CRDT's receive-sync-message
    /// function and applies any resulting change via `doc`. Returns the
    /// patches produced, if any, so the caller can emit `change`/`patch`
    /// events.
    pub fn on_inbound(&self, doc: &mut D, key: &PeerKey, payload: &[u8]) -> Vec<D::Patch> {
        let mut slots = self.slots.lock();
        let slot = slots.entry(key.clone()).or_default();
        doc.receive_sync_message(&mut slot.state, payload)
    }

    /// Demultiplexes a raw peer frame into sync bytes, ignoring anything
    /// tagged as presence (spec-full frame tagging).
    pub fn sync_payload(frame: &[u8]) -> Option<&[u8]> {
        let (tag, rest) = split_frame(frame)?;
        if tag == FRAME_TAG_SYNC {
            Some(rest)
        } else {
            None
        }
    }
}

/// Reports whether two documents have converged (spec §8 testable property
/// 5 and scenario S4/S5): identical CRDT heads after a quiescent period.
pub fn has_converged<D: CrdtDoc>(a: &D, b: &D) -> bool {
    a.get_heads() == b.get_heads()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ChannelConnection;
    use crate::crdt::map::{MapCrdt, Value};
    use crate::crypto::Keypair;
    use crate::session::ClientId;

    fn peer_key(document_id: DocumentId) -> PeerKey {
        PeerKey {
            document_id,
            remote_public_key: Keypair::generate().public_key(),
            remote_client_id: ClientId::generate(),
        }
    }

    #[async_std::test]
    async fn sync_converges_across_peers() {
        let document_id = DocumentId::from_bytes([9u8; 32]);
        let mut a = MapCrdt::init();
        let mut b = MapCrdt::init();
        a.set("n", Value::Int(42));

        let sync_a = DocumentSynchronizer::<MapCrdt, ChannelConnection>::new(document_id);
        let sync_b = DocumentSynchronizer::<MapCrdt, ChannelConnection>::new(document_id);
        let key_ab = peer_key(document_id);
        let key_ba = peer_key(document_id);
        sync_a.add_peer(key_ab.clone());
        sync_b.add_peer(key_ba.clone());

        let ((conn_a, _rx_a), (conn_b, mut rx_b)) = ChannelConnection::pair();
        let peer_a = Arc::new(make_peer(key_ab.clone(), conn_a));
        let mut peers_a = HashMap::new();
        peers_a.insert(key_ab.clone(), peer_a);

        sync_a.on_change(&a, &peers_a).await;

        use futures::StreamExt;
        if let Some(crate::connection::ConnectionEvent::Data(frame)) = rx_b.next().await {
            let payload = DocumentSynchronizer::<MapCrdt, ChannelConnection>::sync_payload(&frame).unwrap();
            sync_b.on_inbound(&mut b, &key_ba, payload);
        }
        let _ = conn_b;

        assert!(has_converged(&a, &b));
    }

    fn make_peer(key: PeerKey, connection: ChannelConnection) -> Peer<ChannelConnection> {
        // Exercised only through `send`; constructed via the manager in
        // production code, built directly here to keep the test narrow.
        crate::peer::test_support::new_connected_peer(key, connection)
    }
}
