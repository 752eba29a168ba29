//! `DocumentPresence`: ephemeral per-document peer state (SPEC_FULL.md
//! addition formalizing component 12 from the system-overview table).
//!
//! Cursor/selection broadcasts share the same byte-frame peer channel the
//! synchronizer uses, distinguished by a one-byte frame tag prefixed to
//! every frame a `Peer` sends.

use crate::address::DocumentId;
use crate::crypto::PublicKey;
use crate::peer::{Peer, PeerKey};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

pub const FRAME_TAG_SYNC: u8 = 0x01;
pub const FRAME_TAG_PRESENCE: u8 = 0x02;

/// Splits an inbound peer byte frame into its tag and payload. Returns
/// `None` for an empty frame.
pub fn split_frame(frame: &[u8]) -> Option<(u8, &[u8])> {
    frame.split_first().map(|(tag, rest)| (*tag, rest))
}

pub fn tagged_frame(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(tag);
    out.extend_from_slice(payload);
    out
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PresenceCursor {
    pub path: String,
    pub offset: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PresenceSelection {
    pub path: String,
    pub start: u64,
    pub end: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct PresenceFrame {
    cursor: Option<PresenceCursor>,
    selection: Option<PresenceSelection>,
}

#[derive(Clone, Debug, Default)]
pub struct PeerPresence {
    pub cursor: Option<PresenceCursor>,
    pub selection: Option<PresenceSelection>,
}

/// Tracks remote presence state for one document and broadcasts local
/// state to its peers. Never persisted: state is dropped on peer close and
/// plays no part in CRDT convergence (spec.md testable property 5 is
/// unaffected, per SPEC_FULL.md).
pub struct DocumentPresence<C> {
    document_id: DocumentId,
    remote: RwLock<HashMap<PublicKey, PeerPresence>>,
    local: RwLock<PeerPresence>,
}

impl<C: crate::connection::Connection> DocumentPresence<C> {
    pub fn new(document_id: DocumentId) -> Self {
        Self {
            document_id,
            remote: RwLock::new(HashMap::new()),
            local: RwLock::new(PeerPresence::default()),
        }
    }

    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    pub fn remote_presence(&self, peer: &PublicKey) -> Option<PeerPresence> {
        self.remote.read().get(peer).cloned()
    }

    /// Sets the local cursor and broadcasts it, tagged, to every connected
    /// peer for this document.
    pub async fn set_cursor(&self, cursor: Option<PresenceCursor>, peers: &[Arc<Peer<C>>]) {
        self.local.write().cursor = cursor;
        self.broadcast(peers).await;
    }

    pub async fn set_selection(&self, selection: Option<PresenceSelection>, peers: &[Arc<Peer<C>>]) {
        self.local.write().selection = selection;
        self.broadcast(peers).await;
    }

    async fn broadcast(&self, peers: &[Arc<Peer<C>>]) {
        let local = self.local.read().clone();
        let frame = PresenceFrame {
            cursor: local.cursor,
            selection: local.selection,
        };
        let bytes = match serde_cbor::to_vec(&frame) {
            Ok(b) => b,
            Err(err) => {
                tracing::warn!("failed to encode presence frame: {}", err);
                return;
            }
        };
        let tagged = tagged_frame(FRAME_TAG_PRESENCE, &bytes);
        for peer in peers {
            if let Err(err) = peer.send(tagged.clone()).await {
                tracing::debug!("presence send failed for a peer: {}", err);
            }
        }
    }

    /// Applies an inbound presence frame payload (tag already stripped by
    /// the caller's frame dispatch) from `from`.
    pub fn apply_inbound(&self, from: PublicKey, payload: &[u8]) {
        let Some(frame) = crate::codec::try_decode::<PresenceFrame>(payload) else {
            return;
        };
        self.remote.write().insert(
            from,
            PeerPresence {
                cursor: frame.cursor,
                selection: frame.selection,
            },
        );
    }

    /// Drops a peer's presence state on close (spec: "dropped on peer
    /// close").
    pub fn drop_peer(&self, key: &PeerKey) {
        self.remote.write().remove(&key.remote_public_key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_tagging_round_trips() {
        let tagged = tagged_frame(FRAME_TAG_PRESENCE, b"payload");
        let (tag, rest) = split_frame(&tagged).unwrap();
        assert_eq!(tag, FRAME_TAG_PRESENCE);
        assert_eq!(rest, b"payload");
    }

    #[test]
    fn inbound_presence_is_recorded_and_droppable() {
        use crate::connection::ChannelConnection;
        let doc_id = DocumentId::from_bytes([3u8; 32]);
        let presence = DocumentPresence::<ChannelConnection>::new(doc_id);
        let from = crate::crypto::Keypair::generate().public_key();
        let frame = PresenceFrame {
            cursor: Some(PresenceCursor { path: "p".into(), offset: 4 }),
            selection: None,
        };
        let bytes = serde_cbor::to_vec(&frame).unwrap();
        presence.apply_inbound(from, &bytes);
        assert!(presence.remote_presence(&from).unwrap().cursor.is_some());

        let key = PeerKey {
            document_id: doc_id,
            remote_public_key: from,
            remote_client_id: crate::session::ClientId::generate(),
        };
        presence.drop_peer(&key);
        assert!(presence.remote_presence(&from).is_none());
    }
}
