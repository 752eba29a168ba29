//! `MessageExchanger`: tagged-union schema dispatch (spec §4.5).
//!
//! Sum type with a `type` discriminant plus a decoding function that
//! returns `Option<Message>` (spec §9 Design Notes), so a malformed or
//! unrecognized inbound payload is logged and dropped, never propagated as
//! a hard error to the signaling layer.

use crate::address::DocumentId;
use crate::crypto::PublicKey;
use crate::error::{Error, Result};
use crate::signaling::{PeerAddress, SignalingClient};
use serde::{Deserialize, Serialize};

/// One envelope in the signaling protocol (spec §6).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Message {
    #[serde(rename = "request-document")]
    RequestDocument {
        #[serde(rename = "documentId")]
        document_id: String,
    },
    #[serde(rename = "document-response")]
    DocumentResponse {
        #[serde(with = "serde_bytes")]
        document: Vec<u8>,
    },
    #[serde(rename = "signal")]
    Signal {
        #[serde(rename = "documentId")]
        document_id: String,
        #[serde(flatten)]
        kind: SignalKind,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalKind {
    Sdp { sdp: SdpPayload },
    Ice { ice: IcePayload },
    Bye { bye: bool },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SdpPayload {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IcePayload {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u32>,
}

/// Decodes an inbound CBOR payload, returning `None` (and logging) on any
/// schema mismatch, per the "decoding function that returns `Option<Message>`"
/// guidance (spec §9). Subscribers for a given variant only ever see
/// payloads that parsed successfully for that variant (spec §4.5 guarantee,
/// testable property 6).
pub fn decode_message(bytes: &[u8]) -> Option<Message> {
    crate::codec::try_decode(bytes)
}

pub fn encode_message(message: &Message) -> Result<Vec<u8>> {
    crate::codec::to_canonical(message).map_err(|e| Error::StorageFailure(e.into()))
}

/// Recipient for an outbound exchanger message, mirroring `sendMessage`'s
/// optional `to` (spec §4.4): `None` is a clear broadcast reserved for
/// public discovery messages.
pub type Recipient = Option<PeerAddress>;

/// Thin wrapper over a `SignalingClient` that validates outbound payloads
/// against the tagged union before delegating to it (spec §4.5).
pub struct MessageExchanger<C> {
    client: SignalingClient<C>,
}

impl<C> MessageExchanger<C> {
    pub fn new(client: SignalingClient<C>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &SignalingClient<C> {
        &self.client
    }
}

impl<C: crate::connection::Connection> MessageExchanger<C> {
    pub async fn send_message(&self, message: &Message, to: Recipient) -> Result<()> {
        let bytes = encode_message(message)?;
        self.client
            .send_message(to, bytes)
            .await
            .map_err(Error::StorageFailure)
    }

    pub async fn request_document(&self, id: &DocumentId) -> Result<()> {
        self.send_message(
            &Message::RequestDocument {
                document_id: id.to_base58(),
            },
            None,
        )
        .await
    }
}

/// Inbound dispatch result, keyed by message type (spec §4.5 "emit an event
/// keyed by `data.type`").
pub enum Dispatched {
    RequestDocument { from: PublicKey, document_id: DocumentId },
    DocumentResponse { from: PublicKey, document: Vec<u8> },
    Signal { from: PublicKey, document_id: DocumentId, kind: SignalKind },
}

/// Validates and routes one inbound `(from, data)` pair. Schema failures
/// and unparseable document ids are dropped silently — never surfaced as
/// an error to the caller (spec §4.5, §7 `SchemaRejected`).
pub fn dispatch(from: PublicKey, data: &[u8]) -> Option<Dispatched> {
    let message = decode_message(data)?;
    match message {
        Message::RequestDocument { document_id } => {
            let document_id = DocumentId::from_base58(&document_id)?;
            Some(Dispatched::RequestDocument { from, document_id })
        }
        Message::DocumentResponse { document } => {
            Some(Dispatched::DocumentResponse { from, document })
        }
        Message::Signal { document_id, kind } => {
            let document_id = DocumentId::from_base58(&document_id)?;
            Some(Dispatched::Signal { from, document_id, kind })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_round_trip() {
        let msg = Message::RequestDocument {
            document_id: "abc".into(),
        };
        let bytes = encode_message(&msg).unwrap();
        let decoded = decode_message(&bytes).unwrap();
        assert!(matches!(decoded, Message::RequestDocument { .. }));
    }

    #[test]
    fn schema_mismatch_is_dropped_not_panicked() {
        // {"type": "request-document", "documentId": 42} — wrong field
        // name and wrong type, scenario S6.
        let mut map = std::collections::BTreeMap::new();
        map.insert("type".to_string(), serde_cbor::Value::Text("request-document".into()));
        map.insert("documentId".to_string(), serde_cbor::Value::Integer(42));
        let value = serde_cbor::Value::Map(
            map.into_iter()
                .map(|(k, v)| (serde_cbor::Value::Text(k), v))
                .collect(),
        );
        let bytes = serde_cbor::to_vec(&value).unwrap();
        assert!(decode_message(&bytes).is_none());
    }
}
