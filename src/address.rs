//! Document addressing (spec §3, §6).
//!
//! An `Address` is an owner public key plus a random nonce; a `DocumentId`
//! is the base58 rendering of its SHA-256 hash. Modeled on the teacher's
//! `DocId`/`PeerId` newtype wrappers (`crdt/src/id.rs`), generalized from a
//! raw 32-byte identity to a hash of owner-key-plus-nonce so two documents
//! owned by the same key never collide.

use crate::crypto::PublicKey;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::convert::TryInto;
use std::fmt;

/// Owner public key plus a random nonce. Immutable once created.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Address {
    owner: PublicKey,
    #[serde(with = "serde_bytes")]
    nonce: [u8; 16],
}

impl Address {
    pub fn new(owner: PublicKey) -> Self {
        let mut nonce = [0u8; 16];
        OsRng.fill_bytes(&mut nonce);
        Self { owner, nonce }
    }

    pub fn from_parts(owner: PublicKey, nonce: [u8; 16]) -> Self {
        Self { owner, nonce }
    }

    pub fn owner(&self) -> &PublicKey {
        &self.owner
    }

    pub fn nonce(&self) -> &[u8; 16] {
        &self.nonce
    }

    /// Raw bytes of the address, `owner_pubkey ‖ nonce` (spec §6).
    pub fn to_bytes(&self) -> [u8; 48] {
        let mut out = [0u8; 48];
        out[..32].copy_from_slice(self.owner.as_bytes());
        out[32..].copy_from_slice(&self.nonce);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 48 {
            return None;
        }
        let owner: [u8; 32] = bytes[..32].try_into().ok()?;
        let nonce: [u8; 16] = bytes[32..].try_into().ok()?;
        Some(Self {
            owner: PublicKey::from_bytes(owner),
            nonce,
        })
    }

    /// DocumentId: base58 of SHA-256(owner_pubkey ‖ nonce).
    pub fn document_id(&self) -> DocumentId {
        let hash = Sha256::digest(self.to_bytes());
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&hash);
        DocumentId(bytes)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.document_id())
    }
}

/// Base58-encoded document identifier, cached alongside an `Address`.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct DocumentId([u8; 32]);

impl DocumentId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_base58(&self) -> String {
        bs58::encode(self.0).into_string()
    }

    pub fn from_base58(s: &str) -> Option<Self> {
        let bytes = bs58::decode(s).into_vec().ok()?;
        let bytes: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }
}

impl fmt::Debug for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base58())
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base58())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;

    #[test]
    fn address_round_trip() {
        let owner = Keypair::generate().public_key();
        let addr = Address::new(owner);
        let bytes = addr.to_bytes();
        let back = Address::from_bytes(&bytes).unwrap();
        assert_eq!(addr.document_id(), back.document_id());
    }

    #[test]
    fn distinct_nonces_give_distinct_ids() {
        let owner = Keypair::generate().public_key();
        let a = Address::new(owner);
        let b = Address::new(owner);
        assert_ne!(a.document_id(), b.document_id());
    }
}
