//! `SessionManager`: client-side ephemeral key set (spec §3 Session).
//!
//! Modeled on the teacher's `Secrets`/`Metadata` keyed lookup
//! (`src/secrets.rs`), adapted from a sled-backed store to an in-memory
//! cache since session material is explicitly process-lifetime and cleared
//! on logout, never persisted.

use crate::crypto::{AeadKey, AgreementPublicKey, Keypair, PublicKey};
use parking_lot::RwLock;
use rand_core::{OsRng, RngCore};
use std::collections::HashMap;
use std::convert::TryInto;

/// Random 16-byte short-term identifier, distinct from the long-term
/// identity key, refreshed every process start.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub struct ClientId([u8; 16]);

impl ClientId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn to_base58(&self) -> String {
        bs58::encode(self.0).into_string()
    }

    pub fn from_base58(s: &str) -> Option<Self> {
        let bytes = bs58::decode(s).into_vec().ok()?;
        Some(Self(bytes.try_into().ok()?))
    }
}

struct PeerDirectoryEntry {
    agreement_public: AgreementPublicKey,
    shared_secret: AeadKey,
}

/// Owns the long-term identity, the short-term client id, and a directory
/// of per-peer agreement public keys and derived shared secrets.
pub struct SessionManager {
    identity: Keypair,
    client_id: ClientId,
    directory: RwLock<HashMap<PublicKey, PeerDirectoryEntry>>,
}

impl SessionManager {
    pub fn new(identity: Keypair) -> Self {
        Self {
            identity,
            client_id: ClientId::generate(),
            directory: RwLock::new(HashMap::new()),
        }
    }

    pub fn generate() -> Self {
        Self::new(Keypair::generate())
    }

    pub fn public_key(&self) -> PublicKey {
        self.identity.public_key()
    }

    pub fn agreement_public(&self) -> AgreementPublicKey {
        self.identity.agreement_public()
    }

    /// Key used by `SecureStorageProvider` to encrypt local content blobs
    /// (spec §4.3, §9 Open Question: session-manager-derived rather than
    /// directly from the private key, so it can be rotated by swapping the
    /// session's identity without re-deriving from raw key material).
    pub fn content_key(&self) -> AeadKey {
        self.identity.derive_key(b"storage-content")
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn identity(&self) -> &Keypair {
        &self.identity
    }

    /// Records a peer's agreement public key, learned out-of-band during
    /// the signaling handshake (spec §4.4), and derives the shared secret
    /// used for per-recipient encryption with that peer.
    pub fn remember_peer(&self, peer: PublicKey, agreement_public: AgreementPublicKey) {
        let shared_secret = self.identity.agree(&agreement_public);
        self.directory.write().insert(
            peer,
            PeerDirectoryEntry {
                agreement_public,
                shared_secret,
            },
        );
    }

    /// The shared secret for a peer already recorded via
    /// [`SessionManager::remember_peer`], if any.
    pub fn shared_secret(&self, peer: &PublicKey) -> Option<AeadKey> {
        self.directory.read().get(peer).map(|e| e.shared_secret.clone())
    }

    pub fn peer_agreement_public(&self, peer: &PublicKey) -> Option<AgreementPublicKey> {
        self.directory.read().get(peer).map(|e| e.agreement_public)
    }

    /// Clears all derived per-peer material. The long-term identity and
    /// client id are untouched; a fresh `SessionManager` is required for a
    /// genuine logout.
    pub fn clear_peers(&self) {
        self.directory.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remembered_peer_yields_symmetric_secret() {
        let a = SessionManager::generate();
        let b = SessionManager::generate();
        a.remember_peer(b.public_key(), b.agreement_public());
        b.remember_peer(a.public_key(), a.agreement_public());
        let secret_a = a.shared_secret(&b.public_key()).unwrap();
        let secret_b = b.shared_secret(&a.public_key()).unwrap();
        let ct = secret_a.encrypt(b"hi", b"aad");
        let pt = secret_b.decrypt(&ct, b"aad").unwrap();
        assert_eq!(pt, b"hi");
    }

    #[test]
    fn unremembered_peer_has_no_secret() {
        let a = SessionManager::generate();
        let other = Keypair::generate().public_key();
        assert!(a.shared_secret(&other).is_none());
    }
}
