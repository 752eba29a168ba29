//! `DocumentHeader`: the signed authorization envelope (spec §3, §4.1).

use crate::address::{Address, DocumentId};
use crate::codec;
use crate::crypto::{Keypair, PublicKey, Signature};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// User-defined, opaque metadata attached to a header.
pub type Metadata = BTreeMap<String, serde_cbor::Value>;

/// Signed authorization envelope for a document.
///
/// Field order in the canonical on-wire encoding is fixed by spec §6:
/// `[address, owner, version, allowed_users (sorted), metadata, signature]`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DocumentHeader {
    address: Address,
    owner: PublicKey,
    allowed_users: BTreeSet<PublicKey>,
    version: u64,
    metadata: Metadata,
    signature: Signature,
}

/// The unsigned body, serialized in canonical field order for signing.
/// A tuple struct, not a named-field one, so `serde_cbor` emits the fixed
/// `[address, owner, version, allowed_users, metadata]` array spec §6
/// requires rather than a map keyed by field name.
#[derive(Serialize, Deserialize)]
struct CanonicalBody(
    [u8; 48],
    [u8; 32],
    u64,
    Vec<[u8; 32]>,
    Metadata,
);

/// The full signed encoding: body fields plus the trailing signature.
#[derive(Serialize, Deserialize)]
struct CanonicalHeader(
    [u8; 48],
    [u8; 32],
    u64,
    Vec<[u8; 32]>,
    Metadata,
    [u8; 64],
);

impl DocumentHeader {
    /// Creates a fresh header: new address, version 1, owner auto-allowed.
    pub fn create(
        private_key: &Keypair,
        allowed_users: impl IntoIterator<Item = PublicKey>,
        metadata: Metadata,
    ) -> Self {
        let owner = private_key.public_key();
        let address = Address::new(owner);
        let mut allowed_users: BTreeSet<PublicKey> = allowed_users.into_iter().collect();
        allowed_users.insert(owner);
        let version = 1;
        let signature = Self::sign_body(private_key, &address, owner, version, &allowed_users, &metadata);
        Self {
            address,
            owner,
            allowed_users,
            version,
            metadata,
            signature,
        }
    }

    fn sign_body(
        private_key: &Keypair,
        address: &Address,
        owner: PublicKey,
        version: u64,
        allowed_users: &BTreeSet<PublicKey>,
        metadata: &Metadata,
    ) -> Signature {
        let body = CanonicalBody(
            address.to_bytes(),
            *owner.as_bytes(),
            version,
            allowed_users.iter().map(|k| *k.as_bytes()).collect(),
            metadata.clone(),
        );
        let bytes = codec::to_canonical(&body).expect("header body always encodes");
        private_key.sign(&bytes)
    }

    /// Decodes and verifies a header exported via [`DocumentHeader::export`].
    pub fn import(bytes: &[u8]) -> Result<Self> {
        let decoded: CanonicalHeader =
            codec::from_canonical(bytes).map_err(|_| Error::InvalidHeader)?;
        let address = Address::from_bytes(&decoded.0).ok_or(Error::InvalidHeader)?;
        let owner = PublicKey::from_bytes(decoded.1);
        if address.owner() != &owner {
            return Err(Error::InvalidHeader);
        }
        let allowed_users: BTreeSet<PublicKey> = decoded
            .3
            .iter()
            .map(|b| PublicKey::from_bytes(*b))
            .collect();
        let signature = Signature::from_bytes(decoded.5);
        let header = Self {
            address,
            owner,
            allowed_users,
            version: decoded.2,
            metadata: decoded.4,
            signature,
        };
        let body = CanonicalBody(
            header.address.to_bytes(),
            *header.owner.as_bytes(),
            header.version,
            header.allowed_users.iter().map(|k| *k.as_bytes()).collect(),
            header.metadata.clone(),
        );
        let body_bytes = codec::to_canonical(&body).map_err(|_| Error::InvalidHeader)?;
        owner
            .verify(&body_bytes, &header.signature)
            .map_err(|_| Error::InvalidHeader)?;
        Ok(header)
    }

    /// Canonical encoding, field order fixed by spec §6.
    pub fn export(&self) -> Vec<u8> {
        let encoded = CanonicalHeader(
            self.address.to_bytes(),
            *self.owner.as_bytes(),
            self.version,
            self.allowed_users.iter().map(|k| *k.as_bytes()).collect(),
            self.metadata.clone(),
            *self.signature.as_bytes(),
        );
        codec::to_canonical(&encoded).expect("header always encodes")
    }

    /// Static upgrade rule: same address, strictly greater version, valid
    /// signature under the *old* header's owner. Returns `new` unmutated on
    /// success; the old header is left untouched on rejection.
    pub fn upgrade(old: &DocumentHeader, new: DocumentHeader) -> Result<DocumentHeader> {
        if new.address.document_id() != old.address.document_id() {
            return Err(Error::HeaderUpgradeRejected);
        }
        if new.version <= old.version {
            return Err(Error::HeaderUpgradeRejected);
        }
        if new.owner != old.owner {
            return Err(Error::HeaderUpgradeRejected);
        }
        // Re-verify against `old.owner` specifically, rather than trusting
        // that `new` already self-verified under its own embedded owner.
        let body = CanonicalBody(
            new.address.to_bytes(),
            *new.owner.as_bytes(),
            new.version,
            new.allowed_users.iter().map(|k| *k.as_bytes()).collect(),
            new.metadata.clone(),
        );
        let body_bytes = codec::to_canonical(&body).map_err(|_| Error::HeaderUpgradeRejected)?;
        old.owner
            .verify(&body_bytes, &new.signature)
            .map_err(|_| Error::HeaderUpgradeRejected)?;
        Ok(new)
    }

    pub fn verify_signature(&self, content: &[u8], signature: &Signature) -> bool {
        self.owner.verify(content, signature).is_ok()
    }

    pub fn has_allowed_user(&self, pubkey: &PublicKey) -> bool {
        self.allowed_users.contains(pubkey)
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn document_id(&self) -> DocumentId {
        self.address.document_id()
    }

    pub fn owner(&self) -> &PublicKey {
        &self.owner
    }

    pub fn allowed_users(&self) -> &BTreeSet<PublicKey> {
        &self.allowed_users
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}

/// Signs `content` under `private_key`, failing if the signer is not an
/// allowed user of `header` (spec §4.2 `export`, property 3).
pub fn sign_authorized(
    header: &DocumentHeader,
    private_key: &Keypair,
    content: &[u8],
) -> Result<Signature> {
    if !header.has_allowed_user(&private_key.public_key()) {
        return Err(Error::Unauthorized);
    }
    Ok(private_key.sign(content))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_and_verify() {
        let owner = Keypair::generate();
        let header = DocumentHeader::create(&owner, [], Metadata::new());
        let exported = header.export();
        let imported = DocumentHeader::import(&exported).unwrap();
        assert_eq!(imported, header);
        assert!(imported.has_allowed_user(&owner.public_key()));
    }

    #[test]
    fn upgrade_requires_strictly_greater_version() {
        let owner = Keypair::generate();
        let h1 = DocumentHeader::create(&owner, [], Metadata::new());
        let other = Keypair::generate().public_key();
        let mut allowed: Vec<PublicKey> = h1.allowed_users().iter().copied().collect();
        allowed.push(other);
        let h1_again =
            DocumentHeader::create(&owner, allowed.clone(), Metadata::new());
        // h1_again has its own fresh address, so build h2 by hand sharing h1's address.
        let h2 = {
            let mut allowed_users: BTreeSet<PublicKey> = h1.allowed_users().clone();
            allowed_users.insert(other);
            build_with_address(&owner, h1.address().clone(), 2, allowed_users, Metadata::new())
        };
        assert!(DocumentHeader::upgrade(&h1, h2.clone()).is_ok());

        let stale = build_with_address(&owner, h1.address().clone(), 1, h1.allowed_users().clone(), Metadata::new());
        assert!(DocumentHeader::upgrade(&h1, stale).is_err());
        let _ = h1_again;
    }

    fn build_with_address(
        owner_key: &Keypair,
        address: Address,
        version: u64,
        allowed_users: BTreeSet<PublicKey>,
        metadata: Metadata,
    ) -> DocumentHeader {
        let signature = DocumentHeader::sign_body(
            owner_key,
            &address,
            owner_key.public_key(),
            version,
            &allowed_users,
            &metadata,
        );
        DocumentHeader {
            address,
            owner: owner_key.public_key(),
            allowed_users,
            version,
            metadata,
            signature,
        }
    }

    #[test]
    fn export_authorization() {
        let owner = Keypair::generate();
        let header = DocumentHeader::create(&owner, [], Metadata::new());
        let outsider = Keypair::generate();
        assert!(sign_authorized(&header, &owner, b"data").is_ok());
        assert!(matches!(
            sign_authorized(&header, &outsider, b"data"),
            Err(Error::Unauthorized)
        ));
    }
}
