//! Signing, key agreement and authenticated encryption primitives.
//!
//! Treated by the rest of the crate as a small named API (see the spec's
//! scope notes): Ed25519 for signing, a static X25519 Diffie-Hellman
//! keypair derived from the same identity seed for per-peer shared
//! secrets, and ChaCha20-Poly1305 for AEAD. None of these choices are
//! load-bearing for callers — everything above this module only sees
//! `PublicKey`, `AgreementPublicKey`, `Keypair`, `Signature` and `AeadKey`.

use chacha20poly1305::aead::{Aead, NewAead};
use chacha20poly1305::{ChaCha20Poly1305, Key as ChaChaKey, Nonce as ChaChaNonce};
use ed25519_dalek::{Signer, Verifier};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::convert::TryInto;
use std::fmt;
use thiserror::Error;

/// Failure from a cryptographic operation. Never silently substituted for a
/// different outcome — callers surface this to the user (spec §7: `CryptoFailure`).
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("malformed key material")]
    MalformedKey,
    #[error("signature verification failed")]
    BadSignature,
    #[error("AEAD decryption failed")]
    Decrypt,
}

/// A 32-byte Ed25519 public key, doubling as a peer/user identity.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "serde_bytes")] [u8; 32]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn verify(&self, message: &[u8], sig: &Signature) -> Result<(), CryptoError> {
        let key = ed25519_dalek::PublicKey::from_bytes(&self.0)
            .map_err(|_| CryptoError::MalformedKey)?;
        let sig =
            ed25519_dalek::Signature::from_bytes(&sig.0).map_err(|_| CryptoError::MalformedKey)?;
        key.verify(message, &sig).map_err(|_| CryptoError::BadSignature)
    }

    /// Base58 rendering used for wire addressing (spec §6).
    pub fn to_base58(&self) -> String {
        bs58::encode(self.0).into_string()
    }

    pub fn from_base58(s: &str) -> Result<Self, CryptoError> {
        let bytes = bs58::decode(s).into_vec().map_err(|_| CryptoError::MalformedKey)?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::MalformedKey)?;
        Ok(Self(bytes))
    }
}

impl AsRef<[u8]> for PublicKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({:.8})", self.to_base58())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base58())
    }
}

/// X25519 public half of a peer's key-agreement keypair. Exchanged during
/// the signaling handshake (§4.4) alongside the identity `PublicKey`, since
/// an Ed25519 public point cannot be converted to its X25519 counterpart
/// without the matching private scalar.
#[derive(Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub struct AgreementPublicKey(#[serde(with = "serde_bytes")] [u8; 32]);

impl AgreementPublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// A detached Ed25519 signature.
#[derive(Clone, Copy, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "serde_bytes")] [u8; 64]);

impl Signature {
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

/// Long-term identity keypair. One is generated per `Session` and persists
/// for the process lifetime (spec §3 Session). Also carries a static X25519
/// agreement keypair derived from the same seed, used to establish
/// per-peer shared secrets.
pub struct Keypair {
    inner: ed25519_dalek::Keypair,
    agreement_secret: x25519_dalek::StaticSecret,
    agreement_public: x25519_dalek::PublicKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Self::from_seed(seed)
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        let secret = ed25519_dalek::SecretKey::from_bytes(&seed).expect("32-byte seed is valid");
        let public = ed25519_dalek::PublicKey::from(&secret);
        // Derive the X25519 scalar from the Ed25519 seed the way
        // libsodium's `crypto_sign_ed25519_sk_to_curve25519` does: hash the
        // seed and clamp the low half.
        let hash = Sha512::digest(&seed);
        let mut scalar = [0u8; 32];
        scalar.copy_from_slice(&hash[..32]);
        let agreement_secret = x25519_dalek::StaticSecret::from(scalar);
        let agreement_public = x25519_dalek::PublicKey::from(&agreement_secret);
        Self {
            inner: ed25519_dalek::Keypair { secret, public },
            agreement_secret,
            agreement_public,
        }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.inner.public.to_bytes())
    }

    pub fn agreement_public(&self) -> AgreementPublicKey {
        AgreementPublicKey(*self.agreement_public.as_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.inner.sign(message).to_bytes())
    }

    /// Derives the symmetric secret shared with a peer whose agreement
    /// public key is `their`, used to encrypt the `data` field of
    /// per-recipient signaling envelopes (spec §4.4).
    pub fn agree(&self, their: &AgreementPublicKey) -> AeadKey {
        let their = x25519_dalek::PublicKey::from(their.0);
        let shared = self.agreement_secret.diffie_hellman(&their);
        AeadKey(*shared.as_bytes())
    }

    /// Derives a domain-separated symmetric key from this identity's seed,
    /// independent of any peer agreement (used for local content
    /// encryption, spec §4.3, rather than per-peer secrets).
    pub fn derive_key(&self, context: &[u8]) -> AeadKey {
        let mut hasher = Sha512::new();
        hasher.update(b"tandem-doc-derive-key");
        hasher.update(context);
        hasher.update(&self.inner.secret.to_bytes());
        let hash = hasher.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&hash[..32]);
        AeadKey(bytes)
    }
}

/// A symmetric AEAD key, either derived via key agreement or generated
/// locally for content encryption (spec §4.3).
#[derive(Clone, Serialize, Deserialize)]
pub struct AeadKey(#[serde(with = "serde_bytes")] [u8; 32]);

impl AeadKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Encrypts `plaintext` with a fresh random nonce, authenticating `aad`.
    /// The nonce is prepended to the returned ciphertext (spec §6: "AEAD
    /// nonce is prepended to the ciphertext").
    pub fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Vec<u8> {
        let cipher = ChaCha20Poly1305::new(ChaChaKey::from_slice(&self.0));
        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = ChaChaNonce::from_slice(&nonce_bytes);
        let payload = chacha20poly1305::aead::Payload { msg: plaintext, aad };
        let ciphertext = cipher.encrypt(nonce, payload).expect("encryption is infallible here");
        let mut out = Vec::with_capacity(12 + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        out
    }

    pub fn decrypt(&self, framed: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if framed.len() < 12 {
            return Err(CryptoError::Decrypt);
        }
        let (nonce_bytes, ciphertext) = framed.split_at(12);
        let cipher = ChaCha20Poly1305::new(ChaChaKey::from_slice(&self.0));
        let nonce = ChaChaNonce::from_slice(nonce_bytes);
        let payload = chacha20poly1305::aead::Payload { msg: ciphertext, aad };
        cipher.decrypt(nonce, payload).map_err(|_| CryptoError::Decrypt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let kp = Keypair::generate();
        let sig = kp.sign(b"hello");
        assert!(kp.public_key().verify(b"hello", &sig).is_ok());
        assert!(kp.public_key().verify(b"tampered", &sig).is_err());
    }

    #[test]
    fn agreement_is_symmetric() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let secret_ab = a.agree(&b.agreement_public());
        let secret_ba = b.agree(&a.agreement_public());
        assert_eq!(secret_ab.0, secret_ba.0);
    }

    #[test]
    fn aead_round_trip() {
        let key = AeadKey::generate();
        let ct = key.encrypt(b"payload", b"aad");
        let pt = key.decrypt(&ct, b"aad").unwrap();
        assert_eq!(pt, b"payload");
        assert!(key.decrypt(&ct, b"wrong-aad").is_err());
    }

    #[test]
    fn base58_round_trip() {
        let kp = Keypair::generate();
        let encoded = kp.public_key().to_base58();
        let decoded = PublicKey::from_base58(&encoded).unwrap();
        assert_eq!(kp.public_key(), decoded);
    }
}
