//! A distributed document-sharing core for peer-to-peer collaborative
//! whiteboards and notes apps.
//!
//! This crate models the document/header layer, the signaling and typed
//! message exchange, the WebRTC-like peer lifecycle, the per-document CRDT
//! synchronizer, and the encrypted storage pipeline. The concrete RTC
//! transport, the signaling relay server, and the CRDT library itself are
//! external collaborators reached only through trait boundaries
//! ([`connection::Connection`], [`crdt::CrdtDoc`],
//! [`storage::StorageProvider`]); none of them are implemented here beyond
//! small in-memory test doubles.
//!
//! [`SharingConfig`] is the entry point: it opens storage, wires a session,
//! and finishes into an [`sharing::SharingClient`] the way the teacher's own
//! `Migrate`/`Sdk` pair separates schema setup from the running SDK.

pub mod address;
pub mod clock;
pub mod codec;
pub mod connection;
pub mod crdt;
pub mod crypto;
pub mod document;
pub mod dot;
pub mod error;
pub mod exchanger;
pub mod header;
pub mod peer;
pub mod presence;
pub mod registry;
pub mod session;
pub mod sharing;
pub mod signaling;
pub mod storage;
pub mod sync;

pub use address::{Address, DocumentId};
pub use crdt::{CrdtDoc, Heads};
pub use crypto::{AeadKey, AgreementPublicKey, Keypair, PublicKey, Signature};
pub use document::{Document, DocumentEvent};
pub use error::{Error, Result};
pub use header::{DocumentHeader, Metadata};
pub use registry::{DocumentRegistry, RegistryEvent};
pub use session::{ClientId, SessionManager};
pub use sharing::{PeerNeeded, SharingClient};
pub use signaling::{PeerAddress, SignalingClient, SignalingEvent};
pub use storage::{SecureStorageProvider, SledStorageProvider, Storage, StorageEvent, StorageProvider};

use crate::connection::Connection;
use std::sync::Arc;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    tracing_log::LogTracer::init().ok();
    let env = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| "info".to_owned());
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_span_events(FmtSpan::ACTIVE | FmtSpan::CLOSE)
        .with_env_filter(EnvFilter::new(env))
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
    log_panics::init();
}

/// Opens storage and wires a session; `finish` produces the running
/// [`SharingClient`] (spec.md §6 configuration table: `signalingUrl`,
/// `privateKey`/`sessionManager`, `storageProvider`, optional peer
/// factory). Modeled on the teacher's `Migrate::new` → `Migrate::finish`
/// two-phase construction.
pub struct SharingConfig {
    headers: sled::Tree,
    content: sled::Tree,
    session: Arc<SessionManager>,
}

impl SharingConfig {
    /// Opens (or creates) the two sled trees this crate's storage layout
    /// uses (spec.md §6: `hdr/<id>` and `bin/<id>` keys, kept in separate
    /// trees here rather than a shared keyspace) and sets up global tracing.
    pub fn new(db: sled::Db, identity: crypto::Keypair) -> anyhow::Result<Self> {
        init_tracing();
        let headers = db.open_tree("headers")?;
        let content = db.open_tree("content")?;
        Ok(Self {
            headers,
            content,
            session: Arc::new(SessionManager::new(identity)),
        })
    }

    /// A config backed by a temporary, non-persistent sled database, for
    /// tests and short-lived embeddings.
    pub fn memory(identity: crypto::Keypair) -> anyhow::Result<Self> {
        Self::new(sled::Config::new().temporary(true).open()?, identity)
    }

    /// Adopts an already-built session instead of a raw identity, for
    /// callers that pass `sessionManager` directly (spec.md §6).
    pub fn with_session(db: sled::Db, session: Arc<SessionManager>) -> anyhow::Result<Self> {
        init_tracing();
        let headers = db.open_tree("headers")?;
        let content = db.open_tree("content")?;
        Ok(Self { headers, content, session })
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    /// Builds the storage pipeline and document registry, then a
    /// [`SharingClient`] over it (teacher's `Migrate::finish` → `Sdk`).
    pub fn finish<D, Conn>(
        self,
        on_peer_needed: impl Fn(PeerNeeded) + Send + Sync + 'static,
    ) -> Arc<SharingClient<D, SledStorageProvider, SecureStorageProvider<SledStorageProvider>, Conn>>
    where
        D: crdt::CrdtDoc + Send + 'static,
        D::Patch: Send,
        D::SyncState: Send,
        Conn: Connection + 'static,
    {
        let headers = SledStorageProvider::new(self.headers);
        let content = SecureStorageProvider::keyed_by_session(self.content, &self.session);
        let storage = Arc::new(Storage::new(headers, content, |event| match event {
            storage::StorageEvent::SaveFailed { document_id, error } => {
                tracing::error!(document = %document_id, "background save failed: {}", error);
            }
        }));
        let registry = Arc::new(DocumentRegistry::new(storage, |_| {}));
        SharingClient::new(self.session, registry, on_peer_needed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ChannelConnection;
    use crate::crdt::map::MapCrdt;

    #[async_std::test]
    async fn sharing_config_finishes_into_a_usable_client() {
        let identity = Keypair::generate();
        let config = SharingConfig::memory(identity).unwrap();
        let client = config.finish::<MapCrdt, ChannelConnection>(|_| {});
        assert!(!client.signaling().is_connected());
    }
}
