//! `SharingClient`: the public facade tying signaling, peers, sync and
//! storage together (spec §4.8).

use crate::address::DocumentId;
use crate::connection::{Connection, ConnectionEvent};
use crate::crdt::CrdtDoc;
use crate::document::{Document, DocumentEvent};
use crate::error::{Error, Result};
use crate::exchanger::{decode_message, encode_message, Dispatched, Message, SdpKind, SignalKind};
use crate::peer::{Peer, PeerKey, PeerManager, PeerManagerEvent, RegistryGate, SignalGate};
use crate::registry::DocumentRegistry;
use crate::session::SessionManager;
use crate::signaling::SignalingClient;
use crate::storage::StorageProvider;
use crate::sync::DocumentSynchronizer;
use futures::channel::{mpsc, oneshot};
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

const REQUEST_DOCUMENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Fired when a peer needs to be negotiated for `(document, remote)`. The
/// actual SDP/ICE exchange is the embedder's responsibility — the concrete
/// RTC transport is out of scope (spec §1) — but once it has produced a
/// `Connection`, the embedder hands it back via
/// [`SharingClient::register_peer`] to finish wiring it into the sync
/// pipeline.
pub enum PeerNeeded {
    AsInitiator { document_id: DocumentId, remote: crate::crypto::PublicKey },
    AsResponder { document_id: DocumentId, remote: crate::crypto::PublicKey },
}

/// Public facade: request, find, list, share documents (spec §4.8).
pub struct SharingClient<D: CrdtDoc, H, SC, Conn> {
    session: Arc<SessionManager>,
    signaling: Arc<SignalingClient<Conn>>,
    registry: Arc<DocumentRegistry<D, H, SC>>,
    peer_manager: PeerManager<Conn>,
    synchronizers: Mutex<HashMap<DocumentId, Arc<DocumentSynchronizer<D, Conn>>>>,
    pending_requests: Mutex<HashMap<DocumentId, Vec<oneshot::Sender<()>>>>,
    on_peer_needed: Box<dyn Fn(PeerNeeded) + Send + Sync>,
}

impl<D, H, SC, Conn> SharingClient<D, H, SC, Conn>
where
    D: CrdtDoc + Send + 'static,
    D::Patch: Send,
    D::SyncState: Send,
    H: StorageProvider + Clone + 'static,
    SC: StorageProvider + Clone + 'static,
    Conn: Connection + 'static,
{
    /// Wires a session, a fresh `SignalingClient`, a registry and a
    /// `PeerManager` together, spawning the background tasks that dispatch
    /// inbound signaling messages and drive the per-document synchronizers
    /// off `peer-created`/`peer-destroyed` events (spec §4.8's "owns one
    /// SignalingClient, one MessageExchanger ... exchanger routes typed
    /// messages"; spec §4.7's "subscribes to peer-created/peer-destroyed").
    pub fn new(
        session: Arc<SessionManager>,
        registry: Arc<DocumentRegistry<D, H, SC>>,
        on_peer_needed: impl Fn(PeerNeeded) + Send + Sync + 'static,
    ) -> Arc<Self> {
        let (signaling, events) = SignalingClient::<Conn>::new(session.clone());
        let (peer_manager, peer_events) = PeerManager::<Conn>::new();
        let client = Arc::new(Self {
            session,
            signaling: Arc::new(signaling),
            registry,
            peer_manager,
            synchronizers: Mutex::new(HashMap::new()),
            pending_requests: Mutex::new(HashMap::new()),
            on_peer_needed: Box::new(on_peer_needed),
        });
        client.clone().spawn_dispatch_loop(events);
        client.clone().spawn_peer_event_loop(peer_events);
        client
    }

    fn spawn_dispatch_loop(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<crate::signaling::SignalingEvent>) {
        async_global_executor::spawn(async move {
            while let Some(event) = events.next().await {
                if let crate::signaling::SignalingEvent::Message { from, data } = event {
                    self.handle_inbound(from.public_key, &data).await;
                }
            }
        })
        .detach();
    }

    /// Drains `peer-created`/`peer-destroyed` into the matching document's
    /// synchronizer: a fresh peer is registered and given an initial sync
    /// pass immediately (spec §4.7), a destroyed one drops its sync state.
    fn spawn_peer_event_loop(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<PeerManagerEvent<Conn>>) {
        async_global_executor::spawn(async move {
            while let Some(event) = events.next().await {
                match event {
                    PeerManagerEvent::PeerCreated { document_id, peer } => {
                        let sync = self.synchronizer(document_id);
                        sync.add_peer(peer.key().clone());
                        self.drive_sync(document_id).await;
                    }
                    PeerManagerEvent::PeerDestroyed { document_id, peer } => {
                        if let Some(sync) = self.synchronizers.lock().get(&document_id).cloned() {
                            sync.remove_peer(peer.key());
                        }
                    }
                }
            }
        })
        .detach();
    }

    fn synchronizer(&self, document_id: DocumentId) -> Arc<DocumentSynchronizer<D, Conn>> {
        self.synchronizers
            .lock()
            .entry(document_id)
            .or_insert_with(|| Arc::new(DocumentSynchronizer::new(document_id)))
            .clone()
    }

    /// Builds a `Document` event hook that drives `document_id`'s
    /// synchronizer on every `change` event (spec §4.7 "on `change` event
    /// of the document: for each peer, generates the next sync message").
    /// Exposed so callers constructing a `Document` outside the registry's
    /// own adopt path (`create`, then `registry().set_document`) can wire
    /// the same hook in themselves via `Document::create`/`set_on_event`.
    pub fn change_hook(
        self: &Arc<Self>,
        document_id: DocumentId,
    ) -> impl Fn(DocumentEvent<'_, D::Patch>) + Send + Sync + 'static {
        let client = self.clone();
        move |event| {
            if let DocumentEvent::Change = event {
                let client = client.clone();
                async_global_executor::spawn(async move {
                    client.drive_sync(document_id).await;
                })
                .detach();
            }
        }
    }

    async fn drive_sync(self: &Arc<Self>, document_id: DocumentId) {
        let Ok(Some(doc)) = self.registry.find_document(&document_id, self.change_hook(document_id)).await else {
            return;
        };
        let sync = self.synchronizer(document_id);
        let peers: HashMap<PeerKey, Arc<Peer<Conn>>> = self
            .peer_manager
            .peers_for_document(&document_id)
            .into_iter()
            .map(|p| (p.key().clone(), p))
            .collect();
        // `on_change` awaits per-peer sends; a clone of the CRDT state
        // avoids holding the document's lock across those awaits.
        let snapshot = doc.with_crdt(|crdt| crdt.clone_doc());
        sync.on_change(&snapshot, &peers).await;
    }

    /// Hands a negotiated connection to the peer manager, completing the
    /// signaling handshake the embedder drove via `PeerNeeded`/`Signal`
    /// messages (spec §4.6 step 3: "until a data channel opens"). Inbound
    /// bytes are demultiplexed by frame tag and fed straight into this
    /// document's synchronizer.
    pub fn register_peer(
        self: &Arc<Self>,
        key: PeerKey,
        initiator: bool,
        connection: Conn,
        inbound: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) -> Arc<Peer<Conn>> {
        let client = self.clone();
        self.peer_manager.register_peer(key, initiator, connection, inbound, move |key, bytes| {
            let Some(payload) = DocumentSynchronizer::<D, Conn>::sync_payload(&bytes) else {
                return;
            };
            let payload = payload.to_vec();
            let client = client.clone();
            async_global_executor::spawn(async move {
                client.apply_inbound_sync(key.document_id, &key, &payload).await;
            })
            .detach();
        })
    }

    pub fn peer_manager(&self) -> &PeerManager<Conn> {
        &self.peer_manager
    }

    /// Feeds an inbound sync frame to the document's CRDT and emits the
    /// resulting `change`/`patch` events, which in turn may enqueue a
    /// follow-up reply to the same peer via `change_hook` (spec §4.7 "on
    /// inbound peer data: ... may produce a follow-up reply to the same
    /// peer").
    async fn apply_inbound_sync(self: &Arc<Self>, document_id: DocumentId, key: &PeerKey, payload: &[u8]) {
        let Ok(Some(doc)) = self.registry.find_document(&document_id, self.change_hook(document_id)).await else {
            return;
        };
        let sync = self.synchronizer(document_id);
        let before = doc.heads();
        let patches = doc.with_crdt_mut(|crdt| sync.on_inbound(crdt, key, payload));
        doc.notify_patches(before, patches);
    }

    async fn handle_inbound(self: &Arc<Self>, from: crate::crypto::PublicKey, data: &[u8]) {
        let Some(dispatched) = crate::exchanger::dispatch(from, data) else {
            return;
        };
        match dispatched {
            Dispatched::RequestDocument { from, document_id } => {
                self.handle_request_document(from, document_id).await;
            }
            Dispatched::DocumentResponse { from, document } => {
                self.handle_document_response(from, document).await;
            }
            Dispatched::Signal { from, document_id, kind } => {
                self.handle_signal(from, document_id, kind).await;
            }
        }
    }

    /// Looks the document up; if present and `from` is an allowed user,
    /// replies with a signed export and creates the initiator peer (spec
    /// §4.8 `request-document` handler: "send document-response ... and
    /// create an initiator peer", testable property 7).
    async fn handle_request_document(self: &Arc<Self>, from: crate::crypto::PublicKey, document_id: DocumentId) {
        let Ok(Some(doc)) = self.registry.find_document(&document_id, self.change_hook(document_id)).await else {
            return;
        };
        if !doc.header().has_allowed_user(&from) {
            return;
        }
        let Ok(export) = doc.export(self.session.identity()) else {
            return;
        };
        let message = Message::DocumentResponse { document: export };
        if let Ok(bytes) = encode_message(&message) {
            let to = crate::signaling::PeerAddress { public_key: from, client_id: None };
            self.signaling.send_message(Some(to), bytes).await.ok();
        }
        (self.on_peer_needed)(PeerNeeded::AsInitiator { document_id, remote: from });
    }

    /// Imports and registers an unsolicited or requested document response,
    /// then wakes any pending `requestDocument` caller (spec §4.8
    /// `document-response` handler, §9 Open Question: accepted either way).
    async fn handle_document_response(self: &Arc<Self>, _from: crate::crypto::PublicKey, document: Vec<u8>) {
        let Ok(mut doc) = Document::<D>::import(&document, |_| {}) else {
            return;
        };
        let id = doc.document_id();
        doc.set_on_event(self.change_hook(id));
        let doc = Arc::new(doc);
        if self.registry.set_document(doc).await.is_err() {
            return;
        }
        if let Some(waiters) = self.pending_requests.lock().remove(&id) {
            for tx in waiters {
                tx.send(()).ok();
            }
        }
    }

    /// Gates an inbound SDP offer (spec §4.6 "before creating a
    /// non-initiator peer the manager calls `verifyIncomingSignal`") and,
    /// if the document exists locally and `from` is allowed, marks a
    /// responder peer as needed. `answer`/`ice`/`bye` continue a
    /// negotiation the embedder's own `Connection` already drives once
    /// `PeerNeeded` has fired, so only the offer is acted on here.
    async fn handle_signal(self: &Arc<Self>, from: crate::crypto::PublicKey, document_id: DocumentId, kind: SignalKind) {
        let SignalKind::Sdp { sdp } = kind else {
            return;
        };
        if sdp.kind != SdpKind::Offer {
            return;
        }
        let gate = RegistryGate {
            headers: &|id| self.registry.cached_header(id),
        };
        if !gate.verify_incoming_signal(&document_id, &from) {
            return;
        }
        (self.on_peer_needed)(PeerNeeded::AsResponder { document_id, remote: from });
    }

    /// Drives `(re)connect` with exponential backoff until `disconnect` is
    /// called (spec §4.8 `connect`).
    pub fn connect<F, Fut>(&self, connect: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<(Conn, mpsc::UnboundedReceiver<ConnectionEvent>)>> + Send + 'static,
    {
        let signaling = self.signaling.clone();
        async_global_executor::spawn(async move {
            signaling.run_with_reconnect(connect).await;
        })
        .detach();
    }

    /// Closes the current connection; documents and storage are untouched
    /// (spec §4.8 `disconnect`).
    pub async fn disconnect(&self) {
        self.signaling.disconnect().await;
    }

    /// Polls until connected (spec §4.8 `waitForConnection`).
    pub async fn wait_for_connection(&self) {
        while !self.signaling.is_connected() {
            futures_timer::Delay::new(Duration::from_millis(50)).await;
        }
    }

    /// Broadcasts a `request-document` and races local lookup, a
    /// `document-response` wakeup, and a 5-second timeout (spec §4.8
    /// `requestDocument`, testable scenario S3/S4).
    pub async fn request_document(self: &Arc<Self>, id: DocumentId) -> Result<Arc<Document<D>>> {
        if let Some(doc) = self.registry.find_document(&id, self.change_hook(id)).await? {
            return Ok(doc);
        }

        let (tx, rx) = oneshot::channel();
        self.pending_requests.lock().entry(id).or_default().push(tx);

        let message = Message::RequestDocument { document_id: id.to_base58() };
        let bytes = encode_message(&message).map_err(|e| Error::StorageFailure(e.into()))?;
        self.signaling
            .send_message(None, bytes)
            .await
            .map_err(Error::StorageFailure)?;

        futures::select! {
            _ = rx.fuse() => {}
            _ = futures_timer::Delay::new(REQUEST_DOCUMENT_TIMEOUT).fuse() => {
                self.pending_requests.lock().remove(&id);
                return Err(Error::DocumentRequestTimeout);
            }
        }

        self.registry
            .find_document(&id, self.change_hook(id))
            .await?
            .ok_or(Error::DocumentRequestTimeout)
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn registry(&self) -> &Arc<DocumentRegistry<D, H, SC>> {
        &self.registry
    }

    pub fn signaling(&self) -> &Arc<SignalingClient<Conn>> {
        &self.signaling
    }
}

/// Decodes a raw inbound payload without dispatching, exposed for callers
/// that want to pre-filter before handing bytes to a `SharingClient`.
pub fn peek_message_type(bytes: &[u8]) -> Option<&'static str> {
    match decode_message(bytes)? {
        Message::RequestDocument { .. } => Some("request-document"),
        Message::DocumentResponse { .. } => Some("document-response"),
        Message::Signal { .. } => Some("signal"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ChannelConnection;
    use crate::crdt::map::{MapCrdt, Value};
    use crate::crypto::Keypair;
    use crate::header::Metadata;
    use crate::storage::{SecureStorageProvider, SledStorageProvider, Storage};

    fn make_registry(
        session: &SessionManager,
    ) -> Arc<DocumentRegistry<MapCrdt, SledStorageProvider, SecureStorageProvider<SledStorageProvider>>> {
        let headers = SledStorageProvider::memory().unwrap();
        let content = SecureStorageProvider::new(SledStorageProvider::memory().unwrap(), session.content_key());
        let storage = Arc::new(Storage::new(headers, content, |_| {}));
        Arc::new(DocumentRegistry::new(storage, |_| {}))
    }

    #[async_std::test]
    async fn request_document_times_out_when_nobody_has_it() {
        let session = Arc::new(SessionManager::generate());
        let registry = make_registry(&session);
        let client = SharingClient::<MapCrdt, _, _, ChannelConnection>::new(session, registry, |_| {});

        let unknown = DocumentId::from_bytes([5u8; 32]);
        let result = client.request_document(unknown).await;
        assert!(matches!(result, Err(Error::DocumentRequestTimeout)));
    }

    #[async_std::test]
    async fn request_document_resolves_from_a_responder() {
        // The owner's session identity must match the document's owner key
        // for `export` to succeed inside the request-document handler, so
        // both are derived from the same seed rather than sharing one
        // `Keypair` (which holds non-`Clone` secret material).
        let owner_seed = [7u8; 32];
        let owner_key = Keypair::from_seed(owner_seed);
        let owner_session = Arc::new(SessionManager::new(Keypair::from_seed(owner_seed)));
        let owner_registry = make_registry(&owner_session);
        let requester_session = Arc::new(SessionManager::generate());
        let requester_registry = make_registry(&requester_session);

        let doc = Document::<MapCrdt>::create(
            &owner_key,
            [requester_session.public_key()],
            Metadata::new(),
            |_| {},
        );
        doc.update(|crdt| {
            crdt.set("n", Value::Int(42));
        });
        owner_registry.set_document(Arc::new(doc)).await.unwrap();

        // Normally learned during the signaling handshake (spec §4.4); the
        // test stands in for that out-of-band exchange directly.
        owner_session.remember_peer(requester_session.public_key(), requester_session.agreement_public());
        requester_session.remember_peer(owner_session.public_key(), owner_session.agreement_public());

        let owner_client =
            SharingClient::<MapCrdt, _, _, ChannelConnection>::new(owner_session, owner_registry, |_| {});
        let requester_client =
            SharingClient::<MapCrdt, _, _, ChannelConnection>::new(requester_session, requester_registry, |_| {});

        let ((conn_owner, rx_owner), (conn_requester, rx_requester)) = ChannelConnection::pair();
        owner_client.signaling().attach(conn_owner, rx_owner);
        requester_client.signaling().attach(conn_requester, rx_requester);

        let doc_id = {
            let ids = owner_client.registry().list_document_ids().await.unwrap();
            ids[0]
        };
        let found = requester_client.request_document(doc_id).await.unwrap();
        assert_eq!(found.with_crdt(|c| c.get("n").cloned()), Some(Value::Int(42)));
    }

    #[async_std::test]
    async fn request_document_from_unauthorized_requester_times_out() {
        let owner_seed = [9u8; 32];
        let owner_key = Keypair::from_seed(owner_seed);
        let owner_session = Arc::new(SessionManager::new(Keypair::from_seed(owner_seed)));
        let owner_registry = make_registry(&owner_session);
        let outsider_session = Arc::new(SessionManager::generate());
        let outsider_registry = make_registry(&outsider_session);

        // Note: the outsider's key is never added to the document's
        // allow-list, unlike `request_document_resolves_from_a_responder`.
        let doc = Document::<MapCrdt>::create(&owner_key, [], Metadata::new(), |_| {});
        doc.update(|crdt| {
            crdt.set("n", Value::Int(1));
        });
        owner_registry.set_document(Arc::new(doc)).await.unwrap();

        owner_session.remember_peer(outsider_session.public_key(), outsider_session.agreement_public());
        outsider_session.remember_peer(owner_session.public_key(), owner_session.agreement_public());

        let owner_client =
            SharingClient::<MapCrdt, _, _, ChannelConnection>::new(owner_session, owner_registry, |_| {});
        let outsider_client =
            SharingClient::<MapCrdt, _, _, ChannelConnection>::new(outsider_session, outsider_registry, |_| {});

        let ((conn_owner, rx_owner), (conn_outsider, rx_outsider)) = ChannelConnection::pair();
        owner_client.signaling().attach(conn_owner, rx_owner);
        outsider_client.signaling().attach(conn_outsider, rx_outsider);

        let doc_id = {
            let ids = owner_client.registry().list_document_ids().await.unwrap();
            ids[0]
        };
        let result = outsider_client.request_document(doc_id).await;
        assert!(matches!(result, Err(Error::DocumentRequestTimeout)));
    }

    #[async_std::test]
    async fn request_document_resolver_fires_an_initiator_peer_needed() {
        // Regression test for spec §4.8: the side answering request-document
        // must create the *initiator* peer, not a responder one.
        let owner_seed = [11u8; 32];
        let owner_key = Keypair::from_seed(owner_seed);
        let owner_session = Arc::new(SessionManager::new(Keypair::from_seed(owner_seed)));
        let owner_registry = make_registry(&owner_session);
        let requester_session = Arc::new(SessionManager::generate());
        let requester_registry = make_registry(&requester_session);

        let doc = Document::<MapCrdt>::create(
            &owner_key,
            [requester_session.public_key()],
            Metadata::new(),
            |_| {},
        );
        owner_registry.set_document(Arc::new(doc)).await.unwrap();

        owner_session.remember_peer(requester_session.public_key(), requester_session.agreement_public());
        requester_session.remember_peer(owner_session.public_key(), owner_session.agreement_public());

        let needed = Arc::new(Mutex::new(Vec::new()));
        let needed2 = needed.clone();
        let owner_client = SharingClient::<MapCrdt, _, _, ChannelConnection>::new(owner_session, owner_registry, move |peer_needed| {
            needed2.lock().push(matches!(peer_needed, PeerNeeded::AsInitiator { .. }));
        });
        let requester_client =
            SharingClient::<MapCrdt, _, _, ChannelConnection>::new(requester_session, requester_registry, |_| {});

        let ((conn_owner, rx_owner), (conn_requester, rx_requester)) = ChannelConnection::pair();
        owner_client.signaling().attach(conn_owner, rx_owner);
        requester_client.signaling().attach(conn_requester, rx_requester);

        let doc_id = {
            let ids = owner_client.registry().list_document_ids().await.unwrap();
            ids[0]
        };
        requester_client.request_document(doc_id).await.unwrap();

        assert_eq!(needed.lock().as_slice(), [true]);
    }

    #[async_std::test]
    async fn register_peer_syncs_live_changes_across_peers() {
        let session_a = Arc::new(SessionManager::generate());
        let session_b = Arc::new(SessionManager::generate());
        let registry_a = make_registry(&session_a);
        let registry_b = make_registry(&session_b);
        let client_a = SharingClient::<MapCrdt, _, _, ChannelConnection>::new(session_a.clone(), registry_a, |_| {});
        let client_b = SharingClient::<MapCrdt, _, _, ChannelConnection>::new(session_b.clone(), registry_b, |_| {});

        let owner = Keypair::generate();
        let mut doc_a = Document::<MapCrdt>::create(&owner, [], Metadata::new(), |_| {});
        let document_id = doc_a.document_id();
        doc_a.set_on_event(client_a.change_hook(document_id));
        let exported = doc_a.export(&owner).unwrap();
        client_a.registry().set_document(Arc::new(doc_a)).await.unwrap();

        let mut doc_b = Document::<MapCrdt>::import(&exported, |_| {}).unwrap();
        doc_b.set_on_event(client_b.change_hook(document_id));
        client_b.registry().set_document(Arc::new(doc_b)).await.unwrap();

        let key_ab = crate::peer::PeerKey {
            document_id,
            remote_public_key: session_b.public_key(),
            remote_client_id: session_b.client_id(),
        };
        let key_ba = crate::peer::PeerKey {
            document_id,
            remote_public_key: session_a.public_key(),
            remote_client_id: session_a.client_id(),
        };
        let ((conn_a, rx_a), (conn_b, rx_b)) = ChannelConnection::pair();
        client_a.register_peer(key_ab, true, conn_a, rx_a);
        client_b.register_peer(key_ba, false, conn_b, rx_b);

        let doc_a = client_a.registry().cached_header(&document_id);
        assert!(doc_a.is_some());

        let doc_a = client_a
            .registry()
            .find_document(&document_id, client_a.change_hook(document_id))
            .await
            .unwrap()
            .unwrap();
        doc_a.update(|crdt| {
            crdt.set("n", Value::Int(7));
        });

        // give the spawned sync tasks a few turns to drain
        futures_timer::Delay::new(std::time::Duration::from_millis(100)).await;

        let doc_b = client_b
            .registry()
            .find_document(&document_id, client_b.change_hook(document_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc_b.with_crdt(|c| c.get("n").cloned()), Some(Value::Int(7)));
    }
}
