//! `SignalingClient`: authenticated session on the relay (spec §4.4).

use crate::connection::{Connection, ConnectionEvent};
use crate::crypto::{AgreementPublicKey, Keypair, PublicKey};
use crate::exchanger::Recipient;
use crate::session::{ClientId, SessionManager};
use futures::channel::mpsc;
use futures::SinkExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Addresses a message to a specific remote (spec §4.4 `sendMessage`'s
/// `to: {publicKey, clientId?}`).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PeerAddress {
    pub public_key: PublicKey,
    pub client_id: Option<ClientId>,
}

/// An event emitted by the `SignalingClient`.
#[derive(Clone, Debug)]
pub enum SignalingEvent {
    Connect,
    Disconnect,
    Error(String),
    Message { from: PeerAddress, data: Vec<u8> },
}

/// Exponential backoff with jitter, tracked as explicit state rather than a
/// dependency — the teacher has no reconnect-backoff crate precedent, and
/// the policy here is small enough to own directly.
struct Backoff {
    attempt: u32,
    base: Duration,
    max: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            attempt: 0,
            base: Duration::from_millis(250),
            max: Duration::from_secs(30),
        }
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }

    fn next_delay(&mut self) -> Duration {
        let exp = self.base.as_millis() as u64 * 2u64.saturating_pow(self.attempt.min(10));
        self.attempt += 1;
        let capped = exp.min(self.max.as_millis() as u64);
        let mut jitter = [0u8; 2];
        rand_core::OsRng.fill_bytes(&mut jitter);
        let jitter_ms = u16::from_le_bytes(jitter) as u64 % (capped / 4 + 1);
        Duration::from_millis(capped + jitter_ms)
    }
}

use rand_core::RngCore;

/// Maintains one authenticated connection to the signaling relay, handling
/// the challenge/response handshake, per-recipient encryption, and
/// reconnect with backoff.
pub struct SignalingClient<C> {
    connection: Mutex<Option<Arc<C>>>,
    session: Arc<SessionManager>,
    events: mpsc::UnboundedSender<SignalingEvent>,
}

impl<C: Connection + 'static> SignalingClient<C> {
    pub fn new(session: Arc<SessionManager>) -> (Self, mpsc::UnboundedReceiver<SignalingEvent>) {
        let (tx, rx) = mpsc::unbounded();
        (
            Self {
                connection: Mutex::new(None),
                session,
                events: tx,
            },
            rx,
        )
    }

    /// Adopts an already-established connection whose challenge/response
    /// handshake the caller performed, and starts draining its inbound
    /// events. The handshake itself is transport-specific (WebSocket
    /// headers `x-public-key`/`x-client-id`, spec §6) and lives outside
    /// this crate's scope; this method models the post-handshake state.
    pub fn attach(&self, connection: C, mut inbound: mpsc::UnboundedReceiver<ConnectionEvent>) {
        let connection = Arc::new(connection);
        *self.connection.lock() = Some(connection);
        let mut events = self.events.clone();
        let session = self.session.clone();
        async_global_executor::spawn(async move {
            use futures::StreamExt;
            events.send(SignalingEvent::Connect).await.ok();
            while let Some(event) = inbound.next().await {
                match event {
                    ConnectionEvent::Data(bytes) => {
                        if let Some((from, data)) = decrypt_inbound(&session, &bytes) {
                            events
                                .send(SignalingEvent::Message { from, data })
                                .await
                                .ok();
                        }
                    }
                    ConnectionEvent::Close(reason) => {
                        events.send(SignalingEvent::Disconnect).await.ok();
                        if let Some(reason) = reason {
                            events.send(SignalingEvent::Error(reason)).await.ok();
                        }
                        break;
                    }
                }
            }
        })
        .detach();
    }

    pub fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .as_ref()
            .map(|c| c.is_connected())
            .unwrap_or(false)
    }

    /// Closes the current connection, if any (spec §4.8 `disconnect`).
    /// Storage and documents are untouched; reconnect is the caller's
    /// responsibility via a fresh `run_with_reconnect`.
    pub async fn disconnect(&self) {
        let connection = self.connection.lock().take();
        if let Some(connection) = connection {
            connection.close(None).await;
        }
        self.events.clone().send(SignalingEvent::Disconnect).await.ok();
    }

    /// Runs `connect` to (re)establish a connection, attaching it and then
    /// waiting for its disconnect; on disconnect, backs off and retries
    /// indefinitely. `connect` encapsulates the transport-specific dial plus
    /// challenge/response handshake.
    pub async fn run_with_reconnect<F, Fut>(self: Arc<Self>, mut connect: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<(C, mpsc::UnboundedReceiver<ConnectionEvent>)>>,
    {
        let mut backoff = Backoff::new();
        loop {
            match connect().await {
                Ok((connection, inbound)) => {
                    backoff.reset();
                    self.attach(connection, inbound);
                    while self.is_connected() {
                        futures_timer::Delay::new(Duration::from_millis(50)).await;
                    }
                }
                Err(err) => {
                    self.events
                        .clone()
                        .send(SignalingEvent::Error(err.to_string()))
                        .await
                        .ok();
                }
            }
            futures_timer::Delay::new(backoff.next_delay()).await;
        }
    }

    /// Sends `data`, encrypted with the recipient's shared secret if `to`
    /// is given; broadcasts (no `to`) go in clear and are reserved for
    /// public discovery messages (spec §4.4).
    pub async fn send_message(&self, to: Recipient, data: Vec<u8>) -> anyhow::Result<()> {
        let connection = self
            .connection
            .lock()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("not connected"))?;
        let framed = match &to {
            Some(addr) => {
                let secret = self
                    .session
                    .shared_secret(&addr.public_key)
                    .ok_or_else(|| anyhow::anyhow!("no shared secret established with recipient"))?;
                Envelope::Encrypted {
                    to: addr.clone(),
                    from: self.session.public_key(),
                    body: secret.encrypt(&data, addr.public_key.as_bytes()),
                }
            }
            None => Envelope::Broadcast {
                from: self.session.public_key(),
                body: data,
            },
        };
        let bytes = serde_cbor::to_vec(&framed)?;
        connection.send(bytes).await
    }

    /// Records a peer's agreement key so future `send_message` calls to it
    /// can encrypt, and future inbound envelopes from it can decrypt.
    pub fn learn_peer(&self, public_key: PublicKey, agreement_public: AgreementPublicKey) {
        self.session.remember_peer(public_key, agreement_public);
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
enum Envelope {
    Broadcast {
        from: PublicKey,
        body: Vec<u8>,
    },
    Encrypted {
        to: PeerAddress,
        from: PublicKey,
        body: Vec<u8>,
    },
}

impl serde::Serialize for PeerAddress {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        (self.public_key, self.client_id.map(|c| c.to_base58())).serialize(s)
    }
}

impl<'de> serde::Deserialize<'de> for PeerAddress {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let (public_key, client_id): (PublicKey, Option<String>) =
            serde::Deserialize::deserialize(d)?;
        Ok(PeerAddress {
            public_key,
            client_id: client_id.as_deref().and_then(ClientId::from_base58),
        })
    }
}

fn decrypt_inbound(session: &SessionManager, bytes: &[u8]) -> Option<(PublicKey, Vec<u8>)> {
    let envelope: Envelope = crate::codec::try_decode(bytes)?;
    match envelope {
        Envelope::Broadcast { from, body } => Some((from, body)),
        Envelope::Encrypted { to, from, body } => {
            if &to.public_key != &session.public_key() {
                return None;
            }
            let secret = session.shared_secret(&from)?;
            let plain = secret.decrypt(&body, session.public_key().as_bytes()).ok()?;
            Some((from, plain))
        }
    }
}

/// Derives a fresh `Keypair` and wraps it in a `SessionManager`, the shape
/// a `SharingConfig` uses when constructed from a raw `privateKey` (spec §6
/// configuration table) rather than a pre-built session.
pub fn session_from_private_key(seed: [u8; 32]) -> SessionManager {
    SessionManager::new(Keypair::from_seed(seed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ChannelConnection;

    #[async_std::test]
    async fn broadcast_round_trips_in_clear() {
        let session_a = Arc::new(SessionManager::generate());
        let session_b = Arc::new(SessionManager::generate());
        let (client_a, _events_a) = SignalingClient::<ChannelConnection>::new(session_a.clone());
        let (client_b, mut events_b) = SignalingClient::<ChannelConnection>::new(session_b.clone());

        let ((conn_a, rx_a), (conn_b, rx_b)) = ChannelConnection::pair();
        client_a.attach(conn_a, rx_a);
        client_b.attach(conn_b, rx_b);

        client_a.send_message(None, b"hello".to_vec()).await.unwrap();

        use futures::StreamExt;
        loop {
            match events_b.next().await.unwrap() {
                SignalingEvent::Message { data, .. } => {
                    assert_eq!(data, b"hello");
                    break;
                }
                _ => continue,
            }
        }
    }
}
