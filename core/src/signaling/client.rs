//! Client side of the signaling protocol.
//!
//! One background read task demultiplexes server frames: directory replies
//! resolve pending requests in FIFO order, handshake traffic is surfaced as
//! [`HandshakeEvent`]s for the transport layer to consume.

use super::protocol::{ClientMessage, RelayPeerMessage, ServerMessage, SignalingProtocolError};
use super::{read_frame, write_frame, FrameError};
use crate::directory::{DirectoryError, PeerDirectory, RelayCapabilities, RelayPeer};
use crate::identity::{PeerId, RelayKeys};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default re-advertisement cadence: half the coordinator's 30-minute
/// descriptor TTL, so an entry is refreshed well before it lapses.
pub const ADVERTISE_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Framing error: {0}")]
    Frame(#[from] FrameError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] SignalingProtocolError),
    #[error("Connection to coordinator closed")]
    Closed,
    #[error("Advertise rejected: {0}")]
    Rejected(String),
    #[error("Coordinator did not reply in time")]
    Timeout,
}

/// Inbound handshake traffic, forwarded from another peer through the
/// coordinator.
#[derive(Debug, Clone)]
pub enum HandshakeEvent {
    Offer { from_peer: PeerId, sdp: String },
    Answer { from_peer: PeerId, sdp: String },
    IceCandidate { from_peer: PeerId, candidate: String },
    TargetUnavailable { target_peer: PeerId },
}

#[derive(Default)]
struct PendingReplies {
    discovers: VecDeque<oneshot::Sender<Vec<RelayPeerMessage>>>,
    registers: VecDeque<oneshot::Sender<String>>,
    keys: VecDeque<(PeerId, oneshot::Sender<Option<[u8; 32]>>)>,
}

/// A connection to the signaling coordinator.
pub struct SignalingClient {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Arc<Mutex<PendingReplies>>,
    read_task: JoinHandle<()>,
}

impl SignalingClient {
    /// Connect to a coordinator. Returns the client and the stream of
    /// handshake events addressed to this node.
    pub async fn connect(
        addr: &str,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<HandshakeEvent>), ClientError> {
        let stream = TcpStream::connect(addr).await?;
        let (mut reader, writer) = stream.into_split();
        let pending = Arc::new(Mutex::new(PendingReplies::default()));
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let task_pending = pending.clone();
        let read_task = tokio::spawn(async move {
            loop {
                let payload = match read_frame(&mut reader).await {
                    Ok(Some(payload)) => payload,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!("signaling read failed: {}", e);
                        break;
                    }
                };
                match ServerMessage::from_json(&payload) {
                    Ok(message) => dispatch(&task_pending, &event_tx, message),
                    Err(e) => {
                        tracing::warn!("malformed server message: {}", e);
                    }
                }
            }
            // Wake every waiter so callers see Closed instead of hanging.
            task_pending.lock().discovers.clear();
            task_pending.lock().registers.clear();
            task_pending.lock().keys.clear();
        });

        Ok((
            Arc::new(Self {
                writer: tokio::sync::Mutex::new(writer),
                pending,
                read_task,
            }),
            event_rx,
        ))
    }

    async fn send(&self, message: &ClientMessage) -> Result<(), ClientError> {
        let bytes = message.to_json()?;
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, &bytes).await?;
        Ok(())
    }

    /// Advertise this node in the coordinator's directory. Client-only nodes
    /// advertise too, with relaying disabled, so handshakes can reach them.
    pub async fn advertise(
        &self,
        keys: &RelayKeys,
        capabilities: RelayCapabilities,
    ) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().registers.push_back(tx);
        self.send(&ClientMessage::AdvertiseRelay {
            peer_id: keys.peer_id(),
            public_key: keys.public_key_hex(),
            capabilities,
        })
        .await?;
        match await_reply(rx).await?.as_str() {
            "registered" => Ok(()),
            status => Err(ClientError::Rejected(status.to_string())),
        }
    }

    /// Advertise now and keep re-advertising on a fixed cadence, so the
    /// directory entry never outlives its TTL while this node is up. The
    /// loop ends when the client is dropped.
    pub fn keep_advertised(
        self: &Arc<Self>,
        keys: Arc<RelayKeys>,
        capabilities: RelayCapabilities,
        interval: Duration,
    ) -> JoinHandle<()> {
        let client = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(client) = client.upgrade() else { break };
                if let Err(e) = client.advertise(&keys, capabilities).await {
                    tracing::warn!("re-advertise failed: {}", e);
                }
            }
        })
    }

    /// Fetch the current relay directory.
    pub async fn discover_relays(&self) -> Result<Vec<RelayPeerMessage>, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().discovers.push_back(tx);
        self.send(&ClientMessage::DiscoverRelays).await?;
        await_reply(rx).await
    }

    /// Look up a peer's X25519 public key. `Ok(None)` means the coordinator
    /// does not know the peer.
    pub async fn peer_key(&self, peer_id: &PeerId) -> Result<Option<[u8; 32]>, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().keys.push_back((peer_id.clone(), tx));
        self.send(&ClientMessage::GetPeerKey {
            peer_id: peer_id.clone(),
        })
        .await?;
        await_reply(rx).await
    }

    /// Fire-and-forget handshake sends. Delivery failure comes back as a
    /// `TargetUnavailable` event, not an error here.
    pub async fn send_offer(&self, target_peer: &PeerId, sdp: String) -> Result<(), ClientError> {
        self.send(&ClientMessage::Offer {
            target_peer: target_peer.clone(),
            sdp,
        })
        .await
    }

    pub async fn send_answer(&self, target_peer: &PeerId, sdp: String) -> Result<(), ClientError> {
        self.send(&ClientMessage::Answer {
            target_peer: target_peer.clone(),
            sdp,
        })
        .await
    }

    pub async fn send_ice_candidate(
        &self,
        target_peer: &PeerId,
        candidate: String,
    ) -> Result<(), ClientError> {
        self.send(&ClientMessage::IceCandidate {
            target_peer: target_peer.clone(),
            candidate,
        })
        .await
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.read_task.abort();
    }
}

async fn await_reply<T>(rx: oneshot::Receiver<T>) -> Result<T, ClientError> {
    match tokio::time::timeout(REPLY_TIMEOUT, rx).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(_)) => Err(ClientError::Closed),
        Err(_) => Err(ClientError::Timeout),
    }
}

fn dispatch(
    pending: &Mutex<PendingReplies>,
    events: &mpsc::UnboundedSender<HandshakeEvent>,
    message: ServerMessage,
) {
    match message {
        ServerMessage::RelayList { peers } => {
            if let Some(tx) = pending.lock().discovers.pop_front() {
                let _ = tx.send(peers);
            }
        }
        ServerMessage::RelayRegistered { status, .. } => {
            if let Some(tx) = pending.lock().registers.pop_front() {
                let _ = tx.send(status);
            }
        }
        ServerMessage::PeerKey {
            peer_id,
            public_key,
        } => {
            if let Some(tx) = take_key_waiter(pending, &peer_id) {
                let _ = tx.send(decode_public_key(&public_key));
            }
        }
        ServerMessage::TargetUnavailable { target_peer } => {
            // A key lookup for this peer resolves to "unknown"; otherwise it
            // was a failed handshake forward.
            if let Some(tx) = take_key_waiter(pending, &target_peer) {
                let _ = tx.send(None);
            } else {
                let _ = events.send(HandshakeEvent::TargetUnavailable { target_peer });
            }
        }
        ServerMessage::Offer { from_peer, sdp } => {
            let _ = events.send(HandshakeEvent::Offer { from_peer, sdp });
        }
        ServerMessage::Answer { from_peer, sdp } => {
            let _ = events.send(HandshakeEvent::Answer { from_peer, sdp });
        }
        ServerMessage::IceCandidate {
            from_peer,
            candidate,
        } => {
            let _ = events.send(HandshakeEvent::IceCandidate {
                from_peer,
                candidate,
            });
        }
    }
}

fn take_key_waiter(
    pending: &Mutex<PendingReplies>,
    peer_id: &PeerId,
) -> Option<oneshot::Sender<Option<[u8; 32]>>> {
    let mut pending = pending.lock();
    let index = pending.keys.iter().position(|(id, _)| id == peer_id)?;
    pending.keys.remove(index).map(|(_, tx)| tx)
}

fn decode_public_key(hex_key: &str) -> Option<[u8; 32]> {
    hex::decode(hex_key).ok()?.try_into().ok()
}

/// The coordinator doubles as the peer directory for circuit building.
#[async_trait]
impl PeerDirectory for SignalingClient {
    async fn discover(&self) -> Result<Vec<RelayPeer>, DirectoryError> {
        let peers = self
            .discover_relays()
            .await
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;
        Ok(peers
            .into_iter()
            .map(|peer| RelayPeer {
                id: peer.id,
                capabilities: peer.capabilities,
                connected_at: peer.connected_at,
            })
            .collect())
    }

    async fn public_key(&self, peer_id: &PeerId) -> Result<[u8; 32], DirectoryError> {
        match self.peer_key(peer_id).await {
            Ok(Some(key)) => Ok(key),
            Ok(None) => Err(DirectoryError::UnknownPeer(peer_id.clone())),
            Err(e) => Err(DirectoryError::Unavailable(e.to_string())),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
