//! TCP front end for the coordinator.
//!
//! One reader loop and one writer task per connection. The writer drains an
//! unbounded channel so handshake forwards from other connections never
//! block a reader.

use super::coordinator::{Coordinator, CoordinatorError, ConnectionId};
use super::protocol::{ClientMessage, ServerMessage};
use super::{read_frame, write_frame};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Signaling server: accepts TCP connections and drives the [`Coordinator`].
pub struct SignalingServer {
    coordinator: Arc<Coordinator>,
    senders: Arc<RwLock<HashMap<ConnectionId, mpsc::UnboundedSender<ServerMessage>>>>,
}

impl SignalingServer {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self {
            coordinator,
            senders: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Bind and start serving. Returns the bound address (useful with port 0)
    /// and the accept-loop task handle.
    pub async fn bind(
        self: &Arc<Self>,
        addr: &str,
    ) -> Result<(SocketAddr, JoinHandle<()>), ServerError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "signaling server listening");

        let cleanup = self.coordinator.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
            loop {
                ticker.tick().await;
                cleanup.cleanup_expired();
            }
        });

        let server = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        tracing::debug!(%remote, "signaling connection accepted");
                        let server = server.clone();
                        tokio::spawn(server.serve_connection(stream));
                    }
                    Err(e) => {
                        tracing::warn!("accept failed: {}", e);
                    }
                }
            }
        });
        Ok((local_addr, handle))
    }

    async fn serve_connection(self: Arc<Self>, stream: TcpStream) {
        let connection_id = ConnectionId::random();
        if self.coordinator.connect(connection_id).is_err() {
            tracing::warn!("connection rejected, at capacity");
            return;
        }

        let (mut reader, mut writer) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
        self.senders.write().insert(connection_id, tx);

        let writer_task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let bytes = match message.to_json() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::warn!("failed to encode server message: {}", e);
                        continue;
                    }
                };
                if write_frame(&mut writer, &bytes).await.is_err() {
                    break;
                }
            }
        });

        loop {
            let payload = match read_frame(&mut reader).await {
                Ok(Some(payload)) => payload,
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(connection = %connection_id, "read failed: {}", e);
                    break;
                }
            };
            match ClientMessage::from_json(&payload) {
                Ok(message) => {
                    // A connection that is still talking keeps its record
                    // alive; the TTL only collects silent ones.
                    let _ = self.coordinator.connect(connection_id);
                    self.handle_message(connection_id, message);
                }
                Err(e) => {
                    tracing::warn!(connection = %connection_id, "malformed message: {}", e);
                }
            }
        }

        self.senders.write().remove(&connection_id);
        self.coordinator.disconnect(connection_id);
        writer_task.abort();
        tracing::debug!(connection = %connection_id, "signaling connection closed");
    }

    fn handle_message(&self, connection_id: ConnectionId, message: ClientMessage) {
        match message {
            ClientMessage::DiscoverRelays => {
                let caller = self.coordinator.connection_peer(connection_id);
                let peers = self.coordinator.discover_relays(caller.as_ref());
                self.reply(connection_id, ServerMessage::RelayList { peers });
            }
            ClientMessage::AdvertiseRelay {
                peer_id,
                public_key,
                capabilities,
            } => {
                // Every advertise gets a reply, accepted or not, so clients
                // can pair replies with requests in order.
                let status = match decode_public_key(&public_key) {
                    Some(key) => match self.coordinator.advertise_relay(
                        connection_id,
                        peer_id.clone(),
                        key,
                        capabilities,
                    ) {
                        Ok(()) => "registered".to_string(),
                        Err(e) => {
                            tracing::warn!(peer = %peer_id.short(), "advertise rejected: {}", e);
                            e.to_string()
                        }
                    },
                    None => {
                        tracing::warn!(peer = %peer_id.short(), "advertise with malformed public key rejected");
                        "malformed public key".to_string()
                    }
                };
                self.reply(
                    connection_id,
                    ServerMessage::RelayRegistered { peer_id, status },
                );
            }
            ClientMessage::Offer { target_peer, sdp } => {
                self.forward(connection_id, target_peer, |from_peer| {
                    ServerMessage::Offer { from_peer, sdp }
                });
            }
            ClientMessage::Answer { target_peer, sdp } => {
                self.forward(connection_id, target_peer, |from_peer| {
                    ServerMessage::Answer { from_peer, sdp }
                });
            }
            ClientMessage::IceCandidate {
                target_peer,
                candidate,
            } => {
                self.forward(connection_id, target_peer, |from_peer| {
                    ServerMessage::IceCandidate {
                        from_peer,
                        candidate,
                    }
                });
            }
            ClientMessage::GetPeerKey { peer_id } => {
                let reply = match self.coordinator.peer_public_key(&peer_id) {
                    Some(key) => ServerMessage::PeerKey {
                        peer_id,
                        public_key: hex::encode(key),
                    },
                    None => ServerMessage::TargetUnavailable {
                        target_peer: peer_id,
                    },
                };
                self.reply(connection_id, reply);
            }
        }
    }

    /// Forward a handshake message, stamping the sender's identity. The
    /// sender must have advertised so the recipient knows who is calling.
    fn forward<F>(&self, from: ConnectionId, target_peer: crate::identity::PeerId, build: F)
    where
        F: FnOnce(crate::identity::PeerId) -> ServerMessage,
    {
        let from_peer = match self.coordinator.connection_peer(from) {
            Some(peer) => peer,
            None => {
                tracing::warn!(connection = %from, "handshake forward from unbound connection dropped");
                return;
            }
        };
        match self.coordinator.forward_target(&target_peer) {
            Ok(target_connection) => {
                let delivered = self
                    .senders
                    .read()
                    .get(&target_connection)
                    .map(|tx| tx.send(build(from_peer)).is_ok())
                    .unwrap_or(false);
                if !delivered {
                    self.reply(from, ServerMessage::TargetUnavailable { target_peer });
                }
            }
            Err(CoordinatorError::TargetUnavailable(_)) => {
                self.reply(from, ServerMessage::TargetUnavailable { target_peer });
            }
            Err(e) => {
                tracing::warn!("handshake forward failed: {}", e);
            }
        }
    }

    fn reply(&self, connection_id: ConnectionId, message: ServerMessage) {
        if let Some(tx) = self.senders.read().get(&connection_id) {
            let _ = tx.send(message);
        }
    }
}

fn decode_public_key(hex_key: &str) -> Option<[u8; 32]> {
    let bytes = hex::decode(hex_key).ok()?;
    bytes.try_into().ok()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::RelayCapabilities;
    use crate::identity::RelayKeys;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn start_server() -> SocketAddr {
        let server = Arc::new(SignalingServer::new(Arc::new(Coordinator::new())));
        let (addr, _handle) = server.bind("127.0.0.1:0").await.unwrap();
        addr
    }

    async fn send(stream: &mut TcpStream, message: &ClientMessage) {
        let bytes = message.to_json().unwrap();
        stream
            .write_all(&(bytes.len() as u32).to_be_bytes())
            .await
            .unwrap();
        stream.write_all(&bytes).await.unwrap();
    }

    async fn recv(stream: &mut TcpStream) -> ServerMessage {
        let mut len_bytes = [0u8; 4];
        stream.read_exact(&mut len_bytes).await.unwrap();
        let mut payload = vec![0u8; u32::from_be_bytes(len_bytes) as usize];
        stream.read_exact(&mut payload).await.unwrap();
        ServerMessage::from_json(&payload).unwrap()
    }

    async fn advertise(stream: &mut TcpStream, keys: &RelayKeys) {
        send(
            stream,
            &ClientMessage::AdvertiseRelay {
                peer_id: keys.peer_id(),
                public_key: keys.public_key_hex(),
                capabilities: RelayCapabilities::default(),
            },
        )
        .await;
        match recv(stream).await {
            ServerMessage::RelayRegistered { status, .. } => assert_eq!(status, "registered"),
            other => panic!("Unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_advertise_and_discover() {
        let addr = start_server().await;
        let mut alice = TcpStream::connect(addr).await.unwrap();
        let mut bob = TcpStream::connect(addr).await.unwrap();
        let alice_keys = RelayKeys::generate();
        let bob_keys = RelayKeys::generate();
        advertise(&mut alice, &alice_keys).await;
        advertise(&mut bob, &bob_keys).await;

        send(&mut alice, &ClientMessage::DiscoverRelays).await;
        match recv(&mut alice).await {
            ServerMessage::RelayList { peers } => {
                // The caller is excluded from its own view.
                assert_eq!(peers.len(), 1);
                assert_eq!(peers[0].id, bob_keys.peer_id());
            }
            other => panic!("Unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_advertise_gets_rejection_reply() {
        let addr = start_server().await;
        let mut alice = TcpStream::connect(addr).await.unwrap();
        let keys = RelayKeys::generate();

        send(
            &mut alice,
            &ClientMessage::AdvertiseRelay {
                peer_id: keys.peer_id(),
                public_key: "not hex".to_string(),
                capabilities: RelayCapabilities::default(),
            },
        )
        .await;

        // Rejected advertises still get a reply; a silent drop would leave
        // the client pairing later replies with the wrong requests.
        match recv(&mut alice).await {
            ServerMessage::RelayRegistered { peer_id, status } => {
                assert_eq!(peer_id, keys.peer_id());
                assert_ne!(status, "registered");
            }
            other => panic!("Unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_offer_forwarded_with_sender_identity() {
        let addr = start_server().await;
        let mut alice = TcpStream::connect(addr).await.unwrap();
        let mut bob = TcpStream::connect(addr).await.unwrap();
        let alice_keys = RelayKeys::generate();
        let bob_keys = RelayKeys::generate();
        advertise(&mut alice, &alice_keys).await;
        advertise(&mut bob, &bob_keys).await;

        send(
            &mut alice,
            &ClientMessage::Offer {
                target_peer: bob_keys.peer_id(),
                sdp: "v=0 offer".to_string(),
            },
        )
        .await;

        match recv(&mut bob).await {
            ServerMessage::Offer { from_peer, sdp } => {
                assert_eq!(from_peer, alice_keys.peer_id());
                assert_eq!(sdp, "v=0 offer");
            }
            other => panic!("Unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_offer_to_unknown_peer_reports_unavailable() {
        let addr = start_server().await;
        let mut alice = TcpStream::connect(addr).await.unwrap();
        let alice_keys = RelayKeys::generate();
        advertise(&mut alice, &alice_keys).await;

        let stranger = RelayKeys::generate().peer_id();
        send(
            &mut alice,
            &ClientMessage::Offer {
                target_peer: stranger.clone(),
                sdp: "v=0".to_string(),
            },
        )
        .await;
        match recv(&mut alice).await {
            ServerMessage::TargetUnavailable { target_peer } => assert_eq!(target_peer, stranger),
            other => panic!("Unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_get_peer_key() {
        let addr = start_server().await;
        let mut alice = TcpStream::connect(addr).await.unwrap();
        let mut bob = TcpStream::connect(addr).await.unwrap();
        let alice_keys = RelayKeys::generate();
        let bob_keys = RelayKeys::generate();
        advertise(&mut alice, &alice_keys).await;
        advertise(&mut bob, &bob_keys).await;

        send(
            &mut alice,
            &ClientMessage::GetPeerKey {
                peer_id: bob_keys.peer_id(),
            },
        )
        .await;
        match recv(&mut alice).await {
            ServerMessage::PeerKey {
                peer_id,
                public_key,
            } => {
                assert_eq!(peer_id, bob_keys.peer_id());
                assert_eq!(public_key, bob_keys.public_key_hex());
            }
            other => panic!("Unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disconnect_removes_peer_from_directory() {
        let addr = start_server().await;
        let mut alice = TcpStream::connect(addr).await.unwrap();
        let mut bob = TcpStream::connect(addr).await.unwrap();
        let alice_keys = RelayKeys::generate();
        let bob_keys = RelayKeys::generate();
        advertise(&mut alice, &alice_keys).await;
        advertise(&mut bob, &bob_keys).await;

        drop(bob);
        // Let the server observe the hangup.
        tokio::time::sleep(Duration::from_millis(100)).await;

        send(&mut alice, &ClientMessage::DiscoverRelays).await;
        match recv(&mut alice).await {
            ServerMessage::RelayList { peers } => assert!(peers.is_empty()),
            other => panic!("Unexpected reply: {:?}", other),
        }
    }
}
