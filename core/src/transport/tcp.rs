//! TCP-backed data channels, negotiated over signaling.
//!
//! An offer carries the offerer's listener address as its session
//! description; the answerer dials it and identifies itself with a hello
//! frame. Frames on the wire are 4-byte big-endian length prefixed, the
//! same convention as the signaling plane.

use super::{ChannelError, ChannelEvent, DataChannelNet};
use crate::identity::PeerId;
use crate::signaling::{read_frame, write_frame, HandshakeEvent, SignalingClient};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);

struct Session {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

/// Data-channel network over plain TCP sockets.
pub struct TcpNet {
    local: PeerId,
    signaling: Arc<SignalingClient>,
    listen_addr: SocketAddr,
    sessions: Arc<RwLock<HashMap<PeerId, Session>>>,
    pending_opens: Arc<Mutex<HashMap<PeerId, Vec<oneshot::Sender<()>>>>>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl TcpNet {
    /// Bind a listener and start negotiating inbound channels. Consumes the
    /// handshake event stream from the signaling client.
    pub async fn start(
        local: PeerId,
        signaling: Arc<SignalingClient>,
        handshakes: mpsc::UnboundedReceiver<HandshakeEvent>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<ChannelEvent>), ChannelError> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let listen_addr = listener.local_addr()?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let net = Arc::new(Self {
            local,
            signaling,
            listen_addr,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            pending_opens: Arc::new(Mutex::new(HashMap::new())),
            events: event_tx,
        });

        tokio::spawn(net.clone().accept_loop(listener));
        tokio::spawn(net.clone().handshake_loop(handshakes));
        Ok((net, event_rx))
    }

    /// The address peers dial to reach this node.
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, remote) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("channel accept failed: {}", e);
                    continue;
                }
            };
            let net = self.clone();
            tokio::spawn(async move {
                if let Err(e) = net.adopt_inbound(stream).await {
                    tracing::debug!(%remote, "inbound channel rejected: {}", e);
                }
            });
        }
    }

    /// Read the hello frame off a dialed-in socket and register the session.
    async fn adopt_inbound(self: Arc<Self>, stream: TcpStream) -> Result<(), ChannelError> {
        let (mut reader, writer) = stream.into_split();
        let hello = tokio::time::timeout(NEGOTIATION_TIMEOUT, read_frame(&mut reader))
            .await
            .map_err(|_| ChannelError::NegotiationTimeout)?
            .map_err(|e| ChannelError::SendFailed(e.to_string()))?
            .ok_or(ChannelError::NegotiationTimeout)?;
        let peer = PeerId::from(
            String::from_utf8(hello).map_err(|e| ChannelError::SendFailed(e.to_string()))?,
        );
        self.register_session(peer.clone(), reader, writer);
        Ok(())
    }

    async fn handshake_loop(
        self: Arc<Self>,
        mut handshakes: mpsc::UnboundedReceiver<HandshakeEvent>,
    ) {
        while let Some(event) = handshakes.recv().await {
            match event {
                HandshakeEvent::Offer { from_peer, sdp } => {
                    let net = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = net.answer_offer(from_peer.clone(), &sdp).await {
                            tracing::warn!(peer = %from_peer.short(), "failed to answer offer: {}", e);
                        }
                    });
                }
                HandshakeEvent::Answer { from_peer, .. } => {
                    // The session itself arrives through the listener.
                    tracing::trace!(peer = %from_peer.short(), "answer received");
                }
                HandshakeEvent::IceCandidate { from_peer, .. } => {
                    tracing::trace!(peer = %from_peer.short(), "candidate ignored");
                }
                HandshakeEvent::TargetUnavailable { target_peer } => {
                    // Fail any open() waiting on this peer.
                    self.pending_opens.lock().remove(&target_peer);
                }
            }
        }
    }

    /// Dial the offerer back, identify ourselves, and acknowledge.
    async fn answer_offer(self: Arc<Self>, from_peer: PeerId, addr: &str) -> Result<(), ChannelError> {
        if self.sessions.read().contains_key(&from_peer) {
            self.signaling
                .send_answer(&from_peer, self.listen_addr.to_string())
                .await
                .map_err(|e| ChannelError::SendFailed(e.to_string()))?;
            return Ok(());
        }
        let stream = TcpStream::connect(addr).await?;
        let (reader, mut writer) = stream.into_split();
        write_frame(&mut writer, self.local.as_str().as_bytes())
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))?;
        self.register_session(from_peer.clone(), reader, writer);
        self.signaling
            .send_answer(&from_peer, self.listen_addr.to_string())
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))?;
        Ok(())
    }

    fn register_session(
        self: &Arc<Self>,
        peer: PeerId,
        mut reader: tokio::net::tcp::OwnedReadHalf,
        writer: OwnedWriteHalf,
    ) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        {
            let mut sessions = self.sessions.write();
            if sessions.contains_key(&peer) {
                // Simultaneous open from both sides; keep the first socket.
                return;
            }
            sessions.insert(
                peer.clone(),
                Session {
                    outbound: outbound_tx,
                },
            );
        }

        tokio::spawn(writer_loop(writer, outbound_rx));

        let net = self.clone();
        let reader_peer = peer.clone();
        tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(Some(bytes)) => {
                        let _ = net.events.send(ChannelEvent::Data {
                            from: reader_peer.clone(),
                            bytes,
                        });
                    }
                    Ok(None) | Err(_) => break,
                }
            }
            net.sessions.write().remove(&reader_peer);
            let _ = net.events.send(ChannelEvent::Closed {
                peer: reader_peer.clone(),
            });
        });

        // Wake any open() call waiting for this peer.
        if let Some(waiters) = self.pending_opens.lock().remove(&peer) {
            for waiter in waiters {
                let _ = waiter.send(());
            }
        }
        let _ = self.events.send(ChannelEvent::Opened { peer });
        tracing::debug!("data channel open");
    }
}

async fn writer_loop(mut writer: OwnedWriteHalf, mut outbound: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(bytes) = outbound.recv().await {
        if write_frame(&mut writer, &bytes).await.is_err() {
            break;
        }
    }
}

#[async_trait]
impl DataChannelNet for TcpNet {
    fn local_peer(&self) -> PeerId {
        self.local.clone()
    }

    async fn open(&self, peer: &PeerId) -> Result<(), ChannelError> {
        if self.sessions.read().contains_key(peer) {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        self.pending_opens
            .lock()
            .entry(peer.clone())
            .or_default()
            .push(tx);
        self.signaling
            .send_offer(peer, self.listen_addr.to_string())
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))?;

        match tokio::time::timeout(NEGOTIATION_TIMEOUT, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ChannelError::Unreachable(peer.clone())),
            Err(_) => {
                if let Some(waiters) = self.pending_opens.lock().get_mut(peer) {
                    waiters.retain(|waiter| !waiter.is_closed());
                }
                Err(ChannelError::NegotiationTimeout)
            }
        }
    }

    async fn send(&self, peer: &PeerId, bytes: Vec<u8>) -> Result<(), ChannelError> {
        if !self.sessions.read().contains_key(peer) {
            self.open(peer).await?;
        }
        let sessions = self.sessions.read();
        let session = sessions
            .get(peer)
            .ok_or_else(|| ChannelError::Closed(peer.clone()))?;
        session
            .outbound
            .send(bytes)
            .map_err(|_| ChannelError::Closed(peer.clone()))
    }

    async fn close(&self, peer: &PeerId) {
        if self.sessions.write().remove(peer).is_some() {
            let _ = self.events.send(ChannelEvent::Closed { peer: peer.clone() });
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
