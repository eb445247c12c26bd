//! Data-channel transport abstraction
//!
//! Circuits run over ordered point-to-point data channels between peers. The
//! trait below is what the engine and forwarder program against; adapters
//! own session negotiation and reuse. `memory` is the in-process hub used in
//! tests, `tcp` negotiates real sockets through the signaling coordinator.

pub mod memory;
pub mod tcp;

pub use memory::{MemoryHub, MemoryNet};
pub use tcp::TcpNet;

use crate::identity::PeerId;
use async_trait::async_trait;
use thiserror::Error;

/// Lifecycle of one data-channel session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closed,
}

/// Events surfaced by a transport adapter to the owning node.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// A session to `peer` became usable.
    Opened { peer: PeerId },
    /// A frame arrived from `from`.
    Data { from: PeerId, bytes: Vec<u8> },
    /// The session to `peer` closed; in-flight envelopes are lost.
    Closed { peer: PeerId },
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("peer not reachable: {0}")]
    Unreachable(PeerId),
    #[error("channel to {0} is closed")]
    Closed(PeerId),
    #[error("channel negotiation timed out")]
    NegotiationTimeout,
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Point-to-point data-channel network.
///
/// `open` is idempotent: an existing open session is reused, which amortizes
/// negotiation across circuits.
#[async_trait]
pub trait DataChannelNet: Send + Sync {
    /// This node's peer id.
    fn local_peer(&self) -> PeerId;

    /// Ensure an open session to `peer`, negotiating if needed.
    async fn open(&self, peer: &PeerId) -> Result<(), ChannelError>;

    /// Send one frame to `peer`, opening a session lazily if none exists.
    async fn send(&self, peer: &PeerId, bytes: Vec<u8>) -> Result<(), ChannelError>;

    /// Tear down the session to `peer`, if any.
    async fn close(&self, peer: &PeerId);
}
