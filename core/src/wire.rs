//! Relay data-channel protocol — frames and serialization

use crate::identity::PeerId;
use crate::onion::SealedLayer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

/// Maximum accepted frame size (bytes). Frames above this are rejected
/// before deserialization.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Identifier correlating one request across all hops of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generate a fresh random request id.
    pub fn random() -> Self {
        RequestId(Uuid::new_v4())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Payload of a forward envelope.
///
/// On the wire this is always `Sealed`; the `Exit` variant only ever appears
/// inside the innermost decrypted layer, where the exit hop finds the
/// plaintext request bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ForwardPayload {
    /// Ciphertext addressed to exactly one hop.
    Sealed(SealedLayer),
    /// Plaintext request bytes, visible only to the exit hop.
    Exit(Vec<u8>),
}

/// One onion-routed forward step.
///
/// `next_hop` names the peer this envelope must be delivered to; that peer
/// is the only one able to open `payload`. `next_hop = None` marks the exit
/// position and only occurs inside the innermost layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardEnvelope {
    pub request_id: RequestId,
    pub next_hop: Option<PeerId>,
    pub payload: ForwardPayload,
    pub timestamp: u64,
}

/// A frame sent over a data-channel session between two peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChannelFrame {
    /// Onion-routed request travelling toward the exit hop.
    Forward(ForwardEnvelope),
    /// Result travelling back toward the originator. `data` is the bincode
    /// encoding of the exit hop's fetch outcome.
    Response {
        request_id: RequestId,
        data: Vec<u8>,
        timestamp: u64,
    },
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("serialization error: {0}")]
    SerializationError(String),
    #[error("deserialization error: {0}")]
    DeserializationError(String),
    #[error("frame too large ({0} bytes)")]
    FrameTooLarge(usize),
}

impl ChannelFrame {
    /// Serialize a frame to bytes using bincode.
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        let bytes =
            bincode::serialize(self).map_err(|e| WireError::SerializationError(e.to_string()))?;
        if bytes.len() > MAX_FRAME_BYTES {
            return Err(WireError::FrameTooLarge(bytes.len()));
        }
        Ok(bytes)
    }

    /// Deserialize a frame from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() > MAX_FRAME_BYTES {
            return Err(WireError::FrameTooLarge(bytes.len()));
        }
        bincode::deserialize(bytes).map_err(|e| WireError::DeserializationError(e.to_string()))
    }

    /// Request id carried by this frame.
    pub fn request_id(&self) -> RequestId {
        match self {
            ChannelFrame::Forward(envelope) => envelope.request_id,
            ChannelFrame::Response { request_id, .. } => *request_id,
        }
    }

    /// Human-readable frame type for log lines.
    pub fn frame_type(&self) -> &'static str {
        match self {
            ChannelFrame::Forward(_) => "Forward",
            ChannelFrame::Response { .. } => "Response",
        }
    }
}

/// Seconds since the Unix epoch, for envelope timestamps.
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ============================================================================
// TESTS
// ============================================================================
