//! Signaling wire protocol — JSON messages between clients and coordinator
//!
//! Messages are internally tagged by `type` with kebab-case tags and
//! camelCase fields, framed as u32-length-prefixed JSON over the socket.

use crate::directory::RelayCapabilities;
use crate::identity::PeerId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol version, carried nowhere yet; bump when the shapes change.
pub const SIGNALING_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum SignalingProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

/// Client → coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    DiscoverRelays,
    #[serde(rename_all = "camelCase")]
    AdvertiseRelay {
        peer_id: PeerId,
        /// Hex-encoded X25519 public key.
        public_key: String,
        capabilities: RelayCapabilities,
    },
    #[serde(rename_all = "camelCase")]
    Offer {
        target_peer: PeerId,
        sdp: String,
    },
    #[serde(rename_all = "camelCase")]
    Answer {
        target_peer: PeerId,
        sdp: String,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        target_peer: PeerId,
        candidate: String,
    },
    #[serde(rename_all = "camelCase")]
    GetPeerKey {
        peer_id: PeerId,
    },
}

/// Coordinator → client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    RelayList {
        peers: Vec<RelayPeerMessage>,
    },
    #[serde(rename_all = "camelCase")]
    RelayRegistered {
        peer_id: PeerId,
        status: String,
    },
    #[serde(rename_all = "camelCase")]
    Offer {
        from_peer: PeerId,
        sdp: String,
    },
    #[serde(rename_all = "camelCase")]
    Answer {
        from_peer: PeerId,
        sdp: String,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        from_peer: PeerId,
        candidate: String,
    },
    #[serde(rename_all = "camelCase")]
    PeerKey {
        peer_id: PeerId,
        /// Hex-encoded X25519 public key.
        public_key: String,
    },
    #[serde(rename_all = "camelCase")]
    TargetUnavailable {
        target_peer: PeerId,
    },
}

/// Directory entry included in a relay-list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayPeerMessage {
    pub id: PeerId,
    pub capabilities: RelayCapabilities,
    pub connected_at: u64,
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<Vec<u8>, SignalingProtocolError> {
        serde_json::to_vec(self).map_err(|e| SignalingProtocolError::SerializationError(e.to_string()))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, SignalingProtocolError> {
        serde_json::from_slice(bytes)
            .map_err(|e| SignalingProtocolError::DeserializationError(e.to_string()))
    }
}

impl ServerMessage {
    pub fn to_json(&self) -> Result<Vec<u8>, SignalingProtocolError> {
        serde_json::to_vec(self).map_err(|e| SignalingProtocolError::SerializationError(e.to_string()))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, SignalingProtocolError> {
        serde_json::from_slice(bytes)
            .map_err(|e| SignalingProtocolError::DeserializationError(e.to_string()))
    }
}

// ============================================================================
// TESTS
// ============================================================================
