//! Peer directory — how an engine learns about advertised relay peers
//!
//! The signaling client implements this against a live coordinator; tests
//! and single-process deployments use the static variant.

use crate::identity::PeerId;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Coarse bandwidth class a relay advertises about itself. Carried as data
/// only; hop selection does not weight by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BandwidthClass {
    Low,
    Standard,
    High,
}

impl Default for BandwidthClass {
    fn default() -> Self {
        BandwidthClass::Standard
    }
}

/// What a peer offers the network. Relaying is opt-in: a node that never
/// advertises `relay_enabled` is never drawn into circuits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayCapabilities {
    pub relay_enabled: bool,
    pub bandwidth_class: BandwidthClass,
}

impl RelayCapabilities {
    pub fn relay(bandwidth_class: BandwidthClass) -> Self {
        Self {
            relay_enabled: true,
            bandwidth_class,
        }
    }

    /// A client that only originates requests.
    pub fn client_only() -> Self {
        Self {
            relay_enabled: false,
            bandwidth_class: BandwidthClass::Standard,
        }
    }
}

impl Default for RelayCapabilities {
    fn default() -> Self {
        Self::relay(BandwidthClass::Standard)
    }
}

/// A relay peer as seen by a client: directory entry minus the key, which is
/// resolved separately when the peer is actually selected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayPeer {
    pub id: PeerId,
    pub capabilities: RelayCapabilities,
    pub connected_at: u64,
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("unknown peer: {0}")]
    UnknownPeer(PeerId),
    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

/// Source of relay peers and their public keys.
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    /// Currently advertised, non-expired relay peers.
    async fn discover(&self) -> Result<Vec<RelayPeer>, DirectoryError>;

    /// Resolve a peer's current X25519 public key.
    async fn public_key(&self, peer: &PeerId) -> Result<[u8; 32], DirectoryError>;
}

/// In-memory directory with a fixed peer set. Used in tests and in
/// single-process wiring where no coordinator is involved.
#[derive(Default)]
pub struct StaticDirectory {
    peers: RwLock<Vec<RelayPeer>>,
    keys: RwLock<HashMap<PeerId, [u8; 32]>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a peer entry.
    pub fn insert(&self, peer: RelayPeer, public_key: [u8; 32]) {
        let mut peers = self.peers.write();
        peers.retain(|p| p.id != peer.id);
        self.keys.write().insert(peer.id.clone(), public_key);
        peers.push(peer);
    }

    pub fn remove(&self, peer: &PeerId) {
        self.peers.write().retain(|p| &p.id != peer);
        self.keys.write().remove(peer);
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}

#[async_trait]
impl PeerDirectory for StaticDirectory {
    async fn discover(&self) -> Result<Vec<RelayPeer>, DirectoryError> {
        Ok(self.peers.read().clone())
    }

    async fn public_key(&self, peer: &PeerId) -> Result<[u8; 32], DirectoryError> {
        self.keys
            .read()
            .get(peer)
            .copied()
            .ok_or_else(|| DirectoryError::UnknownPeer(peer.clone()))
    }
}
