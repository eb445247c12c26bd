//! Signaling Coordinator — rendezvous directory and handshake forwarding
//!
//! Holds only TTL-bounded, reconstructable state: connection records for
//! live signaling sessions and peer descriptors for advertised relays. A
//! restart degrades discovery until peers re-advertise, nothing more.

use super::protocol::RelayPeerMessage;
use crate::directory::RelayCapabilities;
use crate::identity::PeerId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// TTL of a peer descriptor; peers must re-advertise before it lapses.
    pub peer_ttl: Duration,
    /// TTL of a signaling connection record.
    pub connection_ttl: Duration,
    /// Maximum concurrent signaling connections.
    pub max_connections: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            peer_ttl: Duration::from_secs(30 * 60),
            connection_ttl: Duration::from_secs(60 * 60),
            max_connections: 1000,
        }
    }
}

/// Identifier of one signaling transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new random connection id.
    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        ConnectionId(u64::from_le_bytes(bytes))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[derive(Debug)]
struct ConnectionRecord {
    peer_id: Option<PeerId>,
    expires_at: Instant,
}

#[derive(Debug)]
struct PeerDescriptor {
    public_key: [u8; 32],
    capabilities: RelayCapabilities,
    connection_id: ConnectionId,
    registered_at: u64,
    expires_at: Instant,
}

impl PeerDescriptor {
    fn eligible_at(&self, now: Instant) -> bool {
        self.capabilities.relay_enabled && now < self.expires_at
    }
}

/// Statistics about coordinator operations.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorStats {
    pub connections_active: usize,
    pub peers_advertised: usize,
    pub forwards_relayed: u64,
    pub forwards_dropped: u64,
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Connection limit exceeded")]
    ConnectionLimitExceeded,
    #[error("Unknown or expired connection")]
    UnknownConnection,
    #[error("Target peer unavailable: {0}")]
    TargetUnavailable(PeerId),
}

/// The coordinator's directory state. Transport-agnostic: the signaling
/// server drives it from socket events.
pub struct Coordinator {
    config: CoordinatorConfig,
    connections: Arc<RwLock<HashMap<ConnectionId, ConnectionRecord>>>,
    peers: Arc<RwLock<HashMap<PeerId, PeerDescriptor>>>,
    stats: Arc<RwLock<CoordinatorStats>>,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::with_config(CoordinatorConfig::default())
    }

    pub fn with_config(config: CoordinatorConfig) -> Self {
        Self {
            config,
            connections: Arc::new(RwLock::new(HashMap::new())),
            peers: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(CoordinatorStats::default())),
        }
    }

    /// Register a signaling connection. Idempotent: re-connecting refreshes
    /// the record's expiry.
    pub fn connect(&self, connection_id: ConnectionId) -> Result<(), CoordinatorError> {
        let mut connections = self.connections.write();
        if !connections.contains_key(&connection_id)
            && connections.len() >= self.config.max_connections
        {
            return Err(CoordinatorError::ConnectionLimitExceeded);
        }
        let expires_at = Instant::now() + self.config.connection_ttl;
        connections
            .entry(connection_id)
            .and_modify(|record| record.expires_at = expires_at)
            .or_insert(ConnectionRecord {
                peer_id: None,
                expires_at,
            });
        self.stats.write().connections_active = connections.len();
        Ok(())
    }

    /// Drop a connection and any peer descriptor bound to it. Idempotent;
    /// always succeeds.
    pub fn disconnect(&self, connection_id: ConnectionId) {
        let mut connections = self.connections.write();
        let removed = connections.remove(&connection_id);
        self.stats.write().connections_active = connections.len();
        drop(connections);

        if removed.is_some() {
            let mut peers = self.peers.write();
            peers.retain(|_, descriptor| descriptor.connection_id != connection_id);
            self.stats.write().peers_advertised = peers.len();
        }
    }

    /// Upsert a peer descriptor with a fresh TTL, bound to the caller's
    /// connection. Must be called again before expiry to stay discoverable.
    pub fn advertise_relay(
        &self,
        connection_id: ConnectionId,
        peer_id: PeerId,
        public_key: [u8; 32],
        capabilities: RelayCapabilities,
    ) -> Result<(), CoordinatorError> {
        let now = Instant::now();
        {
            let mut connections = self.connections.write();
            let record = connections
                .get_mut(&connection_id)
                .filter(|record| now < record.expires_at)
                .ok_or(CoordinatorError::UnknownConnection)?;
            record.peer_id = Some(peer_id.clone());
        }

        let mut peers = self.peers.write();
        peers.insert(
            peer_id.clone(),
            PeerDescriptor {
                public_key,
                capabilities,
                connection_id,
                registered_at: crate::wire::unix_timestamp(),
                expires_at: now + self.config.peer_ttl,
            },
        );
        self.stats.write().peers_advertised = peers.len();
        tracing::debug!(peer = %peer_id.short(), "relay advertised");
        Ok(())
    }

    /// All enabled, non-expired peers, excluding the caller.
    pub fn discover_relays(&self, caller: Option<&PeerId>) -> Vec<RelayPeerMessage> {
        self.discover_relays_at(Instant::now(), caller)
    }

    fn discover_relays_at(&self, now: Instant, caller: Option<&PeerId>) -> Vec<RelayPeerMessage> {
        self.peers
            .read()
            .iter()
            .filter(|(_, descriptor)| descriptor.eligible_at(now))
            .filter(|&(id, _)| Some(id) != caller)
            .map(|(id, descriptor)| RelayPeerMessage {
                id: id.clone(),
                capabilities: descriptor.capabilities,
                connected_at: descriptor.registered_at,
            })
            .collect()
    }

    /// Resolve a peer's current public key from the directory.
    pub fn peer_public_key(&self, peer_id: &PeerId) -> Option<[u8; 32]> {
        let now = Instant::now();
        self.peers
            .read()
            .get(peer_id)
            .filter(|descriptor| now < descriptor.expires_at)
            .map(|descriptor| descriptor.public_key)
    }

    /// Resolve the live transport for a handshake forward. A stale target is
    /// garbage-collected and reported unavailable; the coordinator never
    /// retries.
    pub fn forward_target(&self, target: &PeerId) -> Result<ConnectionId, CoordinatorError> {
        let now = Instant::now();
        let connection_id = {
            let peers = self.peers.read();
            peers.get(target).map(|descriptor| descriptor.connection_id)
        };

        let live = connection_id.filter(|id| {
            self.connections
                .read()
                .get(id)
                .is_some_and(|record| now < record.expires_at)
        });

        match live {
            Some(id) => {
                self.stats.write().forwards_relayed += 1;
                Ok(id)
            }
            None => {
                // Stale descriptor or dead transport: collect and report.
                if let Some(id) = connection_id {
                    self.peers.write().remove(target);
                    self.connections.write().remove(&id);
                    let mut stats = self.stats.write();
                    stats.peers_advertised = self.peers.read().len();
                    stats.connections_active = self.connections.read().len();
                }
                self.stats.write().forwards_dropped += 1;
                tracing::debug!(target = %target.short(), "handshake forward dropped, target unavailable");
                Err(CoordinatorError::TargetUnavailable(target.clone()))
            }
        }
    }

    /// The peer bound to a connection, if it advertised.
    pub fn connection_peer(&self, connection_id: ConnectionId) -> Option<PeerId> {
        self.connections
            .read()
            .get(&connection_id)
            .and_then(|record| record.peer_id.clone())
    }

    /// Drop expired connections and descriptors.
    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        let mut connections = self.connections.write();
        connections.retain(|_, record| now < record.expires_at);
        let mut peers = self.peers.write();
        peers.retain(|_, descriptor| {
            now < descriptor.expires_at && connections.contains_key(&descriptor.connection_id)
        });
        let mut stats = self.stats.write();
        stats.connections_active = connections.len();
        stats.peers_advertised = peers.len();
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.stats.read().clone()
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
