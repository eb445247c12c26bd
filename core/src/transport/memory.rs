//! In-process data-channel hub
//!
//! Connects peers within one process over unbounded channels. Stands in for
//! the WebRTC data-channel adapter in tests and local wiring, with knobs for
//! forcing peers offline and observing channel establishment.

use super::{ChannelError, ChannelEvent, DataChannelNet, SessionState};
use crate::identity::PeerId;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Shared hub: the "network" all attached peers hang off.
#[derive(Default)]
pub struct MemoryHub {
    inboxes: RwLock<HashMap<PeerId, mpsc::UnboundedSender<ChannelEvent>>>,
    /// Peers marked unreachable; open/send to them fails.
    down: RwLock<HashSet<PeerId>>,
    /// Session-open log per opener, for test assertions.
    open_log: RwLock<HashMap<PeerId, Vec<PeerId>>>,
    /// One-shot open failures per opener: the next open() from that peer
    /// fails regardless of target, simulating a channel force-closed during
    /// establishment.
    fail_next_open: RwLock<HashSet<PeerId>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a peer, returning its network handle and inbound event stream.
    pub fn attach(self: &Arc<Self>, peer: PeerId) -> (MemoryNet, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.write().insert(peer.clone(), tx);
        self.down.write().remove(&peer);
        let net = MemoryNet {
            hub: Arc::clone(self),
            local: peer,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        };
        (net, rx)
    }

    /// Force a peer offline: its inbox is dropped and future opens fail.
    pub fn force_close(&self, peer: &PeerId) {
        self.inboxes.write().remove(peer);
        self.down.write().insert(peer.clone());
    }

    /// Make the next `open()` from `peer` fail once.
    pub fn fail_next_open_from(&self, peer: &PeerId) {
        self.fail_next_open.write().insert(peer.clone());
    }

    /// Number of sessions `peer` has opened so far.
    pub fn channels_opened_by(&self, peer: &PeerId) -> usize {
        self.open_log.read().get(peer).map_or(0, |log| log.len())
    }

    /// Targets of the sessions `peer` opened, in order.
    pub fn open_targets_of(&self, peer: &PeerId) -> Vec<PeerId> {
        self.open_log.read().get(peer).cloned().unwrap_or_default()
    }

    fn deliver(&self, from: &PeerId, to: &PeerId, bytes: Vec<u8>) -> Result<(), ChannelError> {
        let inboxes = self.inboxes.read();
        let tx = inboxes
            .get(to)
            .ok_or_else(|| ChannelError::Unreachable(to.clone()))?;
        tx.send(ChannelEvent::Data {
            from: from.clone(),
            bytes,
        })
        .map_err(|_| ChannelError::Closed(to.clone()))
    }

    fn reachable(&self, peer: &PeerId) -> bool {
        !self.down.read().contains(peer) && self.inboxes.read().contains_key(peer)
    }
}

/// One peer's handle onto a [`MemoryHub`].
#[derive(Clone)]
pub struct MemoryNet {
    hub: Arc<MemoryHub>,
    local: PeerId,
    sessions: Arc<RwLock<HashMap<PeerId, SessionState>>>,
}

#[async_trait]
impl DataChannelNet for MemoryNet {
    fn local_peer(&self) -> PeerId {
        self.local.clone()
    }

    async fn open(&self, peer: &PeerId) -> Result<(), ChannelError> {
        if self.sessions.read().get(peer) == Some(&SessionState::Open) {
            return Ok(());
        }
        // Log the attempt whether or not it succeeds, so suites can observe
        // which targets were tried.
        self.hub
            .open_log
            .write()
            .entry(self.local.clone())
            .or_default()
            .push(peer.clone());
        if self.hub.fail_next_open.write().remove(&self.local) {
            return Err(ChannelError::Unreachable(peer.clone()));
        }
        if !self.hub.reachable(peer) {
            return Err(ChannelError::Unreachable(peer.clone()));
        }
        self.sessions.write().insert(peer.clone(), SessionState::Open);
        Ok(())
    }

    async fn send(&self, peer: &PeerId, bytes: Vec<u8>) -> Result<(), ChannelError> {
        self.open(peer).await?;
        match self.hub.deliver(&self.local, peer, bytes) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.sessions.write().insert(peer.clone(), SessionState::Closed);
                Err(e)
            }
        }
    }

    async fn close(&self, peer: &PeerId) {
        self.sessions.write().insert(peer.clone(), SessionState::Closed);
    }
}
