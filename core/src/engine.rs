//! Relay engine: circuit lifecycle for anonymous requests.
//!
//! Owns the originator side of the system. Each request walks
//! select → encrypt → connect → in-flight and ends resolved, timed out,
//! or failed over to a direct fetch. All dependencies are injected, so the
//! suites drive the engine over in-memory channels and canned fetchers.

use crate::circuit::{select_hops, CircuitConfig, CircuitError};
use crate::directory::{DirectoryError, PeerDirectory};
use crate::fetch::{AnonymousRequest, FetchError, FetchResponse, Fetcher};
use crate::forwarder::{Forwarder, PendingRequests, PredecessorMap};
use crate::identity::{PeerId, RelayKeys};
use crate::onion::{wrap_request, HopAddr, OnionError};
use crate::transport::{ChannelError, ChannelEvent, DataChannelNet};
use crate::wire::{unix_timestamp, ChannelFrame, RequestId, WireError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const PRUNE_INTERVAL: Duration = Duration::from_secs(10);

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub circuit: CircuitConfig,
    /// Budget for opening the channel to the entry hop, per attempt.
    pub connect_timeout: Duration,
    /// Total entry-hop attempts before giving up on a circuit.
    pub connect_attempts: usize,
    /// Budget for the response once the request is on the wire.
    pub request_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            circuit: CircuitConfig::default(),
            connect_timeout: Duration::from_secs(10),
            connect_attempts: 3,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Where a circuit is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Selecting,
    Encrypting,
    Connecting,
    InFlight,
    Resolved,
    TimedOut,
    Failed,
}

/// Snapshot of the engine for status surfaces.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub running: bool,
    pub peers_known: usize,
    pub active_circuits: usize,
    pub min_hops: usize,
    pub max_hops: usize,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Engine is not running")]
    NotRunning,
    #[error("Engine is already running")]
    AlreadyRunning,
    #[error("No circuit available: {0}")]
    NoCircuit(String),
    #[error("Circuit timed out waiting for response")]
    CircuitTimeout,
    #[error("Exit fetch failed: {0}")]
    ExitFetch(String),
    #[error("Onion error: {0}")]
    Onion(#[from] OnionError),
    #[error("Circuit error: {0}")]
    Circuit(#[from] CircuitError),
    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),
    #[error("Encoding error: {0}")]
    Encoding(#[from] WireError),
}

/// The client-side relay engine. One per node.
pub struct RelayEngine {
    keys: Arc<RelayKeys>,
    directory: Arc<dyn PeerDirectory>,
    net: Arc<dyn DataChannelNet>,
    fetcher: Arc<dyn Fetcher>,
    config: EngineConfig,
    forwarder: Forwarder,
    pending: Arc<PendingRequests>,
    predecessors: Arc<PredecessorMap>,
    running: AtomicBool,
    active_circuits: Arc<AtomicUsize>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RelayEngine {
    pub fn new(
        keys: Arc<RelayKeys>,
        directory: Arc<dyn PeerDirectory>,
        net: Arc<dyn DataChannelNet>,
        fetcher: Arc<dyn Fetcher>,
        config: EngineConfig,
    ) -> Self {
        let pending = Arc::new(PendingRequests::new());
        let predecessors = Arc::new(PredecessorMap::new());
        let forwarder = Forwarder::new(
            keys.clone(),
            net.clone(),
            fetcher.clone(),
            predecessors.clone(),
            pending.clone(),
        );
        Self {
            keys,
            directory,
            net,
            fetcher,
            config,
            forwarder,
            pending,
            predecessors,
            running: AtomicBool::new(false),
            active_circuits: Arc::new(AtomicUsize::new(0)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start processing channel events. The engine relays for others and
    /// serves its own responses from here on.
    pub fn start(
        &self,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> Result<(), EngineError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyRunning);
        }

        let forwarder = self.forwarder.clone();
        let dispatch = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ChannelEvent::Data { from, bytes } => {
                        let forwarder = forwarder.clone();
                        tokio::spawn(async move {
                            forwarder.handle_frame(from, &bytes).await;
                        });
                    }
                    ChannelEvent::Opened { peer } => {
                        tracing::trace!(peer = %peer.short(), "channel opened");
                    }
                    ChannelEvent::Closed { peer } => {
                        tracing::trace!(peer = %peer.short(), "channel closed");
                    }
                }
            }
        });

        let predecessors = self.predecessors.clone();
        let prune = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
            loop {
                ticker.tick().await;
                predecessors.prune_expired();
            }
        });

        self.tasks.lock().extend([dispatch, prune]);
        tracing::info!(peer = %self.keys.peer_id().short(), "relay engine started");
        Ok(())
    }

    /// Stop the engine. In-flight requests resolve with [`EngineError::NotRunning`]
    /// semantics on their next await; relay state is kept so a restart picks
    /// up cleanly.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        tracing::info!("relay engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Issue an anonymous request through a fresh circuit.
    pub async fn send_anonymous_request(
        &self,
        request: &AnonymousRequest,
    ) -> Result<FetchResponse, EngineError> {
        if !self.is_running() {
            return Err(EngineError::NotRunning);
        }

        let local = self.keys.peer_id();
        let peers = self.directory.discover().await?;
        let eligible = peers
            .iter()
            .filter(|peer| peer.capabilities.relay_enabled && peer.id != local)
            .count();
        if eligible < self.config.circuit.min_hops {
            tracing::debug!(
                eligible,
                required = self.config.circuit.min_hops,
                "not enough relays for a circuit"
            );
            return self.fallback(request, "insufficient relay peers").await;
        }

        let plaintext = bincode::serialize(request)
            .map_err(|_| EngineError::NoCircuit("request encoding failed".to_string()))?;

        self.active_circuits.fetch_add(1, Ordering::SeqCst);
        let result = self.drive_circuit(request, &local, &peers, &plaintext).await;
        self.active_circuits.fetch_sub(1, Ordering::SeqCst);
        result
    }

    /// Build, connect, and fly one circuit, retrying with alternate entry
    /// hops when the first channel cannot be opened.
    async fn drive_circuit(
        &self,
        request: &AnonymousRequest,
        local: &PeerId,
        peers: &[crate::directory::RelayPeer],
        plaintext: &[u8],
    ) -> Result<FetchResponse, EngineError> {
        let request_id = RequestId::random();
        let mut failed_entries: Vec<PeerId> = Vec::new();

        for attempt in 0..self.config.connect_attempts {
            let hop_ids = match select_hops(peers, local, &failed_entries, &self.config.circuit) {
                Ok(hops) => hops,
                Err(CircuitError::InsufficientPeers) => break,
                Err(e) => return Err(e.into()),
            };

            let mut hops = Vec::with_capacity(hop_ids.len());
            for peer_id in &hop_ids {
                let public_key = self.directory.public_key(peer_id).await?;
                hops.push(HopAddr {
                    peer_id: peer_id.clone(),
                    public_key,
                });
            }

            // Fresh layers per attempt: nothing from a failed attempt is
            // ever retransmitted.
            let envelope = wrap_request(&hops, request_id, plaintext, unix_timestamp())?;
            let entry = hops[0].peer_id.clone();

            tracing::debug!(
                request = %request_id,
                hops = hops.len(),
                entry = %entry.short(),
                attempt,
                "circuit selected"
            );

            let opened =
                tokio::time::timeout(self.config.connect_timeout, self.net.open(&entry)).await;
            match opened {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(entry = %entry.short(), "entry hop unreachable: {}", e);
                    failed_entries.push(entry);
                    continue;
                }
                Err(_) => {
                    tracing::debug!(entry = %entry.short(), "entry hop connect timed out");
                    failed_entries.push(entry);
                    continue;
                }
            }

            let response_rx = self.pending.register(request_id);
            let frame = ChannelFrame::Forward(envelope);
            if let Err(e) = self.net.send(&entry, frame.to_bytes()?).await {
                self.pending.remove(&request_id);
                tracing::debug!(entry = %entry.short(), "send to entry hop failed: {}", e);
                failed_entries.push(entry);
                continue;
            }

            tracing::debug!(request = %request_id, "request in flight");
            let data = match tokio::time::timeout(self.config.request_timeout, response_rx).await {
                Ok(Ok(data)) => data,
                Ok(Err(_)) | Err(_) => {
                    self.pending.remove(&request_id);
                    tracing::debug!(request = %request_id, "circuit timed out");
                    return Err(EngineError::CircuitTimeout);
                }
            };

            let outcome: Result<FetchResponse, String> = bincode::deserialize(&data)
                .map_err(|_| EngineError::NoCircuit("undecodable response".to_string()))?;
            return match outcome {
                Ok(response) => {
                    tracing::debug!(request = %request_id, status = response.status, "circuit resolved");
                    Ok(response)
                }
                Err(message) => Err(EngineError::ExitFetch(message)),
            };
        }

        self.fallback(request, "no entry hop reachable").await
    }

    /// Direct fetch, unless the caller insisted on anonymity.
    async fn fallback(
        &self,
        request: &AnonymousRequest,
        reason: &str,
    ) -> Result<FetchResponse, EngineError> {
        if request.options.strict_anonymity {
            return Err(EngineError::NoCircuit(reason.to_string()));
        }
        tracing::debug!(reason, "falling back to direct fetch");
        Ok(self.fetcher.fetch(&request.url, &request.options).await?)
    }

    pub async fn status(&self) -> EngineStatus {
        let peers_known = self
            .directory
            .discover()
            .await
            .map(|peers| peers.len())
            .unwrap_or(0);
        EngineStatus {
            running: self.is_running(),
            peers_known,
            active_circuits: self.active_circuits.load(Ordering::SeqCst),
            min_hops: self.config.circuit.min_hops,
            max_hops: self.config.circuit.max_hops,
        }
    }

    /// The peer id this engine answers to on the relay network.
    pub fn local_peer(&self) -> PeerId {
        self.keys.peer_id()
    }
}

impl Drop for RelayEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// TESTS
// ============================================================================
