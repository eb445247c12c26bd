// Veilway Core — Anonymizing Relay Spine
//
// "Does this help a request reach the web without anyone on the path
//  knowing both who asked and what was asked?"
//
// If the answer is no, it doesn't belong here.

pub mod circuit;
pub mod directory;
pub mod engine;
pub mod fetch;
pub mod forwarder;
pub mod identity;
pub mod onion;
pub mod signaling;
pub mod transport;
pub mod wire;

pub use circuit::{select_hops, CircuitConfig, CircuitError};
pub use directory::{BandwidthClass, PeerDirectory, RelayCapabilities, RelayPeer, StaticDirectory};
pub use engine::{CircuitState, EngineConfig, EngineError, EngineStatus, RelayEngine};
pub use fetch::{AnonymousRequest, FetchResponse, Fetcher, RequestOptions, UreqFetcher};
pub use forwarder::{Forwarder, PendingRequests, PredecessorMap};
pub use identity::{PeerId, RelayKeys};
pub use onion::{peel_envelope, wrap_request, HopAddr, OnionError};
pub use signaling::{Coordinator, HandshakeEvent, SignalingClient};
pub use transport::{ChannelEvent, DataChannelNet, MemoryHub, MemoryNet, TcpNet};
pub use wire::{ChannelFrame, ForwardEnvelope, RequestId};

/// Initialize tracing (idempotent). Honors `RUST_LOG`, defaults to `info`.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}
