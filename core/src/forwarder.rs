//! Per-node relay logic: peel, forward or execute, and route responses back.
//!
//! Every node runs one [`Forwarder`], whether it only originates requests or
//! also relays for others. Response routing is source-free: each hop
//! remembers only who handed it a request id, so a response retraces the
//! chain without any node learning more than its neighbors.

use crate::fetch::{AnonymousRequest, FetchResponse, Fetcher};
use crate::identity::{PeerId, RelayKeys};
use crate::onion::peel_envelope;
use crate::transport::DataChannelNet;
use crate::wire::{unix_timestamp, ChannelFrame, ForwardEnvelope, RequestId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// How long a return-path entry survives without a response.
pub const PREDECESSOR_TTL: Duration = Duration::from_secs(30);

/// Return-path state: request id to the peer that sent it to us. An entry
/// is consumed by the response or dropped after [`PREDECESSOR_TTL`].
#[derive(Default)]
pub struct PredecessorMap {
    entries: RwLock<HashMap<RequestId, (PeerId, Instant)>>,
}

impl PredecessorMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember who to hand the response for `request_id` back to.
    pub fn record(&self, request_id: RequestId, predecessor: PeerId) {
        self.entries
            .write()
            .insert(request_id, (predecessor, Instant::now() + PREDECESSOR_TTL));
    }

    /// Consume the entry for a request. Expired entries count as absent.
    pub fn take(&self, request_id: &RequestId) -> Option<PeerId> {
        let (predecessor, expires_at) = self.entries.write().remove(request_id)?;
        if Instant::now() < expires_at {
            Some(predecessor)
        } else {
            None
        }
    }

    pub fn prune_expired(&self) {
        let now = Instant::now();
        self.entries
            .write()
            .retain(|_, (_, expires_at)| now < *expires_at);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// In-flight requests this node originated, waiting on response bytes.
#[derive(Default)]
pub struct PendingRequests {
    entries: Mutex<HashMap<RequestId, oneshot::Sender<Vec<u8>>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, request_id: RequestId) -> oneshot::Receiver<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.entries.lock().insert(request_id, tx);
        rx
    }

    /// Deliver response bytes to the waiting originator. Hands the payload
    /// back if nothing was waiting (timed out, duplicate, or never ours), so
    /// relay hops never pay for a copy they do not need.
    pub fn resolve(&self, request_id: &RequestId, data: Vec<u8>) -> Option<Vec<u8>> {
        match self.entries.lock().remove(request_id) {
            Some(tx) => {
                let _ = tx.send(data);
                None
            }
            None => Some(data),
        }
    }

    pub fn remove(&self, request_id: &RequestId) {
        self.entries.lock().remove(request_id);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Handles every frame arriving on this node's data channels.
#[derive(Clone)]
pub struct Forwarder {
    keys: Arc<RelayKeys>,
    net: Arc<dyn DataChannelNet>,
    fetcher: Arc<dyn Fetcher>,
    predecessors: Arc<PredecessorMap>,
    pending: Arc<PendingRequests>,
}

impl Forwarder {
    pub fn new(
        keys: Arc<RelayKeys>,
        net: Arc<dyn DataChannelNet>,
        fetcher: Arc<dyn Fetcher>,
        predecessors: Arc<PredecessorMap>,
        pending: Arc<PendingRequests>,
    ) -> Self {
        Self {
            keys,
            net,
            fetcher,
            predecessors,
            pending,
        }
    }

    /// Entry point for raw channel bytes from `from`.
    pub async fn handle_frame(&self, from: PeerId, bytes: &[u8]) {
        let frame = match ChannelFrame::from_bytes(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(from = %from.short(), "undecodable frame dropped: {}", e);
                return;
            }
        };
        match frame {
            ChannelFrame::Forward(envelope) => self.handle_forward(from, envelope).await,
            ChannelFrame::Response {
                request_id, data, ..
            } => self.handle_response(request_id, data).await,
        }
    }

    /// Peel our layer and either pass the envelope along or execute it.
    async fn handle_forward(&self, from: PeerId, envelope: ForwardEnvelope) {
        let request_id = envelope.request_id;
        let inner = match peel_envelope(&self.keys, &envelope) {
            Ok(inner) => inner,
            Err(e) => {
                // Not addressed to us, replayed, or tampered with. Say nothing:
                // an error reply would leak which hop rejected it.
                tracing::debug!(request = %request_id, "layer rejected: {}", e);
                return;
            }
        };

        self.predecessors.record(request_id, from);

        match (&inner.next_hop, &inner.payload) {
            (Some(next_hop), crate::wire::ForwardPayload::Sealed(_)) => {
                let frame = ChannelFrame::Forward(inner.clone());
                match frame.to_bytes() {
                    Ok(bytes) => {
                        if let Err(e) = self.net.send(next_hop, bytes).await {
                            tracing::debug!(request = %request_id, "forward to next hop failed: {}", e);
                            self.predecessors.take(&request_id);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(request = %request_id, "failed to encode forward: {}", e);
                        self.predecessors.take(&request_id);
                    }
                }
            }
            (None, crate::wire::ForwardPayload::Exit(plaintext)) => {
                self.execute_exit(request_id, plaintext).await;
            }
            _ => {
                // Mismatched addressing and payload; a well-formed chain
                // never produces this.
                tracing::debug!(request = %request_id, "malformed inner envelope dropped");
                self.predecessors.take(&request_id);
            }
        }
    }

    /// Exit role: perform the fetch and send the outcome back along the
    /// chain. Fetch failures travel back too, so the originator can fall
    /// back instead of timing out.
    async fn execute_exit(&self, request_id: RequestId, plaintext: &[u8]) {
        let outcome: Result<FetchResponse, String> = match bincode::deserialize::<AnonymousRequest>(
            plaintext,
        ) {
            Ok(request) => {
                tracing::debug!(request = %request_id, "executing exit fetch");
                self.fetcher
                    .fetch(&request.url, &request.options)
                    .await
                    .map_err(|e| e.to_string())
            }
            Err(_) => Err("malformed exit request".to_string()),
        };

        let data = match bincode::serialize(&outcome) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(request = %request_id, "failed to encode fetch outcome: {}", e);
                return;
            }
        };
        self.handle_response(request_id, data).await;
    }

    /// Route response bytes one step back toward the originator. If we are
    /// the originator, resolve the local waiter; the return-path entry is
    /// consumed either way.
    async fn handle_response(&self, request_id: RequestId, data: Vec<u8>) {
        let Some(data) = self.pending.resolve(&request_id, data) else {
            self.predecessors.take(&request_id);
            return;
        };

        let Some(predecessor) = self.predecessors.take(&request_id) else {
            tracing::debug!(request = %request_id, "response with no return path dropped");
            return;
        };

        let frame = ChannelFrame::Response {
            request_id,
            data,
            timestamp: unix_timestamp(),
        };
        match frame.to_bytes() {
            Ok(bytes) => {
                if let Err(e) = self.net.send(&predecessor, bytes).await {
                    tracing::debug!(request = %request_id, "response forward failed: {}", e);
                }
            }
            Err(e) => {
                tracing::warn!(request = %request_id, "failed to encode response: {}", e);
            }
        }
    }

    pub fn predecessors(&self) -> &PredecessorMap {
        &self.predecessors
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{FetchError, RequestOptions};
    use crate::onion::{wrap_request, HopAddr};
    use crate::transport::{ChannelEvent, MemoryHub};
    use async_trait::async_trait;

    struct CannedFetcher {
        body: Vec<u8>,
    }

    #[async_trait]
    impl Fetcher for CannedFetcher {
        async fn fetch(
            &self,
            _url: &str,
            _options: &RequestOptions,
        ) -> Result<FetchResponse, FetchError> {
            Ok(FetchResponse {
                status: 200,
                headers: vec![("content-type".to_string(), "text/plain".to_string())],
                body: self.body.clone(),
            })
        }
    }

    struct FailingFetcher;

    #[async_trait]
    impl Fetcher for FailingFetcher {
        async fn fetch(
            &self,
            _url: &str,
            _options: &RequestOptions,
        ) -> Result<FetchResponse, FetchError> {
            Err(FetchError::Failed("connection refused".to_string()))
        }
    }

    fn forwarder_on(
        hub: &Arc<MemoryHub>,
        keys: Arc<RelayKeys>,
        fetcher: Arc<dyn Fetcher>,
    ) -> (Forwarder, tokio::sync::mpsc::UnboundedReceiver<ChannelEvent>) {
        let (net, events) = hub.attach(keys.peer_id());
        let forwarder = Forwarder::new(
            keys,
            Arc::new(net),
            fetcher,
            Arc::new(PredecessorMap::new()),
            Arc::new(PendingRequests::new()),
        );
        (forwarder, events)
    }

    fn exit_request(url: &str) -> Vec<u8> {
        bincode::serialize(&AnonymousRequest {
            url: url.to_string(),
            options: RequestOptions::default(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_exit_executes_and_replies_to_predecessor() {
        let hub = MemoryHub::new();
        let origin_keys = RelayKeys::generate();
        let exit_keys = Arc::new(RelayKeys::generate());
        let (_origin_net, mut origin_events) = hub.attach(origin_keys.peer_id());
        let (exit, _exit_events) = forwarder_on(
            &hub,
            exit_keys.clone(),
            Arc::new(CannedFetcher {
                body: b"hello".to_vec(),
            }),
        );

        let request_id = RequestId::random();
        let hops = [HopAddr {
            peer_id: exit_keys.peer_id(),
            public_key: exit_keys.public_key(),
        }];
        let envelope =
            wrap_request(&hops, request_id, &exit_request("http://example.com"), 0).unwrap();
        let bytes = ChannelFrame::Forward(envelope).to_bytes().unwrap();

        exit.handle_frame(origin_keys.peer_id(), &bytes).await;

        let event = origin_events.recv().await.unwrap();
        let ChannelEvent::Data { bytes, .. } = event else {
            panic!("Expected data event");
        };
        let ChannelFrame::Response {
            request_id: rid,
            data,
            ..
        } = ChannelFrame::from_bytes(&bytes).unwrap()
        else {
            panic!("Expected response frame");
        };
        assert_eq!(rid, request_id);
        let outcome: Result<FetchResponse, String> = bincode::deserialize(&data).unwrap();
        assert_eq!(outcome.unwrap().body, b"hello");

        // Return-path entry consumed by the response.
        assert!(exit.predecessors().is_empty());
    }

    #[tokio::test]
    async fn test_exit_fetch_failure_travels_back() {
        let hub = MemoryHub::new();
        let origin_keys = RelayKeys::generate();
        let exit_keys = Arc::new(RelayKeys::generate());
        let (_origin_net, mut origin_events) = hub.attach(origin_keys.peer_id());
        let (exit, _exit_events) =
            forwarder_on(&hub, exit_keys.clone(), Arc::new(FailingFetcher));

        let request_id = RequestId::random();
        let hops = [HopAddr {
            peer_id: exit_keys.peer_id(),
            public_key: exit_keys.public_key(),
        }];
        let envelope =
            wrap_request(&hops, request_id, &exit_request("http://example.com"), 0).unwrap();
        let bytes = ChannelFrame::Forward(envelope).to_bytes().unwrap();
        exit.handle_frame(origin_keys.peer_id(), &bytes).await;

        let ChannelEvent::Data { bytes, .. } = origin_events.recv().await.unwrap() else {
            panic!("Expected data event");
        };
        let ChannelFrame::Response { data, .. } = ChannelFrame::from_bytes(&bytes).unwrap() else {
            panic!("Expected response frame");
        };
        let outcome: Result<FetchResponse, String> = bincode::deserialize(&data).unwrap();
        assert!(outcome.unwrap_err().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_intermediate_peels_and_forwards() {
        let hub = MemoryHub::new();
        let origin_keys = RelayKeys::generate();
        let middle_keys = Arc::new(RelayKeys::generate());
        let exit_keys = Arc::new(RelayKeys::generate());
        let (_origin_net, _origin_events) = hub.attach(origin_keys.peer_id());
        let (middle, _middle_events) = forwarder_on(
            &hub,
            middle_keys.clone(),
            Arc::new(FailingFetcher),
        );
        let (_exit_net, mut exit_events) = hub.attach(exit_keys.peer_id());

        let request_id = RequestId::random();
        let hops = [
            HopAddr {
                peer_id: middle_keys.peer_id(),
                public_key: middle_keys.public_key(),
            },
            HopAddr {
                peer_id: exit_keys.peer_id(),
                public_key: exit_keys.public_key(),
            },
        ];
        let envelope = wrap_request(&hops, request_id, &exit_request("http://x"), 0).unwrap();
        let bytes = ChannelFrame::Forward(envelope).to_bytes().unwrap();

        middle.handle_frame(origin_keys.peer_id(), &bytes).await;

        // The exit receives an envelope addressed to it, one layer thinner.
        let mut got_forward = false;
        while let Ok(event) = exit_events.try_recv() {
            if let ChannelEvent::Data { bytes, .. } = event {
                let ChannelFrame::Forward(inner) = ChannelFrame::from_bytes(&bytes).unwrap() else {
                    panic!("Expected forward frame");
                };
                assert_eq!(inner.request_id, request_id);
                assert_eq!(inner.next_hop, Some(exit_keys.peer_id()));
                got_forward = true;
            }
        }
        assert!(got_forward);
        assert_eq!(middle.predecessors().len(), 1);
    }

    #[tokio::test]
    async fn test_intermediate_forwards_response_to_predecessor() {
        let hub = MemoryHub::new();
        let origin_keys = RelayKeys::generate();
        let middle_keys = Arc::new(RelayKeys::generate());
        let exit_peer = RelayKeys::generate().peer_id();
        let (_origin_net, mut origin_events) = hub.attach(origin_keys.peer_id());
        let (middle, _middle_events) =
            forwarder_on(&hub, middle_keys.clone(), Arc::new(FailingFetcher));

        let request_id = RequestId::random();
        middle.predecessors().record(request_id, origin_keys.peer_id());

        let frame = ChannelFrame::Response {
            request_id,
            data: vec![42],
            timestamp: 0,
        };
        middle
            .handle_frame(exit_peer, &frame.to_bytes().unwrap())
            .await;

        let ChannelEvent::Data { bytes, .. } = origin_events.recv().await.unwrap() else {
            panic!("Expected data event");
        };
        let ChannelFrame::Response { data, .. } = ChannelFrame::from_bytes(&bytes).unwrap() else {
            panic!("Expected response frame");
        };
        assert_eq!(data, vec![42]);
        // Mapping is deleted once the response has passed through.
        assert!(middle.predecessors().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_key_dropped_silently() {
        let hub = MemoryHub::new();
        let origin_keys = RelayKeys::generate();
        let addressed_keys = RelayKeys::generate();
        let wrong_keys = Arc::new(RelayKeys::generate());
        let (_origin_net, mut origin_events) = hub.attach(origin_keys.peer_id());
        let (wrong, _wrong_events) = forwarder_on(
            &hub,
            wrong_keys.clone(),
            Arc::new(FailingFetcher),
        );

        let hops = [HopAddr {
            peer_id: addressed_keys.peer_id(),
            public_key: addressed_keys.public_key(),
        }];
        let envelope = wrap_request(&hops, RequestId::random(), b"payload", 0).unwrap();
        let bytes = ChannelFrame::Forward(envelope).to_bytes().unwrap();

        wrong.handle_frame(origin_keys.peer_id(), &bytes).await;

        // No reply of any kind, and no return-path state.
        assert!(origin_events.try_recv().is_err());
        assert!(wrong.predecessors().is_empty());
    }

    #[tokio::test]
    async fn test_response_with_no_return_path_dropped() {
        let hub = MemoryHub::new();
        let keys = RelayKeys::generate();
        let (forwarder, _events) =
            forwarder_on(&hub, Arc::new(keys), Arc::new(FailingFetcher));

        let frame = ChannelFrame::Response {
            request_id: RequestId::random(),
            data: vec![1, 2, 3],
            timestamp: 0,
        };
        let bytes = frame.to_bytes().unwrap();
        forwarder
            .handle_frame(RelayKeys::generate().peer_id(), &bytes)
            .await;
        // Nothing to assert beyond not panicking; the drop is silent.
    }

    #[tokio::test]
    async fn test_resolve_without_waiter_returns_payload() {
        let pending = PendingRequests::new();
        let request_id = RequestId::random();

        // No waiter registered: the payload comes back untouched.
        assert_eq!(
            pending.resolve(&request_id, vec![7, 8, 9]),
            Some(vec![7, 8, 9])
        );

        let rx = pending.register(request_id);
        assert_eq!(pending.resolve(&request_id, vec![1, 2]), None);
        assert_eq!(rx.await.unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_predecessor_entries_expire() {
        let map = PredecessorMap::new();
        let request_id = RequestId::random();
        map.record(request_id, RelayKeys::generate().peer_id());
        assert_eq!(map.len(), 1);

        // Force expiry by rewriting the deadline.
        map.entries
            .write()
            .get_mut(&request_id)
            .unwrap()
            .1 = Instant::now() - Duration::from_secs(1);
        assert!(map.take(&request_id).is_none());

        map.record(RequestId::random(), RelayKeys::generate().peer_id());
        map.entries
            .write()
            .values_mut()
            .for_each(|entry| entry.1 = Instant::now() - Duration::from_secs(1));
        map.prune_expired();
        assert!(map.is_empty());
    }
}
