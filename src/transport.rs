//! The `Transport` seam: the out-of-scope "underlying socket client that actually
//! transmits bytes." `NetworkChannel` is built against this trait; this module also supplies
//! a `LoopbackTransport` for tests and the demo binary, so none of the wire framing or real
//! networking an external collaborator owns still needs to exist for the core to run.
//!
//! Shaped after a classic per-destination `Message { to: Vec<ServerId>, body }` batch send
//! in `protos.rs`, generalized to one envelope per destination and the connection-readiness
//! states `NetworkChannel` needs (not-yet-ready / ready / failed).

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::protocol::{InboundRequest, InboundResponse, NodeId, OutboundRequest, OutboundResponse};

/// Connection readiness as observed by `NetworkChannel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Destination unknown to the transport; never attempt I/O for it.
    Unknown,
    /// Connection exists but is not yet usable; retry later.
    NotReady,
    Ready,
    /// The transport has given up on this destination.
    Failed,
}

/// The out-of-scope socket client. A `NetworkChannel` sends requests/responses through this
/// and polls it for inbound traffic; everything about how bytes actually move between
/// processes lives on the other side of this trait.
#[async_trait]
pub trait Transport: Send + Sync {
    fn connection_state(&self, node: NodeId) -> ConnectionState;

    fn send_request(&self, req: OutboundRequest);

    fn send_response(&self, resp: OutboundResponse);

    /// Drains whatever inbound requests/responses have arrived since the last call, blocking
    /// up to `timeout` if nothing is available yet. A `timeout` of zero peeks without blocking.
    fn poll_inbound(&self, timeout: Duration) -> (Vec<InboundRequest>, Vec<InboundResponse>);

    fn update_endpoint(&self, node: NodeId, address: String);

    /// Interrupts a concurrent blocking `poll_inbound`, waking it early with an empty result
    /// rather than letting it sleep out its timeout. Callable from another thread (e.g. an
    /// embedder delivering a shutdown signal).
    fn wakeup(&self);
}

struct LoopbackState {
    /// Shared inbox keyed by destination node id; each node's `LoopbackTransport` drains its
    /// own entry on `poll_inbound`.
    inboxes: HashMap<NodeId, (Vec<InboundRequest>, Vec<InboundResponse>)>,
    endpoints: HashMap<NodeId, String>,
    known: std::collections::HashSet<NodeId>,
    /// Node ids with a pending explicit `wakeup()`, consumed (and cleared) by the next
    /// `poll_inbound` on that node even if no data has arrived.
    woken: std::collections::HashSet<NodeId>,
}

/// An in-process transport sharing queues between simulated nodes, keyed by `NodeId`. Used by
/// the integration tests (`tests/scenarios.rs`) and the demo binary; stands in for the real
/// socket client treated as external to this crate.
#[derive(Clone)]
pub struct LoopbackTransport {
    self_id: NodeId,
    shared: Arc<Mutex<LoopbackState>>,
    /// Notified by every `send_request`/`send_response` so a blocked `poll_inbound` wakes as
    /// soon as something lands, instead of always sleeping out the full timeout.
    notify: Arc<Condvar>,
}

impl LoopbackTransport {
    /// Creates a fresh network of loopback transports, one per id in `nodes`, all sharing the
    /// same routing table.
    pub fn network(nodes: &[NodeId]) -> HashMap<NodeId, LoopbackTransport> {
        let shared = Arc::new(Mutex::new(LoopbackState {
            inboxes: nodes.iter().map(|&n| (n, (Vec::new(), Vec::new()))).collect(),
            endpoints: HashMap::new(),
            known: nodes.iter().cloned().collect(),
            woken: std::collections::HashSet::new(),
        }));
        let notify = Arc::new(Condvar::new());
        nodes
            .iter()
            .map(|&n| {
                (
                    n,
                    LoopbackTransport {
                        self_id: n,
                        shared: shared.clone(),
                        notify: notify.clone(),
                    },
                )
            })
            .collect()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn connection_state(&self, node: NodeId) -> ConnectionState {
        let state = self.shared.lock().unwrap();
        if node == self.self_id {
            return ConnectionState::Ready;
        }
        if state.known.contains(&node) {
            ConnectionState::Ready
        } else {
            ConnectionState::Unknown
        }
    }

    fn send_request(&self, req: OutboundRequest) {
        let mut state = self.shared.lock().unwrap();
        let from = self.self_id;
        if let Some((reqs, _)) = state.inboxes.get_mut(&req.to) {
            reqs.push(InboundRequest {
                correlation_id: req.correlation_id,
                from,
                payload: req.payload,
            });
        }
        drop(state);
        self.notify.notify_all();
    }

    fn send_response(&self, resp: OutboundResponse) {
        let mut state = self.shared.lock().unwrap();
        let from = self.self_id;
        if let Some((_, resps)) = state.inboxes.get_mut(&resp.to) {
            resps.push(InboundResponse {
                correlation_id: resp.correlation_id,
                from,
                payload: resp.payload,
            });
        }
        drop(state);
        self.notify.notify_all();
    }

    fn poll_inbound(&self, timeout: Duration) -> (Vec<InboundRequest>, Vec<InboundResponse>) {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock().unwrap();
        loop {
            let has_data = match state.inboxes.get(&self.self_id) {
                Some((reqs, resps)) => !reqs.is_empty() || !resps.is_empty(),
                None => return (Vec::new(), Vec::new()),
            };
            if has_data {
                let (reqs, resps) = state.inboxes.get_mut(&self.self_id).unwrap();
                return (std::mem::take(reqs), std::mem::take(resps));
            }
            if state.woken.remove(&self.self_id) {
                return (Vec::new(), Vec::new());
            }
            let now = Instant::now();
            if now >= deadline {
                return (Vec::new(), Vec::new());
            }
            let (guard, _) = self.notify.wait_timeout(state, deadline - now).unwrap();
            state = guard;
        }
    }

    fn update_endpoint(&self, node: NodeId, address: String) {
        let mut state = self.shared.lock().unwrap();
        state.endpoints.insert(node, address);
        state.known.insert(node);
    }

    fn wakeup(&self) {
        let mut state = self.shared.lock().unwrap();
        state.woken.insert(self.self_id);
        drop(state);
        self.notify.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FindQuorumRequest, RequestPayload};

    #[test]
    fn loopback_delivers_across_nodes() {
        let net = LoopbackTransport::network(&[0, 1]);
        let a = &net[&0];
        let b = &net[&1];

        a.send_request(OutboundRequest {
            correlation_id: 1,
            to: 1,
            payload: RequestPayload::FindQuorum(FindQuorumRequest { replica_id: 0 }),
        });

        let (reqs, resps) = b.poll_inbound(Duration::from_millis(0));
        assert_eq!(reqs.len(), 1);
        assert_eq!(resps.len(), 0);
        assert_eq!(reqs[0].from, 0);

        // Draining again returns nothing new.
        let (reqs2, _) = b.poll_inbound(Duration::from_millis(0));
        assert!(reqs2.is_empty());
    }

    #[test]
    fn unknown_destination_is_reported() {
        let net = LoopbackTransport::network(&[0]);
        let a = &net[&0];
        assert_eq!(a.connection_state(42), ConnectionState::Unknown);
    }

    #[test]
    fn wakeup_unblocks_a_poll_inbound_with_no_data() {
        let net = LoopbackTransport::network(&[0]);
        let a = net[&0].clone();
        let waker = net[&0].clone();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waker.wakeup();
        });

        let started = Instant::now();
        let (reqs, resps) = a.poll_inbound(Duration::from_secs(5));
        assert!(reqs.is_empty());
        assert!(resps.is_empty());
        assert!(started.elapsed() < Duration::from_secs(1), "wakeup should cut the poll short");

        handle.join().unwrap();
    }
}
