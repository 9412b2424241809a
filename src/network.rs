//! `NetworkChannel`: correlation-id-multiplexed request/response transport.
//!
//! Generalizes the per-peer dispatch bookkeeping a raft core typically keeps inline on
//! `ServerProgress` (`request_pending`, `last_sent` in `consensus.rs`) into an explicit
//! correlation-id table, plus the synthesis rules (`BROKER_NOT_AVAILABLE`,
//! `CLUSTER_AUTHORIZATION_FAILED`) and poll-timeout derivation.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::errors::{ErrorKind, Result};
use crate::protocol::{
    CorrelationId, ErrorCode, InboundRequest, InboundResponse, NodeId, OutboundRequest,
    OutboundResponse, RaftMessage, RequestPayload, ResponsePayload,
};
use crate::transport::{ConnectionState, Transport};

/// What an outstanding outbound request was, so a late/synthesized response can be turned back
/// into the right shape and so request-timeout bookkeeping knows who to blame ("cancellation
/// & timeouts").
struct PendingRequest {
    to: NodeId,
    payload_kind: RequestKind,
    deadline: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Vote,
    BeginQuorumEpoch,
    EndQuorumEpoch,
    FetchQuorumRecords,
    FindQuorum,
}

fn request_kind(payload: &RequestPayload) -> RequestKind {
    match payload {
        RequestPayload::Vote(_) => RequestKind::Vote,
        RequestPayload::BeginQuorumEpoch(_) => RequestKind::BeginQuorumEpoch,
        RequestPayload::EndQuorumEpoch(_) => RequestKind::EndQuorumEpoch,
        RequestPayload::FetchQuorumRecords(_) => RequestKind::FetchQuorumRecords,
        RequestPayload::FindQuorum(_) => RequestKind::FindQuorum,
    }
}

fn synthesize_response(kind: RequestKind, error_code: ErrorCode) -> ResponsePayload {
    match kind {
        RequestKind::Vote => ResponsePayload::Vote(crate::protocol::VoteResponse {
            error_code,
            leader_epoch: 0,
            leader_id: -1,
            vote_granted: false,
        }),
        RequestKind::BeginQuorumEpoch => {
            ResponsePayload::BeginQuorumEpoch(crate::protocol::BeginQuorumEpochResponse {
                error_code,
                leader_epoch: 0,
                leader_id: -1,
            })
        }
        RequestKind::EndQuorumEpoch => {
            ResponsePayload::EndQuorumEpoch(crate::protocol::EndQuorumEpochResponse {
                error_code,
                leader_epoch: 0,
                leader_id: -1,
            })
        }
        RequestKind::FetchQuorumRecords => {
            ResponsePayload::FetchQuorumRecords(crate::protocol::FetchQuorumRecordsResponse::error(
                error_code,
            ))
        }
        RequestKind::FindQuorum => ResponsePayload::FindQuorum(crate::protocol::FindQuorumResponse {
            error_code,
            leader_epoch: 0,
            leader_id: -1,
            voters: Vec::new(),
        }),
    }
}

/// A request held at the head of the outbound queue because its destination isn't ready yet
/// (connection not yet ready: retry on next receive).
struct QueuedRequest {
    correlation_id: CorrelationId,
    to: NodeId,
    payload: RequestPayload,
}

pub struct NetworkChannel<T: Transport> {
    transport: T,
    next_correlation_id: CorrelationId,
    pending: HashMap<CorrelationId, PendingRequest>,
    outbound_queue: VecDeque<QueuedRequest>,
    synthesized: VecDeque<InboundResponse>,
    request_timeout: Duration,
    retry_backoff: Duration,
    max_queue_len: usize,
}

impl<T: Transport> NetworkChannel<T> {
    pub fn new(transport: T, request_timeout: Duration, retry_backoff: Duration, voters: usize) -> Self {
        NetworkChannel {
            transport,
            next_correlation_id: 1,
            pending: HashMap::new(),
            outbound_queue: VecDeque::new(),
            synthesized: VecDeque::new(),
            request_timeout,
            retry_backoff,
            // Open question: size the bounded queue off the actual voter set instead of the
            // a fixed constant, and keep overflow fatal rather than silently
            // changing the policy.
            max_queue_len: (voters * 4).max(16),
        }
    }

    pub fn new_correlation_id(&mut self) -> CorrelationId {
        let id = self.next_correlation_id;
        self.next_correlation_id += 1;
        id
    }

    pub fn update_endpoint(&self, node: NodeId, address: String) {
        self.transport.update_endpoint(node, address);
    }

    /// Unblocks a concurrent `receive`/`poll_inbound` from another thread, e.g. so an embedder
    /// can interrupt a node that is blocked waiting on the transport to deliver a shutdown.
    pub fn wakeup(&self) {
        self.transport.wakeup();
    }

    /// Enqueues an outbound request, tracking it for correlation/timeout purposes.
    pub fn send_request(&mut self, now: Instant, to: NodeId, payload: RequestPayload) -> Result<CorrelationId> {
        if self.outbound_queue.len() >= self.max_queue_len {
            return Err(ErrorKind::QueueOverflow("pending outbound").into());
        }
        let correlation_id = self.new_correlation_id();
        self.pending.insert(
            correlation_id,
            PendingRequest {
                to,
                payload_kind: request_kind(&payload),
                deadline: now + self.request_timeout,
            },
        );
        self.outbound_queue.push_back(QueuedRequest {
            correlation_id,
            to,
            payload,
        });
        Ok(correlation_id)
    }

    /// Sends a response to a request we received inbound. Responses are not correlation-
    /// tracked (they have no reply of their own).
    pub fn send_response(&self, correlation_id: CorrelationId, to: NodeId, payload: ResponsePayload) {
        self.transport.send_response(OutboundResponse {
            correlation_id,
            to,
            payload,
        });
    }

    /// True while at least one outbound request is waiting on a not-yet-ready connection.
    fn has_queue_waiting_on_connection(&self) -> bool {
        self.outbound_queue
            .iter()
            .any(|q| self.transport.connection_state(q.to) == ConnectionState::NotReady)
    }

    /// Derives the poll timeout: synthesized responses pending -> 0; outbound
    /// requests waiting on a connection -> `retry_backoff`; else the caller's timeout.
    pub fn derive_poll_timeout(&self, caller_timeout: Duration) -> Duration {
        if !self.synthesized.is_empty() {
            Duration::from_millis(0)
        } else if self.has_queue_waiting_on_connection() {
            self.retry_backoff
        } else {
            caller_timeout
        }
    }

    /// Flushes the outbound queue against the transport, blocks on the transport for up to
    /// `caller_timeout` (the caller is expected to have derived this via `derive_poll_timeout`),
    /// then drains whatever arrived plus any synthesized responses. Returns the mixed batch.
    pub fn receive(&mut self, now: Instant, caller_timeout: Duration) -> Vec<RaftMessage> {
        self.flush_outbound();

        let (inbound_requests, inbound_responses) = self.transport.poll_inbound(caller_timeout);

        let mut out = Vec::new();

        for req in inbound_requests {
            out.push(RaftMessage::InboundRequest(req));
        }

        for resp in inbound_responses {
            if self.pending.remove(&resp.correlation_id).is_some() {
                out.push(RaftMessage::InboundResponse(resp));
            } else {
                debug!(
                    "dropping response with unknown correlation id {}",
                    resp.correlation_id
                );
            }
        }

        self.expire_timed_out_requests(now);

        while let Some(resp) = self.synthesized.pop_front() {
            out.push(RaftMessage::InboundResponse(resp));
        }

        out
    }

    fn flush_outbound(&mut self) {
        let mut still_queued = VecDeque::new();
        while let Some(q) = self.outbound_queue.pop_front() {
            match self.transport.connection_state(q.to) {
                ConnectionState::Unknown | ConnectionState::Failed => {
                    warn!("destination {} unroutable, synthesizing BROKER_NOT_AVAILABLE", q.to);
                    self.synthesize(q.correlation_id, q.to, ErrorCode::BrokerNotAvailable);
                }
                ConnectionState::NotReady => {
                    // Leave at the head of the queue for the next receive.
                    still_queued.push_back(q);
                }
                ConnectionState::Ready => {
                    self.transport.send_request(OutboundRequest {
                        correlation_id: q.correlation_id,
                        to: q.to,
                        payload: q.payload,
                    });
                }
            }
        }
        self.outbound_queue = still_queued;
    }

    fn expire_timed_out_requests(&mut self, now: Instant) {
        let expired: Vec<CorrelationId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for correlation_id in expired {
            if let Some(pending) = self.pending.remove(&correlation_id) {
                debug!(
                    "request {} to {} ({:?}) timed out",
                    correlation_id, pending.to, pending.payload_kind
                );
                self.synthesized.push_back(InboundResponse {
                    correlation_id,
                    from: pending.to,
                    payload: synthesize_response(pending.payload_kind, ErrorCode::BrokerNotAvailable),
                });
            }
        }
    }

    /// Synthesizes an auth-failure response for an outstanding request ("synthesizes
    /// `CLUSTER_AUTHORIZATION_FAILED` for auth errors"). Exposed for embedders whose transport
    /// can detect authorization failures out of band.
    pub fn synthesize_auth_failure(&mut self, correlation_id: CorrelationId) {
        if let Some(pending) = self.pending.remove(&correlation_id) {
            self.synthesized.push_back(InboundResponse {
                correlation_id,
                from: pending.to,
                payload: synthesize_response(pending.payload_kind, ErrorCode::ClusterAuthorizationFailed),
            });
        }
    }

    fn synthesize(&mut self, correlation_id: CorrelationId, to: NodeId, error_code: ErrorCode) {
        if let Some(pending) = self.pending.remove(&correlation_id) {
            self.synthesized.push_back(InboundResponse {
                correlation_id,
                from: to,
                payload: synthesize_response(pending.payload_kind, error_code),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FindQuorumRequest;
    use crate::transport::LoopbackTransport;

    #[test]
    fn unknown_destination_synthesizes_broker_not_available() {
        let net = LoopbackTransport::network(&[0]);
        let transport = net[&0].clone();
        let mut channel = NetworkChannel::new(transport, Duration::from_millis(100), Duration::from_millis(10), 1);

        let now = Instant::now();
        channel
            .send_request(now, 99, RequestPayload::FindQuorum(FindQuorumRequest { replica_id: 0 }))
            .unwrap();

        let msgs = channel.receive(now, Duration::from_millis(50));
        assert_eq!(msgs.len(), 1);
        match &msgs[0] {
            RaftMessage::InboundResponse(resp) => match &resp.payload {
                ResponsePayload::FindQuorum(r) => assert_eq!(r.error_code, ErrorCode::BrokerNotAvailable),
                _ => panic!("wrong payload"),
            },
            _ => panic!("wrong message kind"),
        }
    }

    #[test]
    fn request_timeout_synthesizes_response() {
        let net = LoopbackTransport::network(&[0, 1]);
        let transport = net[&0].clone();
        let mut channel = NetworkChannel::new(transport, Duration::from_millis(10), Duration::from_millis(5), 2);

        let t0 = Instant::now();
        channel
            .send_request(t0, 1, RequestPayload::FindQuorum(FindQuorumRequest { replica_id: 0 }))
            .unwrap();
        // Request was delivered (connection ready), so the first receive returns nothing yet.
        let msgs = channel.receive(t0, Duration::from_millis(5));
        assert!(msgs.is_empty());

        let later = t0 + Duration::from_millis(20);
        let msgs = channel.receive(later, Duration::from_millis(5));
        assert_eq!(msgs.len(), 1);
    }

    #[test]
    fn poll_timeout_derivation_prefers_zero_when_synthesized_pending() {
        let net = LoopbackTransport::network(&[0]);
        let transport = net[&0].clone();
        let mut channel = NetworkChannel::new(transport, Duration::from_millis(100), Duration::from_millis(10), 1);
        let now = Instant::now();
        channel
            .send_request(now, 99, RequestPayload::FindQuorum(FindQuorumRequest { replica_id: 0 }))
            .unwrap();
        channel.flush_outbound();
        assert_eq!(channel.derive_poll_timeout(Duration::from_secs(5)), Duration::from_millis(0));
    }
}
