//! `ConsensusCore`: the central per-node state machine driving one `poll` quantum at a
//! time.
//!
//! Shaped like `ConsensusModule::cycle` in classic single-thread Raft cores — the single
//! function that reads the clock, drives election/heartbeat timers, and dispatches inbound
//! `Message`s against `ServerState` — restructured around fetch-driven replication instead of
//! a push-model `append_entries`, and around an explicit `poll(timeout)` entry point
//! instead of a `Tick` side-effect struct (this core commits its writes directly via
//! `QuorumState`/`PersistentElectionStore` rather than handing a `Tick` back to a caller).

use std::collections::{HashMap, HashSet};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use futures::channel::oneshot;
use log::{info, warn};
use rand::Rng;

use crate::discovery::LeaderDiscovery;
use crate::election_store::PersistentElectionStore;
use crate::errors::Result;
use crate::log::{LeaderChangePayload, LogBatch, RecordPayload, ReplicatedLog};
use crate::network::NetworkChannel;
use crate::protocol::{
    BeginQuorumEpochRequest, BeginQuorumEpochResponse, CorrelationId, EndQuorumEpochRequest,
    EndQuorumEpochResponse, Epoch, ErrorCode, FetchQuorumRecordsRequest, FetchQuorumRecordsResponse,
    FindQuorumRequest, FindQuorumResponse, InboundRequest, InboundResponse, NodeId, Offset,
    RaftMessage, RequestPayload, ResponsePayload, VoteRequest, VoteResponse,
};
use crate::quorum_state::{QuorumState, Role};
use crate::transport::Transport;

/// Why an `append` was refused. The only case today: we were not the leader at the moment the
/// mailbox was drained.
#[derive(Debug, Clone)]
pub enum AppendError {
    NotLeaderForPartition {
        leader_epoch: Epoch,
        leader_id: Option<NodeId>,
    },
}

pub type AppendOutcome = std::result::Result<(Offset, Epoch), AppendError>;

struct AppendRequest {
    records: Vec<Vec<u8>>,
    completion: oneshot::Sender<AppendOutcome>,
}

/// The caller-side handle for `append()`, backed by a bounded SPSC mailbox. Cloning is intentionally
/// not derived: the mailbox is meant to be owned by exactly one external producer thread, with
/// the consensus core as the sole consumer.
pub struct AppendHandle {
    sender: mpsc::SyncSender<AppendRequest>,
}

impl AppendHandle {
    /// Enqueues `records` to be appended once the core next drains its mailbox. Resolves once
    /// the core has actually appended them (or rejected the append), not once they've been
    /// committed — callers that need commit semantics must fetch the high watermark separately.
    /// Blocks the calling thread if the mailbox is full, applying the backpressure called
    /// for instead of silently dropping or growing without bound.
    pub fn append(&self, records: Vec<Vec<u8>>) -> oneshot::Receiver<AppendOutcome> {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(AppendRequest {
                records,
                completion: tx,
            })
            .is_err()
        {
            // The core is gone; the receiver will observe `Canceled` when polled.
        }
        rx
    }
}

/// Boot-time parameters a `ConsensusCore` needs beyond what lives in `RaftConfig` (kept separate
/// so the core doesn't need to know about TOML parsing or file paths).
pub struct ConsensusParams {
    pub node_id: NodeId,
    pub voters: HashSet<NodeId>,
    pub election_timeout_ms: u64,
    pub election_jitter_ms: u64,
    pub request_timeout_ms: u64,
    pub retry_backoff_ms: u64,
    pub mailbox_capacity: usize,
}

pub struct ConsensusCore<T: Transport> {
    node_id: NodeId,
    election_timeout_ms: u64,
    election_jitter_ms: u64,
    request_timeout_ms: u64,
    retry_backoff_ms: u64,

    log: ReplicatedLog,
    quorum: QuorumState,
    channel: NetworkChannel<T>,
    discovery: LeaderDiscovery,

    /// Voters we've already sent a `VoteRequest` to during the current candidacy (one
    /// request per candidacy, never resent until the whole election times out and restarts).
    vote_requested: HashSet<NodeId>,
    /// Voters known to have endorsed our current leadership (they've sent us at least one
    /// `FetchQuorumRecords` at our epoch), so we stop resending `BeginQuorumEpoch` to them.
    endorsed: HashSet<NodeId>,
    /// Last time we sent `BeginQuorumEpoch` to a given voter, so we only resend after a full
    /// request timeout has elapsed without an endorsement.
    begin_epoch_last_sent: HashMap<NodeId, Instant>,
    /// The one outstanding `FetchQuorumRecords` we've sent as a follower/observer, if any.
    fetch_inflight: Option<(CorrelationId, NodeId)>,
    /// Highest offset we know each voter (other than ourselves) has durably replicated.
    match_offsets: HashMap<NodeId, Offset>,
    high_watermark: Option<Offset>,

    running: bool,
    shutdown_deadline: Option<Instant>,

    append_rx: mpsc::Receiver<AppendRequest>,
}

impl<T: Transport> ConsensusCore<T> {
    pub fn new(
        params: ConsensusParams,
        transport: T,
        store: PersistentElectionStore,
        now: Instant,
    ) -> Result<(Self, AppendHandle)> {
        let election_timeout = Duration::from_millis(params.election_timeout_ms);
        let quorum = QuorumState::load(params.node_id, params.voters.clone(), store, now, election_timeout)?;
        let request_timeout = Duration::from_millis(params.request_timeout_ms);
        let retry_backoff = Duration::from_millis(params.retry_backoff_ms);
        let channel = NetworkChannel::new(transport, request_timeout, retry_backoff, params.voters.len().max(1));

        let discovery_targets: Vec<NodeId> = params
            .voters
            .iter()
            .cloned()
            .filter(|&v| v != params.node_id)
            .collect();
        let discovery = LeaderDiscovery::new(discovery_targets, now);

        let (tx, rx) = mpsc::sync_channel(params.mailbox_capacity.max(1));

        let core = ConsensusCore {
            node_id: params.node_id,
            election_timeout_ms: params.election_timeout_ms,
            election_jitter_ms: params.election_jitter_ms,
            request_timeout_ms: params.request_timeout_ms,
            retry_backoff_ms: params.retry_backoff_ms,
            log: ReplicatedLog::new(),
            quorum,
            channel,
            discovery,
            vote_requested: HashSet::new(),
            endorsed: HashSet::new(),
            begin_epoch_last_sent: HashMap::new(),
            fetch_inflight: None,
            match_offsets: HashMap::new(),
            high_watermark: None,
            running: true,
            shutdown_deadline: None,
            append_rx: rx,
        };
        Ok((core, AppendHandle { sender: tx }))
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Interrupts a concurrent blocking `poll`, in case an embedder needs to deliver a
    /// shutdown or append from another thread without waiting out the current poll timeout.
    pub fn wakeup(&self) {
        self.channel.wakeup();
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn epoch(&self) -> Epoch {
        self.quorum.epoch()
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.quorum.leader()
    }

    pub fn is_leader(&self) -> bool {
        self.quorum.is_leader()
    }

    pub fn is_candidate(&self) -> bool {
        self.quorum.is_candidate()
    }

    pub fn is_follower(&self) -> bool {
        self.quorum.is_follower()
    }

    pub fn is_observer(&self) -> bool {
        self.quorum.is_observer()
    }

    pub fn high_watermark(&self) -> Option<Offset> {
        self.high_watermark
    }

    pub fn log_end_offset(&self) -> Offset {
        self.log.end_offset()
    }

    /// Begins a graceful handoff. A non-leader simply stops.
    /// A leader broadcasts `EndQuorumEpoch` to every other voter and keeps running until either
    /// it observes the epoch advance (a successor was elected) or `timeout` elapses, whichever
    /// comes first.
    pub fn shutdown(&mut self, now: Instant, timeout: Duration) -> Result<()> {
        if self.quorum.is_leader() {
            let epoch = self.quorum.epoch();
            let voters: Vec<NodeId> = self
                .quorum
                .voters()
                .iter()
                .cloned()
                .filter(|&v| v != self.node_id)
                .collect();
            for voter in voters {
                let payload = RequestPayload::EndQuorumEpoch(EndQuorumEpochRequest {
                    leader_epoch: epoch,
                    leader_id: self.node_id,
                    replica_id: Some(self.node_id),
                });
                self.channel.send_request(now, voter, payload)?;
            }
            self.shutdown_deadline = Some(now + timeout);
        } else {
            self.running = false;
        }
        Ok(())
    }

    /// One quantum of work. Order: drain the append mailbox, drive timer-based
    /// transitions, emit any outbound requests the current role calls for, receive and dispatch
    /// inbound traffic, then recompute the high watermark and check for shutdown completion.
    pub fn poll(&mut self, now: Instant, timeout: Duration) -> Result<()> {
        self.drain_append_mailbox(now);
        self.drive_timers(now)?;
        self.emit_outbound_requests(now)?;

        let bounded_timeout = self.channel.derive_poll_timeout(timeout);
        let messages = self.channel.receive(now, bounded_timeout);
        for message in messages {
            self.dispatch(now, message)?;
        }

        self.maybe_advance_high_watermark();
        self.maybe_finish_shutdown(now);
        Ok(())
    }

    fn maybe_finish_shutdown(&mut self, now: Instant) {
        if let Some(deadline) = self.shutdown_deadline {
            if !self.quorum.is_leader() || now >= deadline {
                self.running = false;
                self.shutdown_deadline = None;
            }
        }
    }

    fn drain_append_mailbox(&mut self, now: Instant) {
        while let Ok(request) = self.append_rx.try_recv() {
            let outcome = self.try_append(now, request.records);
            let _ = request.completion.send(outcome);
        }
    }

    fn try_append(&mut self, _now: Instant, records: Vec<Vec<u8>>) -> AppendOutcome {
        if !self.quorum.is_leader() {
            return Err(AppendError::NotLeaderForPartition {
                leader_epoch: self.quorum.epoch(),
                leader_id: self.quorum.leader(),
            });
        }
        let epoch = self.quorum.epoch();
        let payloads = records.into_iter().map(RecordPayload::Data).collect();
        let base = self.log.append_as_leader(payloads, epoch);
        Ok((base, epoch))
    }

    fn election_timeout(&self) -> Duration {
        let jitter = if self.election_jitter_ms > 0 {
            rand::thread_rng().gen_range(0, self.election_jitter_ms)
        } else {
            0
        };
        Duration::from_millis(self.election_timeout_ms + jitter)
    }

    fn drive_timers(&mut self, now: Instant) -> Result<()> {
        let expired = match self.quorum.role() {
            Role::Unattached(s) => now >= s.election_deadline,
            Role::Candidate(s) => now >= s.election_deadline,
            Role::Follower(s) => now >= s.election_deadline,
            Role::Leader(_) | Role::Observer(_) => false,
        };
        if expired {
            self.transition_to_candidate(now)?;
        }
        Ok(())
    }

    fn transition_to_candidate(&mut self, now: Instant) -> Result<()> {
        let timeout = self.election_timeout();
        self.quorum.become_candidate(now, timeout)?;
        self.vote_requested.clear();
        self.fetch_inflight = None;
        info!(
            "node {} starting election at epoch {}",
            self.node_id,
            self.quorum.epoch()
        );
        // A single-voter cluster (or any candidacy that already carries a majority without a
        // single `VoteResponse`, e.g. one voter total) wins immediately.
        self.maybe_become_leader(now)?;
        Ok(())
    }

    fn maybe_become_leader(&mut self, now: Instant) -> Result<()> {
        let granted = match self.quorum.role() {
            Role::Candidate(s) => s.votes_granted.len(),
            _ => return Ok(()),
        };
        if granted < self.quorum.majority() {
            return Ok(());
        }
        self.quorum.become_leader()?;
        let epoch = self.quorum.epoch();
        let voters: Vec<NodeId> = self.quorum.voters().iter().cloned().collect();
        let control = RecordPayload::Control(LeaderChangePayload {
            version: 1,
            leader_id: self.node_id,
            voters,
        });
        self.log.append_as_leader(vec![control], epoch);

        self.endorsed.clear();
        self.begin_epoch_last_sent.clear();
        self.match_offsets.clear();
        self.fetch_inflight = None;
        self.high_watermark = None;
        let _ = now;
        info!("node {} completed leader bootstrap at epoch {}", self.node_id, epoch);
        Ok(())
    }

    /// Any inbound message (request or response) carrying a strictly higher epoch demotes us to
    /// `Unattached` at that epoch before we classify the message further.
    fn observe_epoch(&mut self, now: Instant, peer_epoch: Epoch) -> Result<()> {
        if peer_epoch > self.quorum.epoch() {
            let timeout = self.election_timeout();
            self.quorum.become_unattached(peer_epoch, now, timeout)?;
            self.vote_requested.clear();
            self.fetch_inflight = None;
            self.endorsed.clear();
            self.begin_epoch_last_sent.clear();
            self.match_offsets.clear();
            self.high_watermark = None;
        }
        Ok(())
    }

    // ---- outbound ----------------------------------------------------------------------

    fn emit_outbound_requests(&mut self, now: Instant) -> Result<()> {
        if self.quorum.leader().is_none() && self.discovery.should_attempt(now) {
            return self.emit_find_quorum_request(now);
        }
        match self.quorum.role() {
            Role::Candidate(_) => self.emit_vote_requests(now),
            Role::Leader(_) => self.emit_begin_quorum_epoch_requests(now),
            Role::Follower(_) => self.emit_fetch_request(now),
            Role::Observer(s) => {
                if s.leader_id.is_some() {
                    self.emit_fetch_request(now)
                } else {
                    Ok(())
                }
            }
            Role::Unattached(_) => Ok(()),
        }
    }

    fn emit_vote_requests(&mut self, now: Instant) -> Result<()> {
        let epoch = self.quorum.epoch();
        let last_epoch = self.log.last_fetched_epoch();
        let last_offset = self.log.end_offset();
        let voters: Vec<NodeId> = self
            .quorum
            .voters()
            .iter()
            .cloned()
            .filter(|&v| v != self.node_id)
            .collect();
        for voter in voters {
            if self.vote_requested.contains(&voter) {
                continue;
            }
            let payload = RequestPayload::Vote(VoteRequest {
                candidate_epoch: epoch,
                candidate_id: self.node_id,
                last_epoch,
                last_epoch_end_offset: last_offset,
            });
            self.channel.send_request(now, voter, payload)?;
            self.vote_requested.insert(voter);
        }
        Ok(())
    }

    fn emit_begin_quorum_epoch_requests(&mut self, now: Instant) -> Result<()> {
        let epoch = self.quorum.epoch();
        let request_timeout = Duration::from_millis(self.request_timeout_ms);
        let voters: Vec<NodeId> = self
            .quorum
            .voters()
            .iter()
            .cloned()
            .filter(|&v| v != self.node_id)
            .collect();
        for voter in voters {
            if self.endorsed.contains(&voter) {
                continue;
            }
            let due = self
                .begin_epoch_last_sent
                .get(&voter)
                .map(|t| now >= *t + request_timeout)
                .unwrap_or(true);
            if !due {
                continue;
            }
            let payload = RequestPayload::BeginQuorumEpoch(BeginQuorumEpochRequest {
                leader_epoch: epoch,
                leader_id: self.node_id,
                replica_id: Some(self.node_id),
            });
            self.channel.send_request(now, voter, payload)?;
            self.begin_epoch_last_sent.insert(voter, now);
        }
        Ok(())
    }

    fn emit_fetch_request(&mut self, now: Instant) -> Result<()> {
        if self.fetch_inflight.is_some() {
            return Ok(());
        }
        let leader_id = match self.quorum.role() {
            Role::Follower(s) => s.leader_id,
            Role::Observer(s) => match s.leader_id {
                Some(l) => l,
                None => return Ok(()),
            },
            _ => return Ok(()),
        };
        let payload = RequestPayload::FetchQuorumRecords(FetchQuorumRecordsRequest {
            leader_epoch: self.quorum.epoch(),
            fetch_offset: self.log.end_offset(),
            last_fetched_epoch: self.log.last_fetched_epoch(),
            replica_id: self.node_id,
        });
        let correlation_id = self.channel.send_request(now, leader_id, payload)?;
        self.fetch_inflight = Some((correlation_id, leader_id));
        Ok(())
    }

    fn emit_find_quorum_request(&mut self, now: Instant) -> Result<()> {
        if !self.discovery.has_targets() {
            return Ok(());
        }
        let target = self.discovery.next_target();
        let payload = RequestPayload::FindQuorum(FindQuorumRequest {
            replica_id: self.node_id,
        });
        let correlation_id = self.channel.send_request(now, target, payload)?;
        self.discovery.mark_outstanding(correlation_id);
        Ok(())
    }

    // ---- inbound ------------------------------------------------------------------------

    fn dispatch(&mut self, now: Instant, message: RaftMessage) -> Result<()> {
        match message {
            RaftMessage::InboundRequest(req) => self.dispatch_request(now, req),
            RaftMessage::InboundResponse(resp) => self.dispatch_response(now, resp),
            RaftMessage::OutboundRequest(_) | RaftMessage::OutboundResponse(_) => Ok(()),
        }
    }

    fn dispatch_request(&mut self, now: Instant, req: InboundRequest) -> Result<()> {
        let InboundRequest {
            correlation_id,
            from,
            payload,
        } = req;
        match payload {
            RequestPayload::Vote(r) => self.handle_vote_request(now, correlation_id, from, r),
            RequestPayload::BeginQuorumEpoch(r) => {
                self.handle_begin_quorum_epoch_request(now, correlation_id, from, r)
            }
            RequestPayload::EndQuorumEpoch(r) => {
                self.handle_end_quorum_epoch_request(now, correlation_id, from, r)
            }
            RequestPayload::FetchQuorumRecords(r) => {
                self.handle_fetch_request(now, correlation_id, from, r)
            }
            RequestPayload::FindQuorum(r) => self.handle_find_quorum_request(correlation_id, from, r),
        }
    }

    fn dispatch_response(&mut self, now: Instant, resp: InboundResponse) -> Result<()> {
        let InboundResponse {
            correlation_id,
            from,
            payload,
        } = resp;
        match payload {
            ResponsePayload::Vote(r) => self.handle_vote_response(now, from, r),
            ResponsePayload::BeginQuorumEpoch(r) => self.handle_begin_quorum_epoch_response(now, from, r),
            ResponsePayload::EndQuorumEpoch(r) => self.handle_end_quorum_epoch_response(now, r),
            ResponsePayload::FetchQuorumRecords(r) => {
                self.handle_fetch_response(now, correlation_id, from, r)
            }
            ResponsePayload::FindQuorum(r) => {
                self.handle_find_quorum_response(now, correlation_id, from, r)
            }
        }
    }

    fn handle_vote_request(
        &mut self,
        now: Instant,
        correlation_id: CorrelationId,
        from: NodeId,
        req: VoteRequest,
    ) -> Result<()> {
        self.observe_epoch(now, req.candidate_epoch)?;

        if req.candidate_epoch < self.quorum.epoch() {
            self.respond_vote(correlation_id, from, ErrorCode::FencedLeaderEpoch, false);
            return Ok(());
        }

        let our_last_epoch = self.log.last_fetched_epoch();
        let our_last_offset = self.log.end_offset();
        let candidate_log_is_current =
            (req.last_epoch, req.last_epoch_end_offset) >= (our_last_epoch, our_last_offset);

        let already_voted_for_someone_else = self
            .quorum
            .voted_for()
            .map(|v| v != req.candidate_id)
            .unwrap_or(false);

        let grant = self.quorum.voters().contains(&self.node_id)
            && candidate_log_is_current
            && !already_voted_for_someone_else;

        if grant {
            self.quorum.record_vote(self.quorum.epoch(), req.candidate_id)?;
            let timeout = self.election_timeout();
            self.quorum.reset_election_deadline(now, timeout);
        }

        let payload = ResponsePayload::Vote(VoteResponse {
            error_code: ErrorCode::None,
            leader_epoch: self.quorum.epoch(),
            leader_id: self.quorum.leader().unwrap_or(-1),
            vote_granted: grant,
        });
        self.channel.send_response(correlation_id, from, payload);
        Ok(())
    }

    fn respond_vote(&mut self, correlation_id: CorrelationId, to: NodeId, error_code: ErrorCode, granted: bool) {
        let payload = ResponsePayload::Vote(VoteResponse {
            error_code,
            leader_epoch: self.quorum.epoch(),
            leader_id: self.quorum.leader().unwrap_or(-1),
            vote_granted: granted,
        });
        self.channel.send_response(correlation_id, to, payload);
    }

    fn handle_vote_response(&mut self, now: Instant, from: NodeId, resp: VoteResponse) -> Result<()> {
        self.observe_epoch(now, resp.leader_epoch)?;
        if !self.quorum.is_candidate() || resp.leader_epoch != self.quorum.epoch() {
            return Ok(());
        }
        let granted = resp.error_code == ErrorCode::None && resp.vote_granted;
        if let Role::Candidate(state) = self.quorum.role_mut() {
            if granted {
                state.votes_granted.insert(from);
            } else {
                state.votes_rejected.insert(from);
            }
        }
        self.maybe_become_leader(now)?;
        Ok(())
    }

    fn handle_begin_quorum_epoch_request(
        &mut self,
        now: Instant,
        correlation_id: CorrelationId,
        from: NodeId,
        req: BeginQuorumEpochRequest,
    ) -> Result<()> {
        self.observe_epoch(now, req.leader_epoch)?;

        if req.leader_epoch < self.quorum.epoch() {
            let payload = ResponsePayload::BeginQuorumEpoch(BeginQuorumEpochResponse {
                error_code: ErrorCode::FencedLeaderEpoch,
                leader_epoch: self.quorum.epoch(),
                leader_id: self.quorum.leader().unwrap_or(-1),
            });
            self.channel.send_response(correlation_id, from, payload);
            return Ok(());
        }

        let timeout = self.election_timeout();
        self.quorum.become_follower(req.leader_epoch, req.leader_id, now, timeout)?;
        self.vote_requested.clear();

        let payload = ResponsePayload::BeginQuorumEpoch(BeginQuorumEpochResponse {
            error_code: ErrorCode::None,
            leader_epoch: self.quorum.epoch(),
            leader_id: req.leader_id,
        });
        self.channel.send_response(correlation_id, from, payload);
        Ok(())
    }

    fn handle_begin_quorum_epoch_response(
        &mut self,
        now: Instant,
        _from: NodeId,
        resp: BeginQuorumEpochResponse,
    ) -> Result<()> {
        self.observe_epoch(now, resp.leader_epoch)
    }

    fn handle_end_quorum_epoch_request(
        &mut self,
        now: Instant,
        correlation_id: CorrelationId,
        from: NodeId,
        req: EndQuorumEpochRequest,
    ) -> Result<()> {
        self.observe_epoch(now, req.leader_epoch)?;

        if req.leader_epoch < self.quorum.epoch() {
            let payload = ResponsePayload::EndQuorumEpoch(EndQuorumEpochResponse {
                error_code: ErrorCode::FencedLeaderEpoch,
                leader_epoch: self.quorum.epoch(),
                leader_id: self.quorum.leader().unwrap_or(-1),
            });
            self.channel.send_response(correlation_id, from, payload);
            return Ok(());
        }

        if self.quorum.leader() == Some(req.leader_id) {
            let timeout = self.election_timeout();
            self.quorum.become_unattached(req.leader_epoch, now, timeout)?;
            self.fetch_inflight = None;
        }

        let payload = ResponsePayload::EndQuorumEpoch(EndQuorumEpochResponse {
            error_code: ErrorCode::None,
            leader_epoch: self.quorum.epoch(),
            leader_id: self.quorum.leader().unwrap_or(-1),
        });
        self.channel.send_response(correlation_id, from, payload);
        Ok(())
    }

    fn handle_end_quorum_epoch_response(&mut self, now: Instant, resp: EndQuorumEpochResponse) -> Result<()> {
        self.observe_epoch(now, resp.leader_epoch)
    }

    fn handle_fetch_request(
        &mut self,
        now: Instant,
        correlation_id: CorrelationId,
        from: NodeId,
        req: FetchQuorumRecordsRequest,
    ) -> Result<()> {
        self.observe_epoch(now, req.leader_epoch)?;

        if req.leader_epoch < self.quorum.epoch() {
            let mut payload = FetchQuorumRecordsResponse::error(ErrorCode::FencedLeaderEpoch);
            payload.leader_epoch = self.quorum.epoch();
            payload.leader_id = self.quorum.leader().unwrap_or(-1);
            self.channel
                .send_response(correlation_id, from, ResponsePayload::FetchQuorumRecords(payload));
            return Ok(());
        }

        if !self.quorum.is_leader() {
            let mut payload = FetchQuorumRecordsResponse::error(ErrorCode::NotLeaderForPartition);
            payload.leader_epoch = self.quorum.epoch();
            payload.leader_id = self.quorum.leader().unwrap_or(-1);
            self.channel
                .send_response(correlation_id, from, ResponsePayload::FetchQuorumRecords(payload));
            return Ok(());
        }

        self.endorsed.insert(from);
        self.begin_epoch_last_sent.remove(&from);
        let previous = self.match_offsets.get(&from).cloned().unwrap_or(0);
        self.match_offsets.insert(from, previous.max(req.fetch_offset));

        if let Err((next_offset, next_epoch)) = self.log.matches_anchor(req.fetch_offset, req.last_fetched_epoch) {
            let mut payload = FetchQuorumRecordsResponse::error(ErrorCode::OffsetOutOfRange);
            payload.leader_epoch = self.quorum.epoch();
            payload.leader_id = self.node_id;
            payload.next_fetch_offset = Some(next_offset);
            payload.next_fetch_offset_epoch = Some(next_epoch);
            self.channel
                .send_response(correlation_id, from, ResponsePayload::FetchQuorumRecords(payload));
            return Ok(());
        }

        let batches: Vec<LogBatch> = self.log.read(req.fetch_offset, None);
        let payload = FetchQuorumRecordsResponse {
            error_code: ErrorCode::None,
            leader_epoch: self.quorum.epoch(),
            leader_id: self.node_id,
            high_watermark: self.high_watermark.map(|hwm| hwm as i64).unwrap_or(-1),
            records: batches,
            next_fetch_offset: None,
            next_fetch_offset_epoch: None,
        };
        self.channel
            .send_response(correlation_id, from, ResponsePayload::FetchQuorumRecords(payload));
        Ok(())
    }

    fn handle_fetch_response(
        &mut self,
        now: Instant,
        correlation_id: CorrelationId,
        from: NodeId,
        resp: FetchQuorumRecordsResponse,
    ) -> Result<()> {
        let was_our_inflight = self.fetch_inflight.map(|(cid, _)| cid) == Some(correlation_id);
        if was_our_inflight {
            self.fetch_inflight = None;
        } else {
            return Ok(());
        }

        self.observe_epoch(now, resp.leader_epoch)?;

        let still_fetching_from_this_leader = match self.quorum.role() {
            Role::Follower(s) => s.leader_id == from,
            Role::Observer(s) => s.leader_id == Some(from),
            _ => false,
        };
        if !still_fetching_from_this_leader {
            return Ok(());
        }

        match resp.error_code {
            ErrorCode::None => {
                for batch in resp.records {
                    self.log.append_as_follower(batch)?;
                }
                if resp.high_watermark >= 0 {
                    let hwm = resp.high_watermark as Offset;
                    if self.high_watermark.map_or(true, |cur| hwm > cur) {
                        self.high_watermark = Some(hwm);
                    }
                }
                let timeout = self.election_timeout();
                self.quorum.reset_election_deadline(now, timeout);
            }
            ErrorCode::OffsetOutOfRange => {
                if let Some(next) = resp.next_fetch_offset {
                    self.log.truncate_to(next);
                }
            }
            ErrorCode::BrokerNotAvailable | ErrorCode::ClusterAuthorizationFailed => {
                warn!(
                    "node {} lost its leader {} ({:?}); dropping to unattached",
                    self.node_id, from, resp.error_code
                );
                let timeout = self.election_timeout();
                let epoch = self.quorum.epoch();
                self.quorum.become_unattached(epoch, now, timeout)?;
            }
            ErrorCode::NotLeaderForPartition => {
                if resp.leader_id >= 0 {
                    let timeout = self.election_timeout();
                    self.quorum
                        .become_follower(resp.leader_epoch, resp.leader_id, now, timeout)?;
                }
            }
            ErrorCode::FencedLeaderEpoch | ErrorCode::UnknownServerError => {}
        }
        Ok(())
    }

    fn handle_find_quorum_request(
        &mut self,
        correlation_id: CorrelationId,
        from: NodeId,
        _req: FindQuorumRequest,
    ) -> Result<()> {
        let payload = ResponsePayload::FindQuorum(FindQuorumResponse {
            error_code: ErrorCode::None,
            leader_epoch: self.quorum.epoch(),
            leader_id: self.quorum.leader().unwrap_or(-1),
            voters: Vec::new(),
        });
        self.channel.send_response(correlation_id, from, payload);
        Ok(())
    }

    fn handle_find_quorum_response(
        &mut self,
        now: Instant,
        correlation_id: CorrelationId,
        _from: NodeId,
        resp: FindQuorumResponse,
    ) -> Result<()> {
        if !self.discovery.is_outstanding(correlation_id) {
            return Ok(());
        }
        self.discovery
            .record_attempt_finished(now, Duration::from_millis(self.retry_backoff_ms));

        self.observe_epoch(now, resp.leader_epoch)?;

        if resp.error_code != ErrorCode::None {
            return Ok(());
        }
        if resp.leader_id >= 0 {
            let timeout = self.election_timeout();
            self.quorum
                .become_follower(resp.leader_epoch, resp.leader_id, now, timeout)?;
        }
        Ok(())
    }

    fn maybe_advance_high_watermark(&mut self) {
        if !self.quorum.is_leader() {
            return;
        }
        let epoch = self.quorum.epoch();
        let majority = self.quorum.majority();
        let mut offsets: Vec<Offset> = self
            .quorum
            .voters()
            .iter()
            .map(|&v| {
                if v == self.node_id {
                    self.log.end_offset()
                } else {
                    self.match_offsets.get(&v).cloned().unwrap_or(0)
                }
            })
            .collect();
        offsets.sort_unstable();
        if offsets.len() < majority {
            return;
        }
        let candidate = offsets[offsets.len() - majority];
        if candidate == 0 {
            return;
        }
        // Raft safety: only commit by counting replicas once the committed offset actually falls
        // within the leader's own epoch (a candidate cannot commit entries from a prior epoch
        // merely because a majority happens to already hold them).
        if self.log.epoch_at(candidate - 1) != Some(epoch) {
            return;
        }
        if self.high_watermark.map_or(true, |hwm| candidate > hwm) {
            self.high_watermark = Some(candidate);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ErrorCode, FetchQuorumRecordsResponse};
    use crate::transport::LoopbackTransport;
    use tempfile::tempdir;

    fn params(node_id: NodeId, voters: &[NodeId]) -> ConsensusParams {
        ConsensusParams {
            node_id,
            voters: voters.iter().cloned().collect(),
            election_timeout_ms: 100,
            election_jitter_ms: 50,
            request_timeout_ms: 30,
            retry_backoff_ms: 10,
            mailbox_capacity: 8,
        }
    }

    fn new_core(
        node_id: NodeId,
        voters: &[NodeId],
        transport: LoopbackTransport,
        dir: &tempfile::TempDir,
        now: Instant,
    ) -> (ConsensusCore<LoopbackTransport>, AppendHandle) {
        let store = PersistentElectionStore::new(dir.path().join(format!("node-{}.json", node_id)));
        ConsensusCore::new(params(node_id, voters), transport, store, now).unwrap()
    }

    #[test]
    fn single_voter_cluster_becomes_leader_on_first_election() {
        let dir = tempdir().unwrap();
        let net = LoopbackTransport::network(&[0]);
        let now = Instant::now();
        let (mut core, _handle) = new_core(0, &[0], net[&0].clone(), &dir, now);

        // Drive past the election deadline.
        core.poll(now + Duration::from_millis(200), Duration::from_millis(10)).unwrap();
        assert!(core.is_leader());
        assert_eq!(core.leader(), Some(0));
        // The leader-change control record is appended as part of bootstrap.
        assert_eq!(core.log_end_offset(), 1);
    }

    #[test]
    fn append_before_leadership_is_rejected() {
        let dir = tempdir().unwrap();
        let net = LoopbackTransport::network(&[0, 1]);
        let now = Instant::now();
        let (mut core, _handle) = new_core(0, &[0, 1], net[&0].clone(), &dir, now);

        match core.try_append(now, vec![vec![1, 2, 3]]) {
            Err(AppendError::NotLeaderForPartition { .. }) => {}
            other => panic!("expected NotLeaderForPartition, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn stale_epoch_vote_request_is_fenced() {
        let dir = tempdir().unwrap();
        let net = LoopbackTransport::network(&[0, 1]);
        let now = Instant::now();
        let (mut core, _handle) = new_core(0, &[0, 1], net[&0].clone(), &dir, now);
        // Bump our own epoch past the incoming request's.
        core.quorum.become_candidate(now, Duration::from_millis(100)).unwrap();
        assert_eq!(core.epoch(), 1);

        core.handle_vote_request(
            now,
            1,
            1,
            VoteRequest {
                candidate_epoch: 0,
                candidate_id: 1,
                last_epoch: 0,
                last_epoch_end_offset: 0,
            },
        )
        .unwrap();

        let (reqs, resps) = net[&1].poll_inbound(Duration::from_millis(0));
        assert!(reqs.is_empty());
        assert_eq!(resps.len(), 1);
        match &resps[0].payload {
            ResponsePayload::Vote(r) => {
                assert_eq!(r.error_code, ErrorCode::FencedLeaderEpoch);
                assert!(!r.vote_granted);
            }
            _ => panic!("wrong payload"),
        }
    }

    #[test]
    fn fenced_fetch_request_carries_the_current_epoch_and_leader() {
        let dir = tempdir().unwrap();
        let net = LoopbackTransport::network(&[0, 1]);
        let now = Instant::now();
        let (mut core, _handle) = new_core(0, &[0, 1], net[&0].clone(), &dir, now);
        // Become leader at epoch 1 so the node has a real epoch/leader to report back.
        core.quorum.become_candidate(now, Duration::from_millis(100)).unwrap();
        core.maybe_become_leader(now).unwrap();
        assert_eq!(core.epoch(), 1);
        assert_eq!(core.leader(), Some(0));

        // A fetch request quoting a stale epoch must be fenced, but still tell the caller who
        // the real leader is so it can adopt the higher epoch.
        core.handle_fetch_request(
            now,
            5,
            1,
            FetchQuorumRecordsRequest {
                leader_epoch: 0,
                fetch_offset: 0,
                last_fetched_epoch: 0,
                replica_id: 1,
            },
        )
        .unwrap();

        let (reqs, resps) = net[&1].poll_inbound(Duration::from_millis(0));
        assert!(reqs.is_empty());
        assert_eq!(resps.len(), 1);
        match &resps[0].payload {
            ResponsePayload::FetchQuorumRecords(r) => {
                assert_eq!(r.error_code, ErrorCode::FencedLeaderEpoch);
                assert_eq!(r.leader_epoch, 1);
                assert_eq!(r.leader_id, 0);
            }
            _ => panic!("wrong payload"),
        }
    }

    #[test]
    fn offset_out_of_range_fetch_response_truncates_the_log() {
        let dir = tempdir().unwrap();
        let net = LoopbackTransport::network(&[0, 1]);
        let now = Instant::now();
        let (mut core, _handle) = new_core(0, &[0, 1], net[&0].clone(), &dir, now);

        // Make the node a follower of 1 with a few local (uncommitted, divergent) entries.
        core.quorum.become_follower(1, 1, now, Duration::from_millis(100)).unwrap();
        core.log.append_as_leader(vec![RecordPayload::Data(vec![9])], 1);
        assert_eq!(core.log_end_offset(), 1);

        core.fetch_inflight = Some((42, 1));
        let mut resp = FetchQuorumRecordsResponse::error(ErrorCode::OffsetOutOfRange);
        resp.leader_epoch = 1;
        resp.next_fetch_offset = Some(0);
        resp.next_fetch_offset_epoch = Some(0);
        core.handle_fetch_response(now, 42, 1, resp).unwrap();

        assert_eq!(core.log_end_offset(), 0);
        assert!(core.fetch_inflight.is_none());
    }

    #[test]
    fn unreachable_leader_drops_follower_to_unattached() {
        let dir = tempdir().unwrap();
        let net = LoopbackTransport::network(&[0, 1]);
        let now = Instant::now();
        let (mut core, _handle) = new_core(0, &[0, 1], net[&0].clone(), &dir, now);
        core.quorum.become_follower(1, 1, now, Duration::from_millis(100)).unwrap();
        core.fetch_inflight = Some((7, 1));

        let resp = FetchQuorumRecordsResponse::error(ErrorCode::BrokerNotAvailable);
        core.handle_fetch_response(now, 7, 1, resp).unwrap();

        assert!(!core.is_follower());
        assert_eq!(core.leader(), None);
    }

    #[test]
    fn a_stale_response_for_an_old_correlation_id_is_ignored() {
        let dir = tempdir().unwrap();
        let net = LoopbackTransport::network(&[0, 1]);
        let now = Instant::now();
        let (mut core, _handle) = new_core(0, &[0, 1], net[&0].clone(), &dir, now);
        core.quorum.become_follower(1, 1, now, Duration::from_millis(100)).unwrap();
        core.fetch_inflight = Some((99, 1));

        // A response for a correlation id we're not actually waiting on must be dropped.
        let resp = FetchQuorumRecordsResponse::error(ErrorCode::BrokerNotAvailable);
        core.handle_fetch_response(now, 5, 1, resp).unwrap();

        assert!(core.is_follower());
        assert_eq!(core.fetch_inflight, Some((99, 1)));
    }

    #[test]
    fn observer_never_becomes_a_voting_role() {
        let dir = tempdir().unwrap();
        let net = LoopbackTransport::network(&[0, 1, 99]);
        let now = Instant::now();
        let (mut core, _handle) = new_core(99, &[0, 1], net[&99].clone(), &dir, now);
        assert!(core.is_observer());

        core.poll(now + Duration::from_millis(500), Duration::from_millis(10)).unwrap();
        assert!(core.is_observer());
        assert!(!core.is_leader());
        assert!(!core.is_candidate());
    }

    #[test]
    fn high_watermark_only_advances_for_entries_in_the_current_epoch() {
        let dir = tempdir().unwrap();
        let net = LoopbackTransport::network(&[0, 1, 2]);
        let now = Instant::now();
        let (mut core, _handle) = new_core(0, &[0, 1, 2], net[&0].clone(), &dir, now);
        core.quorum.become_candidate(now, Duration::from_millis(100)).unwrap();
        if let Role::Candidate(s) = core.quorum.role_mut() {
            s.votes_granted.insert(1);
        }
        core.maybe_become_leader(now).unwrap();
        assert!(core.is_leader());
        assert_eq!(core.log_end_offset(), 1); // leader-change control record

        // No voter has fetched yet, so even though the leader alone is a "majority of one" short
        // of 2, the high watermark must not advance past 0.
        core.maybe_advance_high_watermark();
        assert_eq!(core.high_watermark(), None);

        // Voter 1 reports it has fetched through offset 1 (i.e. has replicated the control
        // record), which together with the leader is a majority of 3.
        core.match_offsets.insert(1, 1);
        core.maybe_advance_high_watermark();
        assert_eq!(core.high_watermark(), Some(1));
    }
}
