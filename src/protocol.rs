//! The message envelope and payload contracts.
//!
//! Shaped like a classic `Message { to: Vec<ServerId>, body: MessageBody }` /
//! `RequestVoteRequest` / `AppendEntriesRequest` shape in `protos.rs`, redesigned per the
//! "tagged message variants" note into the five-apiKey KRaft-style sum type this crate actually
//! calls for (VOTE, BEGIN_QUORUM_EPOCH, END_QUORUM_EPOCH, FETCH_QUORUM_RECORDS, FIND_QUORUM)
//! instead of a push-model AppendEntries/RequestVote pair.

use serde::{Deserialize, Serialize};

use crate::log::LogBatch;

pub type NodeId = i64;
pub type Epoch = u32;
pub type Offset = u64;
pub type CorrelationId = u32;

/// Error codes exposed by the core. `None` is the success case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    None,
    BrokerNotAvailable,
    ClusterAuthorizationFailed,
    OffsetOutOfRange,
    UnknownServerError,
    FencedLeaderEpoch,
    NotLeaderForPartition,
}

impl Default for ErrorCode {
    fn default() -> Self {
        ErrorCode::None
    }
}

/// A voter entry as returned by `FindQuorum`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoterInfo {
    pub voter_id: NodeId,
    pub boot_timestamp: u64,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub candidate_epoch: Epoch,
    pub candidate_id: NodeId,
    pub last_epoch: Epoch,
    pub last_epoch_end_offset: Offset,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    pub error_code: ErrorCode,
    pub leader_epoch: Epoch,
    pub leader_id: NodeId,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeginQuorumEpochRequest {
    pub leader_epoch: Epoch,
    pub leader_id: NodeId,
    pub replica_id: Option<NodeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeginQuorumEpochResponse {
    pub error_code: ErrorCode,
    pub leader_epoch: Epoch,
    pub leader_id: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndQuorumEpochRequest {
    pub leader_epoch: Epoch,
    pub leader_id: NodeId,
    pub replica_id: Option<NodeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndQuorumEpochResponse {
    pub error_code: ErrorCode,
    pub leader_epoch: Epoch,
    pub leader_id: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchQuorumRecordsRequest {
    pub leader_epoch: Epoch,
    pub fetch_offset: Offset,
    pub last_fetched_epoch: Epoch,
    pub replica_id: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchQuorumRecordsResponse {
    pub error_code: ErrorCode,
    pub leader_epoch: Epoch,
    pub leader_id: NodeId,
    pub high_watermark: i64,
    pub records: Vec<LogBatch>,
    /// Present only with `ErrorCode::OffsetOutOfRange`.
    pub next_fetch_offset: Option<Offset>,
    pub next_fetch_offset_epoch: Option<Epoch>,
}

impl FetchQuorumRecordsResponse {
    /// Builds the sentinel-field error response shape
    /// (`leaderEpoch = -1, leaderId = -1, highWatermark = -1`, empty records) for codes that
    /// carry no divergence point.
    pub fn error(error_code: ErrorCode) -> Self {
        FetchQuorumRecordsResponse {
            error_code,
            leader_epoch: 0,
            leader_id: -1,
            high_watermark: -1,
            records: Vec::new(),
            next_fetch_offset: None,
            next_fetch_offset_epoch: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindQuorumRequest {
    pub replica_id: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindQuorumResponse {
    pub error_code: ErrorCode,
    pub leader_epoch: Epoch,
    pub leader_id: NodeId,
    pub voters: Vec<VoterInfo>,
}

/// One request payload per apiKey. A closed sum type, per the design note below, so an
/// unrecognized apiKey must be rejected before a `RequestPayload` can be constructed rather
/// than relying on an exhaustive match downstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RequestPayload {
    Vote(VoteRequest),
    BeginQuorumEpoch(BeginQuorumEpochRequest),
    EndQuorumEpoch(EndQuorumEpochRequest),
    FetchQuorumRecords(FetchQuorumRecordsRequest),
    FindQuorum(FindQuorumRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponsePayload {
    Vote(VoteResponse),
    BeginQuorumEpoch(BeginQuorumEpochResponse),
    EndQuorumEpoch(EndQuorumEpochResponse),
    FetchQuorumRecords(FetchQuorumRecordsResponse),
    FindQuorum(FindQuorumResponse),
}

/// An outbound request this node is issuing to `to`.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub correlation_id: CorrelationId,
    pub to: NodeId,
    pub payload: RequestPayload,
}

/// An outbound response to a request we previously received inbound.
#[derive(Debug, Clone)]
pub struct OutboundResponse {
    pub correlation_id: CorrelationId,
    pub to: NodeId,
    pub payload: ResponsePayload,
}

/// A request a peer sent us.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub correlation_id: CorrelationId,
    pub from: NodeId,
    pub payload: RequestPayload,
}

/// A response to a request we previously sent.
#[derive(Debug, Clone)]
pub struct InboundResponse {
    pub correlation_id: CorrelationId,
    pub from: NodeId,
    pub payload: ResponsePayload,
}

/// The outer tag distinguishing the four message directions ("a further outer tag
/// distinguishing `Request.Inbound | Request.Outbound | Response.Inbound | Response.Outbound`").
#[derive(Debug, Clone)]
pub enum RaftMessage {
    OutboundRequest(OutboundRequest),
    OutboundResponse(OutboundResponse),
    InboundRequest(InboundRequest),
    InboundResponse(InboundResponse),
}
