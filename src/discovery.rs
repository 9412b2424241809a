//! `LeaderDiscovery`: the `FindQuorum` sub-protocol used by observers and voters
//! without a known leader.
//!
//! A push-model `AppendEntries` design has no real analog for this (a follower
//! is told who the leader is rather than discovering it), so this is grounded instead on the
//! seed-list/bootstrap pattern from a typical cluster `main.rs` (`seed_list: Vec<String>`,
//! `--join SERVER_ADDRESS`), turned into the round-robin-over-known-voters bookkeeping
//! calls for. Targets are `NodeId`s rather than raw addresses: the voter set is static
//! configuration, and resolving a `NodeId` to a dialable address is the out-of-scope transport
//! layer's job (`Transport::update_endpoint`).

use std::time::{Duration, Instant};

use crate::protocol::{CorrelationId, NodeId};

/// Tracks which known voters we've tried and when we're allowed to retry, so `ConsensusCore`
/// can round-robin `FindQuorum` across them.
pub struct LeaderDiscovery {
    targets: Vec<NodeId>,
    next_index: usize,
    next_attempt: Instant,
    outstanding_correlation: Option<CorrelationId>,
}

impl LeaderDiscovery {
    pub fn new(targets: Vec<NodeId>, now: Instant) -> Self {
        LeaderDiscovery {
            targets,
            next_index: 0,
            next_attempt: now,
            outstanding_correlation: None,
        }
    }

    pub fn has_targets(&self) -> bool {
        !self.targets.is_empty()
    }

    /// True once `now` has passed the point we're allowed to issue another `FindQuorum`, and
    /// there isn't already one outstanding.
    pub fn should_attempt(&self, now: Instant) -> bool {
        self.outstanding_correlation.is_none() && now >= self.next_attempt && self.has_targets()
    }

    /// Picks the next voter round-robin. Does not itself mark an attempt outstanding, since the
    /// caller needs to send the request (and learn its correlation id) before that's known; call
    /// `mark_outstanding` once the request has actually been handed to the channel.
    pub fn next_target(&mut self) -> NodeId {
        let target = self.targets[self.next_index];
        self.next_index = (self.next_index + 1) % self.targets.len();
        target
    }

    pub fn mark_outstanding(&mut self, correlation_id: CorrelationId) {
        self.outstanding_correlation = Some(correlation_id);
    }

    /// Called on any terminal outcome (success, error response, or timeout) to clear the
    /// outstanding marker and arm the backoff before the next attempt.
    pub fn record_attempt_finished(&mut self, now: Instant, retry_backoff: Duration) {
        self.outstanding_correlation = None;
        self.next_attempt = now + retry_backoff;
    }

    pub fn is_outstanding(&self, correlation_id: CorrelationId) -> bool {
        self.outstanding_correlation == Some(correlation_id)
    }
}
