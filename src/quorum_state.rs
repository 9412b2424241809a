//! `QuorumState`: the in-memory projection of the election record plus transient
//! per-role bookkeeping, with role transitions validated and persisted before they become
//! observable.
//!
//! Shaped like a classic `ServerState` enum (`Follower`/`Candidate`/`Leader` with
//! `ServerFollowerState`/`ServerCandidateState`/`ServerLeaderState`) in `consensus.rs`,
//! extended with `Unattached` and `Observer` per the sum-of-products design note
//! below ("model them as tagged variants sharing only the persisted `ElectionRecord`").

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use log::info;

use crate::election_store::{ElectionRecord, PersistentElectionStore};
use crate::errors::Result;
use crate::protocol::{Epoch, NodeId, Offset};

pub struct UnattachedState {
    pub election_deadline: Instant,
}

pub struct CandidateState {
    pub votes_granted: HashSet<NodeId>,
    pub votes_rejected: HashSet<NodeId>,
    pub election_deadline: Instant,
}

pub struct FollowerState {
    pub leader_id: NodeId,
    pub election_deadline: Instant,
}

pub struct LeaderState {
    /// Highest fetch offset we've observed from each voter, used to advance the high watermark.
    pub match_offsets: HashMap<NodeId, Offset>,
}

pub struct ObserverState {
    pub leader_id: Option<NodeId>,
    pub election_deadline: Instant,
}

/// The role-specific transient state a node can be in. Voters can occupy any of
/// `Unattached`/`Candidate`/`Follower`/`Leader`; observers only ever occupy `Observer`, which
/// has no path to `Candidate`/`Leader` at the type level.
pub enum Role {
    Unattached(UnattachedState),
    Candidate(CandidateState),
    Follower(FollowerState),
    Leader(LeaderState),
    Observer(ObserverState),
}

pub struct QuorumState {
    node_id: NodeId,
    voters: HashSet<NodeId>,
    is_voter: bool,
    record: ElectionRecord,
    role: Role,
    store: PersistentElectionStore,
}

impl QuorumState {
    /// Loads the persisted record (defaulting to epoch 0, no leader/vote) and derives the
    /// initial role: voters start `Unattached` at the persisted epoch (or `Follower`
    /// if a leader was already recorded); observers start `Observer`, leaderless unless the
    /// persisted record happens to name one.
    ///
    /// Uses `read_strict` rather than the lossy `read`, so a corrupt, non-empty election-store
    /// file fails the load instead of silently booting as epoch 0/no leader/no vote.
    pub fn load(
        node_id: NodeId,
        voters: HashSet<NodeId>,
        store: PersistentElectionStore,
        now: Instant,
        election_timeout: Duration,
    ) -> Result<Self> {
        let record = store.read_strict()?.unwrap_or_default();
        let is_voter = voters.contains(&node_id);

        let role = if is_voter {
            match record.leader {
                Some(leader_id) => Role::Follower(FollowerState {
                    leader_id,
                    election_deadline: now + election_timeout,
                }),
                None => Role::Unattached(UnattachedState {
                    election_deadline: now + election_timeout,
                }),
            }
        } else {
            Role::Observer(ObserverState {
                leader_id: record.leader,
                election_deadline: now + election_timeout,
            })
        };

        Ok(QuorumState {
            node_id,
            voters,
            is_voter,
            record,
            role,
            store,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn epoch(&self) -> Epoch {
        self.record.epoch
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.record.leader
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.record.voted_for
    }

    pub fn is_voter_id(&self, id: NodeId) -> bool {
        self.voters.contains(&id)
    }

    pub fn voters(&self) -> &HashSet<NodeId> {
        &self.voters
    }

    pub fn majority(&self) -> usize {
        self.voters.len() / 2 + 1
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader(_))
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self.role, Role::Candidate(_))
    }

    pub fn is_follower(&self) -> bool {
        matches!(self.role, Role::Follower(_))
    }

    pub fn is_observer(&self) -> bool {
        matches!(self.role, Role::Observer(_))
    }

    fn persist(&mut self) -> Result<()> {
        self.store.write(self.record)
    }

    /// Clears leader & votedFor at `epoch`. `epoch` must be >= current.
    pub fn become_unattached(&mut self, epoch: Epoch, now: Instant, election_timeout: Duration) -> Result<()> {
        assert!(epoch >= self.record.epoch, "epoch must not regress");
        self.record.epoch = epoch;
        self.record.leader = None;
        self.record.voted_for = None;
        self.persist()?;

        self.role = if self.is_voter {
            Role::Unattached(UnattachedState {
                election_deadline: now + election_timeout,
            })
        } else {
            Role::Observer(ObserverState {
                leader_id: None,
                election_deadline: now + election_timeout,
            })
        };
        Ok(())
    }

    /// Voter only; bumps the epoch, votes for self, and arms a fresh election timeout+jitter
    /// (the election protocol's `becomeCandidate`).
    pub fn become_candidate(&mut self, now: Instant, election_timeout: Duration) -> Result<()> {
        assert!(self.is_voter, "observers cannot become candidates");
        self.record.epoch += 1;
        self.record.voted_for = Some(self.node_id);
        self.record.leader = None;
        self.persist()?;

        let mut votes_granted = HashSet::new();
        votes_granted.insert(self.node_id);
        info!("node {} became candidate at epoch {}", self.node_id, self.record.epoch);
        self.role = Role::Candidate(CandidateState {
            votes_granted,
            votes_rejected: HashSet::new(),
            election_deadline: now + election_timeout,
        });
        Ok(())
    }

    /// `epoch` must be >= current. Sets leader, clears votedFor, arms the election timeout.
    pub fn become_follower(&mut self, epoch: Epoch, leader_id: NodeId, now: Instant, election_timeout: Duration) -> Result<()> {
        assert!(epoch >= self.record.epoch, "epoch must not regress");
        self.record.epoch = epoch;
        self.record.leader = Some(leader_id);
        self.record.voted_for = None;
        self.persist()?;

        self.role = if self.is_voter {
            Role::Follower(FollowerState {
                leader_id,
                election_deadline: now + election_timeout,
            })
        } else {
            Role::Observer(ObserverState {
                leader_id: Some(leader_id),
                election_deadline: now + election_timeout,
            })
        };
        info!("node {} became follower of {} at epoch {}", self.node_id, leader_id, epoch);
        Ok(())
    }

    /// Only valid from `Candidate` with `votes_granted.len() >= majority`.
    pub fn become_leader(&mut self) -> Result<()> {
        let granted = match &self.role {
            Role::Candidate(s) => s.votes_granted.len(),
            _ => panic!("become_leader called outside Candidate role"),
        };
        assert!(granted >= self.majority(), "cannot become leader without a majority");

        self.record.leader = Some(self.node_id);
        self.record.voted_for = None;
        self.persist()?;

        info!("node {} became leader at epoch {}", self.node_id, self.record.epoch);
        self.role = Role::Leader(LeaderState {
            match_offsets: HashMap::new(),
        });
        Ok(())
    }

    /// Voter only; `epoch` must equal current, and `votedFor` may only be set if currently
    /// none at this epoch.
    pub fn record_vote(&mut self, epoch: Epoch, candidate_id: NodeId) -> Result<()> {
        assert!(self.is_voter, "observers do not vote");
        assert_eq!(epoch, self.record.epoch, "record_vote called at a stale epoch");
        assert!(
            self.record.voted_for.is_none() || self.record.voted_for == Some(candidate_id),
            "cannot change vote within an epoch"
        );
        self.record.voted_for = Some(candidate_id);
        self.persist()?;
        Ok(())
    }

    /// Re-arms the current role's election deadline without changing the persisted record.
    /// Used when granting a vote (the follower's election timeout must be
    /// reset so a newly elected leader can rely on it for serving reads) and on every
    /// `BeginQuorumEpoch`/fetch-as-endorsement.
    pub fn reset_election_deadline(&mut self, now: Instant, election_timeout: Duration) {
        match &mut self.role {
            Role::Unattached(s) => s.election_deadline = now + election_timeout,
            Role::Candidate(s) => s.election_deadline = now + election_timeout,
            Role::Follower(s) => s.election_deadline = now + election_timeout,
            Role::Observer(s) => s.election_deadline = now + election_timeout,
            Role::Leader(_) => {}
        }
    }

    pub fn role_mut(&mut self) -> &mut Role {
        &mut self.role
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(dir: &tempfile::TempDir) -> PersistentElectionStore {
        PersistentElectionStore::new(dir.path().join("election.json"))
    }

    #[test]
    fn voter_starts_unattached_with_no_persisted_state() {
        let dir = tempdir().unwrap();
        let voters: HashSet<NodeId> = [0, 1, 2].iter().cloned().collect();
        let qs = QuorumState::load(0, voters, store(&dir), Instant::now(), Duration::from_millis(100)).unwrap();
        assert!(matches!(qs.role(), Role::Unattached(_)));
        assert_eq!(qs.epoch(), 0);
    }

    #[test]
    fn observer_never_reaches_candidate_or_leader() {
        let dir = tempdir().unwrap();
        let voters: HashSet<NodeId> = [1, 2].iter().cloned().collect();
        let qs = QuorumState::load(99, voters, store(&dir), Instant::now(), Duration::from_millis(100)).unwrap();
        assert!(qs.is_observer());
        assert!(!qs.is_voter_id(99));
    }

    #[test]
    fn become_candidate_bumps_epoch_and_votes_for_self() {
        let dir = tempdir().unwrap();
        let voters: HashSet<NodeId> = [0, 1, 2].iter().cloned().collect();
        let mut qs = QuorumState::load(0, voters, store(&dir), Instant::now(), Duration::from_millis(100)).unwrap();
        qs.become_candidate(Instant::now(), Duration::from_millis(100)).unwrap();
        assert_eq!(qs.epoch(), 1);
        assert_eq!(qs.voted_for(), Some(0));
        assert!(qs.is_candidate());
    }

    #[test]
    fn become_leader_requires_majority() {
        let dir = tempdir().unwrap();
        let voters: HashSet<NodeId> = [0, 1, 2].iter().cloned().collect();
        let mut qs = QuorumState::load(0, voters, store(&dir), Instant::now(), Duration::from_millis(100)).unwrap();
        qs.become_candidate(Instant::now(), Duration::from_millis(100)).unwrap();
        if let Role::Candidate(s) = qs.role_mut() {
            s.votes_granted.insert(1);
        }
        qs.become_leader().unwrap();
        assert!(qs.is_leader());
        assert_eq!(qs.leader(), Some(0));
        assert_eq!(qs.voted_for(), None);
    }

    #[test]
    fn vote_persists_across_a_reload() {
        let dir = tempdir().unwrap();
        let voters: HashSet<NodeId> = [0, 1].iter().cloned().collect();
        {
            let mut qs = QuorumState::load(1, voters.clone(), store(&dir), Instant::now(), Duration::from_millis(100)).unwrap();
            qs.become_unattached(3, Instant::now(), Duration::from_millis(100)).unwrap();
            qs.record_vote(3, 0).unwrap();
        }
        let qs = QuorumState::load(1, voters, store(&dir), Instant::now(), Duration::from_millis(100)).unwrap();
        assert_eq!(qs.epoch(), 3);
        assert_eq!(qs.voted_for(), Some(0));
    }
}
