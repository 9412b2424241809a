//! End-to-end scenarios driving a small in-process cluster through its public API
//! (`ConsensusCore::poll`, `AppendHandle::append`, `ConsensusCore::shutdown`), exercising
//! `ConsensusCore::poll` end to end across a cluster rather than unit-testing each private helper.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use quorum_raft::consensus::{ConsensusCore, ConsensusParams};
use quorum_raft::election_store::PersistentElectionStore;
use quorum_raft::protocol::NodeId;
use quorum_raft::transport::LoopbackTransport;

fn cluster(
    dir: &tempfile::TempDir,
    ids: &[NodeId],
    voters: &[NodeId],
    now: Instant,
) -> Vec<ConsensusCore<LoopbackTransport>> {
    let network = LoopbackTransport::network(ids);
    let voter_set: HashSet<NodeId> = voters.iter().cloned().collect();
    ids.iter()
        .map(|&id| {
            let store = PersistentElectionStore::new(dir.path().join(format!("node-{}.json", id)));
            let params = ConsensusParams {
                node_id: id,
                voters: voter_set.clone(),
                election_timeout_ms: 100,
                election_jitter_ms: 50,
                request_timeout_ms: 30,
                retry_backoff_ms: 10,
                mailbox_capacity: 16,
            };
            let (core, _handle) = ConsensusCore::new(params, network[&id].clone(), store, now).unwrap();
            core
        })
        .collect()
}

fn tick_all(nodes: &mut [ConsensusCore<LoopbackTransport>], now: &mut Instant, step: Duration, rounds: u32) {
    for _ in 0..rounds {
        *now += step;
        for node in nodes.iter_mut() {
            if node.is_running() {
                node.poll(*now, step).unwrap();
            }
        }
    }
}

fn leader_index(nodes: &[ConsensusCore<LoopbackTransport>]) -> Option<usize> {
    nodes.iter().position(|n| n.is_leader())
}

#[test]
fn three_voter_cluster_elects_a_single_leader() {
    let dir = tempfile::tempdir().unwrap();
    let mut now = Instant::now();
    let mut nodes = cluster(&dir, &[0, 1, 2], &[0, 1, 2], now);

    tick_all(&mut nodes, &mut now, Duration::from_millis(20), 40);

    let leaders: Vec<usize> = (0..nodes.len()).filter(|&i| nodes[i].is_leader()).collect();
    assert_eq!(leaders.len(), 1, "expected exactly one leader, got {:?}", leaders);

    // Every node must agree on who the leader is and at what epoch.
    let leader_id = nodes[leaders[0]].node_id();
    let epoch = nodes[leaders[0]].epoch();
    for node in &nodes {
        assert_eq!(node.leader(), Some(leader_id));
        assert_eq!(node.epoch(), epoch);
    }
}

#[test]
fn appended_records_replicate_to_followers_and_commit() {
    let dir = tempfile::tempdir().unwrap();
    let mut now = Instant::now();
    let network = LoopbackTransport::network(&[0, 1, 2]);
    let voters: HashSet<NodeId> = [0, 1, 2].iter().cloned().collect();

    let mut nodes = Vec::new();
    let mut handles = Vec::new();
    for &id in &[0, 1, 2] {
        let store = PersistentElectionStore::new(dir.path().join(format!("node-{}.json", id)));
        let params = ConsensusParams {
            node_id: id,
            voters: voters.clone(),
            election_timeout_ms: 100,
            election_jitter_ms: 50,
            request_timeout_ms: 30,
            retry_backoff_ms: 10,
            mailbox_capacity: 16,
        };
        let (core, handle) = ConsensusCore::new(params, network[&id].clone(), store, now).unwrap();
        nodes.push(core);
        handles.push(handle);
    }

    tick_all(&mut nodes, &mut now, Duration::from_millis(20), 40);
    let leader = leader_index(&nodes).expect("a leader must have been elected");

    let mut receiver = handles[leader].append(vec![b"hello".to_vec(), b"world".to_vec()]);
    tick_all(&mut nodes, &mut now, Duration::from_millis(20), 1);
    let outcome = receiver
        .try_recv()
        .unwrap()
        .expect("append should have completed by the next poll");
    let (base_offset, epoch) = outcome.expect("append must succeed on the leader");
    assert_eq!(base_offset, 1); // offset 0 is the leader-change control record
    assert_eq!(epoch, nodes[leader].epoch());

    // Give followers time to fetch and the leader time to advance the high watermark.
    tick_all(&mut nodes, &mut now, Duration::from_millis(20), 20);

    for node in &nodes {
        assert!(node.log_end_offset() >= 3, "node {} only has {} entries", node.node_id(), node.log_end_offset());
    }
    assert!(nodes[leader].high_watermark().unwrap_or(0) >= 3);
}

#[test]
fn graceful_shutdown_hands_off_leadership_to_a_successor() {
    let dir = tempfile::tempdir().unwrap();
    let mut now = Instant::now();
    let mut nodes = cluster(&dir, &[0, 1, 2], &[0, 1, 2], now);

    tick_all(&mut nodes, &mut now, Duration::from_millis(20), 40);
    let leader = leader_index(&nodes).expect("a leader must have been elected");
    let old_epoch = nodes[leader].epoch();

    nodes[leader]
        .shutdown(now, Duration::from_millis(500))
        .unwrap();

    tick_all(&mut nodes, &mut now, Duration::from_millis(20), 60);

    assert!(!nodes[leader].is_running());

    let remaining: Vec<usize> = (0..nodes.len()).filter(|&i| i != leader).collect();
    let new_leader = remaining
        .iter()
        .find(|&&i| nodes[i].is_leader())
        .copied()
        .expect("a successor must have been elected");
    assert!(nodes[new_leader].epoch() > old_epoch);
}

#[test]
fn an_observer_discovers_the_leader_without_ever_voting() {
    let dir = tempfile::tempdir().unwrap();
    let mut now = Instant::now();
    let mut nodes = cluster(&dir, &[0, 1, 2, 99], &[0, 1, 2], now);

    tick_all(&mut nodes, &mut now, Duration::from_millis(20), 60);

    let observer = nodes.iter().find(|n| n.node_id() == 99).unwrap();
    assert!(observer.is_observer());
    assert!(observer.leader().is_some());
    assert!(!observer.is_leader());
}
