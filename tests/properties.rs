//! Property tests over the pure, deterministic pieces of the core (the replicated log and the
//! persistent election record), grounded on the `proptest` usage pattern in
//! `aptos-core`'s `consensus::transaction_shuffler` test suites from the retrieval pack.

use proptest::prelude::*;

use quorum_raft::election_store::{ElectionRecord, PersistentElectionStore};
use quorum_raft::log::{RecordPayload, ReplicatedLog};
use quorum_raft::protocol::{Epoch, NodeId};

fn arb_node_id() -> impl Strategy<Value = NodeId> {
    0i64..16
}

fn arb_election_record() -> impl Strategy<Value = ElectionRecord> {
    (
        any::<Epoch>(),
        proptest::option::of(arb_node_id()),
        proptest::option::of(arb_node_id()),
    )
        .prop_map(|(epoch, leader, voted_for)| ElectionRecord {
            epoch,
            leader,
            voted_for,
        })
}

proptest! {
    #[test]
    fn election_record_round_trips_through_the_store(record in arb_election_record()) {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentElectionStore::new(dir.path().join("election.json"));
        store.write(record).unwrap();
        prop_assert_eq!(store.read(), Some(record));
    }

    /// Appending `n` batches of `sizes` records each as the leader always leaves the log with
    /// dense, strictly increasing offsets starting at 0, regardless of how the batches are
    /// grouped or which epochs they carry.
    #[test]
    fn leader_appends_always_produce_dense_monotonic_offsets(
        sizes in proptest::collection::vec(1usize..5, 1..8),
        epochs in proptest::collection::vec(1u32..5, 1..8),
    ) {
        let mut log = ReplicatedLog::new();
        let mut expected_end = 0u64;
        for (size, epoch) in sizes.iter().zip(epochs.iter().cycle()) {
            let payloads: Vec<RecordPayload> = (0..*size).map(|i| RecordPayload::Data(vec![i as u8])).collect();
            let base = log.append_as_leader(payloads, *epoch);
            prop_assert_eq!(base, expected_end);
            expected_end += *size as u64;
            prop_assert_eq!(log.end_offset(), expected_end);
        }
    }

    /// However batches are grouped on append, `read` reconstructs them such that no returned
    /// batch mixes two different epochs, and concatenating every batch's entries reproduces the
    /// full entry sequence in order.
    #[test]
    fn read_never_straddles_an_epoch_boundary(
        sizes in proptest::collection::vec(1usize..4, 1..6),
        epochs in proptest::collection::vec(1u32..4, 1..6),
    ) {
        let mut log = ReplicatedLog::new();
        for (size, epoch) in sizes.iter().zip(epochs.iter().cycle()) {
            let payloads: Vec<RecordPayload> = (0..*size).map(|i| RecordPayload::Data(vec![i as u8])).collect();
            log.append_as_leader(payloads, *epoch);
        }

        let batches = log.read(0, None);
        let mut reconstructed_len = 0u64;
        for batch in &batches {
            prop_assert!(batch.entries.iter().all(|e| e.epoch == batch.epoch));
            reconstructed_len += batch.entries.len() as u64;
        }
        prop_assert_eq!(reconstructed_len, log.end_offset());

        // Every adjacent pair of batches must actually differ in epoch -- otherwise `read` failed
        // to merge what should have been one batch, or split what should have stayed together.
        for pair in batches.windows(2) {
            prop_assert_ne!(pair[0].epoch, pair[1].epoch);
        }
    }

    /// Truncating to any offset within range and then appending a fresh batch whose base offset
    /// matches the new end offset always succeeds and leaves the log at the expected length --
    /// truncation never corrupts the log's ability to accept further writes.
    #[test]
    fn truncate_then_append_recovers_a_consistent_log(
        sizes in proptest::collection::vec(1usize..4, 2..6),
        truncate_at in 0u64..20,
        extra in 1usize..4,
    ) {
        let mut log = ReplicatedLog::new();
        for size in &sizes {
            let payloads: Vec<RecordPayload> = (0..*size).map(|i| RecordPayload::Data(vec![i as u8])).collect();
            log.append_as_leader(payloads, 1);
        }
        let total = log.end_offset();
        let truncate_at = truncate_at.min(total);
        log.truncate_to(truncate_at);
        prop_assert_eq!(log.end_offset(), truncate_at);

        let payloads: Vec<RecordPayload> = (0..extra).map(|i| RecordPayload::Data(vec![i as u8])).collect();
        let base = log.append_as_leader(payloads, 2);
        prop_assert_eq!(base, truncate_at);
        prop_assert_eq!(log.end_offset(), truncate_at + extra as u64);
    }
}
