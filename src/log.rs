//! `ReplicatedLog`: an in-memory, append-only, epoch-tagged log of record batches.
//!
//! Shaped like a classic `LogEntry { index, term, data }` / `LogEntryData` layout in
//! `protos.rs` and the `last_index`/`term`/`entry`/`append`/`truncate_suffix`/`first_index`
//! surface `consensus.rs` calls through `self.log`. Rebuilt around batches (not single
//! entries) tagged by leader epoch, since fetch responses ship whole batches, and
//! on-disk segment storage is explicitly out of this crate's scope — this is a pure
//! in-memory structure an embedder would back with real segments.

use serde::{Deserialize, Serialize};

use crate::errors::{ErrorKind, Result};
use crate::protocol::{Epoch, NodeId, Offset};

/// Schema for the control-record payload. Left intentionally minimal per the
/// open question ("the leader-change control batch's exact version/schema ... is left to
/// the log component").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderChangePayload {
    pub version: u16,
    pub leader_id: NodeId,
    pub voters: Vec<NodeId>,
}

/// The payload of a single record. `Control` records are never handed to the application
/// state machine; they exist purely for replication bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RecordPayload {
    Data(Vec<u8>),
    Control(LeaderChangePayload),
}

/// A single record at a fixed offset, as stored in the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub offset: Offset,
    pub epoch: Epoch,
    pub payload: RecordPayload,
}

/// A contiguous run of entries sharing an epoch, as exchanged over the wire (fetch
/// response carries `records: Vec<LogBatch>`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogBatch {
    pub base_offset: Offset,
    pub epoch: Epoch,
    pub entries: Vec<LogEntry>,
    pub is_control_batch: bool,
}

impl LogBatch {
    pub fn last_offset(&self) -> Offset {
        self.base_offset + self.entries.len() as Offset - 1
    }
}

/// In-memory replicated log. Offsets are dense and start at 0.
#[derive(Debug, Default)]
pub struct ReplicatedLog {
    entries: Vec<LogEntry>,
}

impl ReplicatedLog {
    pub fn new() -> Self {
        ReplicatedLog {
            entries: Vec::new(),
        }
    }

    /// Offset just past the last appended record.
    pub fn end_offset(&self) -> Offset {
        self.entries.len() as Offset
    }

    /// Epoch of the last record, or 0 for an empty log.
    pub fn last_fetched_epoch(&self) -> Epoch {
        self.entries.last().map(|e| e.epoch).unwrap_or(0)
    }

    /// Epoch of the entry at `offset`, if any is present locally.
    pub fn epoch_at(&self, offset: Offset) -> Option<Epoch> {
        self.entries.get(offset as usize).map(|e| e.epoch)
    }

    pub fn entry(&self, offset: Offset) -> Option<&LogEntry> {
        self.entries.get(offset as usize)
    }

    /// Appends records as the leader at `epoch`. Returns the base offset of the new batch.
    pub fn append_as_leader(&mut self, payloads: Vec<RecordPayload>, epoch: Epoch) -> Offset {
        let base = self.end_offset();
        for (i, payload) in payloads.into_iter().enumerate() {
            self.entries.push(LogEntry {
                offset: base + i as Offset,
                epoch,
                payload,
            });
        }
        base
    }

    /// Appends a batch received from the leader. `batch.base_offset` must equal our current
    /// `end_offset` (no gap); the caller is responsible for having resolved any divergence via
    /// `truncate_to` first (see the divergence-detection note below).
    pub fn append_as_follower(&mut self, batch: LogBatch) -> Result<()> {
        if batch.base_offset != self.end_offset() {
            bail!(ErrorKind::Msg(format!(
                "follower append would create a gap: batch base {} != end offset {}",
                batch.base_offset,
                self.end_offset()
            )));
        }
        for entry in batch.entries {
            self.entries.push(entry);
        }
        Ok(())
    }

    /// Discards all records at or after `offset`. Idempotent.
    pub fn truncate_to(&mut self, offset: Offset) {
        let offset = offset as usize;
        if offset < self.entries.len() {
            self.entries.truncate(offset);
        }
    }

    /// Returns whether the follower's stated `(offset, epoch)` anchor matches our log, i.e.
    /// whether appending starting at `offset` would be accepted. `offset == 0` always matches
    /// (there is nothing before the start of the log to diverge on).
    ///
    /// On mismatch, also returns the point the follower should truncate to and retry from, per
    /// the divergence-detection rule: walk back to the last offset this log and the
    /// fetcher could possibly agree on.
    pub fn matches_anchor(&self, offset: Offset, epoch: Epoch) -> Result<(), (Offset, Epoch)> {
        if offset == 0 {
            return Ok(());
        }
        match self.epoch_at(offset - 1) {
            Some(local_epoch) if local_epoch == epoch => Ok(()),
            Some(_) => {
                // Walk back to the start of the diverging epoch run so the follower retries at
                // a point both sides can agree on.
                let mut divergence = offset - 1;
                let run_epoch = self.epoch_at(divergence).unwrap();
                while divergence > 0 && self.epoch_at(divergence - 1) == Some(run_epoch) {
                    divergence -= 1;
                }
                let divergence_epoch = if divergence == 0 {
                    0
                } else {
                    self.epoch_at(divergence - 1).unwrap_or(0)
                };
                Err((divergence, divergence_epoch))
            }
            None => {
                // Follower is asking for something beyond the end of our own log.
                Err((self.end_offset(), self.last_fetched_epoch()))
            }
        }
    }

    /// Returns batches covering `[start_offset, max_offset)` (or to the end of the log if
    /// `max_offset` is `None`). Batches never straddle an epoch boundary, matching the
    /// `epoch` field being constant within a batch.
    pub fn read(&self, start_offset: Offset, max_offset: Option<Offset>) -> Vec<LogBatch> {
        let end = max_offset.unwrap_or_else(|| self.end_offset()).min(self.end_offset());
        let start = start_offset.min(end);

        let mut batches = Vec::new();
        let mut i = start;
        while i < end {
            let epoch = self.entries[i as usize].epoch;
            let batch_start = i;
            let mut entries = Vec::new();
            while i < end && self.entries[i as usize].epoch == epoch {
                entries.push(self.entries[i as usize].clone());
                i += 1;
            }
            let is_control_batch = entries
                .iter()
                .all(|e| matches!(e.payload, RecordPayload::Control(_)));
            batches.push(LogBatch {
                base_offset: batch_start,
                epoch,
                entries,
                is_control_batch,
            });
        }
        batches
    }
}
