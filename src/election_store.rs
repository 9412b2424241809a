//! `PersistentElectionStore`: durable, atomic persistence of the voting record.
//!
//! A dedicated metadata-persistence layer (distinct from `config_state`/`log`, referenced from
//! `consensus.rs` but not among the retrieved files) isn't available to ground this on
//! directly, so this follows a write-temp-then-rename discipline
//! itself, serialized with `serde_json` the way `Metadata` is serialized
//! with `serde_derive` elsewhere in the pack.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{ErrorKind, Result, ResultExt};
use crate::protocol::{Epoch, NodeId};

/// `{epoch, leader, votedFor}`. `leader`/`votedFor` are `Option`
/// here; the on-disk layout instead uses `-1` sentinels, translated at the (de)
/// serialization boundary below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ElectionRecord {
    pub epoch: Epoch,
    pub leader: Option<NodeId>,
    pub voted_for: Option<NodeId>,
}

/// On-disk layout: `epoch: u32, leaderId: i32 (-1 if none), votedId: i32 (-1 if none)`.
#[derive(Debug, Serialize, Deserialize)]
struct OnDiskRecord {
    epoch: Epoch,
    leader_id: NodeId,
    voted_id: NodeId,
}

impl From<ElectionRecord> for OnDiskRecord {
    fn from(r: ElectionRecord) -> Self {
        OnDiskRecord {
            epoch: r.epoch,
            leader_id: r.leader.unwrap_or(-1),
            voted_id: r.voted_for.unwrap_or(-1),
        }
    }
}

impl From<OnDiskRecord> for ElectionRecord {
    fn from(r: OnDiskRecord) -> Self {
        ElectionRecord {
            epoch: r.epoch,
            leader: if r.leader_id < 0 {
                None
            } else {
                Some(r.leader_id)
            },
            voted_for: if r.voted_id < 0 {
                None
            } else {
                Some(r.voted_id)
            },
        }
    }
}

pub struct PersistentElectionStore {
    path: PathBuf,
}

impl PersistentElectionStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        PersistentElectionStore { path: path.into() }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }

    /// Returns `None` if the file is absent or unparseable; the caller treats that as
    /// `{epoch: 0, leader: none, votedFor: none}`. A non-empty-but-unparseable file is
    /// only a soft "none" here — callers that need to distinguish "absent" from "corrupt"
    /// should use `read_strict`.
    pub fn read(&self) -> Option<ElectionRecord> {
        self.read_strict().ok().flatten()
    }

    /// Like `read`, but a non-empty, unparseable file is a fatal `CorruptElectionStore` error
    /// instead of being silently treated as "none".
    pub fn read_strict(&self) -> Result<Option<ElectionRecord>> {
        let contents = match fs::read(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if contents.is_empty() {
            return Ok(None);
        }
        match serde_json::from_slice::<OnDiskRecord>(&contents) {
            Ok(r) => Ok(Some(r.into())),
            Err(_) => Err(ErrorKind::CorruptElectionStore(self.path.clone()).into()),
        }
    }

    /// Writes to `<path>.tmp` then renames over `<path>`. After a successful rename the temp
    /// file does not exist. A crash between write and rename leaves the prior record intact.
    pub fn write(&self, record: ElectionRecord) -> Result<()> {
        let on_disk = OnDiskRecord::from(record);
        let serialized = serde_json::to_vec(&on_disk)?;

        let tmp = self.tmp_path();
        fs::write(&tmp, &serialized)
            .chain_err(|| ErrorKind::Fatal(format!("writing temp election store file {:?}", tmp)))?;
        fs::rename(&tmp, &self.path)
            .chain_err(|| ErrorKind::Fatal(format!("renaming {:?} onto {:?}", tmp, self.path)))?;
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
