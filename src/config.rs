//! Recognized configuration options plus the boot-time parameters a node needs to start.
//!
//! Shaped like a classic `Metadata`/`Configuration` struct: a plain
//! `#[derive(Serialize, Deserialize)]` struct with a `Default` impl that reproduces the
//! the timing constants conventionally named `ELECTION_TIMEOUT`/`HEARTBEAT_TIMEOUT`.

use std::collections::HashSet;
use std::path::PathBuf;

use crate::errors::Result;
use crate::protocol::NodeId;

/// The options called out by name, plus the boot parameters every node needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// This node's id.
    pub node_id: NodeId,

    /// Voters this node starts out knowing about. An id outside this set makes the node an
    /// observer.
    pub voters: HashSet<NodeId>,

    /// Bootstrap addresses used by `FindQuorum`'s observer path.
    pub bootstrap_servers: Vec<String>,

    /// Where `PersistentElectionStore` keeps its file.
    pub election_store_path: PathBuf,

    /// Base timeout before a follower becomes a candidate, or a candidate restarts an
    /// election.
    pub election_timeout_ms: u64,

    /// Upper bound (exclusive) of the uniform jitter added on top of `election_timeout_ms`.
    pub election_jitter_ms: u64,

    /// Backoff before retrying `FindQuorum` or a failed connection.
    pub retry_backoff_ms: u64,

    /// Per-request timeout; after this, an outbound request is considered failed.
    pub request_timeout_ms: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        RaftConfig {
            node_id: 0,
            voters: HashSet::new(),
            bootstrap_servers: Vec::new(),
            election_store_path: PathBuf::from("election-state.json"),
            // Matches a conventional ELECTION_TIMEOUT = (400, 800), split into
            // a base + jitter bound instead of an inclusive range.
            election_timeout_ms: 400,
            election_jitter_ms: 400,
            retry_backoff_ms: 200,
            // Matches a conventional HEARTBEAT_TIMEOUT = 150ms, reused here as the per-request
            // timeout for fetches and RPCs.
            request_timeout_ms: 150,
        }
    }
}

impl RaftConfig {
    pub fn is_voter(&self, id: NodeId) -> bool {
        self.voters.contains(&id)
    }

    pub fn majority(&self) -> usize {
        self.voters.len() / 2 + 1
    }

    /// Loads a config from a TOML document, falling back to `Default` for absent fields.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let cfg: RaftConfig = toml::from_str(contents)?;
        Ok(cfg)
    }
}
