//! Consensus-client core for a single replicated partition: per-node election,
//! fetch-driven replication, and durable voting-record persistence. Wire framing, the actual
//! socket transport, on-disk log segment storage, and the application state machine are treated
//! as external collaborators reached through the seams this crate exposes (`Transport`, the
//! in-memory `ReplicatedLog`, `PersistentElectionStore`).

#[macro_use]
extern crate error_chain;
#[macro_use]
extern crate serde_derive;

pub mod config;
pub mod consensus;
pub mod discovery;
pub mod election_store;
pub mod errors;
pub mod log;
pub mod network;
pub mod protocol;
pub mod quorum_state;
pub mod transport;
