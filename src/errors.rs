//! Error hierarchy for the consensus core.
//!
//! Mirrors a classic `raft::errors` module (`error_chain!` with a `foreign_links` block
//! for I/O), extended with an `ErrorKind::Fatal` variant so the poll loop can distinguish
//! errors that must propagate to the embedder from everything else, which is fully
//! recovered inside `ConsensusCore::poll`.

error_chain! {
    foreign_links {
        Io(::std::io::Error);
        Json(::serde_json::Error);
        Toml(::toml::de::Error);
    }

    errors {
        /// The persistent election-store file exists but could not be parsed, and was
        /// non-empty (an empty/absent file is treated as the default record, not an error).
        CorruptElectionStore(path: ::std::path::PathBuf) {
            description("election store file is corrupt")
            display("election store file at {:?} is corrupt", path)
        }

        /// A bounded outbound queue overflowed. Called out as fatal: a correctly sized peer
        /// set guarantees it cannot happen in steady state.
        QueueOverflow(which: &'static str) {
            description("bounded queue overflowed")
            display("{} queue overflowed", which)
        }

        /// Marks an error as one the poll loop must propagate to the embedder rather than
        /// absorb: I/O failure writing the election store, queue overflow, or unparseable
        /// persistent state with non-empty contents.
        Fatal(reason: String) {
            description("fatal error")
            display("fatal error: {}", reason)
        }

        /// An envelope named an apiKey this crate does not know about. Per the open
        /// question, this is rejected explicitly rather than relying on exhaustive matching
        /// upstream of us.
        UnknownApiKey(key: u16) {
            description("unknown apiKey")
            display("unknown apiKey {}", key)
        }
    }
}
