//! Demo binary: runs a small in-process cluster of consensus cores over a `LoopbackTransport`
//! and drives their `poll` loops, the way a demo `main.rs` drives a single `ConsensusModule`
//! for its Redis-over-Raft demo. Real wire framing and socket transport are out of this crate's
//! scope, so this binary simulates the network in-process instead of dialing out.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::{App, Arg};
use log::info;

use quorum_raft::config::RaftConfig;
use quorum_raft::consensus::{ConsensusCore, ConsensusParams};
use quorum_raft::election_store::PersistentElectionStore;
use quorum_raft::protocol::NodeId;
use quorum_raft::transport::LoopbackTransport;

fn parse_ids(raw: &str) -> Vec<NodeId> {
    raw.split(',')
        .filter(|s| !s.is_empty())
        .map(|s| s.trim().parse::<NodeId>().expect("voter ids must be integers"))
        .collect()
}

fn main() {
    env_logger::init();

    let matches = App::new("quorum-raft-demo")
        .about("runs a small in-process quorum over a loopback transport")
        .arg(
            Arg::with_name("voters")
                .long("voters")
                .takes_value(true)
                .default_value("0,1,2")
                .help("comma-separated list of voter node ids"),
        )
        .arg(
            Arg::with_name("dir")
                .long("dir")
                .takes_value(true)
                .default_value("quorum-raft-demo-state")
                .help("directory to hold each node's election-store file"),
        )
        .arg(
            Arg::with_name("ticks")
                .long("ticks")
                .takes_value(true)
                .default_value("200")
                .help("number of poll quanta to run before exiting"),
        )
        .arg(
            Arg::with_name("tick-ms")
                .long("tick-ms")
                .takes_value(true)
                .default_value("20")
                .help("simulated milliseconds advanced per tick"),
        )
        .get_matches();

    let voter_ids = parse_ids(matches.value_of("voters").unwrap());
    let voters: HashSet<NodeId> = voter_ids.iter().cloned().collect();
    let dir = PathBuf::from(matches.value_of("dir").unwrap());
    let ticks: u64 = matches.value_of("ticks").unwrap().parse().expect("ticks must be an integer");
    let tick_ms: u64 = matches
        .value_of("tick-ms")
        .unwrap()
        .parse()
        .expect("tick-ms must be an integer");

    std::fs::create_dir_all(&dir).expect("failed to create state directory");

    let network = LoopbackTransport::network(&voter_ids);
    let mut nodes: Vec<ConsensusCore<LoopbackTransport>> = Vec::new();
    let boot = Instant::now();

    for &id in &voter_ids {
        let config = RaftConfig {
            node_id: id,
            voters: voters.clone(),
            election_store_path: dir.join(format!("node-{}.json", id)),
            ..RaftConfig::default()
        };
        let store = PersistentElectionStore::new(config.election_store_path.clone());
        let params = ConsensusParams {
            node_id: config.node_id,
            voters: config.voters.clone(),
            election_timeout_ms: config.election_timeout_ms,
            election_jitter_ms: config.election_jitter_ms,
            request_timeout_ms: config.request_timeout_ms,
            retry_backoff_ms: config.retry_backoff_ms,
            mailbox_capacity: 64,
        };
        let transport = network[&id].clone();
        let (core, _append_handle) =
            ConsensusCore::new(params, transport, store, boot).expect("failed to load election store");
        nodes.push(core);
    }

    let mut now = boot;
    for tick in 0..ticks {
        now += Duration::from_millis(tick_ms);
        for node in nodes.iter_mut() {
            if node.is_running() {
                node.poll(now, Duration::from_millis(tick_ms))
                    .expect("fatal consensus core error");
            }
        }
        if tick % 20 == 0 {
            for node in &nodes {
                info!(
                    "node {} epoch={} leader={:?} end_offset={} hwm={:?}",
                    node.node_id(),
                    node.epoch(),
                    node.leader(),
                    node.log_end_offset(),
                    node.high_watermark()
                );
            }
        }
    }
}
