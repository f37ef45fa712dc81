//! Node and cluster configuration.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::log::DEFAULT_SEGMENT_SIZE;

/// Which log implementation to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    /// Volatile log, for tests only.
    Memory,
    /// Single-file log.
    SimpleFile,
    /// Segmented log with a manifest, the production variant.
    SegmentedFile,
}

impl FromStr for LogKind {
    type Err = String;

    fn from_str(s: &str) -> Result<LogKind, String> {
        match s {
            "memory" => Ok(LogKind::Memory),
            "simple-file" => Ok(LogKind::SimpleFile),
            "segmented-file" => Ok(LogKind::SegmentedFile),
            other => Err(format!("unknown log type: {}", other)),
        }
    }
}

/// Configuration for a single node.
#[derive(Debug, Clone)]
pub struct Config {
    /// This node's id.
    pub id: u64,
    /// Address this node advertises to clients, `ip:port`.
    pub local_addr: String,
    /// Peer id to address, excluding this node.
    pub peer_addrs: HashMap<u64, String>,
    /// Directory for the replicated log.
    pub log_path: PathBuf,
    /// Directory for the KV backing store's own files.
    pub data_path: PathBuf,
    /// Base election timeout T; actual timeouts are drawn from `[T, 4T]`.
    pub election_timeout: Duration,
    /// Leader heartbeat interval; also the per-call RPC timeout.
    pub heartbeat_interval: Duration,
    /// Segment rollover size for the segmented log.
    pub segment_size: u64,
    pub log_kind: LogKind,
    /// Max entries shipped in one AppendEntries.
    pub replication_batch: usize,
    /// Deadline for client commands waiting on commit and apply.
    pub commit_timeout: Duration,
    /// Vote gate: this node refuses to vote until its commit index and
    /// term have reached these targets. Defaults make the gate vacuous.
    pub vote_target_index: u64,
    pub vote_target_term: u64,
}

impl Default for Config {
    fn default() -> Self {
        let election_timeout = Duration::from_millis(1000);
        Config {
            id: 1,
            local_addr: "127.0.0.1:7100".to_string(),
            peer_addrs: HashMap::new(),
            log_path: PathBuf::from("raft-log"),
            data_path: PathBuf::from("raft-data"),
            election_timeout,
            heartbeat_interval: election_timeout / 3,
            segment_size: DEFAULT_SEGMENT_SIZE,
            log_kind: LogKind::SegmentedFile,
            replication_batch: 64,
            commit_timeout: Duration::from_secs(10),
            vote_target_index: 0,
            vote_target_term: 0,
        }
    }
}

impl Config {
    /// Config for node `id` with the given peers.
    pub fn new(id: u64, peer_addrs: HashMap<u64, String>) -> Self {
        Config {
            id,
            peer_addrs,
            ..Config::default()
        }
    }

    /// Set the base election timeout and derive the heartbeat interval
    /// as a third of it.
    pub fn with_election_timeout(mut self, timeout: Duration) -> Self {
        self.election_timeout = timeout;
        self.heartbeat_interval = timeout / 3;
        self
    }

    pub fn with_log_kind(mut self, kind: LogKind) -> Self {
        self.log_kind = kind;
        self
    }

    pub fn with_segment_size(mut self, size: u64) -> Self {
        self.segment_size = size;
        self
    }

    pub fn with_vote_targets(mut self, index: u64, term: u64) -> Self {
        self.vote_target_index = index;
        self.vote_target_term = term;
        self
    }

    pub fn with_commit_timeout(mut self, timeout: Duration) -> Self {
        self.commit_timeout = timeout;
        self
    }

    /// Draw a randomized election timeout from `[T, 4T]`.
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let base = self.election_timeout.as_millis() as u64;
        let ms = rand::rng().random_range(base..=4 * base);
        Duration::from_millis(ms)
    }

    pub fn peer_ids(&self) -> Vec<u64> {
        self.peer_addrs.keys().copied().collect()
    }
}
