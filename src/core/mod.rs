//! Consensus core: shared raft state, the workers that drive it, and the
//! server facade that clients and the RPC layer talk to.

pub mod apply;
pub mod config;
pub mod peer;
pub mod raft_core;
pub mod server;

pub use config::{Config, LogKind};
pub use raft_core::{
    AppendEntriesArgs, AppendEntriesResult, NodeId, RaftCore, RequestVoteArgs, RequestVoteResult,
    Role,
};
pub use server::{RaftError, RaftServer, Shared, StatusInfo};
