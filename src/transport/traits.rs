//! Transport abstraction for peer RPC.
//!
//! Raft needs exactly two calls between peers. The transport is a plain
//! request/response envelope layer; retries, backoff, and term checks all
//! live in the peer replicators.

use async_trait::async_trait;
use thiserror::Error;

use crate::core::{
    AppendEntriesArgs, AppendEntriesResult, NodeId, RequestVoteArgs, RequestVoteResult,
};

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("connection failed")]
    ConnectionFailed,
    #[error("request timed out")]
    Timeout,
    #[error("unknown peer")]
    NodeNotFound,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a RequestVote RPC to a peer.
    async fn request_vote(
        &self,
        target: NodeId,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteResult, TransportError>;

    /// Send an AppendEntries RPC to a peer.
    async fn append_entries(
        &self,
        target: NodeId,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, TransportError>;
}
