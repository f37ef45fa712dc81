//! HTTP transport: axum for the inbound peer RPC routes, reqwest for the
//! outbound client. Bodies are JSON.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{extract::State, routing::post, Json, Router};

use super::{Transport, TransportError};
use crate::core::{
    AppendEntriesArgs, AppendEntriesResult, NodeId, RaftServer, RequestVoteArgs, RequestVoteResult,
};

/// Outbound peer RPC client.
pub struct HttpTransport {
    client: reqwest::Client,
    peer_addrs: std::collections::HashMap<NodeId, String>,
}

impl HttpTransport {
    /// `timeout` applies per call; the server passes one heartbeat
    /// interval.
    pub fn new(
        peer_addrs: std::collections::HashMap<NodeId, String>,
        timeout: Duration,
    ) -> Result<HttpTransport, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|_| TransportError::ConnectionFailed)?;
        Ok(HttpTransport { client, peer_addrs })
    }

    async fn post_json<Rq: serde::Serialize, Rs: serde::de::DeserializeOwned>(
        &self,
        target: NodeId,
        path: &str,
        args: &Rq,
    ) -> Result<Rs, TransportError> {
        let addr = self
            .peer_addrs
            .get(&target)
            .ok_or(TransportError::NodeNotFound)?;
        let url = format!("http://{}{}", addr, path);
        let response = self
            .client
            .post(&url)
            .json(args)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::ConnectionFailed
                }
            })?;
        response
            .json::<Rs>()
            .await
            .map_err(|_| TransportError::ConnectionFailed)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request_vote(
        &self,
        target: NodeId,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteResult, TransportError> {
        self.post_json(target, "/raft/request_vote", &args).await
    }

    async fn append_entries(
        &self,
        target: NodeId,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, TransportError> {
        self.post_json(target, "/raft/append_entries", &args).await
    }
}

/// Inbound peer RPC routes, backed by the running server.
pub fn create_raft_router(server: Arc<RaftServer>) -> Router {
    Router::new()
        .route("/raft/request_vote", post(handle_request_vote))
        .route("/raft/append_entries", post(handle_append_entries))
        .with_state(server)
}

async fn handle_request_vote(
    State(server): State<Arc<RaftServer>>,
    Json(args): Json<RequestVoteArgs>,
) -> Json<RequestVoteResult> {
    Json(server.handle_request_vote_rpc(args).await)
}

async fn handle_append_entries(
    State(server): State<Arc<RaftServer>>,
    Json(args): Json<AppendEntriesArgs>,
) -> Json<AppendEntriesResult> {
    Json(server.handle_append_entries_rpc(args).await)
}
