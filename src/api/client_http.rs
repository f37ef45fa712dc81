//! Client-facing HTTP API.
//!
//! Writes, deletes, consensus reads, and lock operations go through the
//! full replication path; dirty reads hit the local store. Non-leader
//! nodes answer 503 with a leader hint so clients can refresh via
//! `/client/leader` and retry.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::core::{NodeId, RaftError, RaftServer, Role};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteRequest {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRequest {
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRequest {
    pub key: String,
    pub holder: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HolderRequest {
    pub holder: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueResponse {
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadAllResponse {
    pub entries: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockResponse {
    pub acquired: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleasedResponse {
    pub released: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader_hint: Option<NodeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderResponse {
    pub node_id: NodeId,
    pub is_leader: bool,
    pub leader_id: Option<NodeId>,
    pub leader_addr: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub node_id: NodeId,
    pub role: String,
    pub term: u64,
    pub leader_id: Option<NodeId>,
    pub commit_index: u64,
    pub apply_index: u64,
    pub last_log_index: u64,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn map_error(err: RaftError) -> ApiError {
    match err {
        RaftError::NotLeader { leader_hint } => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: "no leader".to_string(),
                leader_hint,
            }),
        ),
        RaftError::Timeout => (
            StatusCode::GATEWAY_TIMEOUT,
            Json(ErrorResponse {
                error: "commit timeout".to_string(),
                leader_hint: None,
            }),
        ),
        RaftError::Corruption(msg) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: format!("apply error: {}", msg),
                leader_hint: None,
            }),
        ),
        RaftError::Io(msg) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: format!("storage error: {}", msg),
                leader_hint: None,
            }),
        ),
    }
}

fn not_found(key: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: format!("key not found: {}", key),
            leader_hint: None,
        }),
    )
}

/// Build the client API router.
pub fn create_client_router(server: Arc<RaftServer>) -> Router {
    Router::new()
        .route("/client/write", post(handle_write))
        .route("/client/delete", post(handle_delete))
        .route("/client/read/:key", get(handle_read))
        .route("/client/read_all", get(handle_read_all))
        .route("/client/dirty_read/:key", get(handle_dirty_read))
        .route("/client/try_lock", post(handle_try_lock))
        .route("/client/unlock", post(handle_unlock))
        .route("/client/delete_user", post(handle_delete_user))
        .route("/client/leader", get(handle_leader))
        .route("/client/status", get(handle_status))
        .with_state(server)
}

async fn handle_write(
    State(server): State<Arc<RaftServer>>,
    Json(request): Json<WriteRequest>,
) -> Result<StatusCode, ApiError> {
    server
        .handle_write(&request.key, &request.value)
        .await
        .map_err(map_error)?;
    Ok(StatusCode::OK)
}

async fn handle_delete(
    State(server): State<Arc<RaftServer>>,
    Json(request): Json<KeyRequest>,
) -> Result<StatusCode, ApiError> {
    server.handle_delete(&request.key).await.map_err(map_error)?;
    Ok(StatusCode::OK)
}

async fn handle_read(
    State(server): State<Arc<RaftServer>>,
    Path(key): Path<String>,
) -> Result<Json<ValueResponse>, ApiError> {
    match server.handle_read(&key).await.map_err(map_error)? {
        Some(value) => Ok(Json(ValueResponse { value })),
        None => Err(not_found(&key)),
    }
}

async fn handle_read_all(
    State(server): State<Arc<RaftServer>>,
) -> Result<Json<ReadAllResponse>, ApiError> {
    let entries = server.handle_read_all().await.map_err(map_error)?;
    Ok(Json(ReadAllResponse { entries }))
}

async fn handle_dirty_read(
    State(server): State<Arc<RaftServer>>,
    Path(key): Path<String>,
) -> Result<Json<ValueResponse>, ApiError> {
    match server.dirty_read(&key).map_err(map_error)? {
        Some(value) => Ok(Json(ValueResponse { value })),
        None => Err(not_found(&key)),
    }
}

async fn handle_try_lock(
    State(server): State<Arc<RaftServer>>,
    Json(request): Json<LockRequest>,
) -> Result<Json<LockResponse>, ApiError> {
    let acquired = server
        .handle_try_lock(&request.key, &request.holder)
        .await
        .map_err(map_error)?;
    Ok(Json(LockResponse { acquired }))
}

async fn handle_unlock(
    State(server): State<Arc<RaftServer>>,
    Json(request): Json<LockRequest>,
) -> Result<Json<LockResponse>, ApiError> {
    let released = server
        .handle_unlock(&request.key, &request.holder)
        .await
        .map_err(map_error)?;
    Ok(Json(LockResponse { acquired: released }))
}

async fn handle_delete_user(
    State(server): State<Arc<RaftServer>>,
    Json(request): Json<HolderRequest>,
) -> Result<Json<ReleasedResponse>, ApiError> {
    let released = server
        .handle_delete_user(&request.holder)
        .await
        .map_err(map_error)?;
    Ok(Json(ReleasedResponse { released }))
}

async fn handle_leader(State(server): State<Arc<RaftServer>>) -> Json<LeaderResponse> {
    let status = server.status().await;
    let leader = server.leader().await;
    Json(LeaderResponse {
        node_id: status.id,
        is_leader: status.role == Role::Leader,
        leader_id: leader.as_ref().map(|(id, _)| *id),
        leader_addr: leader.map(|(_, addr)| addr),
    })
}

async fn handle_status(State(server): State<Arc<RaftServer>>) -> Json<StatusResponse> {
    let status = server.status().await;
    Json(StatusResponse {
        node_id: status.id,
        role: format!("{:?}", status.role),
        term: status.term,
        leader_id: status.leader_id,
        commit_index: status.commit_index,
        apply_index: status.apply_index,
        last_log_index: status.last_log_index,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestCluster;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::util::ServiceExt;

    async fn single_node_cluster() -> (TestCluster, Router) {
        let cluster = TestCluster::start(&[1], Duration::from_millis(50));
        cluster
            .wait_for_leader(Duration::from_secs(2))
            .await
            .expect("single node elects itself");
        let router = create_client_router(cluster.server(1).clone());
        (cluster, router)
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_write_then_read() {
        let (cluster, router) = single_node_cluster().await;

        let response = router
            .clone()
            .oneshot(post_json("/client/write", r#"{"key":"k1","value":"v1"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .clone()
            .oneshot(get_req("/client/read/k1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: ValueResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(value.value, "v1");

        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_read_missing_key_is_404() {
        let (cluster, router) = single_node_cluster().await;

        let response = router
            .clone()
            .oneshot(get_req("/client/read/ghost"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_delete_and_read_all() {
        let (cluster, router) = single_node_cluster().await;

        for (k, v) in [("a", "1"), ("b", "2")] {
            let body = format!(r#"{{"key":"{}","value":"{}"}}"#, k, v);
            let response = router
                .clone()
                .oneshot(post_json("/client/write", &body))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = router
            .clone()
            .oneshot(post_json("/client/delete", r#"{"key":"a"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .clone()
            .oneshot(get_req("/client/read_all"))
            .await
            .unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let all: ReadAllResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(all.entries, vec![("b".to_string(), "2".to_string())]);

        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_lock_endpoints() {
        let (cluster, router) = single_node_cluster().await;

        let response = router
            .clone()
            .oneshot(post_json(
                "/client/try_lock",
                r#"{"key":"m","holder":"alice"}"#,
            ))
            .await
            .unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let lock: LockResponse = serde_json::from_slice(&body).unwrap();
        assert!(lock.acquired);

        let response = router
            .clone()
            .oneshot(post_json(
                "/client/try_lock",
                r#"{"key":"m","holder":"bob"}"#,
            ))
            .await
            .unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let lock: LockResponse = serde_json::from_slice(&body).unwrap();
        assert!(!lock.acquired);

        let response = router
            .clone()
            .oneshot(post_json(
                "/client/delete_user",
                r#"{"holder":"alice"}"#,
            ))
            .await
            .unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let released: ReleasedResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(released.released, 1);

        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_write_to_follower_is_rejected_with_hint() {
        let cluster = TestCluster::start(&[1, 2, 3], Duration::from_millis(100));
        let leader = cluster
            .wait_for_leader(Duration::from_secs(5))
            .await
            .expect("a leader is elected");
        let follower = *cluster.servers.keys().find(|&&id| id != leader).unwrap();

        let router = create_client_router(cluster.server(follower).clone());
        // Give the follower a heartbeat so it knows the leader.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let response = router
            .oneshot(post_json("/client/write", r#"{"key":"k","value":"v"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let error: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(error.error, "no leader");
        assert_eq!(error.leader_hint, Some(leader));

        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_status_endpoint() {
        let (cluster, router) = single_node_cluster().await;

        // A completed write pins the counters: NOOP plus this entry are
        // committed and applied by the time it returns.
        let response = router
            .clone()
            .oneshot(post_json("/client/write", r#"{"key":"k","value":"v"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .clone()
            .oneshot(get_req("/client/status"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let status: StatusResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(status.node_id, 1);
        assert_eq!(status.role, "Leader");
        assert!(status.term >= 1);
        assert!(status.commit_index >= 2);
        assert!(status.apply_index >= 2);
        assert_eq!(status.leader_id, Some(1));

        cluster.shutdown().await;
    }
}
