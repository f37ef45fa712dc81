//! Three real nodes over HTTP on loopback: election, write path, follower
//! behavior, dirty reads.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time::{sleep, Instant};

use quorumkv::api::client_http::create_client_router;
use quorumkv::core::{Config, LogKind, RaftServer};
use quorumkv::log::MemoryLog;
use quorumkv::state_machine::shared_store;
use quorumkv::transport::http::{create_raft_router, HttpTransport};

const ELECTION_TIMEOUT: Duration = Duration::from_millis(200);

struct HttpNode {
    server: Arc<RaftServer>,
    api_addr: String,
}

/// Bind listeners first so every node knows its peers' transport
/// addresses, then start the raft servers and both HTTP surfaces.
async fn start_http_cluster(node_ids: &[u64]) -> HashMap<u64, HttpNode> {
    let mut transport_listeners = HashMap::new();
    let mut transport_addrs = HashMap::new();
    for &id in node_ids {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        transport_addrs.insert(id, listener.local_addr().unwrap().to_string());
        transport_listeners.insert(id, listener);
    }

    let mut nodes = HashMap::new();
    for &id in node_ids {
        let api_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let api_addr = api_listener.local_addr().unwrap().to_string();

        let peer_addrs: HashMap<u64, String> = transport_addrs
            .iter()
            .filter(|(&other, _)| other != id)
            .map(|(&other, addr)| (other, addr.clone()))
            .collect();
        let mut config = Config::new(id, peer_addrs.clone())
            .with_election_timeout(ELECTION_TIMEOUT)
            .with_commit_timeout(Duration::from_secs(3))
            .with_log_kind(LogKind::Memory);
        config.local_addr = transport_addrs[&id].clone();

        let transport = Arc::new(
            HttpTransport::new(peer_addrs, config.heartbeat_interval).unwrap(),
        );
        let server = RaftServer::start(
            config,
            Box::new(MemoryLog::new()),
            shared_store(),
            transport,
        );

        let raft_router = create_raft_router(server.clone());
        let transport_listener = transport_listeners.remove(&id).unwrap();
        tokio::spawn(async move {
            axum::serve(transport_listener, raft_router).await.unwrap();
        });

        let client_router = create_client_router(server.clone());
        tokio::spawn(async move {
            axum::serve(api_listener, client_router).await.unwrap();
        });

        nodes.insert(id, HttpNode { server, api_addr });
    }
    nodes
}

async fn wait_for_http_leader(nodes: &HashMap<u64, HttpNode>, timeout: Duration) -> Option<u64> {
    let client = reqwest::Client::new();
    let deadline = Instant::now() + timeout;
    loop {
        for node in nodes.values() {
            let url = format!("http://{}/client/leader", node.api_addr);
            if let Ok(response) = client.get(&url).send().await {
                if let Ok(body) = response.json::<serde_json::Value>().await {
                    if body["is_leader"].as_bool() == Some(true) {
                        return body["node_id"].as_u64();
                    }
                }
            }
        }
        if Instant::now() >= deadline {
            return None;
        }
        sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_http_cluster_write_and_read() {
    let nodes = start_http_cluster(&[1, 2, 3]).await;
    let client = reqwest::Client::new();

    let leader = wait_for_http_leader(&nodes, Duration::from_secs(5))
        .await
        .expect("leader elected over http");
    let leader_addr = &nodes[&leader].api_addr;

    // Write through the leader.
    let response = client
        .post(format!("http://{}/client/write", leader_addr))
        .json(&serde_json::json!({"key": "k1", "value": "v1"}))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    // Linearizable read through the leader.
    let response = client
        .get(format!("http://{}/client/read/k1", leader_addr))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["value"], "v1");

    // Consensus read on a follower: 503 with a leader hint.
    let follower = *nodes.keys().find(|&&id| id != leader).unwrap();
    let follower_addr = &nodes[&follower].api_addr;
    let response = client
        .get(format!("http://{}/client/read/k1", follower_addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["leader_hint"].as_u64(), Some(leader));

    // Dirty read on the follower sees the value once applied there.
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let response = client
            .get(format!("http://{}/client/dirty_read/k1", follower_addr))
            .send()
            .await
            .unwrap();
        if response.status().is_success() {
            let body: serde_json::Value = response.json().await.unwrap();
            assert_eq!(body["value"], "v1");
            break;
        }
        assert!(
            Instant::now() < deadline,
            "follower never applied the write"
        );
        sleep(Duration::from_millis(20)).await;
    }

    for node in nodes.values() {
        node.server.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_http_leader_endpoint_resolves_address() {
    let nodes = start_http_cluster(&[1, 2, 3]).await;
    let client = reqwest::Client::new();

    let leader = wait_for_http_leader(&nodes, Duration::from_secs(5))
        .await
        .expect("leader elected over http");

    // Give heartbeats a moment to tell every follower who leads.
    sleep(ELECTION_TIMEOUT).await;

    for (&id, node) in &nodes {
        let url = format!("http://{}/client/leader", node.api_addr);
        let body: serde_json::Value =
            client.get(&url).send().await.unwrap().json().await.unwrap();
        assert_eq!(body["node_id"].as_u64(), Some(id));
        assert_eq!(body["leader_id"].as_u64(), Some(leader), "node {}", id);
        assert!(body["leader_addr"].as_str().is_some());
    }

    for node in nodes.values() {
        node.server.shutdown().await;
    }
}
