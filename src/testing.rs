//! Cluster-building helpers for integration tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use crate::core::{Config, NodeId, RaftServer, Role};
use crate::log::MemoryLog;
use crate::state_machine::{shared_store, SharedStore};
use crate::transport::inmemory::{create_cluster, FaultInjector};

/// An in-process cluster over the in-memory transport.
pub struct TestCluster {
    pub servers: HashMap<NodeId, Arc<RaftServer>>,
    pub stores: HashMap<NodeId, SharedStore>,
    pub faults: FaultInjector,
    inbox_tasks: Vec<JoinHandle<()>>,
}

impl TestCluster {
    /// Start `node_ids` with in-memory logs and stores. The RPC timeout
    /// is one heartbeat interval, as in a real deployment.
    pub fn start(node_ids: &[NodeId], election_timeout: Duration) -> TestCluster {
        let (mut transports, mut inboxes, faults) =
            create_cluster(node_ids, election_timeout / 3);

        let mut servers = HashMap::new();
        let mut stores = HashMap::new();
        let mut inbox_tasks = Vec::new();

        for &id in node_ids {
            let peer_addrs: HashMap<NodeId, String> = node_ids
                .iter()
                .filter(|&&other| other != id)
                .map(|&other| (other, format!("127.0.0.1:{}", 7100 + other)))
                .collect();
            let config = Config::new(id, peer_addrs)
                .with_election_timeout(election_timeout)
                .with_commit_timeout(election_timeout * 10)
                .with_log_kind(crate::core::LogKind::Memory);

            let store = shared_store();
            let transport = Arc::new(transports.remove(&id).expect("transport built"));
            let server = RaftServer::start(
                config,
                Box::new(MemoryLog::new()),
                store.clone(),
                transport,
            );
            let inbox = inboxes.remove(&id).expect("inbox built");
            inbox_tasks.push(inbox.serve(server.clone()));
            servers.insert(id, server);
            stores.insert(id, store);
        }

        TestCluster {
            servers,
            stores,
            faults,
            inbox_tasks,
        }
    }

    pub fn server(&self, id: NodeId) -> &Arc<RaftServer> {
        &self.servers[&id]
    }

    /// Wait until some node reports itself leader, or give up at the
    /// deadline.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<NodeId> {
        self.wait_for_leader_among(
            &self.servers.keys().copied().collect::<Vec<_>>(),
            timeout,
        )
        .await
    }

    /// Wait for a leader among a subset of nodes (the rest may be
    /// partitioned away).
    pub async fn wait_for_leader_among(
        &self,
        candidates: &[NodeId],
        timeout: Duration,
    ) -> Option<NodeId> {
        let deadline = Instant::now() + timeout;
        loop {
            for &id in candidates {
                let status = self.servers[&id].status().await;
                if status.role == Role::Leader {
                    return Some(id);
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until `node`'s apply index reaches `index`.
    pub async fn wait_for_apply(&self, node: NodeId, index: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.servers[&node].status().await.apply_index >= index {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn shutdown(self) {
        for server in self.servers.values() {
            server.shutdown().await;
        }
        for task in self.inbox_tasks {
            task.abort();
        }
    }
}
