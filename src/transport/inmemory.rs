//! In-memory transport for tests: channels instead of sockets, plus a
//! fault injector that cuts directed links to simulate partitions.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use super::{Transport, TransportError};
use crate::core::{
    AppendEntriesArgs, AppendEntriesResult, NodeId, RaftServer, RequestVoteArgs, RequestVoteResult,
};

/// A request delivered to a node's inbox.
pub enum Request {
    RequestVote {
        args: RequestVoteArgs,
        reply: oneshot::Sender<RequestVoteResult>,
    },
    AppendEntries {
        args: AppendEntriesArgs,
        reply: oneshot::Sender<AppendEntriesResult>,
    },
}

/// Shared switchboard: which directed links are currently cut.
#[derive(Clone, Default)]
pub struct FaultInjector {
    cut: Arc<Mutex<HashSet<(NodeId, NodeId)>>>,
}

impl FaultInjector {
    pub fn new() -> FaultInjector {
        FaultInjector::default()
    }

    /// Cut both directions between `a` and `b`.
    pub fn cut_link(&self, a: NodeId, b: NodeId) {
        let mut cut = self.cut.lock();
        cut.insert((a, b));
        cut.insert((b, a));
    }

    /// Isolate `node` from every other node.
    pub fn isolate(&self, node: NodeId, others: &[NodeId]) {
        for &other in others {
            if other != node {
                self.cut_link(node, other);
            }
        }
    }

    /// Restore every link.
    pub fn heal(&self) {
        self.cut.lock().clear();
    }

    fn is_cut(&self, from: NodeId, to: NodeId) -> bool {
        self.cut.lock().contains(&(from, to))
    }
}

/// Channel-backed transport for one node.
pub struct InMemoryTransport {
    id: NodeId,
    senders: HashMap<NodeId, mpsc::Sender<Request>>,
    timeout: Duration,
    faults: FaultInjector,
}

impl InMemoryTransport {
    async fn deliver<Rs>(
        &self,
        target: NodeId,
        request: Request,
        reply_rx: oneshot::Receiver<Rs>,
    ) -> Result<Rs, TransportError> {
        if self.faults.is_cut(self.id, target) {
            // Behaves like an unreachable host.
            tokio::time::sleep(self.timeout).await;
            return Err(TransportError::Timeout);
        }
        let sender = self
            .senders
            .get(&target)
            .ok_or(TransportError::NodeNotFound)?;
        sender
            .send(request)
            .await
            .map_err(|_| TransportError::ConnectionFailed)?;
        tokio::time::timeout(self.timeout, reply_rx)
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|_| TransportError::ConnectionFailed)
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn request_vote(
        &self,
        target: NodeId,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteResult, TransportError> {
        let (reply, reply_rx) = oneshot::channel();
        self.deliver(target, Request::RequestVote { args, reply }, reply_rx)
            .await
    }

    async fn append_entries(
        &self,
        target: NodeId,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, TransportError> {
        let (reply, reply_rx) = oneshot::channel();
        self.deliver(target, Request::AppendEntries { args, reply }, reply_rx)
            .await
    }
}

/// A node's inbox of incoming requests.
pub struct NodeInbox {
    id: NodeId,
    receiver: mpsc::Receiver<Request>,
    faults: FaultInjector,
}

impl NodeInbox {
    /// Serve requests against a running server until every sender is gone.
    /// Requests arriving over a cut link are dropped, so partitions block
    /// both directions.
    pub fn serve(mut self, server: Arc<RaftServer>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(request) = self.receiver.recv().await {
                match request {
                    Request::RequestVote { args, reply } => {
                        if self.faults.is_cut(args.candidate_id, self.id) {
                            continue;
                        }
                        let result = server.handle_request_vote_rpc(args).await;
                        let _ = reply.send(result);
                    }
                    Request::AppendEntries { args, reply } => {
                        if self.faults.is_cut(args.leader_id, self.id) {
                            continue;
                        }
                        let result = server.handle_append_entries_rpc(args).await;
                        let _ = reply.send(result);
                    }
                }
            }
        })
    }
}

/// Build transports and inboxes for a cluster, all wired to one fault
/// injector.
pub fn create_cluster(
    node_ids: &[NodeId],
    timeout: Duration,
) -> (
    HashMap<NodeId, InMemoryTransport>,
    HashMap<NodeId, NodeInbox>,
    FaultInjector,
) {
    let faults = FaultInjector::new();
    let mut senders: HashMap<NodeId, mpsc::Sender<Request>> = HashMap::new();
    let mut inboxes: HashMap<NodeId, NodeInbox> = HashMap::new();

    for &id in node_ids {
        let (tx, rx) = mpsc::channel(64);
        senders.insert(id, tx);
        inboxes.insert(
            id,
            NodeInbox {
                id,
                receiver: rx,
                faults: faults.clone(),
            },
        );
    }

    let mut transports = HashMap::new();
    for &id in node_ids {
        let peer_senders = senders
            .iter()
            .filter(|(&other, _)| other != id)
            .map(|(&other, tx)| (other, tx.clone()))
            .collect();
        transports.insert(
            id,
            InMemoryTransport {
                id,
                senders: peer_senders,
                timeout,
                faults: faults.clone(),
            },
        );
    }

    (transports, inboxes, faults)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vote_args(candidate_id: NodeId) -> RequestVoteArgs {
        RequestVoteArgs {
            term: 1,
            candidate_id,
            last_log_index: 0,
            last_log_term: 0,
        }
    }

    #[test]
    fn test_fault_injector_cut_and_heal() {
        let faults = FaultInjector::new();
        assert!(!faults.is_cut(1, 2));

        faults.cut_link(1, 2);
        assert!(faults.is_cut(1, 2));
        assert!(faults.is_cut(2, 1));
        assert!(!faults.is_cut(1, 3));

        faults.heal();
        assert!(!faults.is_cut(1, 2));
    }

    #[test]
    fn test_isolate_cuts_every_link() {
        let faults = FaultInjector::new();
        faults.isolate(1, &[1, 2, 3]);
        assert!(faults.is_cut(1, 2));
        assert!(faults.is_cut(3, 1));
        assert!(!faults.is_cut(2, 3));
    }

    #[tokio::test]
    async fn test_unknown_peer_is_an_error() {
        let (transports, _inboxes, _faults) =
            create_cluster(&[1, 2], Duration::from_millis(50));
        let result = transports[&1].request_vote(99, vote_args(1)).await;
        assert!(matches!(result, Err(TransportError::NodeNotFound)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cut_link_behaves_like_timeout() {
        let (transports, _inboxes, faults) =
            create_cluster(&[1, 2], Duration::from_millis(50));
        faults.cut_link(1, 2);
        let result = transports[&1].request_vote(2, vote_args(1)).await;
        assert!(matches!(result, Err(TransportError::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unserved_inbox_times_out() {
        let (transports, _inboxes, _faults) =
            create_cluster(&[1, 2], Duration::from_millis(50));
        // Nobody serves node 2's inbox, so the call hangs until the
        // per-call timeout.
        let result = transports[&1].request_vote(2, vote_args(1)).await;
        assert!(matches!(result, Err(TransportError::Timeout)));
    }
}
