//! Raft server: owns the shared core, runs the workers, and exposes the
//! client-facing command handlers.
//!
//! Workers: one election timer, one disk-sync worker (leader only), one
//! apply engine, and one replicator per peer. They coordinate through the
//! core mutex and a watch channel that plays the role of a broadcast
//! condition variable: every state change bumps the version and every
//! waiter re-checks its predicate.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{info, warn};

use super::apply::run_apply_engine;
use super::config::Config;
use super::peer::run_peer;
use super::raft_core::{
    AppendEntriesArgs, AppendEntriesResult, NodeId, RaftCore, RequestVoteArgs, RequestVoteResult,
    Role,
};
use crate::command::{Command, CommandOutcome};
use crate::log::{Log, LogIndex, Term};
use crate::state_machine::{SharedStore, Store};
use crate::transport::Transport;

/// Errors surfaced to clients.
#[derive(Debug, Clone, Error)]
pub enum RaftError {
    /// This node is not the leader; retry against the hinted node.
    #[error("no leader")]
    NotLeader { leader_hint: Option<NodeId> },
    /// The command did not commit within the deadline. Outcome unknown:
    /// it may still commit and apply later.
    #[error("commit timeout")]
    Timeout,
    /// The entry committed but could not be applied deterministically.
    #[error("apply error: {0}")]
    Corruption(String),
    /// Disk failure; the node has stepped down and halted writes.
    #[error("storage error: {0}")]
    Io(String),
}

/// Snapshot of a node's consensus state for introspection.
#[derive(Debug, Clone)]
pub struct StatusInfo {
    pub id: NodeId,
    pub role: Role,
    pub term: Term,
    pub leader_id: Option<NodeId>,
    pub commit_index: LogIndex,
    pub apply_index: LogIndex,
    pub last_log_index: LogIndex,
}

/// State shared between the server handle and every worker.
pub struct Shared {
    pub core: Mutex<RaftCore>,
    pub config: Config,
    /// Client waiters keyed by log index, tagged with the term of the
    /// entry they are waiting for.
    pub waiters: parking_lot::Mutex<HashMap<LogIndex, (Term, oneshot::Sender<CommandOutcome>)>>,
    changed_tx: watch::Sender<u64>,
}

impl Shared {
    /// Wake every worker and client waiter to re-check its predicate.
    pub fn notify(&self) {
        self.changed_tx.send_modify(|version| *version += 1);
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changed_tx.subscribe()
    }
}

/// A running Raft node.
pub struct RaftServer {
    shared: Arc<Shared>,
    store: SharedStore,
    workers: Mutex<Workers>,
}

#[derive(Default)]
struct Workers {
    peers: Vec<JoinHandle<()>>,
    election_timer: Option<JoinHandle<()>>,
    disk_sync: Option<JoinHandle<()>>,
    apply: Option<JoinHandle<()>>,
}

impl RaftServer {
    /// Bring the node up: restore state from the log and spawn every
    /// worker. The node starts as a follower with a fresh election timer.
    pub fn start<T: Transport + 'static>(
        config: Config,
        log: Box<dyn Log>,
        store: SharedStore,
        transport: Arc<T>,
    ) -> Arc<RaftServer> {
        let mut core = RaftCore::new(config.clone(), log);
        info!(
            id = core.id,
            term = core.current_term,
            last_log_index = core.log.last_index(),
            apply_index = core.apply_index,
            "starting raft node"
        );
        core.set_election_timer();

        let (changed_tx, _) = watch::channel(0u64);
        let shared = Arc::new(Shared {
            core: Mutex::new(core),
            config: config.clone(),
            waiters: parking_lot::Mutex::new(HashMap::new()),
            changed_tx,
        });

        let mut workers = Workers::default();
        for peer_id in config.peer_ids() {
            workers
                .peers
                .push(tokio::spawn(run_peer(shared.clone(), transport.clone(), peer_id)));
        }
        workers.election_timer = Some(tokio::spawn(run_election_timer(shared.clone())));
        workers.disk_sync = Some(tokio::spawn(run_disk_sync(shared.clone())));
        workers.apply = Some(tokio::spawn(run_apply_engine(shared.clone(), store.clone())));

        Arc::new(RaftServer {
            shared,
            store,
            workers: Mutex::new(workers),
        })
    }

    pub fn shared(&self) -> Arc<Shared> {
        self.shared.clone()
    }

    /// Stop every worker and wait for them, peers first, then the timer,
    /// the disk-sync worker (which drains any owed sync), and the apply
    /// engine last.
    pub async fn shutdown(&self) {
        {
            let mut core = self.shared.core.lock().await;
            core.exiting = true;
        }
        self.shared.notify();

        let mut workers = self.workers.lock().await;
        let _ = futures::future::join_all(workers.peers.drain(..)).await;
        for handle in [
            workers.election_timer.take(),
            workers.disk_sync.take(),
            workers.apply.take(),
        ]
        .into_iter()
        .flatten()
        {
            let _ = handle.await;
        }
        info!("raft node stopped");
    }

    // === Client operations ===

    pub async fn handle_write(&self, key: &str, value: &str) -> Result<(), RaftError> {
        let outcome = self
            .submit(Command::Write {
                key: key.to_string(),
                value: value.to_string(),
            })
            .await?;
        expect_done(outcome)
    }

    pub async fn handle_delete(&self, key: &str) -> Result<(), RaftError> {
        let outcome = self
            .submit(Command::Delete {
                key: key.to_string(),
            })
            .await?;
        expect_done(outcome)
    }

    /// Linearizable read: serialized through the log like a write.
    pub async fn handle_read(&self, key: &str) -> Result<Option<String>, RaftError> {
        let outcome = self
            .submit(Command::Read {
                key: key.to_string(),
            })
            .await?;
        match outcome {
            CommandOutcome::Value(value) => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    pub async fn handle_read_all(&self) -> Result<Vec<(String, String)>, RaftError> {
        match self.submit(Command::ReadAll).await? {
            CommandOutcome::All(pairs) => Ok(pairs),
            other => Err(unexpected(other)),
        }
    }

    /// Returns whether the lock was acquired.
    pub async fn handle_try_lock(&self, key: &str, holder: &str) -> Result<bool, RaftError> {
        let outcome = self
            .submit(Command::TryLock {
                key: key.to_string(),
                holder: holder.to_string(),
            })
            .await?;
        match outcome {
            CommandOutcome::Lock(acquired) => Ok(acquired),
            other => Err(unexpected(other)),
        }
    }

    /// Returns whether the lock was released.
    pub async fn handle_unlock(&self, key: &str, holder: &str) -> Result<bool, RaftError> {
        let outcome = self
            .submit(Command::UnLock {
                key: key.to_string(),
                holder: holder.to_string(),
            })
            .await?;
        match outcome {
            CommandOutcome::Lock(released) => Ok(released),
            other => Err(unexpected(other)),
        }
    }

    /// Release every lock held by `holder`; returns how many.
    pub async fn handle_delete_user(&self, holder: &str) -> Result<u64, RaftError> {
        let outcome = self
            .submit(Command::DeleteUser {
                holder: holder.to_string(),
            })
            .await?;
        match outcome {
            CommandOutcome::Released(count) => Ok(count),
            other => Err(unexpected(other)),
        }
    }

    /// Read straight from the local store, no consensus round-trip. May
    /// lag behind the leader.
    pub fn dirty_read(&self, key: &str) -> Result<Option<String>, RaftError> {
        self.store
            .get(key)
            .map_err(|e| RaftError::Io(e.to_string()))
    }

    /// `(id, address)` of the current leader, if known.
    pub async fn leader(&self) -> Option<(NodeId, String)> {
        let core = self.shared.core.lock().await;
        let leader_id = core.leader_id?;
        let addr = if leader_id == core.id {
            self.shared.config.local_addr.clone()
        } else {
            self.shared.config.peer_addrs.get(&leader_id)?.clone()
        };
        Some((leader_id, addr))
    }

    pub async fn status(&self) -> StatusInfo {
        let core = self.shared.core.lock().await;
        StatusInfo {
            id: core.id,
            role: core.role,
            term: core.current_term,
            leader_id: core.leader_id,
            commit_index: core.commit_index,
            apply_index: core.apply_index,
            last_log_index: core.log.last_index(),
        }
    }

    /// Append one command as leader, wait for commit and apply, return the
    /// apply outcome. The whole wait is bounded by the commit timeout.
    async fn submit(&self, cmd: Command) -> Result<CommandOutcome, RaftError> {
        let deadline = Instant::now() + self.shared.config.commit_timeout;

        let (index, outcome_rx) = {
            let mut core = self.shared.core.lock().await;
            match core.replicate(&cmd) {
                Err(e) => {
                    core.halt(&format!("appending client command: {}", e));
                    drop(core);
                    self.shared.notify();
                    return Err(RaftError::Io(e.to_string()));
                }
                Ok(None) => {
                    return Err(RaftError::NotLeader {
                        leader_hint: core.leader_id,
                    })
                }
                Ok(Some(index)) => {
                    // Register before releasing the mutex so the apply
                    // engine cannot pass this index without seeing us.
                    let (tx, rx) = oneshot::channel();
                    self.shared
                        .waiters
                        .lock()
                        .insert(index, (core.current_term, tx));
                    (index, rx)
                }
            }
        };
        self.shared.notify();

        let result = self.wait_for_commit_index(index, deadline).await;
        if result.is_err() {
            self.shared.waiters.lock().remove(&index);
            return Err(result.unwrap_err());
        }

        match timeout_at(deadline, outcome_rx).await {
            Err(_) => {
                self.shared.waiters.lock().remove(&index);
                Err(RaftError::Timeout)
            }
            // Sender dropped: the entry at this index was replaced or the
            // node is shutting down. The outcome is unknown.
            Ok(Err(_)) => Err(RaftError::Timeout),
            Ok(Ok(CommandOutcome::Failed(msg))) => Err(RaftError::Corruption(msg)),
            Ok(Ok(outcome)) => Ok(outcome),
        }
    }

    /// Block until `commit_index >= index` or the deadline passes. On
    /// timeout the entry may still commit later; clients must treat
    /// writes as at-least-once unless they encode idempotency.
    pub async fn wait_for_commit_index(
        &self,
        index: LogIndex,
        deadline: Instant,
    ) -> Result<(), RaftError> {
        let mut changed = self.shared.subscribe();
        loop {
            {
                let core = self.shared.core.lock().await;
                if core.commit_index >= index {
                    return Ok(());
                }
                if core.exiting {
                    return Err(RaftError::Timeout);
                }
            }
            match timeout_at(deadline, changed.changed()).await {
                Err(_) => return Err(RaftError::Timeout),
                Ok(Err(_)) => return Err(RaftError::Timeout),
                Ok(Ok(())) => {}
            }
        }
    }

    // === Peer RPC ingress ===

    pub async fn handle_request_vote_rpc(&self, args: RequestVoteArgs) -> RequestVoteResult {
        let result = {
            let mut core = self.shared.core.lock().await;
            match core.handle_request_vote(&args) {
                Ok(result) => result,
                Err(e) => {
                    // A vote that cannot be persisted must not be granted.
                    core.halt(&format!("persisting vote: {}", e));
                    RequestVoteResult {
                        term: core.current_term,
                        granted: false,
                    }
                }
            }
        };
        self.shared.notify();
        result
    }

    pub async fn handle_append_entries_rpc(&self, args: AppendEntriesArgs) -> AppendEntriesResult {
        let result = {
            let mut core = self.shared.core.lock().await;
            match core.handle_append_entries(&args) {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "append entries failed");
                    core.halt(&format!("appending replicated entries: {}", e));
                    AppendEntriesResult {
                        term: core.current_term,
                        success: false,
                    }
                }
            }
        };
        self.shared.notify();
        result
    }
}

fn expect_done(outcome: CommandOutcome) -> Result<(), RaftError> {
    match outcome {
        CommandOutcome::Done => Ok(()),
        other => Err(unexpected(other)),
    }
}

fn unexpected(outcome: CommandOutcome) -> RaftError {
    RaftError::Corruption(format!("unexpected apply outcome: {:?}", outcome))
}

/// Election timer worker: sleeps until the deadline, re-checks under the
/// lock, and starts an election if it really elapsed. Leaders have no
/// deadline.
async fn run_election_timer(shared: Arc<Shared>) {
    let mut changed = shared.subscribe();
    loop {
        let deadline = {
            let mut core = shared.core.lock().await;
            if core.exiting {
                break;
            }
            match core.start_election_at {
                Some(at) if Instant::now() >= at => {
                    if let Err(e) = core.start_new_election() {
                        core.halt(&format!("persisting election metadata: {}", e));
                    }
                    drop(core);
                    shared.notify();
                    continue;
                }
                other => other,
            }
        };
        match deadline {
            Some(at) => {
                tokio::select! {
                    _ = sleep_until(at) => {}
                    result = changed.changed() => {
                        if result.is_err() {
                            break;
                        }
                    }
                }
            }
            None => {
                if changed.changed().await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Disk-sync worker: while leader, takes the pending sync handle, waits
/// for durability with the core mutex released, then records the synced
/// index and re-runs commit advancement. Keeping the fsync off the core
/// mutex keeps peer replies and incoming RPCs flowing during the flush.
async fn run_disk_sync(shared: Arc<Shared>) {
    let mut changed = shared.subscribe();
    loop {
        let sync = {
            let mut core = shared.core.lock().await;
            if core.exiting {
                // Drain owed work before leaving.
                if core.log_sync_queued {
                    core.log_sync_queued = false;
                    if let Ok(mut sync) = core.log.take_sync() {
                        let _ = sync.wait();
                    }
                }
                break;
            }
            if core.role == Role::Leader && core.log_sync_queued {
                core.log_sync_queued = false;
                match core.log.take_sync() {
                    Ok(sync) => Some(sync),
                    Err(e) => {
                        core.halt(&format!("taking sync handle: {}", e));
                        None
                    }
                }
            } else {
                None
            }
        };

        match sync {
            Some(mut sync) => {
                let result = sync.wait();
                let mut core = shared.core.lock().await;
                match result {
                    Ok(()) => {
                        // The log may have been truncated while we were
                        // flushing; never report beyond its current end.
                        let synced = core
                            .last_synced_index
                            .max(sync.last_index())
                            .min(core.log.last_index());
                        core.last_synced_index = synced;
                        core.advance_commit_index();
                    }
                    Err(e) => {
                        core.halt(&format!("log sync failed: {}", e));
                    }
                }
                drop(core);
                shared.notify();
            }
            None => {
                if changed.changed().await.is_err() {
                    break;
                }
            }
        }
    }
}
