//! Per-peer replicator.
//!
//! One task per remote peer. In replication mode (we are leader) it ships
//! log entries and heartbeats and feeds acknowledgments back into commit
//! advancement; in election mode (we are candidate) it asks the peer for
//! its vote, once per term. All shared state is read and written under the
//! core mutex; the RPC itself happens with the mutex released.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, warn};

use super::raft_core::{
    AppendEntriesArgs, NodeId, RequestVoteArgs, Role,
};
use super::server::Shared;
use crate::log::{LogIndex, Term};
use crate::transport::Transport;

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);

/// What the worker decided to do while holding the lock.
enum Plan {
    Exit,
    /// Nothing to send; wake on state change or at the deadline.
    Wait(Option<Instant>),
    /// Ship an AppendEntries; on success the peer matches `new_match`.
    Append {
        args: AppendEntriesArgs,
        new_match: LogIndex,
        sent_term: Term,
    },
    /// Ask for a vote in `sent_term`.
    Vote {
        args: RequestVoteArgs,
        sent_term: Term,
    },
}

pub(crate) async fn run_peer<T: Transport>(
    shared: Arc<Shared>,
    transport: Arc<T>,
    peer_id: NodeId,
) {
    let mut changed = shared.subscribe();
    let heartbeat_interval = shared.config.heartbeat_interval;
    let batch_limit = shared.config.replication_batch;
    let mut next_heartbeat = Instant::now();
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let plan = {
            let mut core = shared.core.lock().await;
            if core.exiting {
                Plan::Exit
            } else {
                match core.role {
                    Role::Leader => {
                        let next_index = core.peers[&peer_id].next_index;
                        let last_index = core.log.last_index();
                        if last_index >= next_index || Instant::now() >= next_heartbeat {
                            let prev_log_index = next_index - 1;
                            let prev_log_term = if prev_log_index == 0 {
                                0
                            } else {
                                match core.log.entry(prev_log_index) {
                                    Ok(entry) => entry.term,
                                    Err(e) => {
                                        warn!(peer = peer_id, index = prev_log_index, error = %e,
                                              "cannot read previous entry for peer");
                                        core.halt("replication read failure");
                                        continue;
                                    }
                                }
                            };
                            let upper = last_index.min(next_index + batch_limit as u64 - 1);
                            let mut entries = Vec::new();
                            let mut read_failed = false;
                            for index in next_index..=upper {
                                match core.log.entry(index) {
                                    Ok(entry) => entries.push(entry),
                                    Err(e) => {
                                        warn!(peer = peer_id, index, error = %e,
                                              "cannot read entry for peer");
                                        read_failed = true;
                                        break;
                                    }
                                }
                            }
                            if read_failed {
                                core.halt("replication read failure");
                                continue;
                            }
                            let new_match = prev_log_index + entries.len() as u64;
                            Plan::Append {
                                args: AppendEntriesArgs {
                                    term: core.current_term,
                                    leader_id: core.id,
                                    prev_log_index,
                                    prev_log_term,
                                    entries,
                                    commit_index: core.commit_index,
                                },
                                new_match,
                                sent_term: core.current_term,
                            }
                        } else {
                            Plan::Wait(Some(next_heartbeat))
                        }
                    }
                    Role::Candidate => {
                        let term = core.current_term;
                        let (last_log_term, last_log_index) = core.log.last_term_and_index();
                        let candidate_id = core.id;
                        let peer = core.peers.get_mut(&peer_id).expect("peer exists");
                        if peer.vote_requested_term < term {
                            peer.vote_requested_term = term;
                            Plan::Vote {
                                args: RequestVoteArgs {
                                    term,
                                    candidate_id,
                                    last_log_index,
                                    last_log_term,
                                },
                                sent_term: term,
                            }
                        } else {
                            Plan::Wait(None)
                        }
                    }
                    Role::Follower => Plan::Wait(None),
                }
            }
        };

        match plan {
            Plan::Exit => break,
            Plan::Wait(deadline) => match deadline {
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
            },
            Plan::Append {
                args,
                new_match,
                sent_term,
            } => {
                let sent_entries = !args.entries.is_empty();
                let reply = timeout(heartbeat_interval, transport.append_entries(peer_id, args))
                    .await;
                next_heartbeat = Instant::now() + heartbeat_interval;
                match reply {
                    Ok(Ok(reply)) => {
                        backoff = INITIAL_BACKOFF;
                        let mut core = shared.core.lock().await;
                        if reply.term > core.current_term {
                            if let Err(e) = core.observe_term(reply.term) {
                                core.halt(&format!("persisting term: {}", e));
                            }
                            drop(core);
                            shared.notify();
                            continue;
                        }
                        // A stale reply from an earlier term or leadership
                        // must not move replication state.
                        if core.role != Role::Leader || core.current_term != sent_term {
                            continue;
                        }
                        let peer = core.peers.get_mut(&peer_id).expect("peer exists");
                        peer.last_contact = Some(Instant::now());
                        if reply.success {
                            if new_match > peer.match_index {
                                peer.match_index = new_match;
                            }
                            peer.next_index = new_match + 1;
                            if sent_entries {
                                debug!(peer = peer_id, match_index = new_match, "peer acknowledged entries");
                            }
                            if core.advance_commit_index() {
                                drop(core);
                                shared.notify();
                            }
                        } else {
                            // Log mismatch: back next_index off one entry
                            // and retry from there.
                            if peer.next_index > 1 {
                                peer.next_index -= 1;
                            }
                            debug!(peer = peer_id, next_index = peer.next_index, "peer rejected entries, backing off");
                        }
                    }
                    _ => {
                        sleep(backoff).await;
                        backoff = (backoff * 2).min(heartbeat_interval);
                    }
                }
            }
            Plan::Vote { args, sent_term } => {
                let reply = timeout(heartbeat_interval, transport.request_vote(peer_id, args))
                    .await;
                match reply {
                    Ok(Ok(reply)) => {
                        backoff = INITIAL_BACKOFF;
                        let mut core = shared.core.lock().await;
                        if reply.term > core.current_term {
                            if let Err(e) = core.observe_term(reply.term) {
                                core.halt(&format!("persisting term: {}", e));
                            }
                            drop(core);
                            shared.notify();
                            continue;
                        }
                        if core.role != Role::Candidate || core.current_term != sent_term {
                            continue;
                        }
                        if reply.granted {
                            core.peers
                                .get_mut(&peer_id)
                                .expect("peer exists")
                                .have_vote = true;
                            debug!(peer = peer_id, term = sent_term, "vote received");
                            if core.vote_quorum_reached() {
                                if let Err(e) = core.become_leader() {
                                    core.halt(&format!("becoming leader: {}", e));
                                }
                                drop(core);
                                shared.notify();
                            }
                        }
                    }
                    _ => {
                        // Ask again after backing off; a repeated request
                        // for the same term is answered idempotently.
                        {
                            let mut core = shared.core.lock().await;
                            if let Some(peer) = core.peers.get_mut(&peer_id) {
                                if peer.vote_requested_term == sent_term {
                                    peer.vote_requested_term = sent_term - 1;
                                }
                            }
                        }
                        sleep(backoff).await;
                        backoff = (backoff * 2).min(heartbeat_interval);
                    }
                }
            }
        }
    }
}
