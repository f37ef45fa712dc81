//! Raft consensus state and transitions.
//!
//! Everything in [`RaftCore`] lives under one mutex. The workers (election
//! timer, disk-sync worker, apply engine, one replicator per peer) lock it,
//! mutate, and release before doing any I/O other than the follower-side
//! log flush; waiting happens on the server's state-changed channel.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::config::Config;
use crate::command::Command;
use crate::log::{Entry, Log, LogError, LogIndex, Metadata, Term};

pub type NodeId = u64;

/// Node role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Per-peer replication and election bookkeeping. Owned by the peer's
/// replicator task but only ever touched under the core mutex.
#[derive(Debug, Clone)]
pub struct PeerState {
    /// Next log index to send.
    pub next_index: LogIndex,
    /// Highest index known to be replicated on the peer.
    pub match_index: LogIndex,
    /// Vote granted by this peer in the current election.
    pub have_vote: bool,
    /// Term of the last RequestVote sent, so each election asks once.
    pub vote_requested_term: Term,
    /// Most recent successful reply.
    pub last_contact: Option<Instant>,
}

impl PeerState {
    fn new() -> PeerState {
        PeerState {
            next_index: 1,
            match_index: 0,
            have_vote: false,
            vote_requested_term: 0,
            last_contact: None,
        }
    }
}

/// RequestVote RPC arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

/// RequestVote RPC result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResult {
    pub term: Term,
    pub granted: bool,
}

/// AppendEntries RPC arguments. Entry indexes are implied: the first entry
/// is at `prev_log_index + 1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<Entry>,
    pub commit_index: LogIndex,
}

/// AppendEntries RPC result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResult {
    pub term: Term,
    pub success: bool,
}

/// Consensus state shared by every worker.
pub struct RaftCore {
    pub id: NodeId,
    pub config: Config,
    pub log: Box<dyn Log>,

    pub role: Role,
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub leader_id: Option<NodeId>,

    pub commit_index: LogIndex,
    pub apply_index: LogIndex,
    /// Highest index known durable on local disk; the leader's own entry
    /// in the commit quorum.
    pub last_synced_index: LogIndex,
    /// Leader-only flag: an append is waiting for the disk-sync worker.
    pub log_sync_queued: bool,

    /// Deadline for starting an election. `None` while leader.
    pub start_election_at: Option<Instant>,

    pub peers: HashMap<NodeId, PeerState>,

    /// Vote gate, see `Config::vote_target_*`.
    voteable: bool,

    pub exiting: bool,
    /// Set after an unrecoverable storage error; the node stops accepting
    /// writes and candidacies until restarted.
    pub halted: bool,
}

impl RaftCore {
    /// Restore consensus state from the log's durable metadata.
    pub fn new(config: Config, log: Box<dyn Log>) -> RaftCore {
        let meta = log.metadata();
        let peers = config
            .peer_ids()
            .into_iter()
            .map(|id| (id, PeerState::new()))
            .collect();
        // Everything recovered from disk is durable, and anything applied
        // was committed.
        let last_synced_index = log.last_index();
        let apply_index = meta.apply_index;

        RaftCore {
            id: config.id,
            log,
            role: Role::Follower,
            current_term: meta.current_term,
            voted_for: meta.voted_for,
            leader_id: None,
            commit_index: apply_index,
            apply_index,
            last_synced_index,
            log_sync_queued: false,
            start_election_at: None,
            peers,
            voteable: false,
            exiting: false,
            halted: false,
            config,
        }
    }

    /// Number of voting members.
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    fn majority(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    /// Flush the metadata triple. Must complete before any reply that
    /// depends on it leaves this node.
    fn persist_metadata(&mut self) -> Result<(), LogError> {
        self.log.update_metadata(Metadata {
            current_term: self.current_term,
            voted_for: self.voted_for,
            apply_index: self.apply_index,
        })
    }

    /// Arm the election timer with a fresh randomized deadline in `[T, 4T]`.
    pub fn set_election_timer(&mut self) {
        self.start_election_at = Some(Instant::now() + self.config.random_election_timeout());
    }

    /// Append entries and arrange durability: leaders queue an
    /// asynchronous sync for the disk-sync worker, everyone else flushes
    /// before returning.
    pub fn append(&mut self, entries: &[Entry]) -> Result<(LogIndex, LogIndex), LogError> {
        let range = self.log.append(entries)?;
        if self.role == Role::Leader {
            self.log_sync_queued = true;
        } else {
            self.log.sync()?;
            self.last_synced_index = self.log.last_index();
        }
        Ok(range)
    }

    /// Adopt `new_term` if greater and become a follower. Re-arms the
    /// election timer if it was off and drains a queued leader sync.
    pub fn step_down(&mut self, new_term: Term) -> Result<(), LogError> {
        if self.current_term < new_term {
            info!(
                id = self.id,
                old_term = self.current_term,
                new_term,
                "stepping down to follower in a newer term"
            );
            self.current_term = new_term;
            self.leader_id = None;
            self.voted_for = None;
            self.persist_metadata()?;
        } else if self.role != Role::Follower {
            info!(id = self.id, term = self.current_term, "stepping down to follower");
        }
        self.role = Role::Follower;

        if self.start_election_at.is_none() {
            self.set_election_timer();
        }
        if self.log_sync_queued {
            self.log.sync()?;
            self.last_synced_index = self.log.last_index();
            self.log_sync_queued = false;
        }
        Ok(())
    }

    /// Election timeout fired: become a candidate in the next term, vote
    /// for ourselves, and let the peer replicators campaign. A cluster of
    /// one wins immediately.
    pub fn start_new_election(&mut self) -> Result<(), LogError> {
        if self.halted {
            self.start_election_at = None;
            return Ok(());
        }
        self.current_term += 1;
        self.role = Role::Candidate;
        self.leader_id = None;
        self.voted_for = Some(self.id);
        for peer in self.peers.values_mut() {
            peer.have_vote = false;
        }
        self.set_election_timer();
        self.persist_metadata()?;
        info!(id = self.id, term = self.current_term, "starting election");

        if self.peers.is_empty() {
            self.become_leader()?;
        }
        Ok(())
    }

    /// A majority granted their votes (counting our own).
    pub fn vote_quorum_reached(&self) -> bool {
        let granted = 1 + self.peers.values().filter(|p| p.have_vote).count();
        granted >= self.majority()
    }

    /// Candidate won: reset replication state and append this term's NOOP
    /// so commit can advance without waiting for client traffic.
    pub fn become_leader(&mut self) -> Result<(), LogError> {
        assert_eq!(self.role, Role::Candidate);
        self.role = Role::Leader;
        self.leader_id = Some(self.id);
        self.start_election_at = None;

        let next_index = self.log.last_index() + 1;
        for peer in self.peers.values_mut() {
            peer.next_index = next_index;
            peer.match_index = 0;
        }
        info!(id = self.id, term = self.current_term, "became leader");

        let noop = Entry::noop(self.current_term);
        self.append(&[noop])?;
        Ok(())
    }

    /// Leader-side append of one client command. Returns the assigned
    /// index, or `None` when this node is not the leader.
    pub fn replicate(&mut self, cmd: &Command) -> Result<Option<LogIndex>, LogError> {
        if self.role != Role::Leader || self.halted {
            return Ok(None);
        }
        let payload = cmd
            .encode()
            .map_err(|e| LogError::Corruption(e.to_string()))?;
        let entry = Entry::data(self.current_term, payload);
        let (_, last) = self.append(&[entry])?;
        debug!(id = self.id, index = last, "replicating client command");
        Ok(Some(last))
    }

    /// Recompute the commit index from the quorum: every peer's match
    /// index plus our own synced index, lower median. Only entries of the
    /// current term commit by counting replicas; earlier entries commit
    /// along with them.
    ///
    /// Returns whether the commit index advanced.
    pub fn advance_commit_index(&mut self) -> bool {
        if self.role != Role::Leader {
            return false;
        }
        let mut values: Vec<LogIndex> = self
            .peers
            .values()
            .map(|peer| peer.match_index)
            .collect();
        values.push(self.last_synced_index);
        values.sort_unstable();
        // Lower median: the highest N with a strict majority of values >= N.
        let candidate = values[(values.len() - 1) / 2];

        if candidate <= self.commit_index {
            return false;
        }
        match self.log.entry(candidate) {
            Ok(entry) if entry.term == self.current_term => {
                debug!(id = self.id, commit_index = candidate, "advancing commit index");
                self.commit_index = candidate;
                true
            }
            Ok(_) => false,
            Err(e) => {
                warn!(id = self.id, index = candidate, error = %e, "commit check failed to read entry");
                false
            }
        }
    }

    /// RequestVote handler. The vote is durably persisted before the
    /// result is handed back for sending.
    pub fn handle_request_vote(
        &mut self,
        args: &RequestVoteArgs,
    ) -> Result<RequestVoteResult, LogError> {
        if args.term > self.current_term {
            self.step_down(args.term)?;
        }
        let reject = RequestVoteResult {
            term: self.current_term,
            granted: false,
        };
        if args.term < self.current_term {
            return Ok(reject);
        }

        // A freshly joined node must not vote before catching up.
        if self.commit_index >= self.config.vote_target_index
            && self.current_term >= self.config.vote_target_term
        {
            self.voteable = true;
        }

        let (last_log_term, last_log_index) = self.log.last_term_and_index();
        let candidate_up_to_date = args.last_log_term > last_log_term
            || (args.last_log_term == last_log_term && args.last_log_index >= last_log_index);

        if !candidate_up_to_date
            || !self.voteable
            || matches!(self.voted_for, Some(v) if v != args.candidate_id)
        {
            debug!(
                id = self.id,
                candidate = args.candidate_id,
                term = args.term,
                "vote refused"
            );
            return Ok(reject);
        }

        self.voted_for = Some(args.candidate_id);
        self.persist_metadata()?;
        self.set_election_timer();
        info!(
            id = self.id,
            candidate = args.candidate_id,
            term = self.current_term,
            "vote granted"
        );
        Ok(RequestVoteResult {
            term: self.current_term,
            granted: true,
        })
    }

    /// AppendEntries handler: recognize the leader, check the previous
    /// entry, resolve conflicts by truncating our suffix, append the
    /// remainder (flushed before we reply), and adopt the leader's commit
    /// index capped at our own last entry.
    pub fn handle_append_entries(
        &mut self,
        args: &AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, LogError> {
        if args.term < self.current_term {
            return Ok(AppendEntriesResult {
                term: self.current_term,
                success: false,
            });
        }
        self.step_down(args.term)?;
        self.set_election_timer();
        self.leader_id = Some(args.leader_id);

        if args.prev_log_index > 0 {
            if args.prev_log_index > self.log.last_index() {
                return Ok(AppendEntriesResult {
                    term: self.current_term,
                    success: false,
                });
            }
            if self.log.entry(args.prev_log_index)?.term != args.prev_log_term {
                return Ok(AppendEntriesResult {
                    term: self.current_term,
                    success: false,
                });
            }
        }

        // Skip entries we already have; on the first term mismatch drop
        // our conflicting suffix and bulk-append the rest. Only suffixes
        // are ever truncated, and only here on the follower path.
        let mut append_from = None;
        let mut index = args.prev_log_index;
        for (pos, entry) in args.entries.iter().enumerate() {
            index += 1;
            if self.log.last_index() >= index {
                if self.log.entry(index)?.term == entry.term {
                    continue;
                }
                warn!(
                    id = self.id,
                    from = index,
                    "truncating conflicting suffix"
                );
                self.log.truncate_suffix(index - 1)?;
                self.last_synced_index = self.last_synced_index.min(index - 1);
            }
            append_from = Some(pos);
            break;
        }
        if let Some(pos) = append_from {
            self.append(&args.entries[pos..])?;
        }

        // Cap at the last entry this request verified or delivered; any
        // suffix beyond it is not yet known to match the leader.
        let last_verified = args.prev_log_index + args.entries.len() as u64;
        let new_commit = args.commit_index.min(last_verified);
        if new_commit > self.commit_index {
            self.commit_index = new_commit;
        }

        Ok(AppendEntriesResult {
            term: self.current_term,
            success: true,
        })
    }

    /// Record that the entry at `index` has been applied, and persist the
    /// new apply index with the rest of the metadata triple.
    pub fn set_apply_index(&mut self, index: LogIndex) -> Result<(), LogError> {
        self.apply_index = index;
        self.persist_metadata()
    }

    /// A reply carried a newer term than ours.
    pub fn observe_term(&mut self, term: Term) -> Result<(), LogError> {
        if term > self.current_term {
            self.step_down(term)?;
        }
        Ok(())
    }

    /// Unrecoverable storage failure: stop writing, stop campaigning.
    /// Reads of already-applied state keep working.
    pub fn halt(&mut self, reason: &str) {
        warn!(id = self.id, reason, "halting node after unrecoverable error");
        self.halted = true;
        self.role = Role::Follower;
        self.leader_id = None;
        self.start_election_at = None;
    }
}
