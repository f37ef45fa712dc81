//! The persistent replicated log.
//!
//! Raft requires the log and a small metadata triple (current term, vote,
//! apply index) to be durable before certain replies are sent. The `Log`
//! trait captures exactly that contract; the three implementations differ
//! only in where the bytes go.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raft term.
pub type Term = u64;
/// Log index. Indexes start at 1; 0 means "before the first entry".
pub type LogIndex = u64;

/// What a log entry carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// A client command payload.
    Data,
    /// Empty entry appended by a new leader so its term has an entry
    /// eligible for commit.
    Noop,
}

/// A single log entry. Entries are immutable once appended; indexes are
/// assigned by the log at append time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub term: Term,
    pub kind: EntryKind,
    pub payload: Vec<u8>,
}

impl Entry {
    pub fn data(term: Term, payload: Vec<u8>) -> Entry {
        Entry {
            term,
            kind: EntryKind::Data,
            payload,
        }
    }

    pub fn noop(term: Term) -> Entry {
        Entry {
            term,
            kind: EntryKind::Noop,
            payload: Vec::new(),
        }
    }
}

/// The durable metadata triple. Flushed before any action that depends on
/// it: granting a vote, adopting a term, reporting an apply completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub current_term: Term,
    pub voted_for: Option<u64>,
    pub apply_index: LogIndex,
}

/// Errors surfaced by log implementations.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("log i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("log corruption: {0}")]
    Corruption(String),
    #[error("no entry at index {0}")]
    OutOfRange(LogIndex),
}

/// A handle covering every write that was pending when it was taken.
/// `wait` blocks until all of them are durable.
pub trait SyncHandle: Send {
    /// Highest log index covered by this handle.
    fn last_index(&self) -> LogIndex;

    /// Flush the covered writes to durable storage.
    fn wait(&mut self) -> Result<(), LogError>;
}

/// Append-only replicated log plus durable metadata.
///
/// `append` never flushes by itself; the caller decides between the
/// leader's asynchronous path (`take_sync` handed to the disk-sync worker)
/// and the follower's synchronous path (`sync` before replying).
pub trait Log: Send {
    /// Append entries, assigning consecutive indexes. Returns the
    /// `(first, last)` index range assigned.
    fn append(&mut self, entries: &[Entry]) -> Result<(LogIndex, LogIndex), LogError>;

    /// Remove every entry with index greater than `last_kept`. Durable
    /// before returning. Idempotent when the log is already at or below
    /// `last_kept`.
    fn truncate_suffix(&mut self, last_kept: LogIndex) -> Result<(), LogError>;

    /// Fetch the entry at `index`.
    fn entry(&self, index: LogIndex) -> Result<Entry, LogError>;

    /// Index of the first entry present (1 unless truncated from the
    /// front, which this core never does).
    fn first_index(&self) -> LogIndex;

    /// Index of the last entry, or 0 for an empty log.
    fn last_index(&self) -> LogIndex;

    /// `(term, index)` of the last entry, or `(0, 0)` for an empty log.
    fn last_term_and_index(&self) -> (Term, LogIndex);

    /// The metadata as last written.
    fn metadata(&self) -> Metadata;

    /// Replace the metadata triple. Durable before returning.
    fn update_metadata(&mut self, meta: Metadata) -> Result<(), LogError>;

    /// Blocking flush of every pending write.
    fn sync(&mut self) -> Result<(), LogError>;

    /// Non-blocking: a handle representing all writes pending right now.
    fn take_sync(&mut self) -> Result<Box<dyn SyncHandle>, LogError>;
}

/// No-op handle for logs whose writes are already durable (or volatile by
/// design, as in the in-memory log).
pub struct NoopSync {
    last: LogIndex,
}

impl NoopSync {
    pub fn new(last: LogIndex) -> NoopSync {
        NoopSync { last }
    }
}

impl SyncHandle for NoopSync {
    fn last_index(&self) -> LogIndex {
        self.last
    }

    fn wait(&mut self) -> Result<(), LogError> {
        Ok(())
    }
}
