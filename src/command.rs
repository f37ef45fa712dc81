//! Client commands carried through the replicated log.
//!
//! Every client operation, including reads, is serialized into a log entry
//! payload and applied in commit order. Reads pay a replication round-trip
//! in exchange for linearizability; `DirtyRead` bypasses the log entirely
//! and is handled outside this module.

use serde::{Deserialize, Serialize};

/// A client command. Encoded with bincode into the payload of a DATA entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Set a key to a value.
    Write { key: String, value: String },
    /// Remove a key.
    Delete { key: String },
    /// Read a single key (serialized through the log).
    Read { key: String },
    /// Read every key-value pair (serialized through the log).
    ReadAll,
    /// Acquire an advisory lock on `key` for `holder`.
    TryLock { key: String, holder: String },
    /// Release an advisory lock on `key` held by `holder`.
    UnLock { key: String, holder: String },
    /// Release every lock held by `holder`.
    DeleteUser { holder: String },
}

impl Command {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Command, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Result of applying a command against the backing store, delivered to the
/// client waiter blocked on the entry's index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Write/Delete completed.
    Done,
    /// Read result; `None` if the key was absent.
    Value(Option<String>),
    /// ReadAll result.
    All(Vec<(String, String)>),
    /// TryLock/UnLock result: whether the operation took effect.
    Lock(bool),
    /// DeleteUser result: number of locks released.
    Released(u64),
    /// The entry committed but could not be applied deterministically.
    Failed(String),
}
