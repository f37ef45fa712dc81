//! Backing store abstraction.
//!
//! The store is an opaque ordered map with atomic single-key operations,
//! plus an advisory lock table. The apply engine is the only writer; dirty
//! reads go through a shared handle without consensus.
//!
//! Implementations must be deterministic: applying the same commands in the
//! same order must produce the same state on every replica.

use thiserror::Error;

/// Errors surfaced by the backing store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// I/O error (disk full, permission denied, ...).
    #[error("store i/o error: {0}")]
    Io(String),
    /// The store's contents are not what a committed history implies.
    #[error("store corruption: {0}")]
    Corruption(String),
}

/// Ordered key-value store with an advisory lock table.
pub trait Store: Send {
    /// Set a key to a value.
    fn put(&mut self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Remove a key. Returns whether the key existed.
    fn delete(&mut self, key: &str) -> Result<bool, StoreError>;

    /// Look up a key.
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Every key-value pair, in key order.
    fn scan_all(&self) -> Result<Vec<(String, String)>, StoreError>;

    /// Acquire the lock `key` for `holder`. Succeeds if the lock is free or
    /// already held by the same holder.
    fn try_lock(&mut self, key: &str, holder: &str) -> Result<bool, StoreError>;

    /// Release the lock `key`. Succeeds only if held by `holder`.
    fn unlock(&mut self, key: &str, holder: &str) -> Result<bool, StoreError>;

    /// Release every lock held by `holder`. Returns how many were released.
    fn release_held(&mut self, holder: &str) -> Result<u64, StoreError>;
}
