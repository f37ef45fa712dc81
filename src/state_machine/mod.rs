//! The key-value backing store the apply engine drives.

pub mod kv;
pub mod traits;

pub use kv::{shared_store, MemStore, SharedStore};
pub use traits::{Store, StoreError};
