//! Persistent replicated log.
//!
//! - `MemoryLog`: volatile log for tests
//! - `SimpleFileLog`: single file, rewritten on truncation
//! - `SegmentedLog`: manifest + segment files, the production variant

pub mod memory;
pub mod segmented;
pub mod simple;
pub mod traits;

pub use memory::MemoryLog;
pub use segmented::{SegmentedLog, DEFAULT_SEGMENT_SIZE};
pub use simple::SimpleFileLog;
pub use traits::{Entry, EntryKind, Log, LogError, LogIndex, Metadata, SyncHandle, Term};
