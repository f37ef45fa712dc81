//! Apply engine: drives committed entries into the backing store.
//!
//! A single worker advances `apply_index` toward `commit_index`, one entry
//! at a time, in strict index order. The store dispatch itself runs
//! outside the core mutex; ordering is preserved because this is the only
//! writer. After each entry the new apply index is persisted and the
//! client waiter blocked on that index, if any, is released.

use std::sync::Arc;

use tracing::{debug, warn};

use super::server::Shared;
use crate::command::{Command, CommandOutcome};
use crate::log::{Entry, EntryKind};
use crate::state_machine::Store;

/// Dispatch one committed entry against the store.
fn apply_entry<S: Store>(entry: &Entry, store: &mut S) -> CommandOutcome {
    let cmd = match entry.kind {
        EntryKind::Noop => return CommandOutcome::Done,
        EntryKind::Data => match Command::decode(&entry.payload) {
            Ok(cmd) => cmd,
            Err(e) => return CommandOutcome::Failed(format!("undecodable command: {}", e)),
        },
    };

    let result = match cmd {
        Command::Write { key, value } => store.put(&key, &value).map(|_| CommandOutcome::Done),
        Command::Delete { key } => store.delete(&key).map(|_| CommandOutcome::Done),
        Command::Read { key } => store.get(&key).map(CommandOutcome::Value),
        Command::ReadAll => store.scan_all().map(CommandOutcome::All),
        Command::TryLock { key, holder } => {
            store.try_lock(&key, &holder).map(CommandOutcome::Lock)
        }
        Command::UnLock { key, holder } => store.unlock(&key, &holder).map(CommandOutcome::Lock),
        Command::DeleteUser { holder } => {
            store.release_held(&holder).map(CommandOutcome::Released)
        }
    };
    match result {
        Ok(outcome) => outcome,
        Err(e) => CommandOutcome::Failed(e.to_string()),
    }
}

/// The apply worker loop.
pub(crate) async fn run_apply_engine<S: Store>(shared: Arc<Shared>, mut store: S) {
    let mut changed = shared.subscribe();
    loop {
        // Pick the next committed entry, if there is one.
        let next = {
            let mut core = shared.core.lock().await;
            if core.exiting {
                break;
            }
            let next = core.apply_index + 1;
            if !core.halted && core.commit_index >= next {
                match core.log.entry(next) {
                    Ok(entry) => Some((next, entry)),
                    Err(e) => {
                        // Losing a committed entry is unrecoverable.
                        core.halt(&format!("committed entry {} unreadable: {}", next, e));
                        None
                    }
                }
            } else {
                None
            }
        };

        let (index, entry) = match next {
            Some(pair) => pair,
            None => {
                if changed.changed().await.is_err() {
                    break;
                }
                continue;
            }
        };

        // The store can be slow; never under the core mutex.
        let outcome = apply_entry(&entry, &mut store);
        if let CommandOutcome::Failed(ref msg) = outcome {
            warn!(index, error = %msg, "apply failed for committed entry");
        } else {
            debug!(index, "applied entry");
        }

        let waiter = {
            let mut core = shared.core.lock().await;
            if let Err(e) = core.set_apply_index(index) {
                core.halt(&format!("persisting apply index {}: {}", index, e));
            }
            let mut waiters = shared.waiters.lock();
            match waiters.remove(&index) {
                // Deliver only if the waiter was registered for the entry
                // we actually applied; a truncated-and-replaced index must
                // not resolve the old caller with someone else's result.
                Some((term, tx)) if term == entry.term => Some((tx, outcome)),
                Some(_) | None => None,
            }
        };
        if let Some((tx, outcome)) = waiter {
            let _ = tx.send(outcome);
        }
        shared.notify();
    }
}
