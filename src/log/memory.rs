//! In-memory log. Nothing survives a restart; for tests only.

use super::traits::{Entry, Log, LogError, LogIndex, Metadata, NoopSync, SyncHandle, Term};

#[derive(Default)]
pub struct MemoryLog {
    entries: Vec<Entry>,
    meta: Metadata,
}

impl MemoryLog {
    pub fn new() -> MemoryLog {
        MemoryLog::default()
    }
}

impl Log for MemoryLog {
    fn append(&mut self, entries: &[Entry]) -> Result<(LogIndex, LogIndex), LogError> {
        let first = self.last_index() + 1;
        self.entries.extend_from_slice(entries);
        Ok((first, self.last_index()))
    }

    fn truncate_suffix(&mut self, last_kept: LogIndex) -> Result<(), LogError> {
        if self.last_index() > last_kept {
            self.entries.truncate(last_kept as usize);
        }
        Ok(())
    }

    fn entry(&self, index: LogIndex) -> Result<Entry, LogError> {
        if index == 0 || index > self.last_index() {
            return Err(LogError::OutOfRange(index));
        }
        Ok(self.entries[(index - 1) as usize].clone())
    }

    fn first_index(&self) -> LogIndex {
        1
    }

    fn last_index(&self) -> LogIndex {
        self.entries.len() as LogIndex
    }

    fn last_term_and_index(&self) -> (Term, LogIndex) {
        match self.entries.last() {
            Some(entry) => (entry.term, self.last_index()),
            None => (0, 0),
        }
    }

    fn metadata(&self) -> Metadata {
        self.meta
    }

    fn update_metadata(&mut self, meta: Metadata) -> Result<(), LogError> {
        self.meta = meta;
        Ok(())
    }

    fn sync(&mut self) -> Result<(), LogError> {
        Ok(())
    }

    fn take_sync(&mut self) -> Result<Box<dyn SyncHandle>, LogError> {
        Ok(Box::new(NoopSync::new(self.last_index())))
    }
}
