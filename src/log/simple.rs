//! Single-file log.
//!
//! One append-only file of framed entries plus a sidecar metadata record.
//! The whole log is kept in memory and the file is rewritten from scratch
//! on truncation, which keeps recovery trivial at the cost of scaling; the
//! segmented log is the production variant.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use super::traits::{Entry, Log, LogError, LogIndex, Metadata, SyncHandle, Term};

const LOG_FILE: &str = "log";
const META_FILE: &str = "meta";

/// Frame layout: length(u32) | payload | crc32(u32), crc over the payload.
fn encode_frame(entry: &Entry) -> Result<Vec<u8>, LogError> {
    let payload =
        bincode::serialize(entry).map_err(|e| LogError::Corruption(e.to_string()))?;
    let mut frame = Vec::with_capacity(payload.len() + 8);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    Ok(frame)
}

/// Sync handle that flushes a cloned descriptor of the log file.
struct FileSync {
    file: File,
    last: LogIndex,
}

impl SyncHandle for FileSync {
    fn last_index(&self) -> LogIndex {
        self.last
    }

    fn wait(&mut self) -> Result<(), LogError> {
        self.file.sync_data()?;
        Ok(())
    }
}

pub struct SimpleFileLog {
    dir: PathBuf,
    file: File,
    entries: Vec<Entry>,
    meta: Metadata,
}

impl SimpleFileLog {
    /// Open or create a log in `dir`, recovering entries and metadata.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<SimpleFileLog, LogError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let log_path = dir.join(LOG_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&log_path)?;

        let entries = Self::recover_entries(&mut file, &log_path)?;
        let meta = Self::read_meta(&dir.join(META_FILE))?;

        Ok(SimpleFileLog {
            dir,
            file,
            entries,
            meta,
        })
    }

    /// Scan the file frame by frame; a torn or corrupt tail is cut off at
    /// the last well-formed frame boundary.
    fn recover_entries(file: &mut File, path: &Path) -> Result<Vec<Entry>, LogError> {
        let mut buf = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut buf)?;

        let mut entries = Vec::new();
        let mut offset = 0usize;
        while offset + 4 <= buf.len() {
            let len = u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap()) as usize;
            let end = offset + 4 + len + 4;
            if end > buf.len() {
                break;
            }
            let payload = &buf[offset + 4..offset + 4 + len];
            let stored_crc =
                u32::from_le_bytes(buf[offset + 4 + len..end].try_into().unwrap());
            if crc32fast::hash(payload) != stored_crc {
                break;
            }
            match bincode::deserialize::<Entry>(payload) {
                Ok(entry) => entries.push(entry),
                Err(_) => break,
            }
            offset = end;
        }

        if offset < buf.len() {
            warn!(
                path = %path.display(),
                kept = entries.len(),
                dropped_bytes = buf.len() - offset,
                "truncating log at last well-formed frame"
            );
            file.set_len(offset as u64)?;
            file.sync_data()?;
        }
        file.seek(SeekFrom::Start(offset as u64))?;
        Ok(entries)
    }

    fn read_meta(path: &Path) -> Result<Metadata, LogError> {
        if !path.exists() {
            return Ok(Metadata::default());
        }
        let buf = fs::read(path)?;
        if buf.len() < 4 {
            return Err(LogError::Corruption("metadata record too short".into()));
        }
        let (payload, crc_bytes) = buf.split_at(buf.len() - 4);
        let stored_crc = u32::from_le_bytes(crc_bytes.try_into().unwrap());
        if crc32fast::hash(payload) != stored_crc {
            return Err(LogError::Corruption("metadata checksum mismatch".into()));
        }
        bincode::deserialize(payload).map_err(|e| LogError::Corruption(e.to_string()))
    }

    /// Write to a temp file, flush, rename over the target.
    fn atomic_write(&self, path: &Path, data: &[u8]) -> Result<(), LogError> {
        let tmp = path.with_extension("tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl Log for SimpleFileLog {
    fn append(&mut self, entries: &[Entry]) -> Result<(LogIndex, LogIndex), LogError> {
        let first = self.last_index() + 1;
        let mut buf = Vec::new();
        for entry in entries {
            buf.extend_from_slice(&encode_frame(entry)?);
        }
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&buf)?;
        self.entries.extend_from_slice(entries);
        Ok((first, self.last_index()))
    }

    fn truncate_suffix(&mut self, last_kept: LogIndex) -> Result<(), LogError> {
        if self.last_index() <= last_kept {
            return Ok(());
        }
        self.entries.truncate(last_kept as usize);

        let mut buf = Vec::new();
        for entry in &self.entries {
            buf.extend_from_slice(&encode_frame(entry)?);
        }
        let path = self.dir.join(LOG_FILE);
        self.atomic_write(&path, &buf)?;
        self.file = OpenOptions::new().read(true).write(true).open(&path)?;
        self.file.seek(SeekFrom::End(0))?;
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
        let mut buf =
            bincode::serialize(&meta).map_err(|e| LogError::Corruption(e.to_string()))?;
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        self.atomic_write(&self.dir.join(META_FILE), &buf)?;
        self.meta = meta;
        Ok(())
    }

    fn sync(&mut self) -> Result<(), LogError> {
        self.file.sync_data()?;
        Ok(())
    }

    fn take_sync(&mut self) -> Result<Box<dyn SyncHandle>, LogError> {
        Ok(Box::new(FileSync {
            file: self.file.try_clone()?,
            last: self.last_index(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_append_and_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = SimpleFileLog::open(dir.path()).unwrap();
            log.append(&[Entry::noop(1), Entry::data(1, b"hello".to_vec())])
                .unwrap();
            log.sync().unwrap();
        }
        let log = SimpleFileLog::open(dir.path()).unwrap();
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.entry(2).unwrap().payload, b"hello");
    }

    #[test]
    fn test_truncate_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = SimpleFileLog::open(dir.path()).unwrap();
            log.append(&[Entry::noop(1), Entry::noop(1), Entry::noop(2)])
                .unwrap();
            log.truncate_suffix(1).unwrap();
        }
        let log = SimpleFileLog::open(dir.path()).unwrap();
        assert_eq!(log.last_index(), 1);
    }

    #[test]
    fn test_torn_tail_is_cut() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = SimpleFileLog::open(dir.path()).unwrap();
            log.append(&[Entry::data(1, b"good".to_vec())]).unwrap();
            log.sync().unwrap();
        }
        // Simulate a crash mid-append: partial frame at the tail.
        let path = dir.path().join(LOG_FILE);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[9, 0, 0, 0, 42]).unwrap();
        drop(file);

        let log = SimpleFileLog::open(dir.path()).unwrap();
        assert_eq!(log.last_index(), 1);
        assert_eq!(log.entry(1).unwrap().payload, b"good");
    }

    #[test]
    fn test_metadata_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let meta = Metadata {
            current_term: 7,
            voted_for: Some(3),
            apply_index: 4,
        };
        {
            let mut log = SimpleFileLog::open(dir.path()).unwrap();
            log.update_metadata(meta).unwrap();
        }
        let log = SimpleFileLog::open(dir.path()).unwrap();
        assert_eq!(log.metadata(), meta);
    }

    #[test]
    fn test_corrupt_metadata_is_an_error() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = SimpleFileLog::open(dir.path()).unwrap();
            log.update_metadata(Metadata::default()).unwrap();
        }
        fs::write(dir.path().join(META_FILE), b"garbage").unwrap();
        assert!(matches!(
            SimpleFileLog::open(dir.path()),
            Err(LogError::Corruption(_))
        ));
    }
}
