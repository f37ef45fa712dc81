//! Segmented on-disk log.
//!
//! The log is split across segment files plus a manifest:
//!
//! - `manifest` — a fixed-size record holding the highest segment number,
//!   the entry range present across all segments, and the durable metadata
//!   triple. Written copy-on-write into two alternating slots, each with a
//!   trailing CRC, so a torn write leaves the previous slot intact.
//! - `log.NNNNNN` — segment files. Each starts with a header repeating the
//!   range it covers, followed by framed entries:
//!
//!   `| entry_id(u64) | length(u32) | payload | crc32(u32) | begin_offset(u32) |`
//!
//!   The trailing `begin_offset` is the byte offset of the frame's start,
//!   which makes reverse iteration from the file tail possible.
//!
//! Appends go to the active (last) segment; when a segment would exceed the
//! configured size it is sealed and a new one is opened. Appends are not
//! flushed here: the raft core either queues an asynchronous sync (leader)
//! or calls `sync` before replying (follower). Recovery scans the active
//! segment forward from its header and truncates at the last well-formed
//! frame boundary, then reconciles the manifest.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use super::traits::{Entry, Log, LogError, LogIndex, Metadata, SyncHandle, Term};

pub const DEFAULT_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

const MANIFEST_FILE: &str = "manifest";
const MANIFEST_SLOT_LEN: usize = 64;
const MANIFEST_BODY_LEN: usize = 56;

const SEGMENT_HEADER_LEN: u64 = 24;
/// entry_id(8) + length(4) + crc(4) + begin_offset(4).
const FRAME_OVERHEAD: u64 = 20;

fn segment_file_name(file_num: u64) -> String {
    format!("log.{:06}", file_num)
}

/// The manifest record: log bookkeeping plus the raft metadata triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ManifestRecord {
    seq: u64,
    file_num: u64,
    entry_start: LogIndex,
    entry_end: LogIndex,
    meta: Metadata,
}

impl Default for ManifestRecord {
    fn default() -> ManifestRecord {
        ManifestRecord {
            seq: 0,
            file_num: 1,
            entry_start: 1,
            entry_end: 0,
            meta: Metadata::default(),
        }
    }
}

impl ManifestRecord {
    fn encode(&self) -> [u8; MANIFEST_SLOT_LEN] {
        let mut slot = [0u8; MANIFEST_SLOT_LEN];
        slot[0..8].copy_from_slice(&self.seq.to_le_bytes());
        slot[8..16].copy_from_slice(&self.file_num.to_le_bytes());
        slot[16..24].copy_from_slice(&self.entry_start.to_le_bytes());
        slot[24..32].copy_from_slice(&self.entry_end.to_le_bytes());
        slot[32..40].copy_from_slice(&self.meta.current_term.to_le_bytes());
        // voted_for is stored shifted by one so 0 can mean "none".
        let voted = self.meta.voted_for.map_or(0, |id| id + 1);
        slot[40..48].copy_from_slice(&voted.to_le_bytes());
        slot[48..56].copy_from_slice(&self.meta.apply_index.to_le_bytes());
        let crc = crc32fast::hash(&slot[..MANIFEST_BODY_LEN]);
        slot[56..60].copy_from_slice(&crc.to_le_bytes());
        slot
    }

    fn decode(slot: &[u8]) -> Option<ManifestRecord> {
        if slot.len() < MANIFEST_SLOT_LEN {
            return None;
        }
        let crc = u32::from_le_bytes(slot[56..60].try_into().unwrap());
        if crc32fast::hash(&slot[..MANIFEST_BODY_LEN]) != crc {
            return None;
        }
        let read_u64 = |at: usize| u64::from_le_bytes(slot[at..at + 8].try_into().unwrap());
        let voted = read_u64(40);
        Some(ManifestRecord {
            seq: read_u64(0),
            file_num: read_u64(8),
            entry_start: read_u64(16),
            entry_end: read_u64(24),
            meta: Metadata {
                current_term: read_u64(32),
                voted_for: if voted == 0 { None } else { Some(voted - 1) },
                apply_index: read_u64(48),
            },
        })
    }
}

/// Double-buffered manifest file. The newest valid slot wins on recovery;
/// writes alternate slots and fsync before returning.
struct Manifest {
    file: File,
    record: ManifestRecord,
    next_slot: u64,
}

impl Manifest {
    fn create(path: &Path) -> Result<Manifest, LogError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        let mut manifest = Manifest {
            file,
            record: ManifestRecord::default(),
            next_slot: 0,
        };
        manifest.save()?;
        Ok(manifest)
    }

    fn open(path: &Path) -> Result<Manifest, LogError> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        let slot0 = ManifestRecord::decode(&buf);
        let slot1 = if buf.len() >= 2 * MANIFEST_SLOT_LEN {
            ManifestRecord::decode(&buf[MANIFEST_SLOT_LEN..])
        } else {
            None
        };
        let (record, live_slot) = match (slot0, slot1) {
            (Some(a), Some(b)) => {
                if a.seq >= b.seq {
                    (a, 0)
                } else {
                    (b, 1)
                }
            }
            (Some(a), None) => (a, 0),
            (None, Some(b)) => (b, 1),
            (None, None) => {
                return Err(LogError::Corruption(
                    "manifest present but both slots are invalid".into(),
                ))
            }
        };
        Ok(Manifest {
            file,
            record,
            next_slot: 1 - live_slot,
        })
    }

    fn save(&mut self) -> Result<(), LogError> {
        self.record.seq += 1;
        let slot = self.record.encode();
        self.file
            .seek(SeekFrom::Start(self.next_slot * MANIFEST_SLOT_LEN as u64))?;
        self.file.write_all(&slot)?;
        self.file.sync_data()?;
        self.next_slot = 1 - self.next_slot;
        Ok(())
    }
}

/// One open segment file plus its in-memory frame index.
struct Segment {
    file_num: u64,
    path: PathBuf,
    file: File,
    entry_start: LogIndex,
    /// `entry_start - 1` while the segment is empty.
    entry_end: LogIndex,
    /// Current file size, which is also the next write offset.
    size: u64,
    /// Byte offset of each frame, indexed by `index - entry_start`.
    offsets: Vec<u64>,
}

/// What a forward scan of a segment body found.
struct ScanResult {
    entry_end: LogIndex,
    size: u64,
    offsets: Vec<u64>,
    /// Bytes past the last well-formed frame, if any.
    torn: bool,
}

impl Segment {
    fn create(dir: &Path, file_num: u64, entry_start: LogIndex) -> Result<Segment, LogError> {
        let path = dir.join(segment_file_name(file_num));
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        let mut segment = Segment {
            file_num,
            path,
            file,
            entry_start,
            entry_end: entry_start - 1,
            size: SEGMENT_HEADER_LEN,
            offsets: Vec::new(),
        };
        segment.write_header()?;
        Ok(segment)
    }

    /// Open an existing segment and rebuild its frame index by scanning
    /// forward. `expected_start` comes from the previous segment's range.
    /// The second return value reports whether a torn or corrupt tail was
    /// cut off.
    fn open(
        dir: &Path,
        file_num: u64,
        expected_start: LogIndex,
    ) -> Result<(Segment, bool), LogError> {
        let path = dir.join(segment_file_name(file_num));
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut header = [0u8; SEGMENT_HEADER_LEN as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header).map_err(|_| {
            LogError::Corruption(format!("segment {} has no header", path.display()))
        })?;
        let entry_start = u64::from_le_bytes(header[0..8].try_into().unwrap());
        if entry_start != expected_start {
            return Err(LogError::Corruption(format!(
                "segment {} starts at {} but {} was expected",
                path.display(),
                entry_start,
                expected_start
            )));
        }

        let scan = Self::scan_body(&mut file, entry_start)?;
        let mut segment = Segment {
            file_num,
            path,
            file,
            entry_start,
            entry_end: scan.entry_end,
            size: scan.size,
            offsets: scan.offsets,
        };
        if scan.torn {
            warn!(
                segment = %segment.path.display(),
                entry_end = segment.entry_end,
                "truncating segment at last well-formed frame"
            );
            segment.file.set_len(segment.size)?;
            segment.write_header()?;
            segment.file.sync_data()?;
        }
        Ok((segment, scan.torn))
    }

    /// Walk frames from the header to the end of the file, validating
    /// entry id continuity, lengths, checksums, and back-pointers.
    fn scan_body(file: &mut File, entry_start: LogIndex) -> Result<ScanResult, LogError> {
        let mut body = Vec::new();
        file.seek(SeekFrom::Start(SEGMENT_HEADER_LEN))?;
        file.read_to_end(&mut body)?;

        let mut offsets = Vec::new();
        let mut next_id = entry_start;
        let mut offset = 0usize;
        loop {
            if offset + 12 > body.len() {
                break;
            }
            let entry_id = u64::from_le_bytes(body[offset..offset + 8].try_into().unwrap());
            let len =
                u32::from_le_bytes(body[offset + 8..offset + 12].try_into().unwrap()) as usize;
            let end = offset + 12 + len + 8;
            if entry_id != next_id || end > body.len() {
                break;
            }
            let payload = &body[offset + 12..offset + 12 + len];
            let stored_crc = u32::from_le_bytes(
                body[offset + 12 + len..offset + 12 + len + 4]
                    .try_into()
                    .unwrap(),
            );
            let begin_offset = u32::from_le_bytes(
                body[offset + 12 + len + 4..end].try_into().unwrap(),
            ) as u64;
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&body[offset..offset + 12]);
            hasher.update(payload);
            if hasher.finalize() != stored_crc
                || begin_offset != SEGMENT_HEADER_LEN + offset as u64
            {
                break;
            }
            offsets.push(SEGMENT_HEADER_LEN + offset as u64);
            next_id += 1;
            offset = end;
        }

        Ok(ScanResult {
            entry_end: next_id - 1,
            size: SEGMENT_HEADER_LEN + offset as u64,
            offsets,
            torn: offset < body.len(),
        })
    }

    fn write_header(&mut self) -> Result<(), LogError> {
        let mut header = [0u8; SEGMENT_HEADER_LEN as usize];
        header[0..8].copy_from_slice(&self.entry_start.to_le_bytes());
        header[8..16].copy_from_slice(&self.entry_end.to_le_bytes());
        header[16..24].copy_from_slice(&self.size.to_le_bytes());
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header)?;
        Ok(())
    }

    fn append_entry(&mut self, index: LogIndex, entry: &Entry) -> Result<(), LogError> {
        let payload =
            bincode::serialize(entry).map_err(|e| LogError::Corruption(e.to_string()))?;
        let begin_offset = self.size;

        let mut frame = Vec::with_capacity(payload.len() + FRAME_OVERHEAD as usize);
        frame.extend_from_slice(&index.to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&frame);
        frame.extend_from_slice(&hasher.finalize().to_le_bytes());
        frame.extend_from_slice(&(begin_offset as u32).to_le_bytes());

        self.file.seek(SeekFrom::Start(begin_offset))?;
        self.file.write_all(&frame)?;
        self.offsets.push(begin_offset);
        self.size += frame.len() as u64;
        self.entry_end = index;
        Ok(())
    }

    fn read_entry(&self, index: LogIndex) -> Result<Entry, LogError> {
        if index < self.entry_start || index > self.entry_end {
            return Err(LogError::OutOfRange(index));
        }
        let offset = self.offsets[(index - self.entry_start) as usize];

        let mut head = [0u8; 12];
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut head)?;
        let entry_id = u64::from_le_bytes(head[0..8].try_into().unwrap());
        let len = u32::from_le_bytes(head[8..12].try_into().unwrap()) as usize;
        if entry_id != index {
            return Err(LogError::Corruption(format!(
                "frame at offset {} carries entry {} instead of {}",
                offset, entry_id, index
            )));
        }
        let mut rest = vec![0u8; len + 4];
        file.read_exact(&mut rest)?;
        let payload = &rest[..len];
        let stored_crc = u32::from_le_bytes(rest[len..].try_into().unwrap());
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&head);
        hasher.update(payload);
        if hasher.finalize() != stored_crc {
            return Err(LogError::Corruption(format!(
                "checksum mismatch for entry {}",
                index
            )));
        }
        bincode::deserialize(payload).map_err(|e| LogError::Corruption(e.to_string()))
    }

    /// Projected size of a frame carrying `entry`.
    fn frame_len(entry: &Entry) -> Result<u64, LogError> {
        let payload =
            bincode::serialized_size(entry).map_err(|e| LogError::Corruption(e.to_string()))?;
        Ok(payload + FRAME_OVERHEAD)
    }

    fn is_empty(&self) -> bool {
        self.entry_end < self.entry_start
    }
}

/// Sync handle flushing cloned descriptors of every file with writes
/// pending at the time it was taken.
struct SegmentSync {
    files: Vec<File>,
    last: LogIndex,
}

impl SyncHandle for SegmentSync {
    fn last_index(&self) -> LogIndex {
        self.last
    }

    fn wait(&mut self) -> Result<(), LogError> {
        for file in &self.files {
            file.sync_data()?;
        }
        Ok(())
    }
}

pub struct SegmentedLog {
    dir: PathBuf,
    segment_size: u64,
    manifest: Manifest,
    /// Ordered by range; the last segment is the active one.
    segments: Vec<Segment>,
    /// Descriptors of sealed segments with unsynced writes.
    dirty: Vec<File>,
}

impl SegmentedLog {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<SegmentedLog, LogError> {
        Self::open_with_segment_size(dir, DEFAULT_SEGMENT_SIZE)
    }

    pub fn open_with_segment_size<P: AsRef<Path>>(
        dir: P,
        segment_size: u64,
    ) -> Result<SegmentedLog, LogError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let manifest_path = dir.join(MANIFEST_FILE);
        let segment_nums = Self::list_segments(&dir)?;

        if !manifest_path.exists() {
            // Cold start only if no segment holds entries; anything else
            // means the manifest was lost and the log cannot be trusted.
            for num in &segment_nums {
                let len = fs::metadata(dir.join(segment_file_name(*num)))?.len();
                if len > SEGMENT_HEADER_LEN {
                    return Err(LogError::Corruption(
                        "segments present without a manifest".into(),
                    ));
                }
            }
            let manifest = Manifest::create(&manifest_path)?;
            let active = Segment::create(&dir, manifest.record.file_num, 1)?;
            return Ok(SegmentedLog {
                dir,
                segment_size,
                manifest,
                segments: vec![active],
                dirty: Vec::new(),
            });
        }

        let mut manifest = Manifest::open(&manifest_path)?;
        let mut segments: Vec<Segment> = Vec::new();
        let mut expected_start = manifest.record.entry_start;

        for (pos, num) in segment_nums.iter().enumerate() {
            match Segment::open(&dir, *num, expected_start) {
                Ok((segment, torn)) => {
                    let is_last = pos == segment_nums.len() - 1;
                    // A sealed segment that scanned short means corruption
                    // in the middle of the log: cut there and drop the rest.
                    if !is_last && segment.is_empty() {
                        warn!(
                            segment = %segment.path.display(),
                            "sealed segment scanned empty; dropping it and later segments"
                        );
                        Self::remove_segments(&dir, &segment_nums[pos..])?;
                        break;
                    }
                    expected_start = segment.entry_end + 1;
                    segments.push(segment);
                    if torn && !is_last {
                        warn!("dropping segments after a corrupt sealed segment");
                        Self::remove_segments(&dir, &segment_nums[pos + 1..])?;
                        break;
                    }
                }
                Err(LogError::Corruption(msg)) if pos > 0 => {
                    warn!(error = %msg, "dropping unreadable segment suffix");
                    Self::remove_segments(&dir, &segment_nums[pos..])?;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        if segments.is_empty() {
            if manifest.record.entry_end >= manifest.record.entry_start {
                return Err(LogError::Corruption(format!(
                    "manifest claims entries {}..={} but no segment holds them",
                    manifest.record.entry_start, manifest.record.entry_end
                )));
            }
            let active = Segment::create(&dir, manifest.record.file_num, 1)?;
            segments.push(active);
        }

        // Reconcile the manifest with what the scan actually found.
        let last = segments.last().expect("at least one segment");
        if manifest.record.entry_end != last.entry_end
            || manifest.record.file_num != last.file_num
        {
            info!(
                manifest_end = manifest.record.entry_end,
                recovered_end = last.entry_end,
                "reconciling manifest with recovered log range"
            );
            manifest.record.entry_end = last.entry_end;
            manifest.record.file_num = last.file_num;
            manifest.save()?;
        }

        Ok(SegmentedLog {
            dir,
            segment_size,
            manifest,
            segments,
            dirty: Vec::new(),
        })
    }

    fn list_segments(dir: &Path) -> Result<Vec<u64>, LogError> {
        let mut nums = Vec::new();
        for dirent in fs::read_dir(dir)? {
            let name = dirent?.file_name();
            let name = name.to_string_lossy();
            if let Some(num) = name.strip_prefix("log.") {
                if let Ok(num) = num.parse::<u64>() {
                    nums.push(num);
                }
            }
        }
        nums.sort_unstable();
        Ok(nums)
    }

    fn remove_segments(dir: &Path, nums: &[u64]) -> Result<(), LogError> {
        for num in nums {
            let path = dir.join(segment_file_name(*num));
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    fn active(&mut self) -> &mut Segment {
        self.segments.last_mut().expect("at least one segment")
    }

    /// Seal the active segment and open a fresh one after it.
    fn roll(&mut self) -> Result<(), LogError> {
        let active = self.segments.last_mut().expect("at least one segment");
        active.write_header()?;
        let next_start = active.entry_end + 1;
        let next_num = active.file_num + 1;
        let sealed = active.file.try_clone()?;
        self.dirty.push(sealed);
        let segment = Segment::create(&self.dir, next_num, next_start)?;
        self.segments.push(segment);
        self.manifest.record.file_num = next_num;
        self.manifest.save()?;
        Ok(())
    }

    fn find_segment(&self, index: LogIndex) -> Option<&Segment> {
        let pos = self
            .segments
            .partition_point(|segment| segment.entry_start <= index);
        if pos == 0 {
            return None;
        }
        Some(&self.segments[pos - 1])
    }
}

impl Log for SegmentedLog {
    fn append(&mut self, entries: &[Entry]) -> Result<(LogIndex, LogIndex), LogError> {
        let first = self.last_index() + 1;
        let mut index = first;
        let segment_size = self.segment_size;
        for entry in entries {
            let frame_len = Segment::frame_len(entry)?;
            if self.active().size + frame_len > segment_size && !self.active().is_empty() {
                self.roll()?;
            }
            self.active().append_entry(index, entry)?;
            index += 1;
        }
        self.manifest.record.entry_end = index - 1;
        Ok((first, index - 1))
    }

    fn truncate_suffix(&mut self, last_kept: LogIndex) -> Result<(), LogError> {
        if self.last_index() <= last_kept {
            return Ok(());
        }

        // Drop whole segments past the cut, keeping at least one.
        while self.segments.len() > 1
            && self.segments.last().expect("non-empty").entry_start > last_kept
        {
            let segment = self.segments.pop().expect("non-empty");
            fs::remove_file(&segment.path)?;
        }

        let active = self.segments.last_mut().expect("at least one segment");
        if active.entry_end > last_kept {
            let keep = (last_kept + 1).saturating_sub(active.entry_start) as usize;
            let new_size = if keep < active.offsets.len() {
                active.offsets[keep]
            } else {
                active.size
            };
            active.file.set_len(new_size)?;
            active.size = new_size;
            active.entry_end = last_kept.max(active.entry_start - 1);
            active.offsets.truncate(keep);
            active.write_header()?;
            active.file.sync_data()?;
        }

        self.manifest.record.entry_end = last_kept;
        self.manifest.record.file_num =
            self.segments.last().expect("at least one segment").file_num;
        self.manifest.save()?;
        Ok(())
    }

    fn entry(&self, index: LogIndex) -> Result<Entry, LogError> {
        if index == 0 || index > self.last_index() || index < self.first_index() {
            return Err(LogError::OutOfRange(index));
        }
        let segment = self
            .find_segment(index)
            .ok_or(LogError::OutOfRange(index))?;
        segment.read_entry(index)
    }

    fn first_index(&self) -> LogIndex {
        self.manifest.record.entry_start
    }

    fn last_index(&self) -> LogIndex {
        self.segments
            .last()
            .map(|segment| segment.entry_end)
            .unwrap_or(0)
    }

    fn last_term_and_index(&self) -> (Term, LogIndex) {
        let last = self.last_index();
        if last == 0 {
            return (0, 0);
        }
        match self.entry(last) {
            Ok(entry) => (entry.term, last),
            Err(_) => (0, last),
        }
    }

    fn metadata(&self) -> Metadata {
        self.manifest.record.meta
    }

    fn update_metadata(&mut self, meta: Metadata) -> Result<(), LogError> {
        self.manifest.record.meta = meta;
        self.manifest.save()
    }

    fn sync(&mut self) -> Result<(), LogError> {
        self.take_sync()?.wait()
    }

    fn take_sync(&mut self) -> Result<Box<dyn SyncHandle>, LogError> {
        let last = self.last_index();
        self.active().write_header()?;
        let mut files: Vec<File> = self.dirty.drain(..).collect();
        files.push(self.active().file.try_clone()?);
        Ok(Box::new(SegmentSync { files, last }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry_with_len(term: Term, len: usize) -> Entry {
        Entry::data(term, vec![b'x'; len])
    }

    #[test]
    fn test_cold_start_is_empty() {
        let dir = TempDir::new().unwrap();
        let log = SegmentedLog::open(dir.path()).unwrap();
        assert_eq!(log.first_index(), 1);
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term_and_index(), (0, 0));
    }

    #[test]
    fn test_append_recover_round_trip() {
        let dir = TempDir::new().unwrap();
        let entries = vec![
            Entry::noop(1),
            Entry::data(1, b"first".to_vec()),
            Entry::data(2, b"second".to_vec()),
        ];
        {
            let mut log = SegmentedLog::open(dir.path()).unwrap();
            let (first, last) = log.append(&entries).unwrap();
            assert_eq!((first, last), (1, 3));
            log.sync().unwrap();
        }
        let log = SegmentedLog::open(dir.path()).unwrap();
        assert_eq!(log.last_index(), 3);
        for (i, expected) in entries.iter().enumerate() {
            assert_eq!(&log.entry(i as u64 + 1).unwrap(), expected);
        }
    }

    #[test]
    fn test_segment_rollover_preserves_entries() {
        let dir = TempDir::new().unwrap();
        // Segment small enough that the batch spans several files.
        let mut log = SegmentedLog::open_with_segment_size(dir.path(), 300).unwrap();
        for i in 0..10u64 {
            log.append(&[entry_with_len(1, 100)]).unwrap();
            assert_eq!(log.last_index(), i + 1);
        }
        log.sync().unwrap();
        assert!(SegmentedLog::list_segments(dir.path()).unwrap().len() > 1);

        for i in 1..=10u64 {
            assert_eq!(log.entry(i).unwrap().payload.len(), 100);
        }

        // And identical bytes after reopening.
        drop(log);
        let log = SegmentedLog::open_with_segment_size(dir.path(), 300).unwrap();
        assert_eq!(log.last_index(), 10);
        for i in 1..=10u64 {
            assert_eq!(log.entry(i).unwrap(), entry_with_len(1, 100));
        }
    }

    #[test]
    fn test_oversized_entry_gets_own_segment() {
        let dir = TempDir::new().unwrap();
        let mut log = SegmentedLog::open_with_segment_size(dir.path(), 128).unwrap();
        log.append(&[entry_with_len(1, 16)]).unwrap();
        log.append(&[entry_with_len(1, 500)]).unwrap();
        log.sync().unwrap();

        assert_eq!(log.entry(2).unwrap().payload.len(), 500);
        drop(log);
        let log = SegmentedLog::open_with_segment_size(dir.path(), 128).unwrap();
        assert_eq!(log.entry(2).unwrap().payload.len(), 500);
    }

    #[test]
    fn test_truncate_suffix_within_segment() {
        let dir = TempDir::new().unwrap();
        let mut log = SegmentedLog::open(dir.path()).unwrap();
        log.append(&[Entry::noop(1), Entry::noop(1), Entry::noop(2)])
            .unwrap();

        log.truncate_suffix(1).unwrap();
        assert_eq!(log.last_index(), 1);
        assert!(matches!(log.entry(2), Err(LogError::OutOfRange(2))));

        // Idempotent.
        log.truncate_suffix(1).unwrap();
        assert_eq!(log.last_index(), 1);

        // New appends reuse the freed indexes.
        log.append(&[Entry::noop(3)]).unwrap();
        assert_eq!(log.entry(2).unwrap().term, 3);
    }

    #[test]
    fn test_truncate_suffix_drops_later_segments() {
        let dir = TempDir::new().unwrap();
        let mut log = SegmentedLog::open_with_segment_size(dir.path(), 300).unwrap();
        for _ in 0..10 {
            log.append(&[entry_with_len(1, 100)]).unwrap();
        }
        log.sync().unwrap();
        assert!(SegmentedLog::list_segments(dir.path()).unwrap().len() > 2);

        log.truncate_suffix(3).unwrap();
        assert_eq!(log.last_index(), 3);

        drop(log);
        let log = SegmentedLog::open_with_segment_size(dir.path(), 300).unwrap();
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.entry(3).unwrap().payload.len(), 100);
    }

    #[test]
    fn test_truncate_to_empty() {
        let dir = TempDir::new().unwrap();
        let mut log = SegmentedLog::open(dir.path()).unwrap();
        log.append(&[Entry::noop(1), Entry::noop(1)]).unwrap();
        log.truncate_suffix(0).unwrap();
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term_and_index(), (0, 0));

        log.append(&[Entry::noop(2)]).unwrap();
        assert_eq!(log.entry(1).unwrap().term, 2);
    }

    #[test]
    fn test_torn_append_is_truncated_on_recovery() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = SegmentedLog::open(dir.path()).unwrap();
            log.append(&[Entry::data(1, b"good".to_vec())]).unwrap();
            log.sync().unwrap();
        }
        // Simulate a crash mid-append: garbage where the next frame starts.
        let path = dir.path().join(segment_file_name(1));
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&2u64.to_le_bytes()).unwrap();
        file.write_all(&[0xde, 0xad]).unwrap();
        drop(file);

        let log = SegmentedLog::open(dir.path()).unwrap();
        assert_eq!(log.last_index(), 1);
        assert_eq!(log.entry(1).unwrap().payload, b"good");
        assert!(matches!(log.entry(2), Err(LogError::OutOfRange(2))));
    }

    #[test]
    fn test_corrupt_frame_payload_is_truncated_on_recovery() {
        let dir = TempDir::new().unwrap();
        let second_offset;
        {
            let mut log = SegmentedLog::open(dir.path()).unwrap();
            log.append(&[Entry::data(1, b"aaaa".to_vec()), Entry::data(1, b"bbbb".to_vec())])
                .unwrap();
            log.sync().unwrap();
            second_offset = log.segments[0].offsets[1];
        }
        // Flip payload bytes of the second frame.
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(dir.path().join(segment_file_name(1)))
            .unwrap();
        file.seek(SeekFrom::Start(second_offset + 12)).unwrap();
        file.write_all(b"XXXX").unwrap();
        drop(file);

        let log = SegmentedLog::open(dir.path()).unwrap();
        assert_eq!(log.last_index(), 1);
        assert_eq!(log.entry(1).unwrap().payload, b"aaaa");
    }

    #[test]
    fn test_missing_manifest_with_entries_refuses_to_open() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = SegmentedLog::open(dir.path()).unwrap();
            log.append(&[Entry::noop(1)]).unwrap();
            log.sync().unwrap();
        }
        fs::remove_file(dir.path().join(MANIFEST_FILE)).unwrap();
        assert!(matches!(
            SegmentedLog::open(dir.path()),
            Err(LogError::Corruption(_))
        ));
    }

    #[test]
    fn test_metadata_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let meta = Metadata {
            current_term: 9,
            voted_for: Some(0),
            apply_index: 5,
        };
        {
            let mut log = SegmentedLog::open(dir.path()).unwrap();
            log.update_metadata(meta).unwrap();
        }
        let log = SegmentedLog::open(dir.path()).unwrap();
        assert_eq!(log.metadata(), meta);
    }

    #[test]
    fn test_manifest_alternates_slots() {
        let dir = TempDir::new().unwrap();
        let mut log = SegmentedLog::open(dir.path()).unwrap();
        for term in 1..=5 {
            log.update_metadata(Metadata {
                current_term: term,
                voted_for: None,
                apply_index: 0,
            })
            .unwrap();
        }
        // Both slots populated; the newer one wins after reopen.
        let len = fs::metadata(dir.path().join(MANIFEST_FILE)).unwrap().len();
        assert_eq!(len, 2 * MANIFEST_SLOT_LEN as u64);
        drop(log);
        let log = SegmentedLog::open(dir.path()).unwrap();
        assert_eq!(log.metadata().current_term, 5);
    }

    #[test]
    fn test_torn_manifest_slot_falls_back_to_previous() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = SegmentedLog::open(dir.path()).unwrap();
            log.update_metadata(Metadata {
                current_term: 3,
                voted_for: Some(1),
                apply_index: 0,
            })
            .unwrap();
            log.update_metadata(Metadata {
                current_term: 4,
                voted_for: Some(2),
                apply_index: 0,
            })
            .unwrap();
        }
        // Find which slot holds the newest record and tear it.
        let path = dir.path().join(MANIFEST_FILE);
        let buf = fs::read(&path).unwrap();
        let newest_slot = {
            let a = ManifestRecord::decode(&buf).unwrap();
            let b = ManifestRecord::decode(&buf[MANIFEST_SLOT_LEN..]).unwrap();
            if a.seq > b.seq {
                0
            } else {
                1
            }
        };
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(newest_slot * MANIFEST_SLOT_LEN as u64))
            .unwrap();
        file.write_all(&[0xff; 8]).unwrap();
        drop(file);

        let log = SegmentedLog::open(dir.path()).unwrap();
        assert_eq!(log.metadata().current_term, 3);
        assert_eq!(log.metadata().voted_for, Some(1));
    }

    #[test]
    fn test_take_sync_reports_last_index() {
        let dir = TempDir::new().unwrap();
        let mut log = SegmentedLog::open(dir.path()).unwrap();
        log.append(&[Entry::noop(1), Entry::noop(1)]).unwrap();
        let mut sync = log.take_sync().unwrap();
        assert_eq!(sync.last_index(), 2);
        sync.wait().unwrap();
    }
}
