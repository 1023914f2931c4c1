//! The durable replicated log.
//!
//! Logically a 1-indexed vector of `LogEntry`; position 0 is the "no entry"
//! sentinel. On disk the log is a single append-only file of length-prefixed
//! records. Every mutation returns only after its effect is
//! crash-recoverable.

use std::convert::TryFrom;
use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::StoreError;
use crate::raft::LogEntry;

const LOG_FILE_NAME: &str = "log.dat";

/// The durable log owned by one replica.
///
/// Interior synchronization lets the replica core and its replication tasks
/// share one handle behind an `Arc`.
pub struct LogStore {
    inner: Mutex<LogInner>,
}

struct LogInner {
    file: File,
    /// All entries, mirrored in memory; the file is the source of truth at
    /// open.
    entries: Vec<LogEntry>,
    /// Byte offset of each record's start, for suffix truncation.
    offsets: Vec<u64>,
    /// Byte offset one past the last record.
    end: u64,
}

impl LogStore {
    /// Open the log under `dir`, creating it if absent.
    ///
    /// Reconstructs the entry count exactly; fails with
    /// `StoreError::Corrupted` on a torn or undecodable record.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(LOG_FILE_NAME);
        let file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;

        let buf = fs::read(&path)?;
        let mut entries = Vec::new();
        let mut offsets = Vec::new();
        let mut pos: usize = 0;
        while pos < buf.len() {
            if pos + 4 > buf.len() {
                return Err(corrupted(&path, pos, "torn record header"));
            }
            let mut len_bytes = [0u8; 4];
            len_bytes.copy_from_slice(&buf[pos..pos + 4]);
            let len = u32::from_le_bytes(len_bytes) as usize;
            if pos + 4 + len > buf.len() {
                return Err(corrupted(&path, pos, "torn record body"));
            }
            let entry: LogEntry = serde_json::from_slice(&buf[pos + 4..pos + 4 + len])
                .map_err(|err| corrupted(&path, pos, &format!("undecodable record: {}", err)))?;
            offsets.push(pos as u64);
            entries.push(entry);
            pos += 4 + len;
        }

        tracing::debug!(path=%path.display(), len=entries.len(), "opened log");

        Ok(Self {
            inner: Mutex::new(LogInner {
                file,
                entries,
                offsets,
                end: pos as u64,
            }),
        })
    }

    /// Append entries to the tail of the log.
    pub fn append(&self, entries: &[LogEntry]) -> Result<(), StoreError> {
        self.append_from(entries, 0)
    }

    /// Append the tail of `entries` starting at slice offset `from`.
    pub fn append_from(&self, entries: &[LogEntry], from: usize) -> Result<(), StoreError> {
        let tail = &entries[from..];
        if tail.is_empty() {
            return Ok(());
        }

        let mut inner = self.lock();
        let mut batch = Vec::new();
        let mut new_offsets = Vec::with_capacity(tail.len());
        for entry in tail {
            let record = serde_json::to_vec(entry)?;
            let len = u32::try_from(record.len())
                .map_err(|_| StoreError::Corrupted(format!("oversized log record: {} bytes", record.len())))?;
            new_offsets.push(inner.end + batch.len() as u64);
            batch.extend_from_slice(&len.to_le_bytes());
            batch.extend_from_slice(&record);
        }

        let end = inner.end;
        inner.file.seek(SeekFrom::Start(end))?;
        inner.file.write_all(&batch)?;
        inner.file.sync_data()?;

        inner.end += batch.len() as u64;
        inner.offsets.extend(new_offsets);
        inner.entries.extend_from_slice(tail);
        Ok(())
    }

    /// Remove all entries with position >= `index`.
    ///
    /// Only legal on a follower reconciling its log with a leader.
    pub fn truncate_suffix(&self, index: u64) -> Result<(), StoreError> {
        assert!(index >= 1, "position 0 is not a log entry");
        let mut inner = self.lock();
        if index > inner.entries.len() as u64 {
            return Ok(());
        }
        let keep = (index - 1) as usize;
        let new_end = inner.offsets[keep];
        inner.file.set_len(new_end)?;
        inner.file.sync_all()?;
        inner.entries.truncate(keep);
        inner.offsets.truncate(keep);
        inner.end = new_end;
        Ok(())
    }

    /// Read the entry at `index` (1-based).
    pub fn read(&self, index: u64) -> Option<LogEntry> {
        assert!(index >= 1, "position 0 is not a log entry");
        let inner = self.lock();
        inner.entries.get((index - 1) as usize).cloned()
    }

    /// Read entries in positions `[from, to]`, both inclusive; clamped to
    /// the log's bounds.
    pub fn read_range(&self, from: u64, to: u64) -> Vec<LogEntry> {
        let inner = self.lock();
        let len = inner.entries.len() as u64;
        let from = from.max(1);
        let to = to.min(len);
        if from > to {
            return Vec::new();
        }
        inner.entries[(from - 1) as usize..to as usize].to_vec()
    }

    /// The term of the entry at `index`; `term(0) == 0`.
    pub fn term(&self, index: u64) -> u64 {
        if index == 0 {
            return 0;
        }
        let inner = self.lock();
        match inner.entries.get((index - 1) as usize) {
            Some(entry) => entry.term,
            None => panic!("term({}) out of range, log length {}", index, inner.entries.len()),
        }
    }

    /// The number of entries in the log.
    pub fn len(&self) -> u64 {
        self.lock().entries.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// The term of the last entry, 0 if the log is empty.
    pub fn last_log_term(&self) -> u64 {
        self.lock().entries.last().map(|e| e.term).unwrap_or(0)
    }

    /// The greatest position holding an entry of `term`, if any.
    pub fn last_index_of_term(&self, term: u64) -> Option<u64> {
        let inner = self.lock();
        inner
            .entries
            .iter()
            .rposition(|e| e.term == term)
            .map(|zero_based| zero_based as u64 + 1)
    }

    /// A copy of all entries, for inspection in tests and diagnostics.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.lock().entries.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LogInner> {
        self.inner.lock().expect("log store mutex poisoned")
    }
}

fn corrupted(path: &PathBuf, pos: usize, what: &str) -> StoreError {
    StoreError::Corrupted(format!("{} at byte {} in {}", what, pos, path.display()))
}
