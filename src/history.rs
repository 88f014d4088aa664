//! History Ledger: the durable record of documents already processed.
//!
//! ## Layout
//!
//! The ledger is an append-only JSON Lines file. Each line is one
//! [`LogRecord`] `{ "key": "<fingerprint>", "data": { ... } }`; a later line
//! for the same key replaces the earlier one on replay.
//!
//! ## Crash behaviour
//!
//! * Every append is written and `fsync`ed before the in-memory map is
//!   updated, so [`HistoryLedger::is_known`] never reports a document that
//!   would be forgotten after a restart.
//! * A crash mid-append leaves at most one truncated last line. Replay skips
//!   any line that does not parse and keeps loading the rest; the next append
//!   first terminates the torn line so it cannot swallow the new record.

use crate::error::IngestError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// What the ledger remembers about one successfully processed document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// RFC 3339 UTC timestamp of the commit.
    pub recorded_at: String,
    /// Source file name at the time of processing.
    pub file: String,
    pub pages: usize,
    pub success: usize,
    pub errors: usize,
    pub elapsed_ms: u64,
    /// Transcript path, for operators following up on a record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl HistoryEntry {
    pub fn now(file: impl Into<String>, pages: usize, success: usize, errors: usize) -> Self {
        Self {
            recorded_at: chrono::Utc::now().to_rfc3339(),
            file: file.into(),
            pages,
            success,
            errors,
            elapsed_ms: 0,
            output: None,
        }
    }
}

/// One line of the durable log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub key: String,
    pub data: HistoryEntry,
}

/// Append-only storage behind the ledger.
///
/// `append` must not return `Ok` until the record would survive a crash.
pub trait DurableLog: Send + Sync {
    /// Every well-formed record in append order. Malformed records are skipped.
    fn replay(&self) -> Result<Vec<LogRecord>, IngestError>;

    fn append(&self, record: &LogRecord) -> Result<(), IngestError>;

    fn flush(&self) -> Result<(), IngestError>;
}

// ── JSON Lines log ───────────────────────────────────────────────────────────

struct Writer {
    file: File,
    /// Set when the existing file ends without a newline (torn last record).
    needs_newline: bool,
}

/// [`DurableLog`] over a single JSON Lines file.
pub struct JsonLinesLog {
    path: PathBuf,
    writer: Mutex<Option<Writer>>,
}

impl JsonLinesLog {
    /// Use `path` as the log. The file is created on the first append.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> IngestError {
        IngestError::HistoryIo {
            path: self.path.clone(),
            source,
        }
    }

    fn open_writer(&self) -> Result<Writer, IngestError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&self.path)
            .map_err(|e| self.io_err(e))?;

        let len = file.metadata().map_err(|e| self.io_err(e))?.len();
        let needs_newline = if len == 0 {
            false
        } else {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::Start(len - 1))
                .and_then(|_| file.read_exact(&mut last))
                .map_err(|e| self.io_err(e))?;
            last[0] != b'\n'
        };
        Ok(Writer {
            file,
            needs_newline,
        })
    }
}

impl DurableLog for JsonLinesLog {
    fn replay(&self) -> Result<Vec<LogRecord>, IngestError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_err(e)),
        };

        let mut records = Vec::new();
        for (n, line) in bytes.split(|b| *b == b'\n').enumerate() {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<LogRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(
                    "Skipping malformed history record at {}:{}: {}",
                    self.path.display(),
                    n + 1,
                    e
                ),
            }
        }
        Ok(records)
    }

    fn append(&self, record: &LogRecord) -> Result<(), IngestError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut guard = self
            .writer
            .lock()
            .map_err(|_| IngestError::Internal("history writer lock poisoned".into()))?;
        if guard.is_none() {
            *guard = Some(self.open_writer()?);
        }
        let Some(writer) = guard.as_mut() else {
            return Err(IngestError::Internal("history writer unavailable".into()));
        };

        if writer.needs_newline {
            writer.file.write_all(b"\n").map_err(|e| self.io_err(e))?;
            writer.needs_newline = false;
        }
        writer.file.write_all(&line).map_err(|e| self.io_err(e))?;
        writer.file.sync_data().map_err(|e| self.io_err(e))
    }

    fn flush(&self) -> Result<(), IngestError> {
        let guard = self
            .writer
            .lock()
            .map_err(|_| IngestError::Internal("history writer lock poisoned".into()))?;
        match guard.as_ref() {
            Some(writer) => writer.file.sync_all().map_err(|e| self.io_err(e)),
            None => Ok(()),
        }
    }
}

// ── Ledger ───────────────────────────────────────────────────────────────────

/// In-memory view of the durable log, safe to share across File Pool workers.
pub struct HistoryLedger {
    log: Box<dyn DurableLog>,
    entries: RwLock<HashMap<String, HistoryEntry>>,
    /// Serialises append-then-insert so memory never runs ahead of disk.
    append_lock: Mutex<()>,
}

impl HistoryLedger {
    /// Replay `log` and build the ledger over it.
    pub fn open(log: Box<dyn DurableLog>) -> Result<Self, IngestError> {
        let records = log.replay()?;
        let mut entries = HashMap::with_capacity(records.len());
        for record in records {
            entries.insert(record.key, record.data);
        }
        debug!("History ledger loaded with {} entries", entries.len());
        Ok(Self {
            log,
            entries: RwLock::new(entries),
            append_lock: Mutex::new(()),
        })
    }

    /// Open a JSON Lines ledger at `path`.
    pub fn open_file(path: impl Into<PathBuf>) -> Result<Self, IngestError> {
        let path = path.into();
        let ledger = Self::open(Box::new(JsonLinesLog::new(&path)))?;
        info!(
            "History: {} documents already processed ({})",
            ledger.len(),
            path.display()
        );
        Ok(ledger)
    }

    pub fn is_known(&self, key: &str) -> bool {
        self.entries
            .read()
            .map(|map| map.contains_key(key))
            .unwrap_or(false)
    }

    pub fn get(&self, key: &str) -> Option<HistoryEntry> {
        self.entries.read().ok()?.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all entries, oldest commit first.
    pub fn entries(&self) -> Vec<(String, HistoryEntry)> {
        let mut all: Vec<_> = match self.entries.read() {
            Ok(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            Err(_) => Vec::new(),
        };
        all.sort_by(|a, b| a.1.recorded_at.cmp(&b.1.recorded_at).then(a.0.cmp(&b.0)));
        all
    }

    /// Durably commit `entry` under `key`, then make it visible.
    ///
    /// Blocking: call from `spawn_blocking` inside async code.
    pub fn record(&self, key: &str, entry: HistoryEntry) -> Result<(), IngestError> {
        let _serial = self
            .append_lock
            .lock()
            .map_err(|_| IngestError::Internal("history append lock poisoned".into()))?;

        self.log.append(&LogRecord {
            key: key.to_string(),
            data: entry.clone(),
        })?;

        self.entries
            .write()
            .map_err(|_| IngestError::Internal("history map lock poisoned".into()))?
            .insert(key.to_string(), entry);
        Ok(())
    }

    pub fn flush(&self) -> Result<(), IngestError> {
        self.log.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(file: &str) -> HistoryEntry {
        HistoryEntry::now(file, 3, 3, 0)
    }

    #[test]
    fn missing_file_replays_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = HistoryLedger::open_file(dir.path().join("h.jsonl")).unwrap();
        assert!(ledger.is_empty());
        assert!(!ledger.is_known("anything"));
    }

    #[test]
    fn recorded_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("h.jsonl");
        {
            let ledger = HistoryLedger::open_file(&path).unwrap();
            ledger.record("a::1::x", entry("a.tif")).unwrap();
            ledger.record("b::2::y", entry("b.tif")).unwrap();
            assert!(ledger.is_known("a::1::x"));
            ledger.flush().unwrap();
        }
        let reopened = HistoryLedger::open_file(&path).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.get("b::2::y").unwrap().file, "b.tif");
    }

    #[test]
    fn truncated_tail_is_skipped_and_repaired() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("h.jsonl");
        {
            let ledger = HistoryLedger::open_file(&path).unwrap();
            ledger.record("k1", entry("one.tif")).unwrap();
            ledger.record("k2", entry("two.tif")).unwrap();
        }
        // Simulate a crash mid-append.
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(br#"{"key":"k3","data":{"recorded"#).unwrap();
        drop(f);

        let ledger = HistoryLedger::open_file(&path).unwrap();
        assert_eq!(ledger.len(), 2);
        assert!(!ledger.is_known("k3"));

        ledger.record("k4", entry("four.tif")).unwrap();
        let reopened = HistoryLedger::open_file(&path).unwrap();
        assert_eq!(reopened.len(), 3);
        assert!(reopened.is_known("k4"));
    }

    #[test]
    fn later_record_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("h.jsonl");
        let ledger = HistoryLedger::open_file(&path).unwrap();
        ledger.record("k", HistoryEntry::now("a.tif", 2, 1, 1)).unwrap();
        ledger.record("k", HistoryEntry::now("a.tif", 2, 2, 0)).unwrap();
        drop(ledger);
        let reopened = HistoryLedger::open_file(&path).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.get("k").unwrap().success, 2);
    }

    struct FailingLog;

    impl DurableLog for FailingLog {
        fn replay(&self) -> Result<Vec<LogRecord>, IngestError> {
            Ok(Vec::new())
        }
        fn append(&self, _: &LogRecord) -> Result<(), IngestError> {
            Err(IngestError::HistoryIo {
                path: PathBuf::from("/dev/full"),
                source: std::io::Error::new(ErrorKind::Other, "disk full"),
            })
        }
        fn flush(&self) -> Result<(), IngestError> {
            Ok(())
        }
    }

    #[test]
    fn failed_append_is_not_visible() {
        let ledger = HistoryLedger::open(Box::new(FailingLog)).unwrap();
        assert!(ledger.record("k", entry("a.tif")).is_err());
        assert!(!ledger.is_known("k"));
    }
}
