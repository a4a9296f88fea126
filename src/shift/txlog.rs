//! Durable `signature -> ItemRecord` journal, the single source of truth for
//! resuming an interrupted migration.
//!
//! The log is a JSON Lines file. Every `upsert` appends one complete entry
//! and syncs it before returning; replay keeps the last entry per signature.
//! A crash in the middle of an append leaves an unterminated trailing line
//! which `load` drops, so the log reads back in its pre-update state. Writers
//! compact the journal into a snapshot through a temp file and an atomic
//! rename.

use crate::error::ShiftError;
use crate::shift::record::{ItemRecord, ItemStatus};
use crate::shift::signature::Signature;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunTotals {
    pub found: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub manual_cleanup: u64,
    pub skipped: u64,
    pub duplicates: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunMetadata {
    pub run_id: String,
    pub started_at_ms: u64,
    pub finished_at_ms: Option<u64>,
    pub interrupted: bool,
    pub totals: RunTotals,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum LogEntry {
    Run(RunMetadata),
    Record(ItemRecord),
}

#[derive(Debug, Clone, Default)]
pub struct LogState {
    pub run: Option<RunMetadata>,
    pub records: BTreeMap<Signature, ItemRecord>,
}

impl LogState {
    pub fn count_by_status(&self, status: ItemStatus) -> usize {
        self.records.values().filter(|r| r.status == status).count()
    }
}

/// Proof that an operator confirmed a destructive reset. Only the CLI
/// boundary constructs it.
#[derive(Debug)]
pub struct ClearConfirmation(());

impl ClearConfirmation {
    pub fn granted() -> Self {
        Self(())
    }
}

#[derive(Debug)]
pub struct TransactionLog {
    path: PathBuf,
    state: LogState,
    appender: Option<File>,
    torn_tail: bool,
}

fn corrupt(path: &Path, reason: impl Into<String>) -> ShiftError {
    ShiftError::CorruptLog {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn replay(path: &Path, raw: &str) -> Result<(LogState, bool), ShiftError> {
    let mut state = LogState::default();
    let terminated = raw.ends_with('\n');
    let lines = raw.split('\n').collect::<Vec<_>>();
    let last_index = lines.len().saturating_sub(1);
    let mut torn_tail = false;

    for (index, line) in lines.iter().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let entry = match serde_json::from_str::<LogEntry>(trimmed) {
            Ok(entry) => entry,
            Err(_) if index == last_index && !terminated => {
                torn_tail = true;
                continue;
            }
            Err(err) => {
                return Err(corrupt(path, format!("line {}: {err}", index + 1)));
            }
        };
        match entry {
            LogEntry::Run(meta) => state.run = Some(meta),
            LogEntry::Record(record) => {
                state.records.insert(record.signature.clone(), record);
            }
        }
    }

    Ok((state, torn_tail))
}

impl TransactionLog {
    /// Read the log without taking write ownership. A missing file is an
    /// empty log (first run).
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => String::new(),
            Err(err) if err.kind() == ErrorKind::InvalidData => {
                return Err(corrupt(path, "log is not valid UTF-8").into());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        let (state, torn_tail) = replay(path, &raw)?;
        if torn_tail {
            tracing::warn!(
                path = %path.display(),
                "dropped unterminated trailing entry from transaction log"
            );
        }
        Ok(Self {
            path: path.to_path_buf(),
            state,
            appender: None,
            torn_tail,
        })
    }

    /// Load for writing: replays, then rewrites the journal as a compact
    /// snapshot so later appends never land after a torn tail.
    pub fn open(path: &Path) -> Result<Self> {
        let mut log = Self::load(path)?;
        if log.path.exists() {
            log.compact()?;
        }
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> &LogState {
        &self.state
    }

    /// Whether the journal ended in a partial entry when it was read.
    pub fn had_torn_tail(&self) -> bool {
        self.torn_tail
    }

    pub fn get(&self, signature: &Signature) -> Option<&ItemRecord> {
        self.state.records.get(signature)
    }

    pub fn succeeded_signatures(&self) -> HashSet<Signature> {
        self.state
            .records
            .values()
            .filter(|r| r.status == ItemStatus::Succeeded)
            .map(|r| r.signature.clone())
            .collect()
    }

    /// Records interrupted before their destination copy was confirmed.
    pub fn resumable_records(&self) -> Vec<ItemRecord> {
        self.state
            .records
            .values()
            .filter(|r| {
                matches!(
                    r.status,
                    ItemStatus::Pending | ItemStatus::FlagsUpdated | ItemStatus::Copied
                )
            })
            .cloned()
            .collect()
    }

    fn append(&mut self, entry: &LogEntry) -> Result<()> {
        if self.appender.is_none() {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .with_context(|| format!("failed to open {}", self.path.display()))?;
            self.appender = Some(file);
        }
        let Some(file) = self.appender.as_mut() else {
            return Err(anyhow!("transaction log appender unavailable"));
        };
        let line = format!("{}\n", serde_json::to_string(entry)?);
        file.write_all(line.as_bytes())
            .with_context(|| format!("failed to append to {}", self.path.display()))?;
        file.sync_data()
            .with_context(|| format!("failed to sync {}", self.path.display()))?;
        Ok(())
    }

    /// Durably record `record`, enforcing the status machine against the
    /// previously stored version.
    pub fn upsert(&mut self, record: &ItemRecord) -> Result<()> {
        if let Some(existing) = self.state.records.get(&record.signature) {
            if !existing.status.permits(record.status) {
                return Err(existing.illegal(record.status).into());
            }
        }
        self.append(&LogEntry::Record(record.clone()))?;
        self.state
            .records
            .insert(record.signature.clone(), record.clone());
        Ok(())
    }

    pub fn record_run(&mut self, meta: &RunMetadata) -> Result<()> {
        self.append(&LogEntry::Run(meta.clone()))?;
        self.state.run = Some(meta.clone());
        Ok(())
    }

    /// Rewrite the journal as one entry per record via temp file + rename.
    pub fn compact(&mut self) -> Result<()> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;

        let mut tmp = NamedTempFile::new_in(parent)
            .with_context(|| format!("failed to create temp file in {}", parent.display()))?;
        if let Some(run) = &self.state.run {
            writeln!(tmp, "{}", serde_json::to_string(&LogEntry::Run(run.clone()))?)?;
        }
        for record in self.state.records.values() {
            writeln!(
                tmp,
                "{}",
                serde_json::to_string(&LogEntry::Record(record.clone()))?
            )?;
        }
        tmp.as_file().sync_all()?;

        self.appender = None;
        tmp.persist(&self.path)
            .map_err(|err| err.error)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }

    /// Operator edit: put `failed` records back to `pending` with a fresh
    /// attempt budget. Returns the signatures that were requeued.
    pub fn requeue_failed(&mut self, only: Option<&Signature>) -> Result<Vec<Signature>> {
        let targets = self
            .state
            .records
            .values()
            .filter(|r| r.status == ItemStatus::Failed)
            .filter(|r| only.is_none_or(|sig| &r.signature == sig))
            .cloned()
            .collect::<Vec<_>>();

        let mut out = Vec::with_capacity(targets.len());
        for mut record in targets {
            record.advance(ItemStatus::Pending)?;
            record.attempt_count = 0;
            record.delete_attempts = 0;
            record.last_error = None;
            record.claimed_by = None;
            self.upsert(&record)?;
            out.push(record.signature);
        }
        Ok(out)
    }

    /// Destructive reset: removes every record and the run metadata.
    pub fn clear(mut self, _confirmation: ClearConfirmation) -> Result<usize> {
        let removed = self.state.records.len();
        self.appender = None;
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to remove {}", self.path.display()));
            }
        }
        Ok(removed)
    }
}

/// Cloneable single-writer handle shared by concurrent item workers.
#[derive(Debug, Clone)]
pub struct LogWriter {
    inner: Arc<Mutex<TransactionLog>>,
}

impl LogWriter {
    pub fn new(log: TransactionLog) -> Self {
        Self {
            inner: Arc::new(Mutex::new(log)),
        }
    }

    pub fn commit(&self, record: &ItemRecord) -> Result<()> {
        let mut log = self
            .inner
            .lock()
            .map_err(|_| anyhow!("transaction log mutex poisoned"))?;
        log.upsert(record)
    }

    pub fn with_log<T>(&self, f: impl FnOnce(&mut TransactionLog) -> Result<T>) -> Result<T> {
        let mut log = self
            .inner
            .lock()
            .map_err(|_| anyhow!("transaction log mutex poisoned"))?;
        f(&mut log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shift::signature::HeaderSubset;
    use tempfile::tempdir;

    fn record(sig: &str) -> ItemRecord {
        ItemRecord::new(
            Signature::from(sig.repeat(64 / sig.len())),
            "1",
            "Processing",
            "Archive",
            HeaderSubset::default(),
        )
    }

    #[test]
    fn missing_log_is_empty_first_run() {
        let tmp = tempdir().expect("tempdir");
        let log = TransactionLog::load(&tmp.path().join("transactions.jsonl")).expect("load");
        assert!(log.state().records.is_empty());
        assert!(log.state().run.is_none());
    }

    #[test]
    fn upsert_survives_reload_and_keeps_latest_entry() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("state/transactions.jsonl");
        let mut log = TransactionLog::open(&path).expect("open");
        let mut r = record("a");
        log.upsert(&r).expect("pending");
        r.advance(ItemStatus::FlagsUpdated).expect("advance");
        log.upsert(&r).expect("flags");

        let reloaded = TransactionLog::load(&path).expect("reload");
        assert_eq!(
            reloaded.get(&r.signature).map(|r| r.status),
            Some(ItemStatus::FlagsUpdated)
        );
        assert_eq!(reloaded.resumable_records().len(), 1);
    }

    #[test]
    fn torn_trailing_line_is_dropped() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("transactions.jsonl");
        let mut log = TransactionLog::open(&path).expect("open");
        let mut r = record("b");
        log.upsert(&r).expect("pending");
        r.advance(ItemStatus::FlagsUpdated).expect("advance");
        drop(log);

        let partial = serde_json::to_string(&LogEntry::Record(r.clone())).expect("json");
        let mut file = OpenOptions::new().append(true).open(&path).expect("append");
        file.write_all(&partial.as_bytes()[..partial.len() / 2])
            .expect("write torn");
        drop(file);

        let reloaded = TransactionLog::load(&path).expect("torn tail tolerated");
        assert!(reloaded.had_torn_tail());
        assert_eq!(
            reloaded.get(&r.signature).map(|r| r.status),
            Some(ItemStatus::Pending)
        );

        let mut reopened = TransactionLog::open(&path).expect("open compacts");
        assert!(reopened.had_torn_tail());
        reopened.upsert(&r).expect("append after compaction");
        let again = TransactionLog::load(&path).expect("clean reload");
        assert!(!again.had_torn_tail());
        assert_eq!(
            again.get(&r.signature).map(|r| r.status),
            Some(ItemStatus::FlagsUpdated)
        );
    }

    #[test]
    fn garbage_in_the_middle_is_corrupt() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("transactions.jsonl");
        let good = serde_json::to_string(&LogEntry::Record(record("c"))).expect("json");
        fs::write(&path, format!("{{not json}}\n{good}\n")).expect("write");

        let err = TransactionLog::load(&path).expect_err("corrupt");
        let shift = err.downcast_ref::<ShiftError>().expect("shift error");
        assert!(matches!(shift, ShiftError::CorruptLog { .. }));
    }

    #[test]
    fn succeeded_record_cannot_be_rewritten() {
        let tmp = tempdir().expect("tempdir");
        let mut log = TransactionLog::open(&tmp.path().join("t.jsonl")).expect("open");
        let mut r = record("d");
        for next in [
            ItemStatus::FlagsUpdated,
            ItemStatus::Copied,
            ItemStatus::Verified,
            ItemStatus::Deleted,
            ItemStatus::Succeeded,
        ] {
            r.advance(next).expect("advance");
            log.upsert(&r).expect("upsert");
        }

        let mut again = r.clone();
        again.status = ItemStatus::Pending;
        let err = log.upsert(&again).expect_err("immutable");
        assert!(matches!(
            err.downcast_ref::<ShiftError>(),
            Some(ShiftError::IllegalTransition { .. })
        ));
        assert_eq!(log.succeeded_signatures().len(), 1);
    }

    #[test]
    fn compaction_keeps_one_line_per_record() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("t.jsonl");
        let mut log = TransactionLog::open(&path).expect("open");
        let mut r = record("e");
        log.upsert(&r).expect("pending");
        r.advance(ItemStatus::FlagsUpdated).expect("advance");
        log.upsert(&r).expect("flags");
        log.record_run(&RunMetadata {
            run_id: "run-1".into(),
            ..RunMetadata::default()
        })
        .expect("run");
        log.compact().expect("compact");

        let raw = fs::read_to_string(&path).expect("read");
        assert_eq!(raw.lines().count(), 2);
        let reloaded = TransactionLog::load(&path).expect("reload");
        assert_eq!(
            reloaded.state().run.as_ref().map(|r| r.run_id.as_str()),
            Some("run-1")
        );
    }

    #[test]
    fn requeue_resets_failed_records_only() {
        let tmp = tempdir().expect("tempdir");
        let mut log = TransactionLog::open(&tmp.path().join("t.jsonl")).expect("open");
        let mut failed = record("f");
        failed.attempt_count = 3;
        failed.advance(ItemStatus::Failed).expect("fail");
        failed.last_error = Some("copy refused".into());
        log.upsert(&failed).expect("failed");
        log.upsert(&record("0")).expect("pending");

        let requeued = log.requeue_failed(None).expect("requeue");
        assert_eq!(requeued, vec![failed.signature.clone()]);
        let after = log.get(&failed.signature).expect("record");
        assert_eq!(after.status, ItemStatus::Pending);
        assert_eq!(after.attempt_count, 0);
        assert!(after.last_error.is_none());
    }

    #[test]
    fn clear_removes_everything() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("t.jsonl");
        let mut log = TransactionLog::open(&path).expect("open");
        log.upsert(&record("1")).expect("upsert");
        log.upsert(&record("2")).expect("upsert");

        let removed = log.clear(ClearConfirmation::granted()).expect("clear");
        assert_eq!(removed, 2);
        assert!(!path.exists());
        assert!(TransactionLog::load(&path).expect("load").state().records.is_empty());
    }
}
