use crate::shift::util::format_epoch_ms;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// How one dispatched item ended this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Succeeded,
    Failed,
    ManualCleanup,
    Interrupted,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FolderStats {
    pub folder: String,
    pub found: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub manual_cleanup: u64,
    pub skipped: u64,
    pub duplicates: u64,
    pub interrupted: u64,
}

impl FolderStats {
    pub fn new(folder: impl Into<String>) -> Self {
        Self {
            folder: folder.into(),
            ..Self::default()
        }
    }

    pub fn tally(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Succeeded => self.succeeded += 1,
            ItemOutcome::Failed => self.failed += 1,
            ItemOutcome::ManualCleanup => self.manual_cleanup += 1,
            ItemOutcome::Interrupted => self.interrupted += 1,
        }
    }

    fn absorb(&mut self, other: &FolderStats) {
        self.found += other.found;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.manual_cleanup += other.manual_cleanup;
        self.skipped += other.skipped;
        self.duplicates += other.duplicates;
        self.interrupted += other.interrupted;
    }

    pub fn success_rate(&self) -> String {
        format_rate(self.succeeded, self.found)
    }
}

/// `succeeded / found` with one decimal, `N/A` when nothing was found.
pub fn format_rate(succeeded: u64, found: u64) -> String {
    if found == 0 {
        return "N/A".to_string();
    }
    format!("{:.1}%", succeeded as f64 * 100.0 / found as f64)
}

/// Written once per run for operators. Never read back by resumption.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub interrupted: bool,
    pub folders: Vec<FolderStats>,
    pub total: FolderStats,
    pub exhausted: Vec<String>,
    pub manual_cleanup: Vec<String>,
}

impl RunSummary {
    pub fn new(run_id: &str, started_at_ms: u64, folders: &[String]) -> Self {
        Self {
            run_id: run_id.to_string(),
            started_at: format_epoch_ms(started_at_ms),
            folders: folders.iter().map(FolderStats::new).collect(),
            total: FolderStats::new("TOTAL"),
            ..Self::default()
        }
    }

    pub fn folder_mut(&mut self, folder: &str) -> &mut FolderStats {
        let index = match self.folders.iter().position(|f| f.folder == folder) {
            Some(index) => index,
            None => {
                self.folders.push(FolderStats::new(folder));
                self.folders.len() - 1
            }
        };
        &mut self.folders[index]
    }

    pub fn finish(&mut self, finished_at_ms: u64, interrupted: bool) {
        self.finished_at = format_epoch_ms(finished_at_ms);
        self.interrupted = interrupted;
        let mut total = FolderStats::new("TOTAL");
        for folder in &self.folders {
            total.absorb(folder);
        }
        self.total = total;
    }

    /// One row per folder plus the TOTAL row.
    pub fn rows(&self) -> Vec<String> {
        self.folders
            .iter()
            .chain(std::iter::once(&self.total))
            .map(|s| {
                format!(
                    "folder={} found={} succeeded={} failed={} manual_cleanup={} skipped={} duplicates={} interrupted={} success_rate={}",
                    s.folder,
                    s.found,
                    s.succeeded,
                    s.failed,
                    s.manual_cleanup,
                    s.skipped,
                    s.duplicates,
                    s.interrupted,
                    s.success_rate()
                )
            })
            .collect()
    }
}

pub fn write_recovery_summary(path: &Path, summary: &RunSummary) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;

    let mut tmp = NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to create temp file in {}", parent.display()))?;
    let body = serde_json::to_string_pretty(summary)?;
    tmp.write_all(format!("{body}\n").as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

pub fn load_recovery_summary(path: &Path) -> Result<Option<RunSummary>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    let summary = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn success_rate_has_one_decimal() {
        assert_eq!(format_rate(247, 250), "98.8%");
        assert_eq!(format_rate(3, 3), "100.0%");
        assert_eq!(format_rate(0, 0), "N/A");
    }

    #[test]
    fn totals_sum_folders() {
        let folders = vec!["Processing".to_string(), "Later".to_string()];
        let mut summary = RunSummary::new("run-1", 0, &folders);
        {
            let p = summary.folder_mut("Processing");
            p.found = 4;
            p.tally(ItemOutcome::Succeeded);
            p.tally(ItemOutcome::Succeeded);
            p.tally(ItemOutcome::Failed);
            p.tally(ItemOutcome::ManualCleanup);
        }
        summary.folder_mut("Later").skipped = 7;
        summary.finish(1_000, false);

        assert_eq!(summary.total.found, 4);
        assert_eq!(summary.total.succeeded, 2);
        assert_eq!(summary.total.skipped, 7);
        assert_eq!(summary.total.success_rate(), "50.0%");
        let rows = summary.rows();
        assert_eq!(rows.len(), 3);
        assert!(rows[2].starts_with("folder=TOTAL"));
        assert!(rows[1].ends_with("success_rate=N/A"));
    }

    #[test]
    fn recovery_summary_round_trips_atomically() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("state/recovery_summary.json");
        assert!(load_recovery_summary(&path).expect("missing ok").is_none());

        let mut summary = RunSummary::new("run-9", 0, &["Processing".to_string()]);
        summary.exhausted.push("ab".repeat(32));
        summary.finish(0, true);
        write_recovery_summary(&path, &summary).expect("write");

        let loaded = load_recovery_summary(&path).expect("load").expect("present");
        assert_eq!(loaded, summary);
        assert_eq!(loaded.started_at, "1970-01-01 00:00:00 UTC");
    }
}
