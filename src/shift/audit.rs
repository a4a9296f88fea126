//! Operator audit trail: one JSON line per command outcome, kept apart from
//! the transaction log so `clear` never erases it.

use crate::shift::paths::ShiftPaths;
use crate::shift::util::{format_epoch_ms, now_epoch_ms};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub at_ms: u64,
    pub at: String,
    pub pid: u32,
    pub phase: String,
    pub status: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(paths: &ShiftPaths) -> Self {
        Self {
            path: paths.logs_dir.join("audit.log"),
        }
    }

    pub fn record(&self, phase: &str, status: &str, message: impl Into<String>) -> Result<()> {
        let at_ms = now_epoch_ms();
        let event = AuditEvent {
            at_ms,
            at: format_epoch_ms(at_ms),
            pid: std::process::id(),
            phase: phase.to_string(),
            status: status.to_string(),
            message: message.into(),
        };
        let mut line = serde_json::to_vec(&event).context("failed to encode audit event")?;
        line.push(b'\n');

        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(&line))
            .with_context(|| format!("failed to append to {}", self.path.display()))
    }
}
