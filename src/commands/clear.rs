use anyhow::{Context, Result};
use std::fs;
use std::io::{self, BufRead, ErrorKind, Write};

use crate::commands::CommandReport;
use crate::shift::audit::AuditLog;
use crate::shift::lock::ShiftLock;
use crate::shift::paths::resolve_paths;
use crate::shift::txlog::{ClearConfirmation, TransactionLog};

fn confirmed(answer: &str) -> bool {
    answer.trim() == "yes"
}

fn prompt_confirmation() -> Result<bool> {
    let mut stderr = io::stderr();
    write!(
        stderr,
        "This deletes every migration record; already-moved items would be migrated again. Type 'yes' to continue: "
    )?;
    stderr.flush()?;

    let mut answer = String::new();
    io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("failed to read confirmation from stdin")?;
    Ok(confirmed(&answer))
}

pub fn run(yes: bool) -> Result<CommandReport> {
    let mut report = CommandReport::new("clear");
    if !yes && !prompt_confirmation()? {
        report.issue("clear aborted: confirmation not given");
        return Ok(report);
    }

    let paths = resolve_paths()?;
    let audit = AuditLog::new(&paths);
    let _lock = ShiftLock::acquire(&paths.lock_file)?;

    let log = TransactionLog::load(&paths.transaction_log)?;
    let removed = log.clear(ClearConfirmation::granted())?;
    report.detail(format!("removed_records={removed}"));

    match fs::remove_file(&paths.recovery_summary) {
        Ok(()) => report.detail("recovery_summary=removed"),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| {
                format!("failed to remove {}", paths.recovery_summary.display())
            });
        }
    }

    tracing::warn!(removed, "transaction log cleared");
    audit.record("clear", "ok", format!("removed_records={removed}"))?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::confirmed;

    #[test]
    fn only_literal_yes_confirms() {
        assert!(confirmed("yes\n"));
        assert!(confirmed("  yes "));
        assert!(!confirmed("y"));
        assert!(!confirmed("YES please"));
        assert!(!confirmed(""));
    }
}
