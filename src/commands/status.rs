use anyhow::Result;

use crate::commands::CommandReport;
use crate::shift::paths::resolve_paths;
use crate::shift::record::{ItemRecord, ItemStatus};
use crate::shift::txlog::{LogState, TransactionLog};
use crate::shift::util::{format_epoch_ms, truncate_with_ellipsis};

const RECENT_FAILURES: usize = 10;

fn recent_failures(state: &LogState) -> Vec<&ItemRecord> {
    let mut failed = state
        .records
        .values()
        .filter(|r| r.status == ItemStatus::Failed)
        .collect::<Vec<_>>();
    failed.sort_by(|a, b| b.updated_ms.cmp(&a.updated_ms));
    failed.truncate(RECENT_FAILURES);
    failed
}

fn status_details(report: &mut CommandReport, state: &LogState) {
    report.detail(format!("records={}", state.records.len()));
    for status in ItemStatus::ALL {
        report.detail(format!(
            "status.{}={}",
            status.as_str(),
            state.count_by_status(status)
        ));
    }

    match &state.run {
        Some(run) => {
            report.detail(format!("last_run.id={}", run.run_id));
            report.detail(format!(
                "last_run.started_at={}",
                format_epoch_ms(run.started_at_ms)
            ));
            match run.finished_at_ms {
                Some(ms) => report.detail(format!("last_run.finished_at={}", format_epoch_ms(ms))),
                None => report.detail("last_run.finished_at=never (crashed or still running)"),
            }
            report.detail(format!("last_run.interrupted={}", run.interrupted));
            report.detail(format!(
                "last_run.totals found={} succeeded={} failed={} manual_cleanup={} skipped={} duplicates={}",
                run.totals.found,
                run.totals.succeeded,
                run.totals.failed,
                run.totals.manual_cleanup,
                run.totals.skipped,
                run.totals.duplicates
            ));
        }
        None => report.detail("last_run=none"),
    }

    for record in recent_failures(state) {
        report.detail(format!(
            "failed signature={} folder={} attempts={} error={}",
            record.signature.short(),
            record.source_folder,
            record.attempt_count,
            truncate_with_ellipsis(record.last_error.as_deref().unwrap_or("unknown"), 160)
        ));
    }
    for record in state
        .records
        .values()
        .filter(|r| r.status == ItemStatus::Verified && r.manual_cleanup)
    {
        report.detail(format!(
            "manual_cleanup signature={} folder={} identity={}",
            record.signature, record.source_folder, record.identity
        ));
    }
}

/// Read-only: never takes the migration lock and never rewrites the log.
pub fn run() -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let mut report = CommandReport::new("status");
    report.detail(format!("build_id={}", env!("BUILD_UUID")));
    let log = TransactionLog::load(&paths.transaction_log)?;
    report.detail(format!("transaction_log={}", log.path().display()));
    if log.had_torn_tail() {
        report.detail("transaction log ends in a partial entry; the next run drops it");
    }
    status_details(&mut report, log.state());
    Ok(report)
}
