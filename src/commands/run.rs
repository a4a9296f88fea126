use anyhow::Result;
use std::sync::Arc;

use crate::commands::{CommandReport, store_runtime, watch_interrupt};
use crate::shift::audit::AuditLog;
use crate::shift::config::load_config;
use crate::shift::context::{RunContext, RunControl};
use crate::shift::engine;
use crate::shift::lock::ShiftLock;
use crate::shift::paths::resolve_paths;
use crate::shift::recovery::{RecoverySnapshot, recover};
use crate::shift::summary::write_recovery_summary;
use crate::shift::txlog::{LogWriter, TransactionLog};
use crate::store::open_store;

#[derive(Debug, Clone)]
pub struct RunReport {
    pub report: CommandReport,
    pub interrupted: bool,
}

fn recovery_report(snapshot: &RecoverySnapshot) -> CommandReport {
    let mut report = CommandReport::new("recovery");
    report.detail(format!(
        "recovery succeeded={} resumable={} promoted={} exhausted={} manual_cleanup={}",
        snapshot.succeeded.len(),
        snapshot.resumable.len(),
        snapshot.promoted,
        snapshot.exhausted.len(),
        snapshot.manual_cleanup.len()
    ));
    for record in &snapshot.exhausted {
        report.detail(format!(
            "skipping exhausted signature={} attempts={}",
            record.signature, record.attempt_count
        ));
    }
    report
}

pub fn run() -> Result<RunReport> {
    let cfg = load_config()?;
    let paths = resolve_paths()?;
    let audit = AuditLog::new(&paths);
    let lock = ShiftLock::acquire(&paths.lock_file)?;
    tracing::debug!(lock = %lock.path().display(), "migration lock acquired");

    let mut report = CommandReport::new("run");
    let log = LogWriter::new(TransactionLog::open(&paths.transaction_log)?);
    if log.with_log(|l| Ok(l.had_torn_tail()))? {
        report.detail("transaction log tail was torn by a crash; last partial entry dropped");
    }
    let snapshot = recover(&log, cfg.migration.max_attempts)?;
    report.merge(recovery_report(&snapshot));
    audit.record(
        "recovery",
        "ok",
        format!(
            "resumable={} promoted={} exhausted={} manual_cleanup={}",
            snapshot.resumable.len(),
            snapshot.promoted,
            snapshot.exhausted.len(),
            snapshot.manual_cleanup.len()
        ),
    )?;

    let control = RunControl::new();
    let ctx = Arc::new(RunContext::from_config(&cfg.migration, control.clone()));
    report.detail(format!("run_id={}", ctx.run_id));
    audit.record(
        "run",
        "started",
        format!(
            "run_id={} folders={} destination={}",
            ctx.run_id,
            ctx.source_folders.join(","),
            ctx.destination_folder
        ),
    )?;

    let runtime = store_runtime()?;
    let outcome = runtime.block_on(async {
        let store = open_store(&cfg.store, ctx.workers, ctx.op_timeout).await?;
        let watcher = watch_interrupt(control.clone());
        let outcome = engine::run(store, log, Arc::clone(&ctx), snapshot).await;
        watcher.abort();
        outcome
    });
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(err) => {
            let _ = audit.record("run", "error", format!("{err:#}"));
            return Err(err);
        }
    };

    write_recovery_summary(&paths.recovery_summary, &outcome.summary)?;
    for row in outcome.summary.rows() {
        report.detail(row);
    }
    for sig in &outcome.summary.exhausted {
        report.detail(format!("exhausted signature={sig}"));
    }
    for sig in &outcome.summary.manual_cleanup {
        report.detail(format!("manual_cleanup signature={sig}"));
    }
    if !outcome.summary.manual_cleanup.is_empty() {
        report.detail("run `mailshift reconcile` once the source store accepts deletes again");
    }
    report.detail(format!(
        "recovery_summary={}",
        paths.recovery_summary.display()
    ));
    if outcome.interrupted {
        report.detail("interrupted=true; rerun to resume from the last checkpoint");
    }

    let total = &outcome.summary.total;
    audit.record(
        "run",
        if outcome.interrupted { "interrupted" } else { "finished" },
        format!(
            "run_id={} found={} succeeded={} failed={} manual_cleanup={} success_rate={}",
            ctx.run_id,
            total.found,
            total.succeeded,
            total.failed,
            total.manual_cleanup,
            total.success_rate()
        ),
    )?;

    drop(lock);
    Ok(RunReport {
        report,
        interrupted: outcome.interrupted,
    })
}
