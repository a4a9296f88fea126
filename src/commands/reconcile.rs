use anyhow::Result;

use crate::commands::{CommandReport, store_runtime, watch_interrupt};
use crate::shift::audit::AuditLog;
use crate::shift::config::load_config;
use crate::shift::context::{RunContext, RunControl};
use crate::shift::lock::ShiftLock;
use crate::shift::paths::resolve_paths;
use crate::shift::reconcile::reconcile;
use crate::shift::txlog::{LogWriter, TransactionLog};
use crate::store::open_store;

pub fn run() -> Result<CommandReport> {
    let cfg = load_config()?;
    let paths = resolve_paths()?;
    let audit = AuditLog::new(&paths);
    let _lock = ShiftLock::acquire(&paths.lock_file)?;
    let log = LogWriter::new(TransactionLog::open(&paths.transaction_log)?);

    let control = RunControl::new();
    let ctx = RunContext::from_config(&cfg.migration, control.clone());
    let runtime = store_runtime()?;
    let outcome = runtime.block_on(async {
        let store = open_store(&cfg.store, 1, ctx.op_timeout).await?;
        let watcher = watch_interrupt(control.clone());
        let outcome = reconcile(store.as_ref(), &log, &ctx).await;
        watcher.abort();
        store.close().await;
        outcome
    })?;

    let mut report = CommandReport::new("reconcile");
    report.detail(format!("scanned={}", outcome.scanned));
    report.detail(format!("deleted={}", outcome.deleted));
    report.detail(format!("resolved={}", outcome.resolved.len()));
    for sig in &outcome.resolved {
        report.detail(format!("resolved signature={sig}"));
    }
    for sig in &outcome.unconfirmed {
        report.detail(format!("unconfirmed signature={sig}"));
    }
    if outcome.errors > 0 {
        report.issue(format!(
            "{} store operations failed; rerun reconcile",
            outcome.errors
        ));
    }
    if control.is_cancelled() {
        report.issue("reconcile interrupted before every folder was scanned");
    }

    log.with_log(|l| l.compact())?;
    audit.record(
        "reconcile",
        if report.ok { "ok" } else { "partial" },
        format!(
            "scanned={} deleted={} resolved={} unconfirmed={} errors={}",
            outcome.scanned,
            outcome.deleted,
            outcome.resolved.len(),
            outcome.unconfirmed.len(),
            outcome.errors
        ),
    )?;
    Ok(report)
}
