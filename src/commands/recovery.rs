use anyhow::Result;

use crate::commands::CommandReport;
use crate::shift::paths::resolve_paths;
use crate::shift::summary::load_recovery_summary;

pub fn run() -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let mut report = CommandReport::new("recovery");
    report.detail(format!(
        "recovery_summary={}",
        paths.recovery_summary.display()
    ));

    let Some(summary) = load_recovery_summary(&paths.recovery_summary)? else {
        report.detail("no recovery summary yet; nothing has run");
        return Ok(report);
    };

    report.detail(format!("run_id={}", summary.run_id));
    report.detail(format!("started_at={}", summary.started_at));
    report.detail(format!("finished_at={}", summary.finished_at));
    report.detail(format!("interrupted={}", summary.interrupted));
    for row in summary.rows() {
        report.detail(row);
    }
    for sig in &summary.exhausted {
        report.detail(format!("exhausted signature={sig}"));
    }
    for sig in &summary.manual_cleanup {
        report.detail(format!("manual_cleanup signature={sig}"));
    }
    Ok(report)
}
