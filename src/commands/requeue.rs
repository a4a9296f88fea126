use anyhow::Result;

use crate::commands::CommandReport;
use crate::shift::audit::AuditLog;
use crate::shift::lock::ShiftLock;
use crate::shift::paths::resolve_paths;
use crate::shift::signature::Signature;
use crate::shift::txlog::TransactionLog;

fn parse_signature(raw: &str) -> Option<Signature> {
    let raw = raw.trim().to_ascii_lowercase();
    if raw.len() == 64 && raw.bytes().all(|b| b.is_ascii_hexdigit()) {
        Some(Signature::from(raw))
    } else {
        None
    }
}

pub fn run(signature: Option<&str>) -> Result<CommandReport> {
    let mut report = CommandReport::new("requeue");
    let only = match signature {
        Some(raw) => match parse_signature(raw) {
            Some(sig) => Some(sig),
            None => {
                report.issue(format!(
                    "invalid signature {raw}: expected 64 hex characters"
                ));
                return Ok(report);
            }
        },
        None => None,
    };

    let paths = resolve_paths()?;
    let audit = AuditLog::new(&paths);
    let _lock = ShiftLock::acquire(&paths.lock_file)?;
    let mut log = TransactionLog::open(&paths.transaction_log)?;

    let requeued = log.requeue_failed(only.as_ref())?;
    report.detail(format!("requeued={}", requeued.len()));
    for sig in &requeued {
        report.detail(format!("requeued signature={sig}"));
    }
    if let Some(sig) = &only {
        if requeued.is_empty() {
            match log.get(sig) {
                Some(record) => report.issue(format!(
                    "record {sig} is {}, only failed records can be requeued",
                    record.status
                )),
                None => report.issue(format!("no record with signature {sig}")),
            }
        }
    }

    audit.record(
        "requeue",
        if report.ok { "ok" } else { "noop" },
        format!("requeued={}", requeued.len()),
    )?;
    Ok(report)
}
