//! Operator cleanup for source copies left behind after a verified move.

use crate::error::ShiftError;
use crate::shift::context::RunContext;
use crate::shift::record::{ItemRecord, ItemStatus};
use crate::shift::scanner::Scanner;
use crate::shift::signature::{Signature, signature};
use crate::shift::txlog::LogWriter;
use crate::shift::warn::{self, WarnEvent};
use crate::store::{MailStore, StoreError, timed};
use anyhow::Result;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub scanned: u64,
    pub deleted: u64,
    /// Manual-cleanup records closed out as `succeeded`.
    pub resolved: Vec<String>,
    /// Manual-cleanup records whose destination copy could not be confirmed.
    pub unconfirmed: Vec<String>,
    pub errors: u64,
}

fn warn_item(record: &ItemRecord, folder: &str, code: &str, cause: ShiftError) {
    warn::emit(WarnEvent {
        code,
        error_code: cause.code().as_str(),
        stage: "reconcile",
        signature: record.signature.short(),
        folder,
        attempt: record.attempt_count,
        retry: "next-reconcile",
        err: &cause.to_string(),
    });
}

/// Each transition gets its own journal entry, so a crash between the two
/// replays as `deleted` and finishes on the next pass.
fn close_out(log: &LogWriter, record: &ItemRecord) -> Result<()> {
    let mut done = record.clone();
    done.manual_cleanup = false;
    if done.status != ItemStatus::Deleted {
        done.advance(ItemStatus::Deleted)?;
        log.commit(&done)?;
    }
    done.advance(ItemStatus::Succeeded)?;
    log.commit(&done)
}

/// Re-scan the source folders and delete every item whose move is already
/// settled (`succeeded`, or `verified` and parked for manual cleanup) once
/// the destination confirms it holds the copy.
pub async fn reconcile(
    store: &dyn MailStore,
    log: &LogWriter,
    ctx: &RunContext,
) -> Result<ReconcileReport> {
    let mut targets = log.with_log(|l| {
        Ok(l.state()
            .records
            .values()
            .filter(|r| {
                r.status == ItemStatus::Succeeded
                    || (r.status == ItemStatus::Verified && r.manual_cleanup)
            })
            .map(|r| (r.signature.clone(), r.clone()))
            .collect::<BTreeMap<Signature, ItemRecord>>())
    })?;
    let mut report = ReconcileReport::default();
    let mut fully_scanned = HashSet::new();

    for folder in &ctx.source_folders {
        if ctx.control.is_cancelled() {
            break;
        }
        let mut scanner = Scanner::new(folder.clone(), ctx.batch_size);
        loop {
            if ctx.control.is_cancelled() {
                break;
            }
            let batch = match scanner.next_batch(store, ctx).await {
                Ok(Some(batch)) => batch,
                Ok(None) => {
                    fully_scanned.insert(folder.clone());
                    break;
                }
                Err(err) => {
                    report.errors += 1;
                    tracing::warn!(folder = %folder, error = %err, "reconcile scan failed");
                    break;
                }
            };

            for item in batch {
                report.scanned += 1;
                let sig = signature(&item.headers);
                let Some(record) = targets.get(&sig).cloned() else {
                    continue;
                };

                let present = timed(
                    ctx.op_timeout,
                    store.exists(&record.destination_folder, &sig, &record.headers),
                )
                .await;
                match present {
                    Ok(true) => {}
                    Ok(false) => {
                        if record.manual_cleanup {
                            report.unconfirmed.push(sig.to_string());
                        }
                        warn_item(
                            &record,
                            folder,
                            "RECONCILE_DEST_MISSING",
                            ShiftError::NotFound("destination copy not found".to_string()),
                        );
                        continue;
                    }
                    Err(err) => {
                        report.errors += 1;
                        warn_item(&record, folder, "RECONCILE_VERIFY_FAILED", err.into());
                        continue;
                    }
                }

                match timed(ctx.op_timeout, store.delete(folder, &item.identity)).await {
                    Ok(()) => report.deleted += 1,
                    Err(StoreError::NotFound(_)) => {}
                    Err(err) => {
                        report.errors += 1;
                        warn_item(&record, folder, "RECONCILE_DELETE_FAILED", err.into());
                        continue;
                    }
                }

                if record.status == ItemStatus::Verified {
                    close_out(log, &record)?;
                    report.resolved.push(sig.to_string());
                    targets.remove(&sig);
                }
            }
        }
    }

    // Parked records whose source copy is already gone.
    let leftovers = targets
        .into_values()
        .filter(|r| r.status == ItemStatus::Verified)
        .filter(|r| fully_scanned.contains(&r.source_folder))
        .collect::<Vec<_>>();
    for record in leftovers {
        let present = timed(
            ctx.op_timeout,
            store.exists(&record.destination_folder, &record.signature, &record.headers),
        )
        .await;
        match present {
            Ok(true) => {
                close_out(log, &record)?;
                report.resolved.push(record.signature.to_string());
            }
            Ok(false) => report.unconfirmed.push(record.signature.to_string()),
            Err(err) => {
                report.errors += 1;
                warn_item(
                    &record,
                    &record.source_folder,
                    "RECONCILE_VERIFY_FAILED",
                    err.into(),
                );
            }
        }
    }

    tracing::info!(
        scanned = report.scanned,
        deleted = report.deleted,
        resolved = report.resolved.len(),
        unconfirmed = report.unconfirmed.len(),
        errors = report.errors,
        "reconcile finished"
    );
    Ok(report)
}
