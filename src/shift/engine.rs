use crate::error::ShiftError;
use crate::shift::context::RunContext;
use crate::shift::executor::Executor;
use crate::shift::record::ItemStatus;
use crate::shift::recovery::RecoverySnapshot;
use crate::shift::scanner::{Scanner, triage};
use crate::shift::summary::{ItemOutcome, RunSummary};
use crate::shift::txlog::{LogWriter, RunMetadata, RunTotals};
use crate::shift::util::now_epoch_ms;
use crate::shift::warn::{self, WarnEvent};
use crate::store::SharedStore;
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinSet;

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub summary: RunSummary,
    pub interrupted: bool,
}

fn totals_of(summary: &RunSummary) -> RunTotals {
    let t = &summary.total;
    RunTotals {
        found: t.found,
        succeeded: t.succeeded,
        failed: t.failed,
        manual_cleanup: t.manual_cleanup,
        skipped: t.skipped,
        duplicates: t.duplicates,
    }
}

/// Wait for every worker of a batch. A transaction log failure in one
/// worker aborts the run, but only after the others reached a checkpoint.
async fn drain(
    set: &mut JoinSet<(String, Result<ItemOutcome>)>,
    summary: &mut RunSummary,
) -> Result<()> {
    let mut first_err = None;
    while let Some(joined) = set.join_next().await {
        let (folder, result) = joined.context("item worker panicked")?;
        match result {
            Ok(outcome) => summary.folder_mut(&folder).tally(outcome),
            Err(err) => {
                summary.folder_mut(&folder).tally(ItemOutcome::Interrupted);
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
    }
    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// One migration pass over every configured source folder.
pub async fn run(
    store: SharedStore,
    log: LogWriter,
    ctx: Arc<RunContext>,
    mut snapshot: RecoverySnapshot,
) -> Result<RunOutcome> {
    let mut summary = RunSummary::new(&ctx.run_id, ctx.started_at_ms, &ctx.source_folders);
    let mut meta = RunMetadata {
        run_id: ctx.run_id.clone(),
        started_at_ms: ctx.started_at_ms,
        ..RunMetadata::default()
    };
    log.with_log(|l| l.record_run(&meta))?;

    let executor = Executor::new(Arc::clone(&store), log.clone(), Arc::clone(&ctx));
    let blocked = snapshot.blocked();
    let mut claimed = HashSet::new();
    let mut fully_scanned = HashSet::new();

    tracing::info!(
        run_id = %ctx.run_id,
        folders = ctx.source_folders.len(),
        destination = %ctx.destination_folder,
        workers = ctx.workers,
        batch_size = ctx.batch_size,
        "migration run started"
    );

    'folders: for folder in &ctx.source_folders {
        let mut scanner = Scanner::new(folder.clone(), ctx.batch_size);
        loop {
            if ctx.control.is_cancelled() {
                break 'folders;
            }
            let batch = match scanner.next_batch(store.as_ref(), &ctx).await {
                Ok(Some(batch)) => batch,
                Ok(None) => {
                    fully_scanned.insert(folder.clone());
                    break;
                }
                Err(err) => {
                    let cause = ShiftError::from(err);
                    warn::emit(WarnEvent {
                        code: "LIST_FAILED",
                        error_code: cause.code().as_str(),
                        stage: "scan",
                        signature: "na",
                        folder: folder.as_str(),
                        attempt: 0,
                        retry: "next-run",
                        err: &cause.to_string(),
                    });
                    break;
                }
            };

            let picked = triage(batch, folder, &ctx, &mut snapshot, &blocked, &mut claimed);
            {
                let stats = summary.folder_mut(folder);
                stats.skipped += picked.skipped;
                stats.duplicates += picked.duplicates;
                stats.found += picked.dispatch.len() as u64;
            }

            let mut set = JoinSet::new();
            for record in picked.dispatch {
                let executor = executor.clone();
                let folder = folder.clone();
                set.spawn(async move { (folder, executor.drive(record).await) });
            }
            drain(&mut set, &mut summary).await?;
            tracing::debug!(folder = %folder, "batch finished");
        }
    }

    // Interrupted records whose source item no longer exists.
    let unseen = snapshot
        .resumable
        .into_values()
        .filter(|r| fully_scanned.contains(&r.source_folder))
        .collect::<Vec<_>>();
    if !unseen.is_empty() && !ctx.control.is_cancelled() {
        let mut set = JoinSet::new();
        for record in unseen {
            let executor = executor.clone();
            let folder = record.source_folder.clone();
            summary.folder_mut(&folder).found += 1;
            set.spawn(async move { (folder, executor.settle_unseen(record).await) });
        }
        drain(&mut set, &mut summary).await?;
    }

    let interrupted = ctx.control.is_cancelled();
    let finished_at_ms = now_epoch_ms();
    summary.finish(finished_at_ms, interrupted);

    log.with_log(|l| {
        let state = l.state();
        summary.exhausted = state
            .records
            .values()
            .filter(|r| r.status == ItemStatus::Failed && r.attempt_count >= ctx.max_attempts)
            .map(|r| r.signature.to_string())
            .collect();
        summary.manual_cleanup = state
            .records
            .values()
            .filter(|r| r.status == ItemStatus::Verified && r.manual_cleanup)
            .map(|r| r.signature.to_string())
            .collect();

        meta.finished_at_ms = Some(finished_at_ms);
        meta.interrupted = interrupted;
        meta.totals = totals_of(&summary);
        l.record_run(&meta)?;
        l.compact()
    })?;
    store.close().await;

    tracing::info!(
        run_id = %ctx.run_id,
        found = summary.total.found,
        succeeded = summary.total.succeeded,
        failed = summary.total.failed,
        manual_cleanup = summary.total.manual_cleanup,
        interrupted,
        success_rate = %summary.total.success_rate(),
        "migration run finished"
    );
    Ok(RunOutcome {
        summary,
        interrupted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shift::config::MigrationConfig;
    use crate::shift::context::RunControl;
    use crate::shift::record::ItemRecord;
    use crate::shift::recovery::recover;
    use crate::shift::signature::signature;
    use crate::shift::txlog::TransactionLog;
    use crate::store::MailStore;
    use crate::store::memory::{MemoryStore, OpKind, sample_headers};
    use crate::store::Flags;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    struct Rig {
        tmp: TempDir,
        store: Arc<MemoryStore>,
    }

    impl Rig {
        fn new(store: MemoryStore) -> Self {
            Self {
                tmp: tempfile::tempdir().expect("tempdir"),
                store: Arc::new(store),
            }
        }

        fn log_path(&self) -> PathBuf {
            self.tmp.path().join("state/transactions.jsonl")
        }

        fn ctx(&self, control: RunControl, workers: usize) -> Arc<RunContext> {
            let cfg = MigrationConfig {
                source_folders: vec!["Processing".into()],
                destination_folder: "Archive".into(),
                retry_delay_secs: 0,
                flag_settle_ms: 0,
                workers,
                ..MigrationConfig::default()
            };
            Arc::new(RunContext::from_config(&cfg, control))
        }

        async fn pass(&self, control: RunControl, workers: usize) -> RunOutcome {
            let log = LogWriter::new(TransactionLog::open(&self.log_path()).expect("open log"));
            let ctx = self.ctx(control, workers);
            let snapshot = recover(&log, ctx.max_attempts).expect("recover");
            run(self.store.clone(), log, ctx, snapshot)
                .await
                .expect("run")
        }

        fn records(&self) -> Vec<ItemRecord> {
            load(&self.log_path())
        }
    }

    fn load(path: &Path) -> Vec<ItemRecord> {
        TransactionLog::load(path)
            .expect("load log")
            .state()
            .records
            .values()
            .cloned()
            .collect()
    }

    fn with_status(records: &[ItemRecord], status: ItemStatus) -> Vec<&ItemRecord> {
        records.iter().filter(|r| r.status == status).collect()
    }

    #[tokio::test]
    async fn backlog_with_permanent_copy_failures() {
        let store = MemoryStore::new();
        let ids = store.seed("Processing", 250);
        for id in [&ids[7], &ids[120], &ids[249]] {
            store.fail_copy(id, u32::MAX);
        }
        let rig = Rig::new(store);

        let outcome = rig.pass(RunControl::new(), 4).await;
        let total = &outcome.summary.total;
        assert_eq!(total.found, 250);
        assert_eq!(total.succeeded, 247);
        assert_eq!(total.failed, 3);
        assert_eq!(total.success_rate(), "98.8%");
        assert!(!outcome.interrupted);
        assert_eq!(outcome.summary.exhausted.len(), 3);

        let records = rig.records();
        assert_eq!(with_status(&records, ItemStatus::Succeeded).len(), 247);
        let failed = with_status(&records, ItemStatus::Failed);
        assert_eq!(failed.len(), 3);
        assert!(failed.iter().all(|r| r.attempt_count == 3));
        for id in [&ids[7], &ids[120], &ids[249]] {
            assert_eq!(rig.store.calls(OpKind::Copy, id), 3);
        }
        assert_eq!(rig.store.count("Processing"), 3);
        assert_eq!(rig.store.count("Archive"), 247);
    }

    #[tokio::test]
    async fn second_run_touches_nothing_already_moved() {
        let store = MemoryStore::new();
        store.seed("Processing", 12);
        let rig = Rig::new(store);
        rig.pass(RunControl::new(), 2).await;

        // A lingering duplicate of a moved item must not be reprocessed.
        let headers = sample_headers("Processing", 3);
        rig.store.add("Processing", "zz-dup", headers, Flags::default());
        let ops_before = rig.store.ops().len();

        let outcome = rig.pass(RunControl::new(), 2).await;
        assert_eq!(outcome.summary.total.found, 0);
        assert_eq!(outcome.summary.total.skipped, 1);
        assert_eq!(outcome.summary.total.success_rate(), "N/A");
        let new_ops = rig.store.ops()[ops_before..]
            .iter()
            .filter(|op| op.kind != OpKind::List)
            .count();
        assert_eq!(new_ops, 0);
    }

    #[tokio::test]
    async fn resume_processes_only_pending_records() {
        let store = MemoryStore::new();
        let ids = store.seed("Processing", 6);
        let rig = Rig::new(store);

        // Seed the log: three moved earlier, three interrupted at pending.
        {
            let mut log = TransactionLog::open(&rig.log_path()).expect("open");
            for (n, id) in ids.iter().enumerate() {
                let headers = rig.store.headers_of("Processing", id).expect("seeded");
                let mut record =
                    ItemRecord::new(signature(&headers), id, "Processing", "Archive", headers);
                if n < 3 {
                    record.status = ItemStatus::Succeeded;
                } else {
                    record.attempt_count = 1;
                }
                log.upsert(&record).expect("upsert");
            }
        }

        let outcome = rig.pass(RunControl::new(), 2).await;
        assert_eq!(outcome.summary.total.found, 3);
        assert_eq!(outcome.summary.total.succeeded, 3);
        assert_eq!(outcome.summary.total.skipped, 3);
        for id in &ids[..3] {
            assert_eq!(rig.store.calls(OpKind::SetFlags, id), 0);
            assert_eq!(rig.store.calls(OpKind::Copy, id), 0);
        }
        for id in &ids[3..] {
            assert_eq!(rig.store.calls(OpKind::Copy, id), 1);
        }
        let records = rig.records();
        assert!(records.iter().all(|r| r.status == ItemStatus::Succeeded));
        assert_eq!(records.iter().filter(|r| r.attempt_count == 1).count(), 3);
    }

    #[tokio::test]
    async fn verified_records_resume_with_delete_only() {
        let store = MemoryStore::new();
        let ids = store.seed("Processing", 2);
        let rig = Rig::new(store);

        // Crash window: both copies landed and were verified, nothing deleted.
        {
            let mut log = TransactionLog::open(&rig.log_path()).expect("open");
            for id in &ids {
                rig.store
                    .copy("Processing", id, "Archive")
                    .await
                    .expect("copy");
                let headers = rig.store.headers_of("Processing", id).expect("seeded");
                let mut record =
                    ItemRecord::new(signature(&headers), id, "Processing", "Archive", headers);
                for next in [
                    ItemStatus::FlagsUpdated,
                    ItemStatus::Copied,
                    ItemStatus::Verified,
                ] {
                    record.advance(next).expect("advance");
                    log.upsert(&record).expect("upsert");
                }
            }
        }

        let outcome = rig.pass(RunControl::new(), 2).await;
        assert_eq!(outcome.summary.total.succeeded, 2);
        for id in &ids {
            assert_eq!(rig.store.calls(OpKind::Copy, id), 1);
            assert_eq!(rig.store.calls(OpKind::Delete, id), 1);
            assert_eq!(rig.store.calls(OpKind::SetFlags, id), 0);
        }
        assert_eq!(rig.store.count("Archive"), 2);
        assert_eq!(rig.store.count("Processing"), 0);
        for record in rig.records() {
            assert_eq!(record.status, ItemStatus::Succeeded);
            assert!(record.verified_at_ms <= record.deleted_at_ms);
        }
    }

    #[tokio::test]
    async fn interruption_after_flags_resumes_from_pending() {
        let store = MemoryStore::new();
        let ids = store.seed("Processing", 3);
        let target = ids[0].clone();
        let rig = Rig::new(store);

        let control = RunControl::new();
        rig.store
            .cancel_after(OpKind::SetFlags, &target, control.clone());
        let first = rig.pass(control, 1).await;
        assert!(first.interrupted);
        assert_eq!(rig.store.calls(OpKind::Copy, &target), 0);

        let sig = signature(&sample_headers("Processing", 0));
        let after_first = rig
            .records()
            .into_iter()
            .find(|r| r.signature == sig)
            .expect("record written");
        assert_eq!(after_first.status, ItemStatus::FlagsUpdated);

        let second = rig.pass(RunControl::new(), 1).await;
        assert!(!second.interrupted);
        assert_eq!(rig.store.calls(OpKind::SetFlags, &target), 2);
        assert_eq!(rig.store.calls(OpKind::Copy, &target), 1);
        assert_eq!(rig.store.count("Archive"), 3);
        assert!(rig.records().iter().all(|r| r.status == ItemStatus::Succeeded));
    }

    #[tokio::test]
    async fn deletes_are_always_preceded_by_verification() {
        let store = MemoryStore::new();
        let ids = store.seed("Processing", 20);
        store.fail_delete(&ids[4], 1);
        store.fail_copy(&ids[9], 2);
        let rig = Rig::new(store);
        rig.pass(RunControl::new(), 4).await;

        for record in rig.records() {
            if let Some(deleted) = record.deleted_at_ms {
                let verified = record.verified_at_ms.expect("verified before delete");
                assert!(deleted >= verified);
            }
        }
    }

    #[tokio::test]
    async fn duplicate_signatures_are_dispatched_once() {
        let store = MemoryStore::new();
        let headers = sample_headers("Processing", 1);
        store.add("Processing", "a", headers.clone(), Flags::default());
        store.add("Processing", "b", headers, Flags::default());
        let rig = Rig::new(store);

        let outcome = rig.pass(RunControl::new(), 2).await;
        assert_eq!(outcome.summary.total.found, 1);
        assert_eq!(outcome.summary.total.duplicates, 1);
        assert_eq!(rig.store.total_calls(OpKind::Copy), 1);
        assert_eq!(rig.store.count("Archive"), 1);
        assert_eq!(rig.records().len(), 1);
    }

    #[tokio::test]
    async fn cancelled_before_start_claims_nothing() {
        let store = MemoryStore::new();
        store.seed("Processing", 5);
        let rig = Rig::new(store);
        let control = RunControl::new();
        control.cancel();

        let outcome = rig.pass(control, 2).await;
        assert!(outcome.interrupted);
        assert_eq!(outcome.summary.total.found, 0);
        assert!(rig.records().is_empty());
        assert_eq!(rig.store.count("Processing"), 5);
    }

    #[tokio::test]
    async fn vanished_resumable_records_are_settled() {
        let store = MemoryStore::new();
        let ids = store.seed("Processing", 2);
        let rig = Rig::new(store);
        {
            let mut log = TransactionLog::open(&rig.log_path()).expect("open");
            for id in &ids {
                let headers = rig.store.headers_of("Processing", id).expect("seeded");
                let record =
                    ItemRecord::new(signature(&headers), id, "Processing", "Archive", headers);
                log.upsert(&record).expect("upsert");
            }
        }
        // One made it to the destination before vanishing, one did not.
        rig.store
            .copy("Processing", &ids[0], "Archive")
            .await
            .expect("copy");
        rig.store.remove("Processing", &ids[0]);
        rig.store.remove("Processing", &ids[1]);

        let outcome = rig.pass(RunControl::new(), 2).await;
        assert_eq!(outcome.summary.total.succeeded, 1);
        assert_eq!(outcome.summary.total.failed, 1);
        let failed = rig
            .records()
            .into_iter()
            .find(|r| r.status == ItemStatus::Failed)
            .expect("one failed");
        assert!(
            failed
                .last_error
                .as_deref()
                .unwrap_or("")
                .contains("item vanished from source")
        );
        assert_eq!(outcome.summary.exhausted, vec![failed.signature.to_string()]);

        // Settled for good: later runs neither retry nor re-check it.
        let checks_before = rig.store.total_calls(OpKind::Exists);
        let again = rig.pass(RunControl::new(), 2).await;
        assert_eq!(again.summary.total.failed, 0);
        assert_eq!(again.summary.exhausted, vec![failed.signature.to_string()]);
        assert_eq!(rig.store.total_calls(OpKind::Exists), checks_before);
    }
}
