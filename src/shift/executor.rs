//! Per-item copy → verify → delete state machine.
//!
//! Every transition is committed to the transaction log before the next
//! remote call is issued, and the source copy is only deleted once the
//! record is `verified`. Failed attempts are re-submitted after
//! `retry_delay` with the worker permit released in between.

use crate::error::ShiftError;
use crate::shift::context::RunContext;
use crate::shift::flags;
use crate::shift::record::{ItemRecord, ItemStatus};
use crate::shift::summary::ItemOutcome;
use crate::shift::txlog::LogWriter;
use crate::shift::util::truncate_with_ellipsis;
use crate::shift::warn::{self, WarnEvent};
use crate::store::{SharedStore, StoreError, timed};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::Semaphore;

const VANISHED: &str = "item vanished from source";
const MAX_ERROR_CHARS: usize = 300;

enum Step {
    Done(ItemOutcome),
    Retry,
}

struct Failure {
    code: &'static str,
    stage: &'static str,
    error: ShiftError,
}

impl Failure {
    fn store(code: &'static str, stage: &'static str, err: StoreError) -> Self {
        Self {
            code,
            stage,
            error: err.into(),
        }
    }

    fn text(&self) -> String {
        truncate_with_ellipsis(&self.error.to_string(), MAX_ERROR_CHARS)
    }
}

#[derive(Clone)]
pub struct Executor {
    store: SharedStore,
    log: LogWriter,
    ctx: Arc<RunContext>,
    permits: Arc<Semaphore>,
}

impl Executor {
    pub fn new(store: SharedStore, log: LogWriter, ctx: Arc<RunContext>) -> Self {
        let permits = Arc::new(Semaphore::new(ctx.workers.max(1)));
        Self {
            store,
            log,
            ctx,
            permits,
        }
    }

    fn step(&self, record: &mut ItemRecord, next: ItemStatus) -> Result<()> {
        record.advance(next)?;
        self.log.commit(record)
    }

    fn claim(&self, record: &mut ItemRecord) -> Result<()> {
        record.claimed_by = Some(self.ctx.run_id.clone());
        self.log.commit(record)
    }

    fn warn(&self, record: &ItemRecord, failure: &Failure, attempt: u32, retry: &str) {
        warn::emit(WarnEvent {
            code: failure.code,
            error_code: failure.error.code().as_str(),
            stage: failure.stage,
            signature: record.signature.short(),
            folder: &record.source_folder,
            attempt,
            retry,
            err: &failure.error.to_string(),
        });
    }

    /// Run one item until it reaches a terminal state for this run. Only
    /// transaction log failures escape as errors.
    pub async fn drive(&self, mut record: ItemRecord) -> Result<ItemOutcome> {
        let mut claimed = false;
        loop {
            let permit = Arc::clone(&self.permits)
                .acquire_owned()
                .await
                .context("worker pool closed")?;
            if self.ctx.control.is_cancelled() {
                return Ok(ItemOutcome::Interrupted);
            }
            if !claimed {
                self.claim(&mut record)?;
                claimed = true;
            }

            let step = self.attempt(&mut record).await?;
            drop(permit);
            match step {
                Step::Done(outcome) => return Ok(outcome),
                Step::Retry => {
                    if !self.ctx.control.sleep(self.ctx.retry_delay).await {
                        return Ok(ItemOutcome::Interrupted);
                    }
                }
            }
        }
    }

    async fn attempt(&self, record: &mut ItemRecord) -> Result<Step> {
        let limit = self.ctx.op_timeout;
        loop {
            if self.ctx.control.is_cancelled() {
                return Ok(Step::Done(ItemOutcome::Interrupted));
            }
            match record.status {
                ItemStatus::Pending => {
                    let settled = flags::normalize(
                        self.store.as_ref(),
                        &self.ctx,
                        &record.source_folder,
                        &record.identity,
                    )
                    .await;
                    match settled {
                        Ok(()) => self.step(record, ItemStatus::FlagsUpdated)?,
                        Err(err) if err.is_not_found() => return self.vanished(record).await,
                        Err(err) => {
                            record.attempt_count += 1;
                            let failure = Failure::store("FLAGS_UNSETTLED", "flags", err);
                            return self.fail(record, failure);
                        }
                    }
                }
                ItemStatus::FlagsUpdated => {
                    let copied = timed(
                        limit,
                        self.store.copy(
                            &record.source_folder,
                            &record.identity,
                            &record.destination_folder,
                        ),
                    )
                    .await;
                    match copied {
                        Ok(()) => self.step(record, ItemStatus::Copied)?,
                        Err(err) if err.is_not_found() => return self.vanished(record).await,
                        Err(err) => {
                            let failure = Failure::store("COPY_FAILED", "copy", err);
                            return self.retry_or_fail(record, failure, ItemStatus::Pending);
                        }
                    }
                }
                ItemStatus::Copied => {
                    let present = timed(
                        limit,
                        self.store.exists(
                            &record.destination_folder,
                            &record.signature,
                            &record.headers,
                        ),
                    )
                    .await;
                    match present {
                        Ok(true) => {
                            record.delete_attempts = 0;
                            self.step(record, ItemStatus::Verified)?
                        }
                        Ok(false) => {
                            let failure = Failure {
                                code: "VERIFY_MISS",
                                stage: "verify",
                                error: ShiftError::TransientRemote(
                                    "copy not visible in destination".to_string(),
                                ),
                            };
                            return self.retry_or_fail(record, failure, ItemStatus::Pending);
                        }
                        Err(err) => {
                            let failure = Failure::store("VERIFY_FAILED", "verify", err);
                            return self.retry_or_fail(record, failure, ItemStatus::Copied);
                        }
                    }
                }
                ItemStatus::Verified => {
                    let deleted = timed(
                        limit,
                        self.store.delete(&record.source_folder, &record.identity),
                    )
                    .await;
                    match deleted {
                        Ok(()) => return self.complete(record),
                        Err(StoreError::NotFound(_)) => {
                            tracing::info!(
                                signature = record.signature.short(),
                                folder = %record.source_folder,
                                "source copy already gone after verify"
                            );
                            return self.complete(record);
                        }
                        Err(err) => return self.delete_failed(record, err),
                    }
                }
                ItemStatus::Deleted => {
                    self.step(record, ItemStatus::Succeeded)?;
                    return Ok(Step::Done(ItemOutcome::Succeeded));
                }
                ItemStatus::Succeeded => return Ok(Step::Done(ItemOutcome::Succeeded)),
                ItemStatus::Failed => return Ok(Step::Done(ItemOutcome::Failed)),
            }
        }
    }

    fn complete(&self, record: &mut ItemRecord) -> Result<Step> {
        self.step(record, ItemStatus::Deleted)?;
        self.step(record, ItemStatus::Succeeded)?;
        tracing::debug!(
            signature = record.signature.short(),
            folder = %record.source_folder,
            attempts = record.attempt_count,
            "item moved"
        );
        Ok(Step::Done(ItemOutcome::Succeeded))
    }

    /// Terminal failure. Once the attempt budget is spent the cause is
    /// recorded as `AttemptBudgetExceeded`.
    fn fail(&self, record: &mut ItemRecord, failure: Failure) -> Result<Step> {
        let failure = if record.attempt_count >= self.ctx.max_attempts
            && !matches!(failure.error, ShiftError::NotFound(_))
        {
            Failure {
                error: ShiftError::AttemptBudgetExceeded {
                    attempts: record.attempt_count,
                    last_error: failure.error.to_string(),
                },
                ..failure
            }
        } else {
            failure
        };
        record.last_error = Some(failure.text());
        self.step(record, ItemStatus::Failed)?;
        self.warn(record, &failure, record.attempt_count, "exhausted");
        Ok(Step::Done(ItemOutcome::Failed))
    }

    /// Count the attempt, then either schedule another one from `back_to`
    /// or give up once the budget is spent.
    fn retry_or_fail(
        &self,
        record: &mut ItemRecord,
        failure: Failure,
        back_to: ItemStatus,
    ) -> Result<Step> {
        record.attempt_count += 1;
        if record.attempt_count >= self.ctx.max_attempts {
            return self.fail(record, failure);
        }
        record.last_error = Some(failure.text());
        self.step(record, back_to)?;
        self.warn(record, &failure, record.attempt_count, "scheduled");
        Ok(Step::Retry)
    }

    /// The destination copy is safe, so a failing delete never goes back
    /// to copying. Deletes have their own budget; once it is spent the
    /// record is parked for `reconcile`.
    fn delete_failed(&self, record: &mut ItemRecord, err: StoreError) -> Result<Step> {
        record.delete_attempts += 1;
        let failure = Failure::store("DELETE_FAILED", "delete", err);
        record.last_error = Some(failure.text());
        if record.delete_attempts >= self.ctx.max_attempts {
            record.manual_cleanup = true;
            self.step(record, ItemStatus::Verified)?;
            self.warn(record, &failure, record.delete_attempts, "manual-cleanup");
            return Ok(Step::Done(ItemOutcome::ManualCleanup));
        }
        self.step(record, ItemStatus::Verified)?;
        self.warn(record, &failure, record.delete_attempts, "scheduled");
        Ok(Step::Retry)
    }

    /// The source item is gone. It counts as moved only if the destination
    /// has it; otherwise it fails for good and is listed as exhausted.
    async fn vanished(&self, record: &mut ItemRecord) -> Result<Step> {
        let present = timed(
            self.ctx.op_timeout,
            self.store.exists(
                &record.destination_folder,
                &record.signature,
                &record.headers,
            ),
        )
        .await;
        match present {
            Ok(true) => {
                if record.status == ItemStatus::Verified {
                    self.step(record, ItemStatus::Deleted)?;
                }
                self.step(record, ItemStatus::Succeeded)?;
                tracing::info!(
                    signature = record.signature.short(),
                    folder = %record.source_folder,
                    "vanished item already present in destination"
                );
                Ok(Step::Done(ItemOutcome::Succeeded))
            }
            Ok(false) => {
                record.attempt_count = record.attempt_count.max(self.ctx.max_attempts);
                let failure = Failure {
                    code: "ITEM_VANISHED",
                    stage: "reconcile",
                    error: ShiftError::NotFound(VANISHED.to_string()),
                };
                self.fail(record, failure)
            }
            Err(err) => {
                let failure = Failure::store("VERIFY_FAILED", "reconcile", err);
                let back_to = record.status;
                self.retry_or_fail(record, failure, back_to)
            }
        }
    }

    /// Settle a resumable record the scan never listed: its source item is
    /// gone, so only the destination can tell whether it moved.
    pub async fn settle_unseen(&self, mut record: ItemRecord) -> Result<ItemOutcome> {
        let mut claimed = false;
        loop {
            let permit = Arc::clone(&self.permits)
                .acquire_owned()
                .await
                .context("worker pool closed")?;
            if self.ctx.control.is_cancelled() {
                return Ok(ItemOutcome::Interrupted);
            }
            if !claimed {
                self.claim(&mut record)?;
                claimed = true;
            }
            let step = self.vanished(&mut record).await?;
            drop(permit);
            match step {
                Step::Done(outcome) => return Ok(outcome),
                Step::Retry => {
                    if !self.ctx.control.sleep(self.ctx.retry_delay).await {
                        return Ok(ItemOutcome::Interrupted);
                    }
                }
            }
        }
    }
}
