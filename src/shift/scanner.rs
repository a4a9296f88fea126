use crate::shift::context::RunContext;
use crate::shift::record::ItemRecord;
use crate::shift::recovery::RecoverySnapshot;
use crate::shift::signature::{Signature, signature};
use crate::store::{ListedItem, MailStore, StoreError, timed};
use std::collections::HashSet;

/// Keyset pager over one source folder.
#[derive(Debug)]
pub struct Scanner {
    folder: String,
    batch_size: usize,
    cursor: Option<String>,
    exhausted: bool,
}

impl Scanner {
    pub fn new(folder: impl Into<String>, batch_size: usize) -> Self {
        Self {
            folder: folder.into(),
            batch_size: batch_size.max(1),
            cursor: None,
            exhausted: false,
        }
    }

    /// Next page of the folder, `None` once every page has been handed out.
    pub async fn next_batch(
        &mut self,
        store: &dyn MailStore,
        ctx: &RunContext,
    ) -> Result<Option<Vec<ListedItem>>, StoreError> {
        if self.exhausted {
            return Ok(None);
        }
        let page = timed(
            ctx.op_timeout,
            store.list(&self.folder, self.cursor.as_deref(), self.batch_size),
        )
        .await?;
        match page.next_cursor {
            Some(next) => self.cursor = Some(next),
            None => self.exhausted = true,
        }
        if page.entries.is_empty() && self.exhausted {
            return Ok(None);
        }
        Ok(Some(page.entries))
    }
}

#[derive(Debug, Default)]
pub struct Triage {
    pub dispatch: Vec<ItemRecord>,
    /// Already migrated, or parked for an operator.
    pub skipped: u64,
    /// Same signature already dispatched during this run.
    pub duplicates: u64,
}

/// Turn a listed page into work. Every signature is dispatched at most once
/// per run; `claimed` carries that across pages and folders.
pub fn triage(
    batch: Vec<ListedItem>,
    folder: &str,
    ctx: &RunContext,
    snapshot: &mut RecoverySnapshot,
    blocked: &HashSet<Signature>,
    claimed: &mut HashSet<Signature>,
) -> Triage {
    let mut out = Triage::default();
    for item in batch {
        let sig = signature(&item.headers);
        if snapshot.succeeded.contains(&sig) || blocked.contains(&sig) {
            tracing::debug!(signature = sig.short(), folder, "skipping settled item");
            out.skipped += 1;
            continue;
        }
        if !claimed.insert(sig.clone()) {
            tracing::info!(
                signature = sig.short(),
                folder,
                identity = %item.identity,
                "dropping duplicate item"
            );
            out.duplicates += 1;
            continue;
        }

        let record = match snapshot.resumable.remove(&sig) {
            Some(mut record) => {
                record.identity = item.identity;
                record.source_folder = folder.to_string();
                record
            }
            None => ItemRecord::new(
                sig,
                item.identity,
                folder,
                ctx.destination_folder.clone(),
                item.headers,
            ),
        };
        out.dispatch.push(record);
    }
    out
}
