use crate::shift::record::{ItemRecord, ItemStatus};
use crate::shift::signature::Signature;
use crate::shift::txlog::LogWriter;
use anyhow::Result;
use std::collections::{BTreeMap, HashSet};

/// Startup view of the transaction log: what to skip, what to pick up
/// again, and what needs an operator.
#[derive(Debug, Clone, Default)]
pub struct RecoverySnapshot {
    pub succeeded: HashSet<Signature>,
    /// Interrupted records keyed by signature. Everything before `verified`
    /// has been reset to `pending` with its attempt count kept.
    pub resumable: BTreeMap<Signature, ItemRecord>,
    /// Failed with the attempt budget spent.
    pub exhausted: Vec<ItemRecord>,
    /// Verified, but deleting the source copy ran out of attempts.
    pub manual_cleanup: Vec<ItemRecord>,
    /// `deleted` records promoted to `succeeded` during recovery.
    pub promoted: usize,
}

impl RecoverySnapshot {
    /// Signatures the scanner must leave alone this run.
    pub fn blocked(&self) -> HashSet<Signature> {
        self.exhausted
            .iter()
            .chain(self.manual_cleanup.iter())
            .map(|r| r.signature.clone())
            .collect()
    }
}

pub fn recover(log: &LogWriter, max_attempts: u32) -> Result<RecoverySnapshot> {
    log.with_log(|log| {
        let mut snapshot = RecoverySnapshot::default();

        let finished_deletes = log
            .state()
            .records
            .values()
            .filter(|r| r.status == ItemStatus::Deleted)
            .cloned()
            .collect::<Vec<_>>();
        for mut record in finished_deletes {
            record.advance(ItemStatus::Succeeded)?;
            log.upsert(&record)?;
            snapshot.promoted += 1;
        }

        snapshot.succeeded = log.succeeded_signatures();

        for mut record in log.resumable_records() {
            if record.status != ItemStatus::Pending {
                record.advance(ItemStatus::Pending)?;
            }
            snapshot.resumable.insert(record.signature.clone(), record);
        }

        for record in log.state().records.values() {
            match record.status {
                ItemStatus::Verified if record.manual_cleanup => {
                    snapshot.manual_cleanup.push(record.clone());
                }
                ItemStatus::Verified => {
                    snapshot
                        .resumable
                        .insert(record.signature.clone(), record.clone());
                }
                ItemStatus::Failed if record.attempt_count >= max_attempts => {
                    snapshot.exhausted.push(record.clone());
                }
                ItemStatus::Failed => {
                    let mut again = record.clone();
                    again.advance(ItemStatus::Pending)?;
                    snapshot.resumable.insert(again.signature.clone(), again);
                }
                _ => {}
            }
        }

        if snapshot.promoted > 0 || !snapshot.resumable.is_empty() {
            tracing::info!(
                promoted = snapshot.promoted,
                resumable = snapshot.resumable.len(),
                exhausted = snapshot.exhausted.len(),
                manual_cleanup = snapshot.manual_cleanup.len(),
                "recovered interrupted work"
            );
        }
        Ok(snapshot)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shift::signature::HeaderSubset;
    use crate::shift::txlog::TransactionLog;
    use tempfile::tempdir;

    fn record(tag: char, status: ItemStatus, attempts: u32) -> ItemRecord {
        let mut r = ItemRecord::new(
            Signature::from(tag.to_string().repeat(64)),
            "1",
            "Processing",
            "Archive",
            HeaderSubset::default(),
        );
        r.status = status;
        r.attempt_count = attempts;
        r
    }

    #[test]
    fn snapshot_partitions_log_by_status() {
        let tmp = tempdir().expect("tempdir");
        let mut log = TransactionLog::open(&tmp.path().join("tx.jsonl")).expect("open");
        log.upsert(&record('a', ItemStatus::Succeeded, 0)).expect("a");
        log.upsert(&record('b', ItemStatus::Copied, 1)).expect("b");
        log.upsert(&record('c', ItemStatus::Verified, 0)).expect("c");
        let mut manual = record('d', ItemStatus::Verified, 3);
        manual.manual_cleanup = true;
        log.upsert(&manual).expect("d");
        log.upsert(&record('e', ItemStatus::Failed, 3)).expect("e");
        log.upsert(&record('f', ItemStatus::Failed, 1)).expect("f");
        log.upsert(&record('g', ItemStatus::Deleted, 0)).expect("g");

        let writer = LogWriter::new(log);
        let snapshot = recover(&writer, 3).expect("recover");

        assert_eq!(snapshot.promoted, 1);
        assert_eq!(snapshot.succeeded.len(), 2);
        assert_eq!(snapshot.exhausted.len(), 1);
        assert_eq!(snapshot.manual_cleanup.len(), 1);

        let statuses = snapshot
            .resumable
            .values()
            .map(|r| (r.signature.as_str().chars().next().unwrap_or('?'), r.status, r.attempt_count))
            .collect::<Vec<_>>();
        assert_eq!(
            statuses,
            vec![
                ('b', ItemStatus::Pending, 1),
                ('c', ItemStatus::Verified, 0),
                ('f', ItemStatus::Pending, 1),
            ]
        );
        assert_eq!(snapshot.blocked().len(), 2);

        let promoted = writer
            .with_log(|log| Ok(log.get(&Signature::from("g".repeat(64))).cloned()))
            .expect("read")
            .expect("g present");
        assert_eq!(promoted.status, ItemStatus::Succeeded);
    }

    #[test]
    fn empty_log_is_a_first_run() {
        let tmp = tempdir().expect("tempdir");
        let log = TransactionLog::open(&tmp.path().join("tx.jsonl")).expect("open");
        let snapshot = recover(&LogWriter::new(log), 3).expect("recover");
        assert!(snapshot.succeeded.is_empty());
        assert!(snapshot.resumable.is_empty());
    }
}
