//! In-process store with fault injection for engine tests.

use super::{Flags, ListedItem, MailStore, Page, StoreError};
use crate::shift::context::RunControl;
use crate::shift::signature::{HeaderSubset, Signature, signature};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    List,
    FetchFlags,
    SetFlags,
    Copy,
    Exists,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Op {
    pub kind: OpKind,
    pub folder: String,
    pub identity: String,
}

#[derive(Debug, Clone)]
struct Message {
    headers: HeaderSubset,
    flags: Flags,
    hidden: bool,
}

#[derive(Debug, Default)]
struct Inner {
    folders: BTreeMap<String, BTreeMap<String, Message>>,
    next_id: u64,
    ops: Vec<Op>,
    copy_failures: HashMap<String, u32>,
    delete_failures: HashMap<String, u32>,
    flag_lag: HashMap<String, u32>,
    hidden_copies: HashSet<String>,
    stalled_copies: HashSet<String>,
    cancel_after: HashMap<(OpKind, String), RunControl>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

pub fn sample_headers(tag: &str, n: usize) -> HeaderSubset {
    HeaderSubset {
        message_id: format!("<{tag}-{n}@example.org>"),
        from: "sender@example.org".to_string(),
        subject: format!("{tag} message {n}"),
        date: "2024-03-01T10:00:00Z".to_string(),
        size: 1_000 + n as u64,
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory store poisoned")
    }

    pub fn add(&self, folder: &str, identity: &str, headers: HeaderSubset, flags: Flags) {
        self.lock()
            .folders
            .entry(folder.to_string())
            .or_default()
            .insert(
                identity.to_string(),
                Message {
                    headers,
                    flags,
                    hidden: false,
                },
            );
    }

    /// `count` unread, flagged messages with distinct headers. Returns
    /// their identities in listing order.
    pub fn seed(&self, folder: &str, count: usize) -> Vec<String> {
        (0..count)
            .map(|n| {
                let identity = format!("{n:06}");
                self.add(
                    folder,
                    &identity,
                    sample_headers(folder, n),
                    Flags {
                        seen: false,
                        flagged: true,
                    },
                );
                identity
            })
            .collect()
    }

    pub fn headers_of(&self, folder: &str, identity: &str) -> Option<HeaderSubset> {
        self.lock()
            .folders
            .get(folder)
            .and_then(|f| f.get(identity))
            .map(|m| m.headers.clone())
    }

    pub fn remove(&self, folder: &str, identity: &str) {
        if let Some(f) = self.lock().folders.get_mut(folder) {
            f.remove(identity);
        }
    }

    /// Fail the next `times` copies of `identity`; `u32::MAX` never heals.
    pub fn fail_copy(&self, identity: &str, times: u32) {
        self.lock().copy_failures.insert(identity.to_string(), times);
    }

    pub fn fail_delete(&self, identity: &str, times: u32) {
        self.lock()
            .delete_failures
            .insert(identity.to_string(), times);
    }

    /// Ignore the next `calls` flag updates of `identity`.
    pub fn lag_flags(&self, identity: &str, calls: u32) {
        self.lock().flag_lag.insert(identity.to_string(), calls);
    }

    /// Copies of `identity` land but never show up in `exists`.
    pub fn hide_copies(&self, identity: &str) {
        self.lock().hidden_copies.insert(identity.to_string());
    }

    /// Copies of `identity` never answer; only the caller's timeout ends them.
    pub fn stall_copies(&self, identity: &str) {
        self.lock().stalled_copies.insert(identity.to_string());
    }

    /// Cancel `control` once an operation of `kind` on `identity` completes.
    pub fn cancel_after(&self, kind: OpKind, identity: &str, control: RunControl) {
        self.lock()
            .cancel_after
            .insert((kind, identity.to_string()), control);
    }

    pub fn count(&self, folder: &str) -> usize {
        self.lock().folders.get(folder).map_or(0, BTreeMap::len)
    }

    pub fn flags(&self, folder: &str, identity: &str) -> Option<Flags> {
        self.lock()
            .folders
            .get(folder)
            .and_then(|f| f.get(identity))
            .map(|m| m.flags)
    }

    pub fn ops(&self) -> Vec<Op> {
        self.lock().ops.clone()
    }

    pub fn calls(&self, kind: OpKind, identity: &str) -> usize {
        self.lock()
            .ops
            .iter()
            .filter(|op| op.kind == kind && op.identity == identity)
            .count()
    }

    pub fn total_calls(&self, kind: OpKind) -> usize {
        self.lock().ops.iter().filter(|op| op.kind == kind).count()
    }

    fn record(inner: &mut Inner, kind: OpKind, folder: &str, identity: &str) {
        inner.ops.push(Op {
            kind,
            folder: folder.to_string(),
            identity: identity.to_string(),
        });
    }

    fn finish(inner: &Inner, kind: OpKind, identity: &str) {
        if let Some(control) = inner.cancel_after.get(&(kind, identity.to_string())) {
            control.cancel();
        }
    }

    fn take_fault(faults: &mut HashMap<String, u32>, identity: &str) -> bool {
        match faults.get_mut(identity) {
            Some(left) if *left > 0 => {
                if *left != u32::MAX {
                    *left -= 1;
                }
                true
            }
            _ => false,
        }
    }
}

fn missing(folder: &str, identity: &str) -> StoreError {
    StoreError::NotFound(format!("{identity} not in {folder}"))
}

#[async_trait]
impl MailStore for MemoryStore {
    async fn list(
        &self,
        folder: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page, StoreError> {
        let mut inner = self.lock();
        Self::record(&mut inner, OpKind::List, folder, cursor.unwrap_or(""));
        let Some(items) = inner.folders.get(folder) else {
            return Err(StoreError::NotFound(format!("folder {folder}")));
        };
        let remaining = items
            .iter()
            .filter(|(id, _)| cursor.is_none_or(|c| id.as_str() > c))
            .collect::<Vec<_>>();
        let entries = remaining
            .iter()
            .take(limit)
            .map(|(id, m)| ListedItem {
                identity: (*id).clone(),
                headers: m.headers.clone(),
            })
            .collect::<Vec<_>>();
        let next_cursor = if remaining.len() > limit {
            entries.last().map(|e| e.identity.clone())
        } else {
            None
        };
        Ok(Page {
            entries,
            next_cursor,
        })
    }

    async fn fetch_flags(&self, folder: &str, identity: &str) -> Result<Flags, StoreError> {
        let mut inner = self.lock();
        Self::record(&mut inner, OpKind::FetchFlags, folder, identity);
        inner
            .folders
            .get(folder)
            .and_then(|f| f.get(identity))
            .map(|m| m.flags)
            .ok_or_else(|| missing(folder, identity))
    }

    async fn set_flags(
        &self,
        folder: &str,
        identity: &str,
        flags: Flags,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        Self::record(&mut inner, OpKind::SetFlags, folder, identity);
        let lagging = Self::take_fault(&mut inner.flag_lag, identity);
        let message = inner
            .folders
            .get_mut(folder)
            .and_then(|f| f.get_mut(identity))
            .ok_or_else(|| missing(folder, identity))?;
        if !lagging {
            message.flags = flags;
        } else {
            // Only half of the update becomes visible.
            message.flags.seen = flags.seen;
        }
        Self::finish(&inner, OpKind::SetFlags, identity);
        Ok(())
    }

    async fn copy(&self, source: &str, identity: &str, dest: &str) -> Result<(), StoreError> {
        let stalled = {
            let mut inner = self.lock();
            Self::record(&mut inner, OpKind::Copy, source, identity);
            inner.stalled_copies.contains(identity)
        };
        if stalled {
            std::future::pending::<()>().await;
        }
        let mut inner = self.lock();
        let message = inner
            .folders
            .get(source)
            .and_then(|f| f.get(identity))
            .cloned()
            .ok_or_else(|| missing(source, identity))?;
        if Self::take_fault(&mut inner.copy_failures, identity) {
            return Err(StoreError::Transient(format!("copy of {identity} refused")));
        }
        inner.next_id += 1;
        let copy_id = format!("c{:06}", inner.next_id);
        let hidden = inner.hidden_copies.contains(identity);
        inner.folders.entry(dest.to_string()).or_default().insert(
            copy_id,
            Message {
                hidden,
                ..message
            },
        );
        Self::finish(&inner, OpKind::Copy, identity);
        Ok(())
    }

    async fn exists(
        &self,
        folder: &str,
        wanted: &Signature,
        _headers: &HeaderSubset,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        Self::record(&mut inner, OpKind::Exists, folder, wanted.short());
        Ok(inner.folders.get(folder).is_some_and(|f| {
            f.values()
                .any(|m| !m.hidden && &signature(&m.headers) == wanted)
        }))
    }

    async fn delete(&self, folder: &str, identity: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        Self::record(&mut inner, OpKind::Delete, folder, identity);
        if !inner
            .folders
            .get(folder)
            .is_some_and(|f| f.contains_key(identity))
        {
            return Err(missing(folder, identity));
        }
        if Self::take_fault(&mut inner.delete_failures, identity) {
            return Err(StoreError::Transient(format!("delete of {identity} refused")));
        }
        if let Some(f) = inner.folders.get_mut(folder) {
            f.remove(identity);
        }
        Self::finish(&inner, OpKind::Delete, identity);
        Ok(())
    }
}
