//! Remote store adapters. The engine only sees [`MailStore`]; each call may
//! fail on its own and is retried by the caller, never here.

pub mod imap;
pub mod maildir;
#[cfg(test)]
pub mod memory;

use crate::shift::config::{StoreConfig, StoreKind};
use crate::shift::signature::{HeaderSubset, Signature};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("transient store failure: {0}")]
    Transient(String),
    #[error("item not found: {0}")]
    NotFound(String),
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<StoreError> for crate::error::ShiftError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::NotFound(what),
            other => Self::TransientRemote(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags {
    pub seen: bool,
    pub flagged: bool,
}

impl Flags {
    /// The state every item is normalized to before it moves.
    pub const ARCHIVED: Flags = Flags {
        seen: true,
        flagged: false,
    };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedItem {
    pub identity: String,
    pub headers: HeaderSubset,
}

#[derive(Debug, Clone, Default)]
pub struct Page {
    pub entries: Vec<ListedItem>,
    /// Resume point for the next call, `None` once the folder is exhausted.
    pub next_cursor: Option<String>,
}

#[async_trait]
pub trait MailStore: Send + Sync {
    /// Up to `limit` items of `folder` whose identity sorts after `cursor`.
    async fn list(&self, folder: &str, cursor: Option<&str>, limit: usize)
    -> Result<Page, StoreError>;

    async fn fetch_flags(&self, folder: &str, identity: &str) -> Result<Flags, StoreError>;

    async fn set_flags(&self, folder: &str, identity: &str, flags: Flags)
    -> Result<(), StoreError>;

    async fn copy(&self, source: &str, identity: &str, dest: &str) -> Result<(), StoreError>;

    /// Whether an item with `signature` is present in `folder`.
    async fn exists(
        &self,
        folder: &str,
        signature: &Signature,
        headers: &HeaderSubset,
    ) -> Result<bool, StoreError>;

    async fn delete(&self, folder: &str, identity: &str) -> Result<(), StoreError>;

    async fn close(&self) {}
}

pub type SharedStore = Arc<dyn MailStore>;

/// Bound a store call by `limit`; an elapsed call is a failed call.
pub async fn timed<T, F>(limit: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}

pub async fn open_store(
    cfg: &StoreConfig,
    sessions: usize,
    timeout: Duration,
) -> Result<SharedStore> {
    match cfg.kind {
        StoreKind::Imap => {
            let store = imap::ImapStore::connect(&cfg.imap, sessions, timeout).await?;
            Ok(Arc::new(store))
        }
        StoreKind::Maildir => {
            let store = maildir::MaildirStore::open(&cfg.maildir.root)?;
            Ok(Arc::new(store))
        }
    }
}
