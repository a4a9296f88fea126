//! Local Maildir tree: every folder is a directory with `cur/`, `new/` and
//! `tmp/`. Flags live in the `:2,` info suffix of the file name.

use super::{Flags, ListedItem, MailStore, Page, StoreError};
use crate::shift::signature::{HeaderSubset, Signature, signature};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs;

const INFO_SEPARATOR: &str = ":2,";

#[derive(Debug)]
pub struct MaildirStore {
    root: PathBuf,
    deliveries: AtomicU64,
}

#[derive(Debug, Clone)]
struct Entry {
    identity: String,
    path: PathBuf,
    info: String,
}

fn io_error(context: &str, err: std::io::Error) -> StoreError {
    if err.kind() == ErrorKind::NotFound {
        StoreError::NotFound(format!("{context}: {err}"))
    } else {
        StoreError::Transient(format!("{context}: {err}"))
    }
}

fn split_name(file_name: &str) -> (&str, &str) {
    match file_name.split_once(INFO_SEPARATOR) {
        Some((unique, info)) => (unique, info),
        None => (file_name, ""),
    }
}

fn parse_flags(info: &str) -> Flags {
    Flags {
        seen: info.contains('S'),
        flagged: info.contains('F'),
    }
}

fn apply_flags(info: &str, flags: Flags) -> String {
    let mut letters = info
        .chars()
        .filter(|c| *c != 'S' && *c != 'F')
        .collect::<Vec<_>>();
    if flags.seen {
        letters.push('S');
    }
    if flags.flagged {
        letters.push('F');
    }
    letters.sort_unstable();
    letters.dedup();
    letters.into_iter().collect()
}

impl MaildirStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("failed to create maildir root {}", root.display()))?;
        Ok(Self {
            root,
            deliveries: AtomicU64::new(0),
        })
    }

    fn folder_dir(&self, folder: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(folder);
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if folder.trim().is_empty() || !safe {
            return Err(StoreError::Transient(format!("invalid folder name `{folder}`")));
        }
        Ok(self.root.join(relative))
    }

    async fn entries(&self, folder: &str) -> Result<Vec<Entry>, StoreError> {
        let dir = self.folder_dir(folder)?;
        if !fs::try_exists(dir.join("cur"))
            .await
            .map_err(|err| io_error(folder, err))?
        {
            return Err(StoreError::NotFound(format!("folder {folder} does not exist")));
        }

        let mut out = Vec::new();
        for sub in ["new", "cur"] {
            let mut reader = match fs::read_dir(dir.join(sub)).await {
                Ok(reader) => reader,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(io_error(folder, err)),
            };
            while let Some(item) = reader
                .next_entry()
                .await
                .map_err(|err| io_error(folder, err))?
            {
                let Some(name) = item.file_name().to_str().map(ToOwned::to_owned) else {
                    continue;
                };
                if name.starts_with('.') {
                    continue;
                }
                let (unique, info) = split_name(&name);
                out.push(Entry {
                    identity: unique.to_string(),
                    info: info.to_string(),
                    path: item.path(),
                });
            }
        }
        out.sort_by(|a, b| a.identity.cmp(&b.identity));
        Ok(out)
    }

    async fn locate(&self, folder: &str, identity: &str) -> Result<Entry, StoreError> {
        self.entries(folder)
            .await?
            .into_iter()
            .find(|e| e.identity == identity)
            .ok_or_else(|| StoreError::NotFound(format!("{identity} not in {folder}")))
    }

    async fn headers_of(path: &Path) -> Result<HeaderSubset, StoreError> {
        let bytes = fs::read(path)
            .await
            .map_err(|err| io_error(&path.display().to_string(), err))?;
        Ok(HeaderSubset::from_raw(&bytes, bytes.len() as u64))
    }

    fn next_unique(&self) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let seq = self.deliveries.fetch_add(1, Ordering::Relaxed);
        format!(
            "{}.M{}P{}Q{}.mailshift",
            now.as_secs(),
            now.subsec_micros(),
            std::process::id(),
            seq
        )
    }

    async fn ensure_folder(&self, folder: &str) -> Result<PathBuf, StoreError> {
        let dir = self.folder_dir(folder)?;
        for sub in ["cur", "new", "tmp"] {
            fs::create_dir_all(dir.join(sub))
                .await
                .map_err(|err| io_error(folder, err))?;
        }
        Ok(dir)
    }
}

#[async_trait]
impl MailStore for MaildirStore {
    async fn list(
        &self,
        folder: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page, StoreError> {
        let limit = limit.max(1);
        let remaining = self
            .entries(folder)
            .await?
            .into_iter()
            .filter(|e| cursor.is_none_or(|c| e.identity.as_str() > c))
            .collect::<Vec<_>>();

        let mut entries = Vec::with_capacity(limit.min(remaining.len()));
        for entry in remaining.iter().take(limit) {
            let headers = match Self::headers_of(&entry.path).await {
                Ok(headers) => headers,
                // Removed between readdir and read: nothing left to migrate.
                Err(StoreError::NotFound(_)) => continue,
                Err(err) => return Err(err),
            };
            entries.push(ListedItem {
                identity: entry.identity.clone(),
                headers,
            });
        }

        let next_cursor = if remaining.len() > limit {
            remaining.get(limit - 1).map(|e| e.identity.clone())
        } else {
            None
        };
        Ok(Page {
            entries,
            next_cursor,
        })
    }

    async fn fetch_flags(&self, folder: &str, identity: &str) -> Result<Flags, StoreError> {
        Ok(parse_flags(&self.locate(folder, identity).await?.info))
    }

    async fn set_flags(
        &self,
        folder: &str,
        identity: &str,
        flags: Flags,
    ) -> Result<(), StoreError> {
        let entry = self.locate(folder, identity).await?;
        let dir = self.folder_dir(folder)?;
        let target = dir.join("cur").join(format!(
            "{identity}{INFO_SEPARATOR}{}",
            apply_flags(&entry.info, flags)
        ));
        if target == entry.path {
            return Ok(());
        }
        fs::rename(&entry.path, &target)
            .await
            .map_err(|err| io_error(identity, err))
    }

    async fn copy(&self, source: &str, identity: &str, dest: &str) -> Result<(), StoreError> {
        let entry = self.locate(source, identity).await?;
        let bytes = fs::read(&entry.path)
            .await
            .map_err(|err| io_error(identity, err))?;
        let dest_dir = self.ensure_folder(dest).await?;

        let unique = self.next_unique();
        let staged = dest_dir.join("tmp").join(&unique);
        fs::write(&staged, &bytes)
            .await
            .map_err(|err| io_error(dest, err))?;
        let delivered = dest_dir
            .join("cur")
            .join(format!("{unique}{INFO_SEPARATOR}{}", entry.info));
        fs::rename(&staged, &delivered)
            .await
            .map_err(|err| io_error(dest, err))
    }

    async fn exists(
        &self,
        folder: &str,
        wanted: &Signature,
        headers: &HeaderSubset,
    ) -> Result<bool, StoreError> {
        let entries = match self.entries(folder).await {
            Ok(entries) => entries,
            Err(StoreError::NotFound(_)) => return Ok(false),
            Err(err) => return Err(err),
        };
        for entry in entries {
            let len = match fs::metadata(&entry.path).await {
                Ok(meta) => meta.len(),
                Err(_) => continue,
            };
            if len != headers.size {
                continue;
            }
            let Ok(candidate) = Self::headers_of(&entry.path).await else {
                continue;
            };
            if &signature(&candidate) == wanted {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn delete(&self, folder: &str, identity: &str) -> Result<(), StoreError> {
        let entry = self.locate(folder, identity).await?;
        fs::remove_file(&entry.path)
            .await
            .map_err(|err| io_error(identity, err))
    }
}
