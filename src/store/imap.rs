use super::{Flags, ListedItem, MailStore, Page, StoreError};
use crate::shift::config::{ImapConfig, ImapSecurity};
use crate::shift::signature::{HeaderSubset, Signature, signature};
use anyhow::{Context, Result};
use async_trait::async_trait;
use imap::types::Flag;
use native_tls::{TlsConnector, TlsStream};
use std::io::ErrorKind;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use utf7_imap::encode_utf7_imap;

type TlsSession = imap::Session<TlsStream<TcpStream>>;

const HEADER_QUERY: &str = "(UID RFC822.SIZE BODY.PEEK[HEADER])";

/// One authenticated connection, re-opened lazily after an I/O failure.
struct Conn {
    cfg: ImapConfig,
    timeout: Duration,
    session: Option<TlsSession>,
    selected: Option<String>,
    uidplus: Option<bool>,
}

pub struct ImapStore {
    conns: Vec<Arc<Mutex<Conn>>>,
    next: AtomicUsize,
}

fn quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

/// Mailbox names go over the wire in modified UTF-7.
fn mailbox(folder: &str) -> String {
    encode_utf7_imap(folder.to_string())
}

/// UID set for `UID EXPUNGE`, or `None` when only a plain `EXPUNGE` is
/// available.
fn expunge_scope(uidplus: bool, uid: u32) -> Option<String> {
    uidplus.then(|| uid.to_string())
}

fn parse_uid(identity: &str) -> Result<u32, StoreError> {
    identity
        .parse::<u32>()
        .map_err(|_| StoreError::Transient(format!("`{identity}` is not an IMAP UID")))
}

fn open_session(cfg: &ImapConfig, timeout: Duration) -> Result<TlsSession, StoreError> {
    let addr = (cfg.host.as_str(), cfg.port)
        .to_socket_addrs()
        .map_err(|err| StoreError::Transient(format!("resolve {}: {err}", cfg.host)))?
        .next()
        .ok_or_else(|| StoreError::Transient(format!("no address for {}", cfg.host)))?;
    let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(|err| io_failure(err, timeout))?;
    tcp.set_read_timeout(Some(timeout))
        .and_then(|_| tcp.set_write_timeout(Some(timeout)))
        .map_err(|err| io_failure(err, timeout))?;

    let tls = TlsConnector::new().map_err(|err| StoreError::Transient(err.to_string()))?;
    let client = match cfg.security {
        ImapSecurity::Tls => {
            let stream = tls
                .connect(&cfg.host, tcp)
                .map_err(|err| StoreError::Transient(format!("tls handshake: {err}")))?;
            let mut client = imap::Client::new(stream);
            client
                .read_greeting()
                .map_err(|err| imap_failure(err, timeout))?;
            client
        }
        ImapSecurity::Starttls => {
            let mut plain = imap::Client::new(tcp);
            plain
                .read_greeting()
                .map_err(|err| imap_failure(err, timeout))?;
            plain
                .secure(&cfg.host, &tls)
                .map_err(|err| imap_failure(err, timeout))?
        }
    };

    client
        .login(&cfg.username, &cfg.password)
        .map_err(|(err, _)| imap_failure(err, timeout))
}

fn io_failure(err: std::io::Error, timeout: Duration) -> StoreError {
    match err.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => StoreError::Timeout(timeout),
        _ => StoreError::Transient(err.to_string()),
    }
}

fn imap_failure(err: imap::error::Error, timeout: Duration) -> StoreError {
    match err {
        imap::error::Error::Io(io) => io_failure(io, timeout),
        other => StoreError::Transient(other.to_string()),
    }
}

impl Conn {
    fn session(&mut self) -> Result<&mut TlsSession, StoreError> {
        if self.session.is_none() {
            self.session = Some(open_session(&self.cfg, self.timeout)?);
            self.selected = None;
            self.uidplus = None;
        }
        self.session
            .as_mut()
            .ok_or_else(|| StoreError::Transient("imap session unavailable".to_string()))
    }

    /// Maps an error and forgets the session when the socket is suspect.
    fn fail(&mut self, err: imap::error::Error) -> StoreError {
        let broken = matches!(
            err,
            imap::error::Error::Io(_) | imap::error::Error::ConnectionLost
        );
        if broken {
            self.session = None;
            self.selected = None;
        }
        imap_failure(err, self.timeout)
    }

    fn select(&mut self, folder: &str) -> Result<(), StoreError> {
        if self.selected.as_deref() == Some(folder) {
            let outcome = self.session()?.noop();
            return outcome.map_err(|err| self.fail(err));
        }
        let outcome = self.session()?.select(mailbox(folder));
        match outcome {
            Ok(_) => {
                self.selected = Some(folder.to_string());
                Ok(())
            }
            Err(imap::error::Error::No(msg)) => {
                self.selected = None;
                Err(StoreError::NotFound(format!("folder {folder}: {msg}")))
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    fn require(&mut self, uid: u32) -> Result<(), StoreError> {
        let outcome = self.session()?.uid_search(format!("UID {uid}"));
        let hits = outcome.map_err(|err| self.fail(err))?;
        if hits.contains(&uid) {
            Ok(())
        } else {
            Err(StoreError::NotFound(format!("uid {uid}")))
        }
    }

    fn store(&mut self, uid: u32, query: &str) -> Result<(), StoreError> {
        let outcome = self.session()?.uid_store(uid.to_string(), query).map(|_| ());
        outcome.map_err(|err| self.fail(err))
    }

    fn supports_uidplus(&mut self) -> Result<bool, StoreError> {
        if let Some(known) = self.uidplus {
            return Ok(known);
        }
        let outcome = self
            .session()?
            .capabilities()
            .map(|caps| caps.has_str("UIDPLUS"));
        let known = outcome.map_err(|err| self.fail(err))?;
        if !known {
            tracing::warn!(
                host = %self.cfg.host,
                "server lacks UIDPLUS; deletes fall back to a folder-wide EXPUNGE"
            );
        }
        self.uidplus = Some(known);
        Ok(known)
    }

    /// Remove `uid` after it was flagged `\Deleted`. Other messages flagged
    /// in the same folder are left alone whenever the server allows it.
    fn expunge(&mut self, uid: u32) -> Result<(), StoreError> {
        let scope = expunge_scope(self.supports_uidplus()?, uid);
        let outcome = match scope {
            Some(set) => self.session()?.uid_expunge(set).map(|_| ()),
            None => self.session()?.expunge().map(|_| ()),
        };
        outcome.map_err(|err| self.fail(err))
    }

    fn headers(&mut self, uids: &[u32]) -> Result<Vec<ListedItem>, StoreError> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let set = uids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let outcome = self.session()?.uid_fetch(set, HEADER_QUERY);
        let fetches = outcome.map_err(|err| self.fail(err))?;
        let mut items = fetches
            .iter()
            .filter_map(|fetch| {
                let uid = fetch.uid?;
                let raw = fetch.header().unwrap_or_default();
                let size = fetch.size.map(u64::from).unwrap_or(raw.len() as u64);
                Some((uid, HeaderSubset::from_raw(raw, size)))
            })
            .collect::<Vec<_>>();
        items.sort_by_key(|(uid, _)| *uid);
        Ok(items
            .into_iter()
            .map(|(uid, headers)| ListedItem {
                identity: uid.to_string(),
                headers,
            })
            .collect())
    }
}

impl ImapStore {
    pub async fn connect(cfg: &ImapConfig, sessions: usize, timeout: Duration) -> Result<Self> {
        let mut conns = Vec::with_capacity(sessions.max(1));
        for _ in 0..sessions.max(1) {
            let cfg = cfg.clone();
            let conn = tokio::task::spawn_blocking(move || {
                open_session(&cfg, timeout).map(|session| Conn {
                    cfg,
                    timeout,
                    session: Some(session),
                    selected: None,
                    uidplus: None,
                })
            })
            .await
            .context("imap connect task failed")?
            .with_context(|| "failed to open imap session")?;
            conns.push(Arc::new(Mutex::new(conn)));
        }
        tracing::info!(host = %cfg.host, sessions = conns.len(), "imap sessions ready");
        Ok(Self {
            conns,
            next: AtomicUsize::new(0),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Conn) -> Result<T, StoreError> + Send + 'static,
    {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.conns.len();
        let conn = Arc::clone(&self.conns[idx]);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Transient("imap session poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|err| StoreError::Transient(format!("imap task failed: {err}")))?
    }
}

#[async_trait]
impl MailStore for ImapStore {
    async fn list(
        &self,
        folder: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page, StoreError> {
        let after = cursor.map(parse_uid).transpose()?.unwrap_or(0);
        let limit = limit.max(1);
        let folder = folder.to_string();
        self.with_conn(move |conn| {
            conn.select(&folder)?;
            let outcome = conn.session()?.uid_search("ALL");
            let mut uids = outcome
                .map_err(|err| conn.fail(err))?
                .into_iter()
                .filter(|uid| *uid > after)
                .collect::<Vec<_>>();
            uids.sort_unstable();
            let has_more = uids.len() > limit;
            uids.truncate(limit);

            let entries = conn.headers(&uids)?;
            let next_cursor = if has_more {
                uids.last().map(u32::to_string)
            } else {
                None
            };
            Ok(Page {
                entries,
                next_cursor,
            })
        })
        .await
    }

    async fn fetch_flags(&self, folder: &str, identity: &str) -> Result<Flags, StoreError> {
        let uid = parse_uid(identity)?;
        let folder = folder.to_string();
        self.with_conn(move |conn| {
            conn.select(&folder)?;
            conn.require(uid)?;
            let outcome = conn.session()?.uid_fetch(uid.to_string(), "FLAGS");
            let fetches = outcome.map_err(|err| conn.fail(err))?;
            let fetch = fetches
                .iter()
                .find(|f| f.uid == Some(uid))
                .ok_or_else(|| StoreError::NotFound(format!("uid {uid}")))?;
            let flags = fetch.flags();
            Ok(Flags {
                seen: flags.iter().any(|f| matches!(f, Flag::Seen)),
                flagged: flags.iter().any(|f| matches!(f, Flag::Flagged)),
            })
        })
        .await
    }

    async fn set_flags(
        &self,
        folder: &str,
        identity: &str,
        flags: Flags,
    ) -> Result<(), StoreError> {
        let uid = parse_uid(identity)?;
        let folder = folder.to_string();
        self.with_conn(move |conn| {
            conn.select(&folder)?;
            conn.require(uid)?;
            let seen = if flags.seen { '+' } else { '-' };
            let flagged = if flags.flagged { '+' } else { '-' };
            conn.store(uid, &format!("{seen}FLAGS.SILENT (\\Seen)"))?;
            conn.store(uid, &format!("{flagged}FLAGS.SILENT (\\Flagged)"))
        })
        .await
    }

    async fn copy(&self, source: &str, identity: &str, dest: &str) -> Result<(), StoreError> {
        let uid = parse_uid(identity)?;
        let (source, dest) = (source.to_string(), dest.to_string());
        self.with_conn(move |conn| {
            conn.select(&source)?;
            conn.require(uid)?;
            let outcome = conn.session()?.uid_copy(uid.to_string(), mailbox(&dest));
            outcome.map_err(|err| conn.fail(err))
        })
        .await
    }

    async fn exists(
        &self,
        folder: &str,
        wanted: &Signature,
        headers: &HeaderSubset,
    ) -> Result<bool, StoreError> {
        let query = if !headers.message_id.is_empty() {
            format!("HEADER Message-ID {}", quote(&headers.message_id))
        } else if !headers.subject.is_empty() {
            format!("SUBJECT {}", quote(&headers.subject))
        } else {
            "ALL".to_string()
        };
        let folder = folder.to_string();
        let wanted = wanted.clone();
        self.with_conn(move |conn| {
            match conn.select(&folder) {
                Ok(()) => {}
                Err(StoreError::NotFound(_)) => return Ok(false),
                Err(err) => return Err(err),
            }
            let outcome = conn.session()?.uid_search(&query);
            let mut uids = outcome
                .map_err(|err| conn.fail(err))?
                .into_iter()
                .collect::<Vec<_>>();
            if uids.is_empty() {
                return Ok(false);
            }
            uids.sort_unstable();
            let set = uids
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(",");
            let outcome = conn.session()?.uid_fetch(set, HEADER_QUERY);
            let fetches = outcome.map_err(|err| conn.fail(err))?;
            Ok(fetches.iter().any(|fetch| {
                let raw = fetch.header().unwrap_or_default();
                let size = fetch.size.map(u64::from).unwrap_or(raw.len() as u64);
                signature(&HeaderSubset::from_raw(raw, size)) == wanted
            }))
        })
        .await
    }

    async fn delete(&self, folder: &str, identity: &str) -> Result<(), StoreError> {
        let uid = parse_uid(identity)?;
        let folder = folder.to_string();
        self.with_conn(move |conn| {
            conn.select(&folder)?;
            conn.require(uid)?;
            conn.store(uid, "+FLAGS.SILENT (\\Deleted)")?;
            conn.expunge(uid)
        })
        .await
    }

    async fn close(&self) {
        for conn in &self.conns {
            let conn = Arc::clone(conn);
            let _ = tokio::task::spawn_blocking(move || {
                if let Ok(mut guard) = conn.lock() {
                    if let Some(mut session) = guard.session.take() {
                        let _ = session.logout();
                    }
                }
            })
            .await;
        }
    }
}
