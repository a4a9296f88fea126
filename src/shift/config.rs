use crate::error::ShiftError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

include!(concat!(env!("OUT_DIR"), "/mailshift_env_allowlist.rs"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Imap,
    Maildir,
}

impl StoreKind {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "imap" => Some(Self::Imap),
            "maildir" => Some(Self::Maildir),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImapSecurity {
    Tls,
    Starttls,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub security: ImapSecurity,
    pub username: String,
    pub password: String,
}

impl Default for ImapConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 993,
            security: ImapSecurity::Tls,
            username: String::new(),
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MaildirConfig {
    pub root: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub kind: StoreKind,
    pub imap: ImapConfig,
    pub maildir: MaildirConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Imap,
            imap: ImapConfig::default(),
            maildir: MaildirConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    pub source_folders: Vec<String>,
    pub destination_folder: String,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub retry_delay_secs: u64,
    pub workers: usize,
    pub op_timeout_secs: u64,
    pub flag_settle_ms: u64,
    pub flag_settle_attempts: u32,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            source_folders: Vec::new(),
            destination_folder: String::new(),
            batch_size: 100,
            max_attempts: 3,
            retry_delay_secs: 5,
            workers: 4,
            op_timeout_secs: 30,
            flag_settle_ms: 1_000,
            flag_settle_attempts: 3,
        }
    }
}

impl MigrationConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_secs)
    }

    pub fn flag_settle_delay(&self) -> Duration {
        Duration::from_millis(self.flag_settle_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ShiftConfig {
    pub store: StoreConfig,
    pub migration: MigrationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialShiftConfig {
    store: Option<StoreConfig>,
    migration: Option<MigrationConfig>,
}

fn env_or_u64(var: &str, fallback: u64) -> u64 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<u64>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_usize(var: &str, fallback: usize) -> usize {
    match env::var(var) {
        Ok(v) => v.trim().parse::<usize>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_u32(var: &str, fallback: u32) -> u32 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<u32>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_string(var: &str, fallback: &str) -> String {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => fallback.to_string(),
    }
}

fn env_or_csv(var: &str, fallback: &[String]) -> Vec<String> {
    match env::var(var) {
        Ok(v) => {
            let out = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToOwned::to_owned)
                .collect::<Vec<_>>();
            if out.is_empty() {
                fallback.to_vec()
            } else {
                out
            }
        }
        Err(_) => fallback.to_vec(),
    }
}

fn invalid(message: impl Into<String>) -> anyhow::Error {
    ShiftError::InvalidConfig(message.into()).into()
}

pub fn validate(cfg: &ShiftConfig) -> Result<()> {
    let m = &cfg.migration;
    if m.source_folders.is_empty() {
        return Err(invalid("no source folders configured"));
    }
    if m.destination_folder.trim().is_empty() {
        return Err(invalid("destination folder cannot be empty"));
    }
    if m.source_folders.iter().any(|f| f == &m.destination_folder) {
        return Err(invalid(format!(
            "destination folder {} is also listed as a source",
            m.destination_folder
        )));
    }
    if m.batch_size == 0 {
        return Err(invalid("invalid batch size: must be >= 1"));
    }
    if m.max_attempts == 0 {
        return Err(invalid("invalid max attempts: must be >= 1"));
    }
    if !(1..=8).contains(&m.workers) {
        return Err(invalid("invalid worker count: require 1 <= workers <= 8"));
    }
    if m.op_timeout_secs == 0 {
        return Err(invalid("invalid operation timeout: must be >= 1 second"));
    }
    if m.flag_settle_attempts == 0 {
        return Err(invalid("invalid flag settle attempts: must be >= 1"));
    }
    match cfg.store.kind {
        StoreKind::Imap => {
            let imap = &cfg.store.imap;
            if imap.host.trim().is_empty() {
                return Err(invalid("imap host cannot be empty"));
            }
            if imap.username.trim().is_empty() {
                return Err(invalid("imap username cannot be empty"));
            }
        }
        StoreKind::Maildir => {
            if cfg.store.maildir.root.trim().is_empty() {
                return Err(invalid("maildir root cannot be empty"));
            }
        }
    }
    Ok(())
}

fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(custom) = env::var("MAILSHIFT_CONFIG_PATH") {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }

    if let Ok(home) = env::var("MAILSHIFT_HOME") {
        let trimmed = home.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed).join("mailshift.toml"));
        }
    }

    let home = dirs::home_dir()?;
    Some(home.join(".mailshift").join("mailshift.toml"))
}

fn merge_toml(base: &mut ShiftConfig, raw: &str) -> Result<()> {
    let parsed: PartialShiftConfig =
        toml::from_str(raw).map_err(|err| invalid(format!("failed to parse config: {err}")))?;
    if let Some(store) = parsed.store {
        base.store = store;
    }
    if let Some(migration) = parsed.migration {
        base.migration = migration;
    }
    Ok(())
}

fn merge_file_config(base: &mut ShiftConfig) -> Result<()> {
    let Some(path) = resolve_config_path() else {
        return Ok(());
    };
    if !path.exists() {
        return Ok(());
    }

    let raw = fs::read_to_string(&path)
        .map_err(|err| invalid(format!("failed to read {}: {err}", path.display())))?;
    merge_toml(base, &raw).with_context(|| format!("config file {}", path.display()))
}

fn apply_env(cfg: &mut ShiftConfig) -> Result<()> {
    if let Ok(raw) = env::var("MAILSHIFT_STORE_KIND") {
        cfg.store.kind = StoreKind::parse(&raw)
            .ok_or_else(|| invalid(format!("unknown store kind `{raw}`: use imap or maildir")))?;
    }
    let imap = &mut cfg.store.imap;
    imap.host = env_or_string("MAILSHIFT_IMAP_HOST", &imap.host);
    imap.port = env_or_u64("MAILSHIFT_IMAP_PORT", u64::from(imap.port))
        .try_into()
        .map_err(|_| invalid("invalid imap port"))?;
    if let Ok(raw) = env::var("MAILSHIFT_IMAP_SECURITY") {
        imap.security = match raw.trim().to_ascii_lowercase().as_str() {
            "tls" => ImapSecurity::Tls,
            "starttls" => ImapSecurity::Starttls,
            _ => return Err(invalid(format!("unknown imap security `{raw}`"))),
        };
    }
    imap.username = env_or_string("MAILSHIFT_IMAP_USERNAME", &imap.username);
    imap.password = env_or_string("MAILSHIFT_IMAP_PASSWORD", &imap.password);
    cfg.store.maildir.root = env_or_string("MAILSHIFT_MAILDIR_ROOT", &cfg.store.maildir.root);

    let m = &mut cfg.migration;
    m.source_folders = env_or_csv("MAILSHIFT_SOURCE_FOLDERS", &m.source_folders);
    m.destination_folder = env_or_string("MAILSHIFT_DESTINATION_FOLDER", &m.destination_folder);
    m.batch_size = env_or_usize("MAILSHIFT_BATCH_SIZE", m.batch_size);
    m.max_attempts = env_or_u32("MAILSHIFT_MAX_ATTEMPTS", m.max_attempts);
    m.retry_delay_secs = env_or_u64("MAILSHIFT_RETRY_DELAY_SECS", m.retry_delay_secs);
    m.workers = env_or_usize("MAILSHIFT_WORKERS", m.workers);
    m.op_timeout_secs = env_or_u64("MAILSHIFT_OP_TIMEOUT_SECS", m.op_timeout_secs);
    m.flag_settle_ms = env_or_u64("MAILSHIFT_FLAG_SETTLE_MS", m.flag_settle_ms);
    m.flag_settle_attempts = env_or_u32("MAILSHIFT_FLAG_SETTLE_ATTEMPTS", m.flag_settle_attempts);
    Ok(())
}

/// `MAILSHIFT_*` variables present in the environment that nothing reads.
pub fn unknown_env_keys() -> Vec<String> {
    env::vars()
        .map(|(key, _)| key)
        .filter(|key| key.starts_with("MAILSHIFT_"))
        .filter(|key| !GENERATED_ENV_ALLOWLIST.contains(&key.as_str()))
        .collect()
}

pub fn load_config() -> Result<ShiftConfig> {
    let mut cfg = ShiftConfig::default();
    merge_file_config(&mut cfg)?;
    apply_env(&mut cfg)?;

    for key in unknown_env_keys() {
        tracing::warn!(key = %key, "ignoring unrecognized environment variable");
    }

    validate(&cfg)?;
    Ok(cfg)
}
