use anyhow::Result;
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct ShiftPaths {
    pub shift_home: PathBuf,
    pub state_dir: PathBuf,
    pub transaction_log: PathBuf,
    pub recovery_summary: PathBuf,
    pub lock_file: PathBuf,
    pub logs_dir: PathBuf,
}

fn required_home_dir() -> Result<PathBuf> {
    if let Some(home) = dirs::home_dir() {
        return Ok(home);
    }
    Err(anyhow::anyhow!("HOME directory could not be resolved"))
}

fn env_or_default_path(var: &str, fallback: PathBuf) -> PathBuf {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => fallback,
    }
}

pub fn resolve_paths() -> Result<ShiftPaths> {
    let shift_home = match env::var("MAILSHIFT_HOME") {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => required_home_dir()?.join(".mailshift"),
    };
    Ok(paths_under(shift_home))
}

/// Layout below a given home directory, with per-file env overrides applied.
pub fn paths_under(shift_home: PathBuf) -> ShiftPaths {
    let state_dir = env_or_default_path("MAILSHIFT_STATE_DIR", shift_home.join("state"));
    let transaction_log = env_or_default_path(
        "MAILSHIFT_TRANSACTION_LOG",
        state_dir.join("transactions.jsonl"),
    );
    let recovery_summary = env_or_default_path(
        "MAILSHIFT_RECOVERY_SUMMARY",
        state_dir.join("recovery_summary.json"),
    );
    let lock_file = state_dir.join("mailshift.lock");
    let logs_dir = env_or_default_path("MAILSHIFT_LOGS_DIR", shift_home.join("logs"));

    ShiftPaths {
        shift_home,
        state_dir,
        transaction_log,
        recovery_summary,
        lock_file,
        logs_dir,
    }
}
