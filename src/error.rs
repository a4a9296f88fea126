use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShiftError {
    #[error("transient remote error: {0}")]
    TransientRemote(String),
    #[error("item not found in remote store: {0}")]
    NotFound(String),
    #[error("transaction log {} is corrupt: {reason}", .path.display())]
    CorruptLog { path: PathBuf, reason: String },
    #[error("migration lock {} is held by another process{}", .path.display(), .pid.map(|p| format!(" (pid {p})")).unwrap_or_default())]
    LockHeld { path: PathBuf, pid: Option<u32> },
    #[error("attempt budget exceeded after {attempts} attempts: {last_error}")]
    AttemptBudgetExceeded { attempts: u32, last_error: String },
    #[error("illegal status transition for {signature}: {from} -> {to}")]
    IllegalTransition {
        signature: String,
        from: String,
        to: String,
    },
    #[error("config file invalid or unreadable: {0}")]
    InvalidConfig(String),
}

impl ShiftError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::LockHeld { .. } => ErrorCode::E001LockHeld,
            Self::CorruptLog { .. } => ErrorCode::E002CorruptLog,
            Self::InvalidConfig(_) => ErrorCode::E003ConfigInvalid,
            Self::TransientRemote(_) => ErrorCode::E004TransientRemote,
            Self::NotFound(_) => ErrorCode::E005NotFound,
            Self::AttemptBudgetExceeded { .. } => ErrorCode::E006BudgetExceeded,
            Self::IllegalTransition { .. } => ErrorCode::E007IllegalTransition,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    E001LockHeld,
    E002CorruptLog,
    E003ConfigInvalid,
    E004TransientRemote,
    E005NotFound,
    E006BudgetExceeded,
    E007IllegalTransition,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::E001LockHeld => "E001_LOCK_HELD",
            Self::E002CorruptLog => "E002_CORRUPT_LOG",
            Self::E003ConfigInvalid => "E003_CONFIG_INVALID",
            Self::E004TransientRemote => "E004_TRANSIENT_REMOTE",
            Self::E005NotFound => "E005_NOT_FOUND",
            Self::E006BudgetExceeded => "E006_BUDGET_EXCEEDED",
            Self::E007IllegalTransition => "E007_ILLEGAL_TRANSITION",
        }
    }

    /// Process exit code used when an error of this kind aborts a command.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::E002CorruptLog => 2,
            Self::E001LockHeld => 3,
            Self::E003ConfigInvalid => 4,
            _ => 1,
        }
    }
}

/// Code of the first `ShiftError` in the chain, if any.
pub fn code_for(err: &anyhow::Error) -> Option<ErrorCode> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<ShiftError>())
        .map(ShiftError::code)
}

/// Pick the exit code for an error that reached `main`.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    code_for(err).map(ErrorCode::exit_code).unwrap_or(1)
}
