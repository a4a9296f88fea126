use crate::error::ShiftError;
use crate::shift::signature::{HeaderSubset, Signature};
use crate::shift::util::now_epoch_ms;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    FlagsUpdated,
    Copied,
    Verified,
    Deleted,
    Succeeded,
    Failed,
}

impl ItemStatus {
    pub const ALL: [ItemStatus; 7] = [
        Self::Pending,
        Self::FlagsUpdated,
        Self::Copied,
        Self::Verified,
        Self::Deleted,
        Self::Succeeded,
        Self::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::FlagsUpdated => "flags_updated",
            Self::Copied => "copied",
            Self::Verified => "verified",
            Self::Deleted => "deleted",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    fn rank(self) -> Option<u8> {
        match self {
            Self::Pending => Some(0),
            Self::FlagsUpdated => Some(1),
            Self::Copied => Some(2),
            Self::Verified => Some(3),
            Self::Deleted => Some(4),
            Self::Succeeded => Some(5),
            Self::Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Whether a record may move from `self` to `next`.
    ///
    /// Forward moves along the pipeline are allowed (including staying put
    /// to record another attempt). `failed` is reachable from every
    /// non-terminal state. `pending` is the only re-entry point and is
    /// closed once the destination copy has been verified.
    pub fn permits(self, next: ItemStatus) -> bool {
        match (self, next) {
            (Self::Succeeded, _) => false,
            (_, Self::Failed) => !self.is_terminal(),
            (Self::Failed, Self::Pending) => true,
            (Self::Failed, _) => false,
            (Self::Pending | Self::FlagsUpdated | Self::Copied, Self::Pending) => true,
            (from, to) => match (from.rank(), to.rank()) {
                (Some(a), Some(b)) => b >= a,
                _ => false,
            },
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub signature: Signature,
    pub identity: String,
    pub source_folder: String,
    pub destination_folder: String,
    pub status: ItemStatus,
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub headers: HeaderSubset,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(default)]
    pub manual_cleanup: bool,
    /// Delete attempts since the copy was verified. Counted apart from
    /// `attempt_count` so a slow copy does not eat the delete budget.
    #[serde(default)]
    pub delete_attempts: u32,
    pub first_seen_ms: u64,
    pub updated_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at_ms: Option<u64>,
}

impl ItemRecord {
    pub fn new(
        signature: Signature,
        identity: impl Into<String>,
        source_folder: impl Into<String>,
        destination_folder: impl Into<String>,
        headers: HeaderSubset,
    ) -> Self {
        let now = now_epoch_ms();
        Self {
            signature,
            identity: identity.into(),
            source_folder: source_folder.into(),
            destination_folder: destination_folder.into(),
            status: ItemStatus::Pending,
            attempt_count: 0,
            last_error: None,
            headers,
            claimed_by: None,
            manual_cleanup: false,
            delete_attempts: 0,
            first_seen_ms: now,
            updated_ms: now,
            verified_at_ms: None,
            deleted_at_ms: None,
        }
    }

    /// Move to `next`, stamping the transition time. Rejects moves the
    /// status machine does not allow.
    pub fn advance(&mut self, next: ItemStatus) -> Result<(), ShiftError> {
        if !self.status.permits(next) {
            return Err(self.illegal(next));
        }
        let now = now_epoch_ms().max(self.updated_ms);
        match next {
            ItemStatus::Verified if self.verified_at_ms.is_none() => {
                self.verified_at_ms = Some(now)
            }
            ItemStatus::Deleted => self.deleted_at_ms = Some(now),
            ItemStatus::Pending => self.verified_at_ms = None,
            _ => {}
        }
        if next == ItemStatus::Succeeded {
            self.last_error = None;
        }
        self.status = next;
        self.updated_ms = now;
        Ok(())
    }

    pub fn illegal(&self, next: ItemStatus) -> ShiftError {
        ShiftError::IllegalTransition {
            signature: self.signature.to_string(),
            from: self.status.to_string(),
            to: next.to_string(),
        }
    }
}
