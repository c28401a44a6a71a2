use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Scheduled action id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionId(pub Uuid);

impl ActionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ActionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Conversation/entity an action or debounce session belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubjectId(pub String);

impl SubjectId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SubjectId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SubjectId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Processing,
    Executed,
    Cancelled,
    Failed,
}

impl ActionStatus {
    pub const ALL: [ActionStatus; 5] = [
        ActionStatus::Pending,
        ActionStatus::Processing,
        ActionStatus::Executed,
        ActionStatus::Cancelled,
        ActionStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Processing => "processing",
            ActionStatus::Executed => "executed",
            ActionStatus::Cancelled => "cancelled",
            ActionStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ActionStatus::Pending),
            "processing" => Some(ActionStatus::Processing),
            "executed" => Some(ActionStatus::Executed),
            "cancelled" => Some(ActionStatus::Cancelled),
            "failed" => Some(ActionStatus::Failed),
            _ => None,
        }
    }

    /// Executed, cancelled and failed. Only `failed` may leave this set, and
    /// only through an explicit retry.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionStatus::Executed | ActionStatus::Cancelled | ActionStatus::Failed
        )
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A durable, time-delayed action.
///
/// `payload` is opaque to the core: it is stored and handed to the executor
/// untouched, dispatched only by `kind`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScheduledAction {
    pub id: ActionId,
    pub subject_id: SubjectId,
    pub kind: String,
    pub payload: serde_json::Value,
    pub scheduled_for: DateTime<Utc>,
    pub status: ActionStatus,
    pub started_processing_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub claimed_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Query used by operators to inspect actions (e.g. terminal `failed` rows).
#[derive(Clone, Debug, Default)]
pub struct ActionFilter {
    pub status: Option<ActionStatus>,
    pub subject_id: Option<SubjectId>,
    pub limit: Option<usize>,
}

impl ActionFilter {
    pub fn status(status: ActionStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn subject(subject: impl Into<SubjectId>) -> Self {
        Self {
            subject_id: Some(subject.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, action: &ScheduledAction) -> bool {
        if let Some(status) = self.status {
            if action.status != status {
                return false;
            }
        }
        if let Some(subject) = &self.subject_id {
            if &action.subject_id != subject {
                return false;
            }
        }
        true
    }
}

/// Number of actions per status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: u64,
    pub processing: u64,
    pub executed: u64,
    pub cancelled: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: ActionStatus, n: u64) {
        match status {
            ActionStatus::Pending => self.pending += n,
            ActionStatus::Processing => self.processing += n,
            ActionStatus::Executed => self.executed += n,
            ActionStatus::Cancelled => self.cancelled += n,
            ActionStatus::Failed => self.failed += n,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.executed + self.cancelled + self.failed
    }
}
