use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

/// Lifecycle state of a remote try-on job.
///
/// The wire spelling matches the executor's status vocabulary
/// (`IN_QUEUE`, `IN_PROGRESS`, ...). Transitions are monotonic:
/// Queued → Running → one of the terminal states, and nothing moves
/// out of a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    #[serde(rename = "IN_QUEUE")]
    Queued,
    #[serde(rename = "IN_PROGRESS")]
    Running,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

impl JobState {
    pub const fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "IN_QUEUE",
            JobState::Running => "IN_PROGRESS",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
            JobState::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "IN_QUEUE" => Some(Self::Queued),
            "IN_PROGRESS" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }
}

/// Whether a job produces one result or one result per garment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Single,
    Batch,
}

/// Structured error reported by the remote executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
}

impl ErrorDetail {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }
}

/// One garment's slot in a batch result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItem {
    pub garment_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchItem {
    pub fn failed(&self) -> bool {
        self.url.is_none() || self.error.is_some()
    }
}

/// Reference to the output artifact(s) of a completed job.
///
/// Single vs batch differs only in this payload shape; the tracking
/// control flow is identical for both kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultRef {
    Single { url: String },
    Batch { items: Vec<BatchItem> },
}

impl ResultRef {
    /// True when the payload carries no usable artifact at all.
    pub fn is_empty(&self) -> bool {
        match self {
            ResultRef::Single { url } => url.is_empty(),
            ResultRef::Batch { items } => items.is_empty(),
        }
    }
}

/// Canonical snapshot of one remote job, owned by the reconciler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub state: JobState,
    /// 0–100, non-decreasing while non-terminal; 100 once Completed.
    pub progress: u8,
    /// Latest human-readable status line; overwritten, never accumulated.
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<ResultRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<ErrorDetail>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(id: impl Into<String>, kind: JobKind, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            kind,
            state: JobState::Queued,
            progress: 0,
            message: String::new(),
            result_ref: None,
            error_detail: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
