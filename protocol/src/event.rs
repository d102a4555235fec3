use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::job::ErrorDetail;
use crate::job::JobState;
use crate::job::ResultRef;

/// Type-specific body of a push event, tagged the way the event feed
/// emits it (`STATE`, `PROGRESS`, `RESULT`, `ERROR`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum EventPayload {
    #[serde(rename = "STATE")]
    StateChange {
        state: JobState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    #[serde(rename = "PROGRESS")]
    Progress {
        progress: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    #[serde(rename = "RESULT")]
    Result { result_ref: ResultRef },
    #[serde(rename = "ERROR")]
    Error { detail: ErrorDetail },
}

/// Append-only fragment from the push feed. Events never touch the
/// canonical snapshot directly; they are inputs to the reconciler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    /// Server-assigned, monotonic per job.
    pub id: i64,
    pub job_id: String,
    #[serde(flatten)]
    pub payload: EventPayload,
    pub observed_at: DateTime<Utc>,
}
