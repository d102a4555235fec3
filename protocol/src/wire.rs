use serde::Deserialize;
use serde::Serialize;

use crate::job::ErrorDetail;
use crate::job::JobState;
use crate::job::ResultRef;

fn default_steps() -> u32 {
    50
}

fn default_guidance_scale() -> f64 {
    2.5
}

/// Request body for creating a try-on job against the remote executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateJobRequest {
    /// One URL per garment; more than one makes the job a batch.
    pub garment_urls: Vec<String>,
    #[serde(default = "default_steps")]
    pub steps: u32,
    #[serde(default = "default_guidance_scale")]
    pub guidance_scale: f64,
}

impl CreateJobRequest {
    pub fn new(garment_urls: Vec<String>) -> Self {
        Self {
            garment_urls,
            steps: default_steps(),
            guidance_scale: default_guidance_scale(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateJobResponse {
    pub job_id: String,
    pub state: JobState,
}

/// Response of the pull-based status endpoint.
///
/// Beyond the status fields it may carry polling hints; a present
/// `recommended_interval_seconds` overrides the client's own backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: String,
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<ResultRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<ErrorDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommended_interval_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub should_stop: Option<bool>,
}

impl JobStatusResponse {
    pub fn running(job_id: impl Into<String>, progress: u8) -> Self {
        Self {
            job_id: job_id.into(),
            state: JobState::Running,
            progress: Some(progress),
            message: None,
            result_ref: None,
            error_detail: None,
            recommended_interval_seconds: None,
            max_attempts: None,
            timeout_seconds: None,
            should_stop: None,
        }
    }
}
