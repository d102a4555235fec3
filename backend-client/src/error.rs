use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("{method} {url} failed: {status}; body={body}")]
    Status {
        method: &'static str,
        url: String,
        status: u16,
        body: String,
    },

    #[error("rate limited{}", retry_after.map(|d| format!("; retry after {}s", d.as_secs())).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },

    #[error("decode error for {url}: {message}; body={body}")]
    Decode {
        url: String,
        message: String,
        body: String,
    },

    #[error("{url} succeeded but carried no job id; body={body}")]
    MissingJobId { url: String, body: String },
}

impl BackendError {
    /// Errors worth retrying with backoff: transport failures, 5xx and 429.
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Transport(_) | BackendError::RateLimited { .. } => true,
            BackendError::Status { status, .. } => *status >= 500,
            BackendError::Decode { .. } | BackendError::MissingJobId { .. } => false,
        }
    }
}
