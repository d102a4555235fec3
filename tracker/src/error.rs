use std::time::Duration;

use thiserror::Error;
use vto_protocol::ErrorDetail;

/// Errors surfaced to subscribers and callers.
///
/// `PollExhausted` and `Channel` mean "we stopped watching": the remote
/// job's true state is unknown and the local snapshot is left untouched.
/// `RemoteJobFailed` means the executor itself reported failure and is
/// delivered through the same once-only terminal path as completion.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrackerError {
    #[error("job submission failed: {message}")]
    Submission { message: String },

    #[error("push channel failed: {message}")]
    Channel { message: String },

    #[error("polling exhausted after {attempts} attempts ({elapsed:?}) without a terminal state")]
    PollExhausted { attempts: u32, elapsed: Duration },

    #[error("remote job failed: {}", .0.message)]
    RemoteJobFailed(ErrorDetail),

    #[error("already tracking job {job_id}")]
    AlreadyTracking { job_id: String },
}
