use std::sync::Arc;

use async_trait::async_trait;
use vto_backend_client::BackendError;
use vto_backend_client::Client;
use vto_protocol::CreateJobRequest;
use vto_protocol::CreateJobResponse;
use vto_protocol::JobStatusResponse;
use vto_protocol::ResultRef;

use crate::error::TrackerError;

/// The remote executor surface the tracker consumes. Implemented by the
/// HTTP client; tests substitute scripted fakes.
#[async_trait]
pub trait JobBackend: Send + Sync {
    async fn create_job(&self, request: &CreateJobRequest)
    -> Result<CreateJobResponse, BackendError>;

    async fn job_status(&self, job_id: &str) -> Result<JobStatusResponse, BackendError>;

    /// One-shot fetch of the final artifact reference(s).
    async fn job_result(&self, job_id: &str) -> Result<ResultRef, BackendError>;

    /// Best-effort; the remote job may still run to completion.
    async fn cancel_job(&self, job_id: &str) -> Result<(), BackendError>;
}

#[async_trait]
impl JobBackend for Client {
    async fn create_job(
        &self,
        request: &CreateJobRequest,
    ) -> Result<CreateJobResponse, BackendError> {
        Client::create_job(self, request).await
    }

    async fn job_status(&self, job_id: &str) -> Result<JobStatusResponse, BackendError> {
        Client::get_job_status(self, job_id).await
    }

    async fn job_result(&self, job_id: &str) -> Result<ResultRef, BackendError> {
        Client::get_job_result(self, job_id).await
    }

    async fn cancel_job(&self, job_id: &str) -> Result<(), BackendError> {
        Client::cancel_job(self, job_id).await
    }
}

/// Thin creation facade. A failure here is fatal and leaves no tracker
/// state behind.
pub struct JobSubmitter {
    backend: Arc<dyn JobBackend>,
}

impl JobSubmitter {
    pub fn new(backend: Arc<dyn JobBackend>) -> Self {
        Self { backend }
    }

    pub async fn create(&self, request: &CreateJobRequest) -> Result<CreateJobResponse, TrackerError> {
        self.backend
            .create_job(request)
            .await
            .map_err(|err| TrackerError::Submission {
                message: err.to_string(),
            })
    }
}
