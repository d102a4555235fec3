use std::time::Duration;

use reqwest::header::AUTHORIZATION;
use reqwest::header::CONTENT_TYPE;
use reqwest::header::HeaderMap;
use reqwest::header::HeaderValue;
use reqwest::header::RETRY_AFTER;
use reqwest::header::USER_AGENT;
use serde::de::DeserializeOwned;
use vto_protocol::CreateJobRequest;
use vto_protocol::CreateJobResponse;
use vto_protocol::JobStatusResponse;
use vto_protocol::ResultRef;

use crate::error::BackendError;

type Result<T> = std::result::Result<T, BackendError>;

#[derive(Clone, Debug)]
pub struct Client {
    base_url: String,
    http: reqwest::Client,
    bearer_token: Option<String>,
    user_agent: Option<HeaderValue>,
}

impl Client {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let mut base_url = base_url.into();
        // Trim trailing slashes for consistent URL building.
        while base_url.ends_with('/') {
            base_url.pop();
        }
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            base_url,
            http,
            bearer_token: None,
            user_agent: None,
        })
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn with_user_agent(mut self, ua: impl Into<String>) -> Self {
        if let Ok(hv) = HeaderValue::from_str(&ua.into()) {
            self.user_agent = Some(hv);
        }
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn headers(&self) -> HeaderMap {
        let mut h = HeaderMap::new();
        if let Some(ua) = &self.user_agent {
            h.insert(USER_AGENT, ua.clone());
        } else {
            h.insert(USER_AGENT, HeaderValue::from_static("vto-client"));
        }
        if let Some(token) = &self.bearer_token {
            let value = format!("Bearer {token}");
            if let Ok(hv) = HeaderValue::from_str(&value) {
                h.insert(AUTHORIZATION, hv);
            }
        }
        h
    }

    async fn exec_request(
        &self,
        req: reqwest::RequestBuilder,
        method: &'static str,
        url: &str,
    ) -> Result<String> {
        let res = req.send().await?;
        let status = res.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = res
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(BackendError::RateLimited { retry_after });
        }
        let body = res.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(BackendError::Status {
                method,
                url: url.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }

    fn decode_json<T: DeserializeOwned>(&self, url: &str, body: &str) -> Result<T> {
        serde_json::from_str::<T>(body).map_err(|e| BackendError::Decode {
            url: url.to_string(),
            message: e.to_string(),
            body: body.to_string(),
        })
    }

    /// Create a new try-on job. Returns the executor-assigned job id and
    /// its initial state.
    pub async fn create_job(&self, request: &CreateJobRequest) -> Result<CreateJobResponse> {
        let url = format!("{}/jobs", self.base_url);
        let req = self
            .http
            .post(&url)
            .headers(self.headers())
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .json(request);
        let body = self.exec_request(req, "POST", &url).await?;
        let parsed: CreateJobResponse = self.decode_json(&url, &body)?;
        if parsed.job_id.is_empty() {
            return Err(BackendError::MissingJobId { url, body });
        }
        Ok(parsed)
    }

    /// One pull of the remote status endpoint.
    pub async fn get_job_status(&self, job_id: &str) -> Result<JobStatusResponse> {
        let url = format!("{}/jobs/{}/status", self.base_url, job_id);
        let req = self.http.get(&url).headers(self.headers());
        let body = self.exec_request(req, "GET", &url).await?;
        self.decode_json::<JobStatusResponse>(&url, &body)
    }

    /// Fetches the final artifact reference(s).
    pub async fn get_job_result(&self, job_id: &str) -> Result<ResultRef> {
        let url = format!("{}/jobs/{}/result", self.base_url, job_id);
        let req = self.http.get(&url).headers(self.headers());
        let body = self.exec_request(req, "GET", &url).await?;
        self.decode_json::<ResultRef>(&url, &body)
    }

    /// Best-effort cancel; the executor may still finish the job.
    pub async fn cancel_job(&self, job_id: &str) -> Result<()> {
        let url = format!("{}/jobs/{}/cancel", self.base_url, job_id);
        let req = self.http.post(&url).headers(self.headers());
        self.exec_request(req, "POST", &url).await?;
        Ok(())
    }
}
