use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::Stream;
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;
use vto_protocol::JobEvent;

use crate::policy::PollingPolicy;
use crate::policy::retry_backoff;
use crate::reconcile::FragmentSource;
use crate::reconcile::StatusFragment;
use crate::tracker::TrackerSignal;

/// Consecutive useless connections (failed, or dropped before yielding
/// an event) before the channel gives up and leaves polling in charge.
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    /// Lost the stream and currently reconnecting.
    Degraded,
    Closed,
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("event feed connect failed: {0}")]
    Connect(String),

    #[error("event stream failed: {0}")]
    Stream(String),
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<JobEvent, FeedError>> + Send>>;

/// Push-side event source. The HTTP implementation speaks server-sent
/// events; tests substitute scripted streams.
#[async_trait]
pub trait EventFeed: Send + Sync {
    async fn connect(&self, job_id: &str) -> Result<EventStream, FeedError>;
}

/// SSE feed over `GET {base}/jobs/{id}/events`, one JSON event per
/// `data:` line.
pub struct SseEventFeed {
    base_url: String,
    http: reqwest::Client,
    bearer_token: Option<String>,
}

impl SseEventFeed {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            bearer_token: None,
        }
    }

    pub fn with_bearer_token(mut self, token: &str) -> Self {
        self.bearer_token = Some(token.to_string());
        self
    }
}

#[async_trait]
impl EventFeed for SseEventFeed {
    async fn connect(&self, job_id: &str) -> Result<EventStream, FeedError> {
        let url = format!("{}/jobs/{job_id}/events", self.base_url);
        let mut request = self
            .http
            .get(&url)
            .header(reqwest::header::ACCEPT, "text/event-stream");
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|err| FeedError::Connect(err.to_string()))?;

        let stream = response.bytes_stream().eventsource().map(|event| match event {
            Ok(event) => serde_json::from_str::<JobEvent>(&event.data)
                .map_err(|err| FeedError::Stream(format!("bad event payload: {err}"))),
            Err(err) => Err(FeedError::Stream(err.to_string())),
        });
        Ok(Box::pin(stream))
    }
}

/// Push channel task. Forwards every decoded event as a fragment and
/// reports connection transitions; reconnects with backoff until the
/// failure ceiling, then signals `ChannelFailed` and exits. Never
/// decides job state on its own.
pub(crate) async fn run_push_channel(
    feed: Arc<dyn EventFeed>,
    job_id: String,
    tx: mpsc::UnboundedSender<TrackerSignal>,
    cancel: CancellationToken,
    policy: PollingPolicy,
) {
    let mut consecutive_failures: u32 = 0;
    let mut last_error = String::new();
    loop {
        let state = if consecutive_failures == 0 {
            ConnectionState::Connecting
        } else {
            ConnectionState::Degraded
        };
        let _ = tx.send(TrackerSignal::Connection(state));

        let connected = tokio::select! {
            _ = cancel.cancelled() => return,
            connected = feed.connect(&job_id) => connected,
        };
        let mut stream = match connected {
            Ok(stream) => stream,
            Err(err) => {
                consecutive_failures += 1;
                last_error = err.to_string();
                warn!(%job_id, %err, attempt = consecutive_failures, "event feed connect failed");
                if give_up(consecutive_failures, &last_error, &tx) {
                    return;
                }
                if wait_or_cancel(consecutive_failures, &policy, &cancel).await {
                    return;
                }
                continue;
            }
        };

        let _ = tx.send(TrackerSignal::Connection(ConnectionState::Connected));
        let mut delivered_any = false;
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(event)) => {
                    delivered_any = true;
                    let _ = tx.send(TrackerSignal::Fragment {
                        source: FragmentSource::Push,
                        fragment: StatusFragment::from_event(event),
                    });
                }
                Some(Err(err)) => {
                    last_error = err.to_string();
                    warn!(%job_id, %err, "event stream dropped");
                    break;
                }
                None => {
                    debug!(%job_id, "event stream ended");
                    last_error = "event stream ended".to_string();
                    break;
                }
            }
        }

        // A connection that produced at least one event resets the
        // ceiling; a connection that dropped immediately counts against
        // it, so a flapping feed cannot reconnect forever.
        if delivered_any {
            consecutive_failures = 1;
        } else {
            consecutive_failures += 1;
        }
        if give_up(consecutive_failures, &last_error, &tx) {
            return;
        }
        if wait_or_cancel(consecutive_failures, &policy, &cancel).await {
            return;
        }
    }
}

fn give_up(
    consecutive_failures: u32,
    last_error: &str,
    tx: &mpsc::UnboundedSender<TrackerSignal>,
) -> bool {
    if consecutive_failures < MAX_CONSECUTIVE_FAILURES {
        return false;
    }
    let _ = tx.send(TrackerSignal::Connection(ConnectionState::Closed));
    let _ = tx.send(TrackerSignal::ChannelFailed {
        detail: last_error.to_string(),
    });
    true
}

/// Returns true when cancelled during the wait.
async fn wait_or_cancel(failure: u32, policy: &PollingPolicy, cancel: &CancellationToken) -> bool {
    let wait = retry_backoff(failure, policy);
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(wait) => false,
    }
}
