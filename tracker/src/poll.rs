use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;
use vto_backend_client::BackendError;
use vto_protocol::JobState;

use crate::backend::JobBackend;
use crate::policy::IntervalState;
use crate::policy::PollingPolicy;
use crate::policy::retry_backoff;
use crate::reconcile::FragmentSource;
use crate::reconcile::StatusFragment;
use crate::tracker::TrackerSignal;

/// Poll loop task. Fetches status until a terminal state arrives, the
/// attempt ceiling or deadline is hit, or the server says to stop.
/// Every attempt counts against the ceiling, including transient
/// failures, so a dead server cannot spin forever. Fragments go to the
/// reconciler; this task never interprets them.
pub(crate) async fn run_poll_loop(
    backend: Arc<dyn JobBackend>,
    job_id: String,
    policy: PollingPolicy,
    tx: mpsc::UnboundedSender<TrackerSignal>,
    cancel: CancellationToken,
) {
    let started = Instant::now();
    let mut interval = IntervalState::new(&policy);
    let mut max_attempts = policy.max_attempts;
    let mut total_timeout = policy.total_timeout;
    let mut attempts: u32 = 0;
    let mut transient_failures: u32 = 0;
    let mut last_observed: Option<(JobState, Option<u8>)> = None;

    loop {
        if attempts >= max_attempts || started.elapsed() >= total_timeout {
            let _ = tx.send(TrackerSignal::PollExhausted {
                attempts,
                elapsed: started.elapsed(),
            });
            return;
        }
        attempts += 1;

        let status = tokio::select! {
            _ = cancel.cancelled() => return,
            status = backend.job_status(&job_id) => status,
        };

        let wait = match status {
            Ok(status) => {
                transient_failures = 0;
                if let Some(n) = status.max_attempts {
                    max_attempts = n;
                }
                if let Some(secs) = status.timeout_seconds {
                    total_timeout = Duration::from_secs(secs);
                }
                let hint = status
                    .recommended_interval_seconds
                    .map(Duration::from_secs_f64);
                let should_stop = status.should_stop == Some(true);
                let terminal = status.state.is_terminal();

                // Any visible movement re-arms the interval at the base.
                let observed = (status.state, status.progress);
                if last_observed.is_some_and(|prev| prev != observed) {
                    interval.reset(&policy);
                }
                last_observed = Some(observed);

                let now = chrono::Utc::now();
                let _ = tx.send(TrackerSignal::Fragment {
                    source: FragmentSource::Poll,
                    fragment: StatusFragment::from_status(status, now),
                });

                if terminal {
                    debug!(%job_id, attempts, "poll observed terminal state");
                    return;
                }
                if should_stop {
                    debug!(%job_id, attempts, "server asked polling to stop");
                    let _ = tx.send(TrackerSignal::PollExhausted {
                        attempts,
                        elapsed: started.elapsed(),
                    });
                    return;
                }
                interval.next(&policy, hint)
            }
            Err(err) => {
                warn!(%job_id, %err, attempt = attempts, "status fetch failed");
                match err {
                    BackendError::RateLimited {
                        retry_after: Some(after),
                    } => after,
                    err if err.is_transient() => {
                        transient_failures += 1;
                        retry_backoff(transient_failures, &policy)
                    }
                    // Decode failures and 4xx responses are not load
                    // related; keep the regular cadence instead of the
                    // escalating retry backoff.
                    _ => interval.next(&policy, None),
                }
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }
    }
}
