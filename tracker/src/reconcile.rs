use chrono::DateTime;
use chrono::Utc;
use tracing::debug;
use tracing::warn;
use vto_protocol::ErrorDetail;
use vto_protocol::EventPayload;
use vto_protocol::Job;
use vto_protocol::JobEvent;
use vto_protocol::JobState;
use vto_protocol::JobStatusResponse;
use vto_protocol::ResultRef;

/// Which channel produced a fragment. Terminal races between the two are
/// expected; the first one wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentSource {
    Push,
    Poll,
}

/// A partial status observation from either channel. Fragments never
/// touch the canonical snapshot directly.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusFragment {
    pub state: Option<JobState>,
    pub progress: Option<u8>,
    pub message: Option<String>,
    pub result_ref: Option<ResultRef>,
    pub error_detail: Option<ErrorDetail>,
    pub observed_at: DateTime<Utc>,
}

impl StatusFragment {
    pub fn from_status(status: JobStatusResponse, observed_at: DateTime<Utc>) -> Self {
        Self {
            state: Some(status.state),
            progress: status.progress,
            message: status.message,
            result_ref: status.result_ref,
            error_detail: status.error_detail,
            observed_at,
        }
    }

    pub fn from_event(event: JobEvent) -> Self {
        let observed_at = event.observed_at;
        let (state, progress, message, result_ref, error_detail) = match event.payload {
            EventPayload::StateChange { state, message } => (Some(state), None, message, None, None),
            EventPayload::Progress { progress, message } => {
                (None, Some(progress), message, None, None)
            }
            // The feed emits RESULT together with the completed state.
            EventPayload::Result { result_ref } => {
                (Some(JobState::Completed), None, None, Some(result_ref), None)
            }
            EventPayload::Error { detail } => (Some(JobState::Failed), None, None, None, Some(detail)),
        };
        Self {
            state,
            progress,
            message,
            result_ref,
            error_detail,
            observed_at,
        }
    }
}

/// When a batch counts as failed: any sub-result failed, or only when
/// every sub-result failed (the default; partial success completes with
/// per-garment errors left in the batch items).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchFailurePolicy {
    AnyFailed,
    #[default]
    AllFailed,
}

#[derive(Debug, PartialEq)]
pub(crate) enum MergeOutcome {
    Unchanged,
    Updated,
    Terminal(TerminalKind),
}

#[derive(Debug, PartialEq)]
pub(crate) enum TerminalKind {
    Completed { needs_result_fetch: bool },
    Failed(ErrorDetail),
    Cancelled,
}

#[derive(Debug, PartialEq)]
pub(crate) enum CompletionOutcome {
    Completed,
    RemoteFailed(ErrorDetail),
}

fn state_rank(state: JobState) -> u8 {
    match state {
        JobState::Queued => 0,
        JobState::Running => 1,
        JobState::Completed | JobState::Failed | JobState::Cancelled => 2,
    }
}

/// Single owner of the canonical [`Job`] snapshot. All fragments from
/// both channels funnel through [`Reconciler::apply`]; nothing else may
/// mutate the snapshot.
#[derive(Debug)]
pub(crate) struct Reconciler {
    job: Job,
    delivered: bool,
    pending_result: Option<ResultRef>,
    batch_policy: BatchFailurePolicy,
}

impl Reconciler {
    pub(crate) fn new(job: Job, batch_policy: BatchFailurePolicy) -> Self {
        let delivered = job.is_terminal();
        Self {
            job,
            delivered,
            pending_result: None,
            batch_policy,
        }
    }

    pub(crate) fn job(&self) -> &Job {
        &self.job
    }

    pub(crate) fn delivered(&self) -> bool {
        self.delivered
    }

    pub(crate) fn apply(&mut self, source: FragmentSource, fragment: StatusFragment) -> MergeOutcome {
        if self.job.is_terminal() {
            match fragment.state {
                Some(state) if state.is_terminal() && state != self.job.state => {
                    warn!(
                        job_id = %self.job.id,
                        reported = state.as_str(),
                        current = self.job.state.as_str(),
                        ?source,
                        "terminal state disagreement; keeping first observation"
                    );
                }
                _ => {
                    debug!(job_id = %self.job.id, ?source, "fragment after terminal state; recorded only");
                }
            }
            return MergeOutcome::Unchanged;
        }

        if let Some(state) = fragment.state
            && state.is_terminal()
        {
            self.delivered = true;
            self.job.updated_at = fragment.observed_at;
            if let Some(message) = fragment.message {
                self.job.message = message;
            }
            return match state {
                JobState::Completed => {
                    self.job.state = JobState::Completed;
                    self.job.progress = 100;
                    if let Some(result) = fragment.result_ref {
                        self.pending_result = Some(result);
                    }
                    MergeOutcome::Terminal(TerminalKind::Completed {
                        needs_result_fetch: self.pending_result.is_none(),
                    })
                }
                JobState::Failed => {
                    let detail = fragment
                        .error_detail
                        .unwrap_or_else(|| ErrorDetail::new("remote executor reported failure"));
                    self.job.state = JobState::Failed;
                    self.job.error_detail = Some(detail.clone());
                    self.job.completed_at = Some(fragment.observed_at);
                    MergeOutcome::Terminal(TerminalKind::Failed(detail))
                }
                JobState::Cancelled => {
                    self.job.state = JobState::Cancelled;
                    self.job.completed_at = Some(fragment.observed_at);
                    MergeOutcome::Terminal(TerminalKind::Cancelled)
                }
                JobState::Queued | JobState::Running => unreachable!("non-terminal state"),
            };
        }

        let mut changed = false;
        if let Some(state) = fragment.state
            && state_rank(state) > state_rank(self.job.state)
        {
            self.job.state = state;
            changed = true;
        }
        if let Some(progress) = fragment.progress {
            let progress = progress.min(100);
            if progress > self.job.progress {
                self.job.progress = progress;
                changed = true;
            }
        }
        if let Some(message) = fragment.message
            && message != self.job.message
        {
            self.job.message = message;
            changed = true;
        }
        if let Some(result) = fragment.result_ref {
            // Result ahead of the completed state: hold it for the
            // terminal transition instead of mutating the snapshot.
            debug!(job_id = %self.job.id, ?source, "result fragment before completion; deferred");
            self.pending_result = Some(result);
        }
        if changed {
            self.job.updated_at = fragment.observed_at;
            MergeOutcome::Updated
        } else {
            MergeOutcome::Unchanged
        }
    }

    /// Second half of the Completed transition, after any result fetch.
    /// Applies the batch failure policy and pins the final snapshot.
    pub(crate) fn finalize_completion(&mut self, fetched: Option<ResultRef>) -> CompletionOutcome {
        let now = Utc::now();
        let result = self.pending_result.take().or(fetched);
        match result {
            None => {
                warn!(job_id = %self.job.id, "completed without a retrievable result reference");
                self.job.completed_at = Some(now);
                CompletionOutcome::Completed
            }
            Some(result) if result.is_empty() => self.fail_completion(
                ErrorDetail::new("job completed without a result payload"),
                now,
            ),
            Some(ResultRef::Batch { items }) => {
                let failed: Vec<&str> = items
                    .iter()
                    .filter(|item| item.failed())
                    .map(|item| item.garment_key.as_str())
                    .collect();
                let batch_failed = match self.batch_policy {
                    BatchFailurePolicy::AnyFailed => !failed.is_empty(),
                    BatchFailurePolicy::AllFailed => failed.len() == items.len(),
                };
                if batch_failed {
                    let detail = ErrorDetail {
                        code: Some("batch_failed".to_string()),
                        message: format!("failed garments: {}", failed.join(", ")),
                    };
                    self.fail_completion(detail, now)
                } else {
                    self.job.result_ref = Some(ResultRef::Batch { items });
                    self.job.completed_at = Some(now);
                    CompletionOutcome::Completed
                }
            }
            Some(single) => {
                self.job.result_ref = Some(single);
                self.job.completed_at = Some(now);
                CompletionOutcome::Completed
            }
        }
    }

    fn fail_completion(&mut self, detail: ErrorDetail, now: DateTime<Utc>) -> CompletionOutcome {
        self.job.state = JobState::Failed;
        self.job.error_detail = Some(detail.clone());
        self.job.result_ref = None;
        self.job.completed_at = Some(now);
        CompletionOutcome::RemoteFailed(detail)
    }
}
