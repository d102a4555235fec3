use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;
use vto_protocol::CreateJobRequest;
use vto_protocol::Job;
use vto_protocol::JobKind;
use vto_protocol::ResultRef;

use crate::backend::JobBackend;
use crate::backend::JobSubmitter;
use crate::error::TrackerError;
use crate::policy::PollingPolicy;
use crate::policy::retry_backoff;
use crate::poll::run_poll_loop;
use crate::push::ConnectionState;
use crate::push::EventFeed;
use crate::push::run_push_channel;
use crate::reconcile::BatchFailurePolicy;
use crate::reconcile::CompletionOutcome;
use crate::reconcile::FragmentSource;
use crate::reconcile::MergeOutcome;
use crate::reconcile::Reconciler;
use crate::reconcile::StatusFragment;
use crate::reconcile::TerminalKind;
use crate::resume::DEFAULT_MAX_SNAPSHOT_AGE;
use crate::resume::ResumePlan;
use crate::resume::partition_resumable;
use crate::store::PersistentJobStore;
use crate::store::StoreError;

const RESULT_FETCH_ATTEMPTS: u32 = 3;
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Internal message from the push channel and poll loop tasks to the
/// run loop, which is the only place fragments touch the snapshot.
#[derive(Debug)]
pub(crate) enum TrackerSignal {
    Fragment {
        source: FragmentSource,
        fragment: StatusFragment,
    },
    Connection(ConnectionState),
    ChannelFailed {
        detail: String,
    },
    PollExhausted {
        attempts: u32,
        elapsed: Duration,
    },
}

/// Events broadcast to subscribers. `Complete` and the terminal errors
/// are delivered at most once per tracked job; `Update` may repeat.
#[derive(Debug, Clone)]
pub enum TrackerEvent {
    Update(Job),
    Complete(Job),
    Error(TrackerError),
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub policy: PollingPolicy,
    pub batch_failure_policy: BatchFailurePolicy,
    /// Persisted snapshots older than this (by last update) are dropped
    /// at resume time.
    pub store_max_age: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            policy: PollingPolicy::default(),
            batch_failure_policy: BatchFailurePolicy::default(),
            store_max_age: DEFAULT_MAX_SNAPSHOT_AGE,
        }
    }
}

/// Identifies a tracked job to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    job_id: String,
}

impl JobHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }
}

struct ActiveTracking {
    job_id: String,
    /// Cleared by cancel/reset before the token fires so no event is
    /// emitted after those calls return.
    active: Arc<AtomicBool>,
    cancel: CancellationToken,
}

/// Tracks one remote job at a time: submits (or attaches to) a job,
/// runs a push channel and a poll loop against it, reconciles their
/// fragments into a persisted snapshot, and broadcasts updates plus a
/// once-only terminal outcome.
pub struct JobStatusTracker {
    backend: Arc<dyn JobBackend>,
    feed: Arc<dyn EventFeed>,
    store: PersistentJobStore,
    config: TrackerConfig,
    submitter: JobSubmitter,
    inner: Arc<Mutex<Option<ActiveTracking>>>,
    events_tx: broadcast::Sender<TrackerEvent>,
}

impl JobStatusTracker {
    pub fn new(
        backend: Arc<dyn JobBackend>,
        feed: Arc<dyn EventFeed>,
        store: PersistentJobStore,
        config: TrackerConfig,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let submitter = JobSubmitter::new(backend.clone());
        Self {
            backend,
            feed,
            store,
            config,
            submitter,
            inner: Arc::new(Mutex::new(None)),
            events_tx,
        }
    }

    /// Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.events_tx.subscribe()
    }

    /// Creates the remote job and starts tracking it. A creation failure
    /// leaves no tracker state behind.
    pub async fn submit(&self, request: &CreateJobRequest) -> Result<JobHandle, TrackerError> {
        let kind = if request.garment_urls.len() > 1 {
            JobKind::Batch
        } else {
            JobKind::Single
        };
        let response = self.submitter.create(request).await?;
        self.start_with_kind(&response.job_id, kind).await
    }

    /// Attaches to an already-created remote job.
    pub async fn start(&self, job_id: &str) -> Result<JobHandle, TrackerError> {
        self.start_with_kind(job_id, JobKind::Single).await
    }

    async fn start_with_kind(&self, job_id: &str, kind: JobKind) -> Result<JobHandle, TrackerError> {
        if job_id.is_empty() {
            return Err(TrackerError::Submission {
                message: "backend returned an empty job id".to_string(),
            });
        }
        let mut guard = self.inner.lock().await;
        if let Some(tracking) = guard.as_ref() {
            if tracking.job_id == job_id {
                // Tracking this job already; idempotent.
                return Ok(JobHandle {
                    job_id: job_id.to_string(),
                });
            }
            return Err(TrackerError::AlreadyTracking {
                job_id: tracking.job_id.clone(),
            });
        }
        let job = Job::new(job_id, kind, Utc::now());
        Ok(self.begin(&mut guard, job))
    }

    /// Loads persisted snapshots, discards stale ones, and picks up the
    /// most recently updated non-terminal job if nothing is being
    /// tracked yet. Terminal snapshots are returned in the plan for the
    /// caller to surface.
    pub async fn resume(&self) -> Result<ResumePlan, StoreError> {
        let snapshots = self.store.list_all()?;
        let plan = partition_resumable(snapshots, self.config.store_max_age, Utc::now());
        for stale in &plan.discard {
            if let Err(err) = self.store.remove(&stale.id) {
                warn!(job_id = %stale.id, %err, "failed to drop stale snapshot");
            }
        }
        let mut guard = self.inner.lock().await;
        if guard.is_none()
            && let Some(job) = plan
                .resume
                .iter()
                .max_by_key(|job| job.updated_at)
                .cloned()
        {
            debug!(job_id = %job.id, "resuming persisted job");
            self.begin(&mut guard, job);
        }
        Ok(plan)
    }

    fn begin(&self, guard: &mut Option<ActiveTracking>, job: Job) -> JobHandle {
        let job_id = job.id.clone();
        if let Err(err) = self.store.save(&job) {
            warn!(%job_id, %err, "failed to persist initial snapshot");
        }

        let active = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(run_push_channel(
            self.feed.clone(),
            job_id.clone(),
            tx.clone(),
            cancel.clone(),
            self.config.policy.clone(),
        ));
        tokio::spawn(run_poll_loop(
            self.backend.clone(),
            job_id.clone(),
            self.config.policy.clone(),
            tx,
            cancel.clone(),
        ));
        tokio::spawn(
            RunLoop {
                rx,
                reconciler: Reconciler::new(job, self.config.batch_failure_policy),
                events_tx: self.events_tx.clone(),
                store: self.store.clone(),
                backend: self.backend.clone(),
                policy: self.config.policy.clone(),
                active: active.clone(),
                cancel: cancel.clone(),
                inner: self.inner.clone(),
            }
            .run(),
        );

        *guard = Some(ActiveTracking {
            job_id: job_id.clone(),
            active,
            cancel,
        });
        JobHandle { job_id }
    }

    /// Stops tracking, asks the backend to cancel the remote job (best
    /// effort, the job may still finish remotely), and drops the
    /// persisted snapshot. Idempotent; no event is emitted after this
    /// returns.
    pub async fn cancel(&self) {
        let Some(tracking) = self.end_tracking().await else {
            return;
        };
        if let Err(err) = self.backend.cancel_job(&tracking.job_id).await {
            warn!(job_id = %tracking.job_id, %err, "remote cancel failed; job may still run");
        }
    }

    /// Stops tracking and drops the persisted snapshot without touching
    /// the remote job. The tracker is reusable afterwards. Idempotent.
    pub async fn reset(&self) {
        let _ = self.end_tracking().await;
    }

    async fn end_tracking(&self) -> Option<ActiveTracking> {
        let tracking = self.inner.lock().await.take();
        if let Some(tracking) = &tracking {
            tracking.active.store(false, Ordering::SeqCst);
            tracking.cancel.cancel();
            if let Err(err) = self.store.remove(&tracking.job_id) {
                warn!(job_id = %tracking.job_id, %err, "failed to drop snapshot");
            }
        }
        self.sweep_finished();
        tracking
    }

    /// Delivered terminal snapshots outlive their run loop so a restart
    /// can surface them; an explicit cancel/reset is the point where
    /// they leave the store.
    fn sweep_finished(&self) {
        let jobs = match self.store.list_all() {
            Ok(jobs) => jobs,
            Err(err) => {
                warn!(%err, "failed to scan store for finished snapshots");
                return;
            }
        };
        for job in jobs.iter().filter(|job| job.is_terminal()) {
            if let Err(err) = self.store.remove(&job.id) {
                warn!(job_id = %job.id, %err, "failed to drop finished snapshot");
            }
        }
    }
}

/// Single writer over the snapshot. Consumes signals from both channel
/// tasks until a terminal outcome is delivered or both channels die.
struct RunLoop {
    rx: mpsc::UnboundedReceiver<TrackerSignal>,
    reconciler: Reconciler,
    events_tx: broadcast::Sender<TrackerEvent>,
    store: PersistentJobStore,
    backend: Arc<dyn JobBackend>,
    policy: PollingPolicy,
    active: Arc<AtomicBool>,
    cancel: CancellationToken,
    inner: Arc<Mutex<Option<ActiveTracking>>>,
}

impl RunLoop {
    async fn run(mut self) {
        let mut poll_done = false;
        let mut push_down = false;
        loop {
            let signal = tokio::select! {
                _ = self.cancel.cancelled() => return,
                signal = self.rx.recv() => match signal {
                    Some(signal) => signal,
                    None => return,
                },
            };
            match signal {
                TrackerSignal::Fragment { source, fragment } => {
                    match self.reconciler.apply(source, fragment) {
                        MergeOutcome::Unchanged => {}
                        MergeOutcome::Updated => {
                            self.persist();
                            self.emit(TrackerEvent::Update(self.reconciler.job().clone()));
                        }
                        MergeOutcome::Terminal(kind) => {
                            self.deliver_terminal(kind).await;
                            return;
                        }
                    }
                }
                TrackerSignal::Connection(state) => {
                    debug!(job_id = %self.reconciler.job().id, ?state, "push channel transition");
                    if state == ConnectionState::Closed {
                        push_down = true;
                    }
                }
                TrackerSignal::ChannelFailed { detail } => {
                    push_down = true;
                    if poll_done {
                        // Both channels are dead with the job still
                        // in flight.
                        self.emit(TrackerEvent::Error(TrackerError::Channel { message: detail }));
                        self.finish().await;
                        return;
                    }
                    warn!(
                        job_id = %self.reconciler.job().id,
                        %detail,
                        "push channel failed; polling continues"
                    );
                }
                TrackerSignal::PollExhausted { attempts, elapsed } => {
                    poll_done = true;
                    self.emit(TrackerEvent::Error(TrackerError::PollExhausted {
                        attempts,
                        elapsed,
                    }));
                    if push_down {
                        self.finish().await;
                        return;
                    }
                }
            }
        }
    }

    async fn deliver_terminal(&mut self, kind: TerminalKind) {
        match kind {
            TerminalKind::Completed { needs_result_fetch } => {
                let fetched = if needs_result_fetch {
                    self.fetch_result().await
                } else {
                    None
                };
                let outcome = self.reconciler.finalize_completion(fetched);
                self.persist();
                match outcome {
                    CompletionOutcome::Completed => {
                        self.emit(TrackerEvent::Complete(self.reconciler.job().clone()));
                    }
                    CompletionOutcome::RemoteFailed(detail) => {
                        self.emit(TrackerEvent::Error(TrackerError::RemoteJobFailed(detail)));
                    }
                }
            }
            TerminalKind::Failed(detail) => {
                self.persist();
                self.emit(TrackerEvent::Error(TrackerError::RemoteJobFailed(detail)));
            }
            TerminalKind::Cancelled => {
                // Cancelled remotely; surface the state change without a
                // terminal callback, mirroring a local cancel.
                self.persist();
                self.emit(TrackerEvent::Update(self.reconciler.job().clone()));
            }
        }
        self.finish().await;
    }

    async fn fetch_result(&self) -> Option<ResultRef> {
        let job_id = self.reconciler.job().id.clone();
        for attempt in 1..=RESULT_FETCH_ATTEMPTS {
            if !self.active.load(Ordering::SeqCst) {
                return None;
            }
            let fetched = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                fetched = self.backend.job_result(&job_id) => fetched,
            };
            match fetched {
                Ok(result) => return Some(result),
                Err(err) => {
                    warn!(%job_id, %err, attempt, "result fetch failed");
                    if attempt < RESULT_FETCH_ATTEMPTS {
                        let wait = retry_backoff(attempt, &self.policy);
                        tokio::select! {
                            _ = self.cancel.cancelled() => return None,
                            _ = tokio::time::sleep(wait) => {}
                        }
                    }
                }
            }
        }
        None
    }

    fn persist(&self) {
        let job = self.reconciler.job();
        if let Err(err) = self.store.save(job) {
            warn!(job_id = %job.id, %err, "failed to persist snapshot");
        }
    }

    fn emit(&self, event: TrackerEvent) {
        if self.active.load(Ordering::SeqCst) {
            let _ = self.events_tx.send(event);
        }
    }

    /// Stops the channel tasks and releases the tracking slot so a new
    /// job can be started. The terminal snapshot stays in the store
    /// until cancel/reset.
    async fn finish(&mut self) {
        self.cancel.cancel();
        let job_id = &self.reconciler.job().id;
        let mut guard = self.inner.lock().await;
        if guard.as_ref().is_some_and(|t| &t.job_id == job_id) {
            *guard = None;
        }
    }
}
