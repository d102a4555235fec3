use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use vto_backend_client::BackendError;
use vto_protocol::CreateJobRequest;
use vto_protocol::CreateJobResponse;
use vto_protocol::ErrorDetail;
use vto_protocol::EventPayload;
use vto_protocol::Job;
use vto_protocol::JobEvent;
use vto_protocol::JobKind;
use vto_protocol::JobState;
use vto_protocol::JobStatusResponse;
use vto_protocol::ResultRef;
use vto_tracker::EventFeed;
use vto_tracker::EventStream;
use vto_tracker::FeedError;
use vto_tracker::JobBackend;
use vto_tracker::JobStatusTracker;
use vto_tracker::PersistentJobStore;
use vto_tracker::PollingPolicy;
use vto_tracker::TrackerConfig;
use vto_tracker::TrackerError;
use vto_tracker::TrackerEvent;

/// Status script plays one entry per poll attempt and repeats the last
/// entry once exhausted.
struct MockBackend {
    statuses: Mutex<VecDeque<JobStatusResponse>>,
    last: Mutex<Option<JobStatusResponse>>,
    result: Mutex<Option<ResultRef>>,
    cancelled: AtomicBool,
}

impl MockBackend {
    fn new(statuses: Vec<JobStatusResponse>) -> Self {
        Self {
            statuses: Mutex::new(statuses.into()),
            last: Mutex::new(None),
            result: Mutex::new(None),
            cancelled: AtomicBool::new(false),
        }
    }

    fn with_result(self, result: ResultRef) -> Self {
        *self.result.lock().unwrap() = Some(result);
        self
    }
}

#[async_trait]
impl JobBackend for MockBackend {
    async fn create_job(
        &self,
        _request: &CreateJobRequest,
    ) -> Result<CreateJobResponse, BackendError> {
        Ok(CreateJobResponse {
            job_id: "job-1".to_string(),
            state: JobState::Queued,
        })
    }

    async fn job_status(&self, _job_id: &str) -> Result<JobStatusResponse, BackendError> {
        match self.statuses.lock().unwrap().pop_front() {
            Some(status) => {
                *self.last.lock().unwrap() = Some(status.clone());
                Ok(status)
            }
            None => {
                let last = self.last.lock().unwrap().clone();
                Ok(last.expect("status script exhausted with no prior entry"))
            }
        }
    }

    async fn job_result(&self, _job_id: &str) -> Result<ResultRef, BackendError> {
        match self.result.lock().unwrap().clone() {
            Some(result) => Ok(result),
            None => Err(BackendError::Status {
                method: "GET",
                url: "mock://result".to_string(),
                status: 404,
                body: "no result".to_string(),
            }),
        }
    }

    async fn cancel_job(&self, _job_id: &str) -> Result<(), BackendError> {
        self.cancelled.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Plays one scripted connection per connect call, then stays offline.
struct ScriptedFeed {
    connections: Mutex<VecDeque<Vec<JobEvent>>>,
}

impl ScriptedFeed {
    fn offline() -> Self {
        Self {
            connections: Mutex::new(VecDeque::new()),
        }
    }

    fn with_connections(connections: Vec<Vec<JobEvent>>) -> Self {
        Self {
            connections: Mutex::new(connections.into()),
        }
    }
}

#[async_trait]
impl EventFeed for ScriptedFeed {
    async fn connect(&self, _job_id: &str) -> Result<EventStream, FeedError> {
        match self.connections.lock().unwrap().pop_front() {
            Some(events) => Ok(Box::pin(futures::stream::iter(events.into_iter().map(Ok)))),
            None => Err(FeedError::Connect("feed offline".to_string())),
        }
    }
}

fn running(progress: u8) -> JobStatusResponse {
    JobStatusResponse::running("job-1", progress)
}

fn terminal(state: JobState) -> JobStatusResponse {
    JobStatusResponse {
        state,
        ..running(100)
    }
}

fn event(id: i64, payload: EventPayload) -> JobEvent {
    JobEvent {
        id,
        job_id: "job-1".to_string(),
        payload,
        observed_at: Utc::now(),
    }
}

fn tracker(
    backend: MockBackend,
    feed: ScriptedFeed,
) -> (JobStatusTracker, Arc<MockBackend>, tempfile::TempDir) {
    let backend = Arc::new(backend);
    let dir = tempfile::tempdir().expect("create temp dir");
    let store = PersistentJobStore::new(dir.path()).expect("create store");
    let config = TrackerConfig {
        policy: PollingPolicy {
            max_attempts: 20,
            ..PollingPolicy::default()
        },
        ..TrackerConfig::default()
    };
    let tracker = JobStatusTracker::new(backend.clone(), Arc::new(feed), store, config);
    (tracker, backend, dir)
}

/// Collects events until the tracker goes quiet. Only safe once every
/// spawned task has finished or been cancelled.
async fn collect_events(rx: &mut broadcast::Receiver<TrackerEvent>) -> Vec<TrackerEvent> {
    let mut events = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(120), rx.recv()).await {
            Ok(Ok(event)) => events.push(event),
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => break,
        }
    }
    events
}

fn completions(events: &[TrackerEvent]) -> Vec<&Job> {
    events
        .iter()
        .filter_map(|event| match event {
            TrackerEvent::Complete(job) => Some(job),
            _ => None,
        })
        .collect()
}

fn errors(events: &[TrackerEvent]) -> Vec<&TrackerError> {
    events
        .iter()
        .filter_map(|event| match event {
            TrackerEvent::Error(err) => Some(err),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn poll_only_job_completes_once_with_result() {
    let statuses = vec![
        running(20),
        running(80),
        JobStatusResponse {
            result_ref: Some(ResultRef::Single {
                url: "https://cdn/out.png".to_string(),
            }),
            ..terminal(JobState::Completed)
        },
    ];
    let (tracker, _backend, _dir) = tracker(MockBackend::new(statuses), ScriptedFeed::offline());
    let mut rx = tracker.subscribe();
    tracker.start("job-1").await.expect("start tracking");

    let events = collect_events(&mut rx).await;
    let completed = completions(&events);
    assert_eq!(completed.len(), 1, "exactly one completion: {events:?}");
    assert_eq!(
        completed[0].result_ref,
        Some(ResultRef::Single {
            url: "https://cdn/out.png".to_string()
        })
    );
    assert_eq!(completed[0].progress, 100);
    assert!(errors(&events).is_empty(), "unexpected errors: {events:?}");
}

#[tokio::test(start_paused = true)]
async fn duplicate_terminal_reports_deliver_one_failure() {
    // Push and poll both observe the failure; only one error surfaces.
    let feed = ScriptedFeed::with_connections(vec![vec![event(
        1,
        EventPayload::Error {
            detail: ErrorDetail::new("executor crashed"),
        },
    )]]);
    let statuses = vec![JobStatusResponse {
        error_detail: Some(ErrorDetail::new("executor crashed")),
        ..terminal(JobState::Failed)
    }];
    let (tracker, _backend, _dir) = tracker(MockBackend::new(statuses), feed);
    let mut rx = tracker.subscribe();
    tracker.start("job-1").await.expect("start tracking");

    let events = collect_events(&mut rx).await;
    let failures: Vec<_> = errors(&events)
        .into_iter()
        .filter(|err| matches!(err, TrackerError::RemoteJobFailed(_)))
        .collect();
    assert_eq!(failures.len(), 1, "exactly one failure: {events:?}");
    assert!(completions(&events).is_empty());
}

#[tokio::test(start_paused = true)]
async fn exhausted_polling_reports_without_touching_the_snapshot() {
    let (tracker, _backend, dir) = {
        let backend = Arc::new(MockBackend::new(vec![running(10)]));
        let dir = tempfile::tempdir().expect("create temp dir");
        let store = PersistentJobStore::new(dir.path()).expect("create store");
        let config = TrackerConfig {
            policy: PollingPolicy {
                max_attempts: 5,
                ..PollingPolicy::default()
            },
            ..TrackerConfig::default()
        };
        (
            JobStatusTracker::new(
                backend.clone(),
                Arc::new(ScriptedFeed::offline()),
                store,
                config,
            ),
            backend,
            dir,
        )
    };
    let mut rx = tracker.subscribe();
    tracker.start("job-1").await.expect("start tracking");

    let events = collect_events(&mut rx).await;
    match errors(&events).as_slice() {
        [TrackerError::PollExhausted { attempts, .. }] => assert_eq!(*attempts, 5),
        other => panic!("expected one poll exhaustion, got {other:?}"),
    }
    assert!(completions(&events).is_empty());

    // The snapshot keeps the last known state; exhaustion is not a job
    // outcome.
    let store = PersistentJobStore::new(dir.path()).expect("reopen store");
    let snapshot = store.load("job-1").expect("load").expect("snapshot kept");
    assert_eq!(snapshot.state, JobState::Running);
    assert_eq!(snapshot.progress, 10);
}

#[tokio::test(start_paused = true)]
async fn poll_finishes_the_job_after_the_push_channel_dies() {
    // One connection delivers early progress and drops; polling carries
    // the job to completion.
    let feed = ScriptedFeed::with_connections(vec![vec![event(
        1,
        EventPayload::Progress {
            progress: 30,
            message: None,
        },
    )]]);
    let statuses = vec![
        running(40),
        JobStatusResponse {
            result_ref: Some(ResultRef::Single {
                url: "https://cdn/out.png".to_string(),
            }),
            ..terminal(JobState::Completed)
        },
    ];
    let (tracker, _backend, _dir) = tracker(MockBackend::new(statuses), feed);
    let mut rx = tracker.subscribe();
    tracker.start("job-1").await.expect("start tracking");

    let events = collect_events(&mut rx).await;
    assert_eq!(completions(&events).len(), 1, "one completion: {events:?}");
    let channel_errors: Vec<_> = errors(&events)
        .into_iter()
        .filter(|err| matches!(err, TrackerError::Channel { .. }))
        .collect();
    assert!(
        channel_errors.is_empty(),
        "push death alone is not an error while polling works: {events:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn unfetchable_result_completes_without_reference() {
    // Terminal status without a result and no fetchable result either.
    let statuses = vec![terminal(JobState::Completed)];
    let (tracker, _backend, _dir) = tracker(MockBackend::new(statuses), ScriptedFeed::offline());
    let mut rx = tracker.subscribe();
    tracker.start("job-1").await.expect("start tracking");

    let events = collect_events(&mut rx).await;
    // The fetch itself failed, which leaves the job completed without a
    // reference rather than failed.
    let completed = completions(&events);
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].result_ref, None);
}

#[tokio::test(start_paused = true)]
async fn completed_status_triggers_result_fetch() {
    let statuses = vec![running(50), terminal(JobState::Completed)];
    let backend = MockBackend::new(statuses).with_result(ResultRef::Single {
        url: "https://cdn/fetched.png".to_string(),
    });
    let (tracker, _backend, _dir) = tracker(backend, ScriptedFeed::offline());
    let mut rx = tracker.subscribe();
    tracker.start("job-1").await.expect("start tracking");

    let events = collect_events(&mut rx).await;
    let completed = completions(&events);
    assert_eq!(completed.len(), 1);
    assert_eq!(
        completed[0].result_ref,
        Some(ResultRef::Single {
            url: "https://cdn/fetched.png".to_string()
        })
    );
}

#[tokio::test(start_paused = true)]
async fn cancel_is_idempotent_and_reaches_the_backend() {
    let (tracker, backend, dir) = tracker(MockBackend::new(vec![running(10)]), ScriptedFeed::offline());
    let mut rx = tracker.subscribe();
    tracker.start("job-1").await.expect("start tracking");
    tracker.cancel().await;
    tracker.cancel().await;

    assert!(backend.cancelled.load(Ordering::SeqCst));
    let store = PersistentJobStore::new(dir.path()).expect("reopen store");
    assert!(store.load("job-1").expect("load").is_none());
    // Nothing is delivered after cancel returns.
    let events = collect_events(&mut rx).await;
    assert!(completions(&events).is_empty());
    assert!(errors(&events).is_empty());
}

#[tokio::test(start_paused = true)]
async fn reset_clears_a_delivered_terminal_snapshot() {
    let statuses = vec![
        running(50),
        JobStatusResponse {
            result_ref: Some(ResultRef::Single {
                url: "https://cdn/out.png".to_string(),
            }),
            ..terminal(JobState::Completed)
        },
    ];
    let (tracker, _backend, dir) = tracker(MockBackend::new(statuses), ScriptedFeed::offline());
    let mut rx = tracker.subscribe();
    tracker.start("job-1").await.expect("start tracking");
    let events = collect_events(&mut rx).await;
    assert_eq!(completions(&events).len(), 1);

    // The terminal snapshot survives delivery so a restart can surface
    // it, but an explicit reset must still be able to clear it.
    let store = PersistentJobStore::new(dir.path()).expect("reopen store");
    assert!(store.load("job-1").expect("load").is_some());
    tracker.reset().await;
    assert!(store.load("job-1").expect("load").is_none());
}

#[tokio::test(start_paused = true)]
async fn starting_the_same_job_twice_is_a_no_op() {
    let (tracker, _backend, _dir) = tracker(MockBackend::new(vec![running(10)]), ScriptedFeed::offline());
    let first = tracker.start("job-1").await.expect("start tracking");
    let second = tracker.start("job-1").await.expect("idempotent start");
    assert_eq!(first, second);

    match tracker.start("job-2").await {
        Err(TrackerError::AlreadyTracking { job_id }) => assert_eq!(job_id, "job-1"),
        other => panic!("expected AlreadyTracking, got {other:?}"),
    }
    tracker.reset().await;
}

#[tokio::test(start_paused = true)]
async fn submit_marks_multi_garment_requests_as_batch() {
    let statuses = vec![running(10)];
    let (tracker, _backend, _dir) = tracker(MockBackend::new(statuses), ScriptedFeed::offline());
    let mut rx = tracker.subscribe();
    let request = CreateJobRequest::new(vec![
        "https://cdn/g1.jpg".to_string(),
        "https://cdn/g2.jpg".to_string(),
    ]);
    let handle = tracker.submit(&request).await.expect("submit");
    assert_eq!(handle.job_id(), "job-1");

    let update = loop {
        match rx.recv().await.expect("event") {
            TrackerEvent::Update(job) => break job,
            _ => continue,
        }
    };
    assert_eq!(update.kind, JobKind::Batch);
    tracker.reset().await;
}

#[tokio::test(start_paused = true)]
async fn resume_picks_up_a_recent_snapshot() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let store = PersistentJobStore::new(dir.path()).expect("create store");
    let mut job = Job::new("job-1", JobKind::Single, Utc::now());
    job.state = JobState::Running;
    job.progress = 30;
    store.save(&job).expect("persist snapshot");

    let statuses = vec![
        running(60),
        JobStatusResponse {
            result_ref: Some(ResultRef::Single {
                url: "https://cdn/out.png".to_string(),
            }),
            ..terminal(JobState::Completed)
        },
    ];
    let tracker = JobStatusTracker::new(
        Arc::new(MockBackend::new(statuses)),
        Arc::new(ScriptedFeed::offline()),
        store,
        TrackerConfig::default(),
    );
    let mut rx = tracker.subscribe();
    let plan = tracker.resume().await.expect("resume");
    assert_eq!(plan.resume.len(), 1);
    assert_eq!(plan.resume[0].id, "job-1");

    let events = collect_events(&mut rx).await;
    assert_eq!(completions(&events).len(), 1);
}
