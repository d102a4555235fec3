//! Client-side tracking for long-running remote try-on jobs.
//!
//! A [`JobStatusTracker`] watches one job through two channels at once,
//! a server-sent event feed and an adaptive poll loop, reconciles their
//! observations into a single persisted snapshot, and broadcasts status
//! updates plus a once-only terminal outcome. Snapshots survive process
//! restarts and recent ones can be resumed.

mod backend;
mod error;
mod policy;
mod poll;
mod push;
mod reconcile;
mod resume;
mod store;
mod tracker;

pub use backend::JobBackend;
pub use backend::JobSubmitter;
pub use error::TrackerError;
pub use policy::PollingPolicy;
pub use push::ConnectionState;
pub use push::EventFeed;
pub use push::EventStream;
pub use push::FeedError;
pub use push::SseEventFeed;
pub use reconcile::BatchFailurePolicy;
pub use reconcile::FragmentSource;
pub use reconcile::StatusFragment;
pub use resume::DEFAULT_MAX_SNAPSHOT_AGE;
pub use resume::ResumePlan;
pub use resume::partition_resumable;
pub use store::PersistentJobStore;
pub use store::StoreError;
pub use tracker::JobHandle;
pub use tracker::JobStatusTracker;
pub use tracker::TrackerConfig;
pub use tracker::TrackerEvent;
