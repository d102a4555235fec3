//! Shared data model for the try-on job tracking subsystem.
//!
//! This crate defines the canonical [`Job`] snapshot, the append-only
//! [`JobEvent`] fragments delivered by the push feed, and the wire types
//! spoken by the remote executor's REST surface. It performs no I/O.

mod event;
mod job;
mod wire;

pub use event::EventPayload;
pub use event::JobEvent;
pub use job::BatchItem;
pub use job::ErrorDetail;
pub use job::Job;
pub use job::JobKind;
pub use job::JobState;
pub use job::ResultRef;
pub use wire::CreateJobRequest;
pub use wire::CreateJobResponse;
pub use wire::JobStatusResponse;
