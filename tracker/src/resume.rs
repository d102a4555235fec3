use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use vto_protocol::Job;

pub const DEFAULT_MAX_SNAPSHOT_AGE: Duration = Duration::from_secs(30 * 60);

/// How persisted snapshots partition at startup. `resume` entries get a
/// fresh tracker; `finished` entries already hold a terminal state and
/// only need surfacing; `discard` entries are stale and get removed.
#[derive(Debug, Default, PartialEq)]
pub struct ResumePlan {
    pub resume: Vec<Job>,
    pub finished: Vec<Job>,
    pub discard: Vec<Job>,
}

/// Age is measured from `updated_at`, so a long-lived job that was still
/// reporting progress recently is resumable even if it was created hours
/// ago.
pub fn partition_resumable(snapshots: Vec<Job>, max_age: Duration, now: DateTime<Utc>) -> ResumePlan {
    let mut plan = ResumePlan::default();
    let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
    for job in snapshots {
        if job.is_terminal() {
            plan.finished.push(job);
        } else if now.signed_duration_since(job.updated_at) > max_age {
            plan.discard.push(job);
        } else {
            plan.resume.push(job);
        }
    }
    plan
}
