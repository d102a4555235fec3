use std::time::Duration;

use rand::Rng;

const BACKOFF_FACTOR: f64 = 2.0;
const RETRY_INITIAL_DELAY_MS: u64 = 500;

/// Per-tracker polling limits and interval shape. Not persisted.
#[derive(Debug, Clone)]
pub struct PollingPolicy {
    pub base_interval: Duration,
    pub max_interval: Duration,
    /// ±ratio applied to every computed interval.
    pub jitter_ratio: f64,
    pub max_attempts: u32,
    pub total_timeout: Duration,
}

impl Default for PollingPolicy {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(30),
            jitter_ratio: 0.2,
            max_attempts: 120,
            total_timeout: Duration::from_secs(15 * 60),
        }
    }
}

/// Status-driven interval: exponential growth from the base, overridden
/// by a server-recommended interval whenever one is present. Separate
/// from the transient-retry backoff below.
#[derive(Debug)]
pub(crate) struct IntervalState {
    current: Duration,
}

impl IntervalState {
    pub(crate) fn new(policy: &PollingPolicy) -> Self {
        Self {
            current: policy.base_interval,
        }
    }

    pub(crate) fn reset(&mut self, policy: &PollingPolicy) {
        self.current = policy.base_interval;
    }

    /// Next wait before the following poll attempt.
    pub(crate) fn next(&mut self, policy: &PollingPolicy, server_hint: Option<Duration>) -> Duration {
        match server_hint {
            Some(hint) => self.current = hint,
            None => {
                self.current = self.current.mul_f64(BACKOFF_FACTOR).min(policy.max_interval);
            }
        }
        jittered(self.current, policy)
    }
}

/// Backoff for transient fetch failures, independent of the
/// status-driven interval. `failure` is 1-based.
pub(crate) fn retry_backoff(failure: u32, policy: &PollingPolicy) -> Duration {
    let exp = BACKOFF_FACTOR.powi(failure.saturating_sub(1) as i32);
    let base = Duration::from_millis((RETRY_INITIAL_DELAY_MS as f64 * exp) as u64);
    jittered(base.min(policy.max_interval), policy)
}

fn jittered(interval: Duration, policy: &PollingPolicy) -> Duration {
    let ratio = policy.jitter_ratio;
    // Inclusive so a zero ratio samples the degenerate 1.0..=1.0 range
    // instead of panicking on an empty one.
    let factor = rand::rng().random_range(1.0 - ratio..=1.0 + ratio);
    let floor = policy.base_interval.mul_f64(1.0 - ratio);
    interval
        .mul_f64(factor)
        .clamp(floor.min(policy.max_interval), policy.max_interval)
}
