//! Reconnection scheduling: linear backoff capped at a maximum, one pending timer.

use std::time::Duration;

use tokio::time::Instant;

use crate::types::TimingConfig;

/// Backoff parameters. Attempt `n` (starting at 1) waits
/// `min(initial_timeout + n * increment, max_delay)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BackoffPolicy {
    pub initial_timeout: Duration,
    pub increment: Duration,
    pub max_delay: Duration,
}

impl BackoffPolicy {
    pub fn from_timing(timing: &TimingConfig) -> Self {
        Self {
            initial_timeout: timing.initial_timeout,
            increment: timing.retry_increment,
            max_delay: timing.max_retry_delay,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.initial_timeout
            .saturating_add(self.increment.saturating_mul(attempt))
            .min(self.max_delay)
    }
}

/// What the pending timer was armed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RetryKind {
    /// No `connection_established` arrived within the initial timeout.
    InitialTimeout,
    /// A scheduled retry is due: reconnect now.
    Retry,
}

#[derive(Debug, Clone, Copy)]
struct PendingTimer {
    deadline: Instant,
    kind: RetryKind,
}

/// Owns the retry counter and the single retry timer slot.
///
/// Arming any timer replaces the previous one, so at most one is pending.
#[derive(Debug)]
pub(crate) struct RetryScheduler {
    policy: BackoffPolicy,
    attempt: u32,
    pending: Option<PendingTimer>,
}

impl RetryScheduler {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempt: 1,
            pending: None,
        }
    }

    /// Arm the deadline for the first `connection_established`.
    pub fn start_initial_timeout(&mut self, now: Instant) {
        self.pending = Some(PendingTimer {
            deadline: now + self.policy.initial_timeout,
            kind: RetryKind::InitialTimeout,
        });
    }

    /// Cancel the pending timer and reset the attempt counter.
    pub fn stop(&mut self) {
        self.pending = None;
        self.attempt = 1;
    }

    /// Replace any pending timer with a retry for the current attempt, then
    /// advance the counter. Returns the delay that was armed.
    pub fn schedule_retry(&mut self, now: Instant) -> Duration {
        let delay = self.policy.delay_for(self.attempt);
        self.pending = Some(PendingTimer {
            deadline: now + delay,
            kind: RetryKind::Retry,
        });
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Take the pending timer once its deadline has passed.
    ///
    /// Either way the next retry is armed before returning, so a chain of
    /// failures keeps retrying until [`stop`](Self::stop) is called.
    pub fn fire(&mut self, now: Instant) -> Option<RetryKind> {
        let pending = self.pending.filter(|p| p.deadline <= now)?;
        self.schedule_retry(now);
        Some(pending.kind)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.pending.map(|p| p.deadline)
    }

    /// A retry (not the initial timeout) is already armed.
    pub fn retry_pending(&self) -> bool {
        self.pending.is_some_and(|p| p.kind == RetryKind::Retry)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::from_timing(&TimingConfig::default())
    }

    #[test]
    fn delay_grows_linearly_then_caps() {
        let p = policy();
        assert_eq!(p.delay_for(1), Duration::from_secs(5));
        assert_eq!(p.delay_for(2), Duration::from_secs(6));
        assert_eq!(p.delay_for(6), Duration::from_secs(10));
        assert_eq!(p.delay_for(7), Duration::from_secs(10));
        assert_eq!(p.delay_for(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn delay_is_non_decreasing_and_bounded() {
        for p in [
            policy(),
            BackoffPolicy {
                initial_timeout: Duration::from_millis(10),
                increment: Duration::from_millis(7),
                max_delay: Duration::from_millis(100),
            },
            BackoffPolicy {
                initial_timeout: Duration::from_secs(30),
                increment: Duration::from_secs(1),
                max_delay: Duration::from_secs(5),
            },
        ] {
            let mut prev = Duration::ZERO;
            for n in 1..500 {
                let d = p.delay_for(n);
                assert!(d >= prev, "delay decreased at attempt {n}");
                assert!(d <= p.max_delay, "delay exceeded max at attempt {n}");
                prev = d;
            }
        }
    }

    #[test]
    fn initial_timeout_arms_single_timer() {
        let now = Instant::now();
        let mut s = RetryScheduler::new(policy());
        s.start_initial_timeout(now);
        assert_eq!(s.deadline(), Some(now + Duration::from_secs(4)));
        assert!(!s.retry_pending());

        // Not due yet.
        assert_eq!(s.fire(now + Duration::from_secs(3)), None);

        // Firing the initial timeout arms the first retry without counting as a reconnect.
        let at = now + Duration::from_secs(4);
        assert_eq!(s.fire(at), Some(RetryKind::InitialTimeout));
        assert!(s.retry_pending());
        assert_eq!(s.deadline(), Some(at + Duration::from_secs(5)));
    }

    #[test]
    fn schedule_retry_replaces_pending_timer() {
        let now = Instant::now();
        let mut s = RetryScheduler::new(policy());
        s.start_initial_timeout(now);
        let delay = s.schedule_retry(now);
        assert_eq!(delay, Duration::from_secs(5));
        assert_eq!(s.deadline(), Some(now + delay));
        assert_eq!(s.attempt(), 2);

        let delay = s.schedule_retry(now);
        assert_eq!(delay, Duration::from_secs(6));
        assert_eq!(s.deadline(), Some(now + delay));
    }

    #[test]
    fn fire_rearms_next_retry() {
        let now = Instant::now();
        let mut s = RetryScheduler::new(policy());
        s.schedule_retry(now);

        let first = now + Duration::from_secs(5);
        assert_eq!(s.fire(first), Some(RetryKind::Retry));
        assert_eq!(s.deadline(), Some(first + Duration::from_secs(6)));

        let second = first + Duration::from_secs(6);
        assert_eq!(s.fire(second), Some(RetryKind::Retry));
        assert_eq!(s.deadline(), Some(second + Duration::from_secs(7)));
    }

    #[test]
    fn stop_cancels_and_resets() {
        let now = Instant::now();
        let mut s = RetryScheduler::new(policy());
        s.schedule_retry(now);
        s.schedule_retry(now);
        s.stop();
        assert_eq!(s.deadline(), None);
        assert_eq!(s.attempt(), 1);
        assert_eq!(s.fire(now + Duration::from_secs(3600)), None);

        // Counting restarts from the first attempt.
        assert_eq!(s.schedule_retry(now), Duration::from_secs(5));
    }
}
