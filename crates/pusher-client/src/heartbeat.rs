//! Liveness detection for connections the transport has not reported closed.

use std::time::Duration;

use tokio::time::Instant;

use crate::types::TimingConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeartbeatAction {
    /// The connection has been quiet for the activity timeout.
    SendPing,
    /// Nothing arrived within the pong timeout after a ping.
    CloseTransport,
}

/// Two-stage deadline: activity timeout, then pong timeout.
///
/// Both stages share one timer slot, so at most one heartbeat deadline is
/// pending at any time.
#[derive(Debug)]
pub(crate) struct HeartbeatMonitor {
    activity_timeout: Duration,
    pong_timeout: Duration,
    last_activity: Option<Instant>,
    awaiting_pong: bool,
    deadline: Option<Instant>,
}

impl HeartbeatMonitor {
    pub fn new(timing: &TimingConfig) -> Self {
        Self {
            activity_timeout: timing.activity_timeout,
            pong_timeout: timing.pong_timeout,
            last_activity: None,
            awaiting_pong: false,
            deadline: None,
        }
    }

    /// Record an inbound frame and restart the cycle from the activity timeout.
    pub fn on_activity(&mut self, now: Instant) {
        self.last_activity = Some(now);
        self.awaiting_pong = false;
        self.deadline = Some(now + self.activity_timeout);
    }

    /// Cancel both stages. A new cycle starts with the next `on_activity`.
    pub fn on_disconnect(&mut self) {
        self.last_activity = None;
        self.awaiting_pong = false;
        self.deadline = None;
    }

    pub fn fire(&mut self, now: Instant) -> Option<HeartbeatAction> {
        self.deadline.filter(|d| *d <= now)?;
        if self.awaiting_pong {
            self.awaiting_pong = false;
            self.deadline = None;
            Some(HeartbeatAction::CloseTransport)
        } else {
            self.awaiting_pong = true;
            self.deadline = Some(now + self.pong_timeout);
            Some(HeartbeatAction::SendPing)
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_running(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn awaiting_pong(&self) -> bool {
        self.awaiting_pong
    }

    pub fn idle_for(&self, now: Instant) -> Option<Duration> {
        self.last_activity.map(|t| now.saturating_duration_since(t))
    }
}
