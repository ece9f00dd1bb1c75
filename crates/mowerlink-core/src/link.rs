use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Degraded => "degraded",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    ConnectRequested,
    HandshakeSucceeded,
    HandshakeFailed,
    SendSucceeded,
    SendFailed,
    HeartbeatSucceeded,
    HeartbeatMissed,
    AuthenticationRejected,
    DisconnectRequested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkAction {
    None,
    /// Retry the link after the given delay, holding queued commands.
    ScheduleRetry(Duration),
    /// Link is usable again; drain the queue.
    ResumeQueue,
    /// Fail everything queued; the link is gone.
    FailQueued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub action: LinkAction,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// Exponential backoff, doubling from `base` and capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base.saturating_mul(1 << exp).min(self.max)
    }
}

#[derive(Debug, Clone)]
pub struct LinkMachine {
    state: ConnectionState,
    consecutive_failures: u32,
    failure_threshold: u32,
    backoff: Backoff,
    auth_rejected: bool,
}

impl LinkMachine {
    pub fn new(failure_threshold: u32, backoff: Backoff) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            consecutive_failures: 0,
            failure_threshold: failure_threshold.max(1),
            backoff,
            auth_rejected: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn auth_rejected(&self) -> bool {
        self.auth_rejected
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    pub fn apply(&mut self, event: LinkEvent) -> Transition {
        use ConnectionState::*;
        use LinkEvent::*;

        let from = self.state;
        let (to, action) = match (from, event) {
            (_, AuthenticationRejected) => {
                self.auth_rejected = true;
                self.consecutive_failures = 0;
                (Disconnected, LinkAction::FailQueued)
            }
            (_, DisconnectRequested) => {
                self.consecutive_failures = 0;
                (Disconnected, LinkAction::FailQueued)
            }
            (Disconnected, ConnectRequested) => {
                self.auth_rejected = false;
                (Connecting, LinkAction::None)
            }
            (Connecting, HandshakeSucceeded) => {
                self.consecutive_failures = 0;
                (Connected, LinkAction::ResumeQueue)
            }
            (Connecting, HandshakeFailed) => (Disconnected, LinkAction::FailQueued),
            (Connected, SendSucceeded | HeartbeatSucceeded) => {
                self.consecutive_failures = 0;
                (Connected, LinkAction::None)
            }
            (Degraded, SendSucceeded | HeartbeatSucceeded) => {
                self.consecutive_failures = 0;
                (Connected, LinkAction::ResumeQueue)
            }
            (Connected | Degraded, SendFailed | HeartbeatMissed) => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.failure_threshold {
                    self.consecutive_failures = 0;
                    (Disconnected, LinkAction::FailQueued)
                } else {
                    let delay = self.backoff.delay(self.consecutive_failures);
                    (Degraded, LinkAction::ScheduleRetry(delay))
                }
            }
            (state, _) => (state, LinkAction::None),
        };

        self.state = to;
        Transition { from, to, action }
    }
}
