//! Connection state machine.
//!
//! ```text
//! disconnected -> connecting -> connected <-> degraded
//!       ^                          |             |
//!       +--------------------------+-------------+
//! ```
//!
//! The machine is driven by [`ConnectionEvent`]s from the transport and
//! answers with the resulting [`Transition`] and the [`Action`] the transport
//! must take. `Stop` is terminal: every later event is ignored.

use crate::{backoff::Backoff, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Missed heartbeats that force a reconnect cycle.
pub const MAX_MISSED_HEARTBEATS: u32 = 3;

/// Transport connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Connected, but heartbeats or polls are failing
    Degraded,
}

impl ConnectionState {
    /// Whether sends may be attempted in this state.
    pub fn may_send(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Degraded)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Degraded => "degraded",
        };
        f.write_str(name)
    }
}

/// Transport delivery mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    #[default]
    Polling,
    Push,
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Transport started, or a scheduled reconnect fired
    Start,
    /// Push socket opened
    Opened,
    /// Push socket closed or failed to open
    Closed,
    /// Any inbound push frame
    HeartbeatAck,
    /// No inbound frame within two heartbeat intervals
    HeartbeatMissed,
    PollSucceeded,
    PollFailed,
    /// Explicit shutdown
    Stop,
}

/// A state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    /// When the change happened (ms)
    pub at: Timestamp,
}

/// Work the transport must do after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Feed [`ConnectionEvent::Start`] again after the backoff delay
    ScheduleReconnect { attempt: u32 },
    /// Tear the socket down and go through a reconnect cycle
    ForceReconnect,
}

/// Result of handling one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Step {
    pub transition: Option<Transition>,
    pub action: Option<Action>,
}

/// Tunables for the state machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectionPolicy {
    pub mode: TransportMode,
    /// Schedule reconnects after a close
    pub reconnect: bool,
    /// Consecutive poll failures before `degraded`
    pub degraded_after_failures: u32,
    pub backoff: Backoff,
}

impl Default for ConnectionPolicy {
    fn default() -> Self {
        Self {
            mode: TransportMode::Polling,
            reconnect: true,
            degraded_after_failures: 3,
            backoff: Backoff::default(),
        }
    }
}

/// The connection state machine.
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    policy: ConnectionPolicy,
    state: ConnectionState,
    stopped: bool,
    reconnect_attempt: u32,
    missed_heartbeats: u32,
    poll_failures: u32,
}

impl ConnectionMachine {
    /// Create a machine in `disconnected`.
    pub fn new(policy: ConnectionPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Disconnected,
            stopped: false,
            reconnect_attempt: 0,
            missed_heartbeats: 0,
            poll_failures: 0,
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Check whether `stop` was handled.
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Whether sends may be attempted right now.
    pub fn may_send(&self) -> bool {
        !self.stopped && self.state.may_send()
    }

    /// Consecutive heartbeats missed so far.
    pub fn missed_heartbeats(&self) -> u32 {
        self.missed_heartbeats
    }

    /// Backoff delay for a reconnect attempt.
    pub fn reconnect_delay(&self, attempt: u32, jitter_factor: f64) -> u64 {
        self.policy.backoff.delay(attempt, jitter_factor)
    }

    /// Feed one event.
    pub fn handle(&mut self, event: ConnectionEvent, now: Timestamp) -> Step {
        use ConnectionEvent as E;
        use ConnectionState as S;

        if self.stopped {
            return Step::default();
        }

        let mut action = None;
        let next = match (event, self.state) {
            (E::Start, S::Disconnected) => match self.policy.mode {
                TransportMode::Polling => Some(S::Connected),
                TransportMode::Push => Some(S::Connecting),
            },
            (E::Start, _) => None,

            (E::Opened, S::Connecting | S::Disconnected) => {
                self.reconnect_attempt = 0;
                self.missed_heartbeats = 0;
                Some(S::Connected)
            }
            (E::Opened, _) => None,

            (E::Closed, S::Disconnected) if !self.policy.reconnect => None,
            (E::Closed, _) => {
                self.missed_heartbeats = 0;
                if self.policy.reconnect {
                    action = Some(Action::ScheduleReconnect {
                        attempt: self.reconnect_attempt,
                    });
                    self.reconnect_attempt = self.reconnect_attempt.saturating_add(1);
                }
                Some(S::Disconnected)
            }

            (E::HeartbeatAck, S::Degraded) => {
                self.missed_heartbeats = 0;
                Some(S::Connected)
            }
            (E::HeartbeatAck, _) => {
                self.missed_heartbeats = 0;
                None
            }

            (E::HeartbeatMissed, S::Connected | S::Degraded) => {
                self.missed_heartbeats += 1;
                if self.missed_heartbeats >= MAX_MISSED_HEARTBEATS {
                    action = Some(Action::ForceReconnect);
                }
                Some(S::Degraded)
            }
            (E::HeartbeatMissed, _) => None,

            (E::PollSucceeded, _) => {
                self.poll_failures = 0;
                Some(S::Connected)
            }

            (E::PollFailed, S::Connected | S::Degraded) => {
                self.poll_failures += 1;
                (self.poll_failures >= self.policy.degraded_after_failures).then_some(S::Degraded)
            }
            (E::PollFailed, _) => None,

            (E::Stop, _) => {
                self.stopped = true;
                Some(S::Disconnected)
            }
        };

        let transition = next.filter(|to| *to != self.state).map(|to| {
            let from = std::mem::replace(&mut self.state, to);
            Transition { from, to, at: now }
        });

        Step { transition, action }
    }
}
