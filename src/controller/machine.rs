//! Per-output relay state machine. The control loop feeds it one decision
//! per tick; the machine enforces anti-chatter locks and tracks in-flight
//! actuation so at most one command per output is ever outstanding.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use strum_macros::Display;
use uuid::Uuid;

use crate::domain::{AntiChatter, OffTimer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    Off,
    On,
    TurningOn,
    TurningOff,
    LockedOn,
    LockedOff,
    Fault,
}

/// Actuation the control loop must start this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    TurnOn,
    TurnOff,
}

/// Everything the machine needs to know about the world this tick, already
/// reduced to a single wanted state plus lock-bypass hints.
#[derive(Debug, Clone, Copy)]
pub struct Gates {
    /// The state the output should be in.
    pub want_on: bool,
    /// An app override or forced input pin bypasses min-on/min-off locks.
    pub ignore_locks: bool,
}

#[derive(Debug, Clone)]
pub struct OutputMachine {
    pub state: ControllerState,
    /// End of the current LOCKED_ON / LOCKED_OFF window.
    pub locked_until: Option<DateTime<Utc>>,
    /// Continuous-off start, driving max-off forced exercise.
    pub off_since: Option<DateTime<Utc>>,
    pub on_since: Option<DateTime<Utc>>,
    /// Correlation id of the in-flight command or sequence.
    pub pending: Option<Uuid>,
    pub last_fault: Option<String>,
    chatter: AntiChatter,
}

impl OutputMachine {
    /// A machine always starts from the persisted relay state so a restart
    /// does not cycle hardware.
    pub fn new(chatter: AntiChatter, relay_on: Option<bool>, now: DateTime<Utc>) -> Self {
        let (state, on_since, off_since) = match relay_on {
            Some(true) => (ControllerState::On, Some(now), None),
            Some(false) => (ControllerState::Off, None, Some(now)),
            None => (ControllerState::Off, None, None),
        };
        Self {
            state,
            locked_until: None,
            off_since,
            on_since,
            pending: None,
            last_fault: None,
            chatter,
        }
    }

    pub fn is_on(&self) -> bool {
        matches!(
            self.state,
            ControllerState::On | ControllerState::LockedOn | ControllerState::TurningOff
        )
    }

    pub fn in_flight(&self) -> bool {
        self.pending.is_some()
    }

    /// True when the output has sat continuously off past the configured
    /// max-off exercise interval.
    pub fn max_off_exceeded(&self, now: DateTime<Utc>) -> bool {
        let OffTimer::MaxOff { minutes } = self.chatter.off_timer else {
            return false;
        };
        match (self.state, self.off_since) {
            (ControllerState::Off, Some(since)) => {
                now - since > Duration::minutes(minutes as i64)
            }
            _ => false,
        }
    }

    /// Release expired locks. Called at the top of every tick.
    pub fn expire_locks(&mut self, now: DateTime<Utc>) {
        let Some(until) = self.locked_until else { return };
        if now < until {
            return;
        }
        self.locked_until = None;
        match self.state {
            ControllerState::LockedOn => self.state = ControllerState::On,
            ControllerState::LockedOff => self.state = ControllerState::Off,
            _ => {}
        }
    }

    /// Evaluate one tick. Returns the actuation to start, if any. While a
    /// command is in flight no further action is produced.
    pub fn step(&mut self, now: DateTime<Utc>, gates: Gates) -> Option<Action> {
        if self.in_flight() {
            return None;
        }
        match self.state {
            ControllerState::On => {
                if !gates.want_on {
                    Some(Action::TurnOff)
                } else {
                    None
                }
            }
            ControllerState::LockedOn => {
                // Min-on holds unless an override asks to break it.
                if !gates.want_on && gates.ignore_locks {
                    Some(Action::TurnOff)
                } else {
                    None
                }
            }
            ControllerState::Off => {
                if gates.want_on {
                    Some(Action::TurnOn)
                } else {
                    None
                }
            }
            ControllerState::LockedOff => {
                if gates.want_on && gates.ignore_locks {
                    Some(Action::TurnOn)
                } else {
                    None
                }
            }
            ControllerState::Fault => {
                // Recovery: attempt whichever direction the world wants.
                Some(if gates.want_on {
                    Action::TurnOn
                } else {
                    Action::TurnOff
                })
            }
            ControllerState::TurningOn | ControllerState::TurningOff => None,
        }
    }

    /// Record that actuation has been dispatched.
    pub fn begin(&mut self, action: Action, correlation_id: Uuid) {
        self.pending = Some(correlation_id);
        self.state = match action {
            Action::TurnOn => ControllerState::TurningOn,
            Action::TurnOff => ControllerState::TurningOff,
        };
    }

    /// Actuation finished. On success the relevant anti-chatter lock is
    /// armed; on failure the machine faults and waits for recovery.
    pub fn complete(&mut self, now: DateTime<Utc>, ok: bool, error: Option<String>) {
        self.pending = None;
        if !ok {
            self.last_fault = error;
            self.state = ControllerState::Fault;
            return;
        }
        self.last_fault = None;
        match self.state {
            ControllerState::TurningOn => {
                self.on_since = Some(now);
                self.off_since = None;
                if self.chatter.min_on_minutes > 0 {
                    self.state = ControllerState::LockedOn;
                    self.locked_until =
                        Some(now + Duration::minutes(self.chatter.min_on_minutes as i64));
                } else {
                    self.state = ControllerState::On;
                }
            }
            ControllerState::TurningOff => {
                self.off_since = Some(now);
                self.on_since = None;
                if let OffTimer::MinOff { minutes } = self.chatter.off_timer {
                    self.state = ControllerState::LockedOff;
                    self.locked_until = Some(now + Duration::minutes(minutes as i64));
                } else {
                    self.state = ControllerState::Off;
                }
            }
            // A stray completion for a state we are no longer in: adopt
            // the closest stable state rather than guessing.
            _ => {}
        }
    }

    /// Force-adopt an externally observed relay state (webhook or status
    /// poll disagreeing with our bookkeeping).
    pub fn observe(&mut self, now: DateTime<Utc>, relay_on: bool) {
        if self.in_flight() {
            return;
        }
        match (self.is_on(), relay_on) {
            (false, true) => {
                self.state = ControllerState::On;
                self.on_since = Some(now);
                self.off_since = None;
                self.locked_until = None;
            }
            (true, false) => {
                self.state = ControllerState::Off;
                self.off_since = Some(now);
                self.on_since = None;
                self.locked_until = None;
            }
            _ => {}
        }
    }
}
