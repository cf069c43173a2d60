//! Per-rule alert state machine.
//!
//! A rule moves `Idle → Pending → Firing → CoolingDown → Idle`. The
//! condition must hold for the rule's `duration` before firing
//! (hysteresis), and successive firings are separated by at least
//! `cooldown`. The machine is a pure function of (condition, now) so the
//! worker loop stays trivially small and the transitions are testable
//! without a clock.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Position of a rule in its firing lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RuleState {
    #[default]
    Idle,
    Pending,
    Firing,
    CoolingDown,
}

/// Outcome of one evaluation tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// No side effect this tick.
    None,
    /// The rule just fired: dispatch all actions now.
    Dispatch,
}

/// Checkpointable alert state, embedded in the rule record on shutdown
/// so a restarting owner resumes mid-hysteresis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AlertState {
    pub state: RuleState,
    /// First observation at which the condition became true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_at: Option<DateTime<Utc>>,
    /// Timestamp of the most recent action dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fired_at: Option<DateTime<Utc>>,
}

impl AlertState {
    /// Advance the machine by one tick.
    ///
    /// `firing` is whether the condition holds this tick. Returns
    /// `Transition::Dispatch` exactly when the condition has held for
    /// `duration` and the rule is not cooling down; the caller must then
    /// run the actions and call [`AlertState::enter_cooldown`].
    pub fn step(
        &mut self,
        firing: bool,
        duration: Duration,
        cooldown: Duration,
        now: DateTime<Utc>,
    ) -> Transition {
        match self.state {
            RuleState::Idle => {
                if firing {
                    self.state = RuleState::Pending;
                    self.active_at = Some(now);
                }
                Transition::None
            }
            RuleState::Pending => {
                if !firing {
                    self.state = RuleState::Idle;
                    self.active_at = None;
                    return Transition::None;
                }
                let held = self
                    .active_at
                    .map(|at| now.signed_duration_since(at).to_std().unwrap_or_default())
                    .unwrap_or_default();
                if held >= duration {
                    self.state = RuleState::Firing;
                    self.last_fired_at = Some(now);
                    Transition::Dispatch
                } else {
                    Transition::None
                }
            }
            // Reached only when restored from a checkpoint taken between
            // dispatch and cooldown entry.
            RuleState::Firing => {
                self.enter_cooldown();
                Transition::None
            }
            RuleState::CoolingDown => {
                let since_fired = self
                    .last_fired_at
                    .map(|at| now.signed_duration_since(at).to_std().unwrap_or_default())
                    .unwrap_or(cooldown);
                if since_fired >= cooldown {
                    self.state = RuleState::Idle;
                    self.active_at = None;
                }
                Transition::None
            }
        }
    }

    /// Move `Firing → CoolingDown` after action dispatch completes.
    pub fn enter_cooldown(&mut self) {
        if self.state == RuleState::Firing {
            self.state = RuleState::CoolingDown;
            self.active_at = None;
        }
    }
}
