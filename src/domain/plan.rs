use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::{PlanDecision, ReasonCode};

/// One half-hour slot of a run plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSlot {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub decision: PlanDecision,
    pub reason: ReasonCode,
    /// Price used when deciding this slot, if any was available.
    pub price: Option<f64>,
}

impl PlanSlot {
    pub fn covers(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t < self.end
    }

    pub fn is_on(&self) -> bool {
        self.decision == PlanDecision::On
    }
}

/// Errors raised when validating slot partitioning.
#[derive(Debug, Error, PartialEq)]
pub enum PlanValidationError {
    #[error("slot {index} has an invalid time range")]
    InvalidRange { index: usize },
    #[error("gap between {previous_end} and {next_start}")]
    Gap {
        previous_end: DateTime<Utc>,
        next_start: DateTime<Utc>,
    },
    #[error("overlap between {previous_end} and {next_start}")]
    Overlap {
        previous_end: DateTime<Utc>,
        next_start: DateTime<Utc>,
    },
}

/// The per-output plan over the planning horizon. Slots partition the
/// horizon: ordered, gap-free, overlap-free.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunPlan {
    pub output: String,
    pub built_at: DateTime<Utc>,
    pub slots: Vec<PlanSlot>,
}

impl RunPlan {
    pub fn empty(output: impl Into<String>, built_at: DateTime<Utc>) -> Self {
        Self {
            output: output.into(),
            built_at,
            slots: Vec::new(),
        }
    }

    /// The slot containing `t`, if the horizon covers it.
    pub fn slot_at(&self, t: DateTime<Utc>) -> Option<&PlanSlot> {
        self.slots.iter().find(|s| s.covers(t))
    }

    /// Planned decision at `t`; Off outside the horizon.
    pub fn decision_at(&self, t: DateTime<Utc>) -> PlanDecision {
        self.slot_at(t)
            .map(|s| s.decision)
            .unwrap_or(PlanDecision::Off)
    }

    /// Number of planned ON slots with start in `[from, to)`.
    pub fn on_slots_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> usize {
        self.slots
            .iter()
            .filter(|s| s.is_on() && s.start >= from && s.start < to)
            .count()
    }

    /// Check the partition invariant.
    pub fn validate(&self) -> Result<(), PlanValidationError> {
        for (i, s) in self.slots.iter().enumerate() {
            if s.end <= s.start {
                return Err(PlanValidationError::InvalidRange { index: i });
            }
        }
        for pair in self.slots.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            if b.start > a.end {
                return Err(PlanValidationError::Gap {
                    previous_end: a.end,
                    next_start: b.start,
                });
            }
            if b.start < a.end {
                return Err(PlanValidationError::Overlap {
                    previous_end: a.end,
                    next_start: b.start,
                });
            }
        }
        Ok(())
    }
}
