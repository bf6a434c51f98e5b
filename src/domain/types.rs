use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Length of one planning slot on the wall-clock half-hour grid.
pub const SLOT_MINUTES: i64 = 30;

/// Floor an instant to the enclosing half-hour slot boundary (UTC grid).
pub fn slot_floor(t: DateTime<Utc>) -> DateTime<Utc> {
    let minute = t.minute() - (t.minute() % SLOT_MINUTES as u32);
    t.with_minute(minute)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

/// Start of the slot following the one containing `t`.
pub fn slot_ceil(t: DateTime<Utc>) -> DateTime<Utc> {
    let floor = slot_floor(t);
    if floor == t {
        floor
    } else {
        floor + Duration::minutes(SLOT_MINUTES)
    }
}

/// Physical relay state as last acknowledged by the device worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum RelayState {
    On,
    Off,
    /// Never contacted since startup, or contact lost before an ack.
    Unknown,
}

impl RelayState {
    pub fn is_on(self) -> bool {
        matches!(self, RelayState::On)
    }
}

/// Decision for a single plan slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum PlanDecision {
    On,
    Off,
}

/// Why a slot ended up with its decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ReasonCode {
    ScheduleHit,
    PriceBelowCeiling,
    Priority,
    ParentGated,
    ConstrainedOff,
    DateOff,
    ForcedOff,
    AppOverride,
    PriceAboveCeiling,
    NotSelected,
}

/// Output flavour. Switched outputs drive a relay; meter outputs only
/// observe a power meter; imported outputs ingest externally recorded
/// sessions. Unsupported fields per flavour are rejected at config load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OutputKind {
    Switched,
    Meter,
    Imported,
}

/// Planning mode for switched outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum PlanMode {
    BestPrice,
    Schedule,
}

/// User-pushed forced state, with optional expiry. An expired override is
/// equivalent to no override at all.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AppOverride {
    pub target_on: bool,
    /// None means the override never expires.
    pub expires_at: Option<DateTime<Utc>>,
}

impl AppOverride {
    pub fn active(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(exp) => now < exp,
            None => true,
        }
    }
}

/// How a physical input pin maps onto the output it is wired to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum InputPinMode {
    /// Input low forces the output ON; high leaves it plan-driven.
    TurnOn,
    /// Input low forces the output OFF; high leaves it plan-driven.
    TurnOff,
    /// Input has no effect.
    Ignore,
}

/// What to do with a UPS-linked output when the UPS is unhealthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum UnhealthyAction {
    TurnOff,
    AlertOnly,
}
