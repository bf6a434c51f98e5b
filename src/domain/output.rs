use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::types::{InputPinMode, OutputKind, PlanMode, UnhealthyAction};

/// Daily run-hour budget. `target_hours == -1.0` means "all eligible
/// slots"; month overrides replace the target for that calendar month.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyBudget {
    pub min_hours: f64,
    pub max_hours: f64,
    pub target_hours: f64,
    /// Month number (1-12) to target-hours override.
    #[serde(default)]
    pub month_targets: HashMap<u32, f64>,
    pub max_shortfall_hours: f64,
}

impl DailyBudget {
    pub const ALL_ELIGIBLE: f64 = -1.0;

    /// Target hours for a given month, honouring per-month overrides.
    pub fn target_for_month(&self, month: u32) -> f64 {
        self.month_targets
            .get(&month)
            .copied()
            .unwrap_or(self.target_hours)
    }

    pub fn wants_all_eligible(&self, month: u32) -> bool {
        self.target_for_month(month) == Self::ALL_ELIGIBLE
    }
}

/// Price ceilings for BestPrice planning, cents per kWh.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceCeilings {
    pub max_best_price: f64,
    pub max_priority_price: f64,
}

/// Off-side anti-chatter timer. `MinOff` and `MaxOff` are mutually
/// exclusive: the former clamps re-energising, the latter forces periodic
/// exercise.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OffTimer {
    None,
    MinOff { minutes: u32 },
    MaxOff { minutes: u32 },
}

/// Anti-chatter configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AntiChatter {
    pub min_on_minutes: u32,
    pub off_timer: OffTimer,
}

/// Inclusive local-date interval in which the output must stay off.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DateOff {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateOff {
    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.from && date <= self.to
    }
}

/// Comparison direction for a temperature constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TempComparison {
    /// Eligible only while the probe reads above the threshold.
    Above,
    /// Eligible only while the probe reads below the threshold.
    Below,
}

/// Gate an output on a temperature probe reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TempConstraint {
    pub probe: String,
    pub comparison: TempComparison,
    pub threshold_c: f64,
}

impl TempConstraint {
    /// True when the reading violates the constraint. `None` (no reading or
    /// stale) is never a violation on its own.
    pub fn violated_by(&self, reading_c: Option<f64>) -> bool {
        match (reading_c, self.comparison) {
            (Some(t), TempComparison::Above) => t <= self.threshold_c,
            (Some(t), TempComparison::Below) => t >= self.threshold_c,
            (None, _) => false,
        }
    }
}

/// Link to a UPS and the action taken while it is unhealthy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpsLink {
    pub ups: String,
    pub action: UnhealthyAction,
}

/// Physical input pin wired to override this output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputPin {
    pub device: String,
    pub input: u8,
    pub mode: InputPinMode,
}

/// Power thresholds for meter-kind outputs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeterThresholds {
    /// At or above this the load counts as running.
    pub power_on_w: f64,
    /// At or below this the load counts as stopped.
    pub power_off_w: f64,
    /// Sessions smaller than this are discarded from the log.
    pub min_energy_to_log_wh: f64,
}

/// Relay/meter endpoint on a device: device name plus channel index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceChannel {
    pub device: String,
    pub index: u8,
}

/// A fully resolved output definition. Built from raw config at startup;
/// all name references have been checked against the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub name: String,
    pub kind: OutputKind,
    pub relay: Option<DeviceChannel>,
    pub meter: Option<DeviceChannel>,
    pub input_pin: Option<InputPin>,
    pub mode: PlanMode,
    pub schedule: Option<String>,
    pub constraint_schedule: Option<String>,
    pub price_channel: String,
    pub budget: DailyBudget,
    pub ceilings: PriceCeilings,
    pub chatter: AntiChatter,
    pub dates_off: Vec<DateOff>,
    pub stop_on_exit: bool,
    pub parent: Option<String>,
    pub turn_on_sequence: Option<String>,
    pub turn_off_sequence: Option<String>,
    /// Cap on app-override ON duration, minutes. 0 disables expiry.
    pub max_app_on_minutes: u32,
    pub temp_constraints: Vec<TempConstraint>,
    pub ups_link: Option<UpsLink>,
    pub meter_thresholds: Option<MeterThresholds>,
}

impl OutputConfig {
    pub fn in_dates_off(&self, date: NaiveDate) -> bool {
        self.dates_off.iter().any(|d| d.contains(date))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn month_override_takes_precedence() {
        let budget = DailyBudget {
            min_hours: 1.0,
            max_hours: 8.0,
            target_hours: 4.0,
            month_targets: HashMap::from([(12, 6.0)]),
            max_shortfall_hours: 2.0,
        };
        assert_eq!(budget.target_for_month(12), 6.0);
        assert_eq!(budget.target_for_month(6), 4.0);
    }

    #[test]
    fn all_eligible_sentinel() {
        let budget = DailyBudget {
            min_hours: 0.0,
            max_hours: 24.0,
            target_hours: DailyBudget::ALL_ELIGIBLE,
            month_targets: HashMap::new(),
            max_shortfall_hours: 0.0,
        };
        assert!(budget.wants_all_eligible(3));
    }

    #[test]
    fn temp_constraint_violation_sides() {
        let keep_warm = TempConstraint {
            probe: "tank".into(),
            comparison: TempComparison::Below,
            threshold_c: 60.0,
        };
        // Eligible only below 60C: a 65C reading violates.
        assert!(keep_warm.violated_by(Some(65.0)));
        assert!(!keep_warm.violated_by(Some(40.0)));
        assert!(!keep_warm.violated_by(None));

        let frost_guard = TempConstraint {
            probe: "intake".into(),
            comparison: TempComparison::Above,
            threshold_c: 4.0,
        };
        assert!(frost_guard.violated_by(Some(2.0)));
        assert!(!frost_guard.violated_by(Some(10.0)));
    }

    #[test]
    fn date_off_interval_is_inclusive() {
        let d = DateOff {
            from: NaiveDate::from_ymd_opt(2025, 12, 24).unwrap(),
            to: NaiveDate::from_ymd_opt(2025, 12, 26).unwrap(),
        };
        assert!(d.contains(NaiveDate::from_ymd_opt(2025, 12, 24).unwrap()));
        assert!(d.contains(NaiveDate::from_ymd_opt(2025, 12, 26).unwrap()));
        assert!(!d.contains(NaiveDate::from_ymd_opt(2025, 12, 27).unwrap()));
    }
}
