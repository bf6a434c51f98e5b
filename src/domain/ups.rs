use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Battery state reported by the UPS script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BatteryState {
    Charging,
    Charged,
    Discharging,
}

/// One reading from a UPS monitoring script. At least one of charge and
/// runtime is present in well-formed output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpsReading {
    pub timestamp: DateTime<Utc>,
    pub battery_state: BatteryState,
    pub battery_charge_percent: Option<f64>,
    pub battery_runtime_seconds: Option<i64>,
}

/// Health verdict derived from a reading against configured thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum HealthVerdict {
    Healthy,
    Unhealthy,
    /// Script failed, output malformed, or reading too old.
    Unknown,
}

/// Thresholds below which a discharging UPS counts as unhealthy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UpsThresholds {
    pub min_charge_percent: f64,
    pub min_runtime_seconds: i64,
}

/// Current health of one named UPS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpsHealth {
    pub name: String,
    pub reading: Option<UpsReading>,
    pub verdict: HealthVerdict,
}

impl UpsHealth {
    pub fn unknown(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reading: None,
            verdict: HealthVerdict::Unknown,
        }
    }

    /// Evaluate a fresh reading. A charging or charged UPS is healthy; a
    /// discharging one is healthy only while both reported figures stay at
    /// or above their thresholds. Missing figures are not counted against
    /// the UPS as long as one of them is present.
    pub fn from_reading(
        name: impl Into<String>,
        reading: UpsReading,
        thresholds: UpsThresholds,
    ) -> Self {
        let verdict = if reading.battery_charge_percent.is_none()
            && reading.battery_runtime_seconds.is_none()
        {
            HealthVerdict::Unknown
        } else {
            match reading.battery_state {
                BatteryState::Charging | BatteryState::Charged => HealthVerdict::Healthy,
                BatteryState::Discharging => {
                    let charge_low = reading
                        .battery_charge_percent
                        .map(|c| c < thresholds.min_charge_percent)
                        .unwrap_or(false);
                    let runtime_low = reading
                        .battery_runtime_seconds
                        .map(|r| r < thresholds.min_runtime_seconds)
                        .unwrap_or(false);
                    if charge_low || runtime_low {
                        HealthVerdict::Unhealthy
                    } else {
                        HealthVerdict::Healthy
                    }
                }
            }
        };
        Self {
            name: name.into(),
            reading: Some(reading),
            verdict,
        }
    }
}
