use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::types::SLOT_MINUTES;

/// Provenance of a price figure. The ordering matters: a stored cache slot
/// must never move down this ladder between successive refreshes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PriceQuality {
    /// Synthesised from the configured default price.
    Default,
    /// Synthesised from a schedule window's nominal price.
    FallbackSchedule,
    Forecast,
    /// Served from a cache whose source has gone stale.
    CachedStale,
    Current,
    Actual,
}

/// One half-hour spot price on a named channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub start: DateTime<Utc>,
    pub channel: String,
    /// Price in cents per kWh.
    pub per_kwh: f64,
    pub quality: PriceQuality,
}

impl PricePoint {
    pub fn end(&self) -> DateTime<Utc> {
        self.start + Duration::minutes(SLOT_MINUTES)
    }

    pub fn covers(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t < self.end()
    }
}

/// Hourly usage/cost row as reported by the price source, kept in a
/// time-bounded ring alongside the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRow {
    pub start: DateTime<Utc>,
    pub channel: String,
    pub energy_kwh: f64,
    pub cost: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn quality_ladder_orders_forecast_below_stale_below_current() {
        assert!(PriceQuality::Forecast < PriceQuality::CachedStale);
        assert!(PriceQuality::CachedStale < PriceQuality::Current);
        assert!(PriceQuality::Current < PriceQuality::Actual);
        assert!(PriceQuality::Default < PriceQuality::FallbackSchedule);
        assert!(PriceQuality::FallbackSchedule < PriceQuality::Forecast);
    }

    #[test]
    fn price_point_covers_its_half_hour() {
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        let p = PricePoint {
            start,
            channel: "general".into(),
            per_kwh: 21.5,
            quality: PriceQuality::Forecast,
        };
        assert!(p.covers(start));
        assert!(p.covers(start + Duration::minutes(29)));
        assert!(!p.covers(start + Duration::minutes(30)));
    }
}
