//! Merged half-hourly price cache. One instance is shared between the
//! refresher (sole writer) and the control loop (reader); readers get
//! cloned snapshots, never references into the map.

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::clock::Clock;
use crate::domain::{slot_floor, OperatingSchedule, PricePoint, PriceQuality, UsageRow, SLOT_MINUTES};
use crate::store::write_atomic;

/// On-disk form of the cache.
#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheDoc {
    points: Vec<PricePoint>,
    #[serde(default)]
    usage: Vec<UsageRow>,
    #[serde(default)]
    last_success: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Inner {
    /// channel -> slot start -> point.
    channels: HashMap<String, BTreeMap<DateTime<Utc>, PricePoint>>,
    usage: Vec<UsageRow>,
    last_success: Option<DateTime<Utc>>,
    consecutive_errors: u32,
}

/// Shared price cache with quality-monotone merging and serve-time
/// staleness downgrade.
pub struct PriceCache {
    path: PathBuf,
    stale_after: Duration,
    max_concurrent_errors: u32,
    usage_retention: Duration,
    inner: RwLock<Inner>,
}

impl PriceCache {
    /// Open the cache, loading any surviving file from a previous run.
    pub fn open(
        path: impl Into<PathBuf>,
        stale_after: Duration,
        max_concurrent_errors: u32,
        usage_retention: Duration,
    ) -> Self {
        let path = path.into();
        let mut inner = Inner::default();
        match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<CacheDoc>(&text) {
                Ok(doc) => {
                    for p in doc.points {
                        inner
                            .channels
                            .entry(p.channel.clone())
                            .or_default()
                            .insert(p.start, p);
                    }
                    inner.usage = doc.usage;
                    inner.last_success = doc.last_success;
                    info!(path = %path.display(), "loaded price cache");
                }
                Err(e) => warn!(error = %e, "price cache file unreadable, starting empty"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, "could not read price cache file"),
        }
        Self {
            path,
            stale_after,
            max_concurrent_errors,
            usage_retention,
            inner: RwLock::new(inner),
        }
    }

    /// Merge freshly fetched points. Last writer wins per slot start,
    /// except that a stored slot's quality never decreases: an actual is
    /// never replaced by a forecast. Resets the failure counter and
    /// persists the cache.
    pub fn merge(&self, points: Vec<PricePoint>, now: DateTime<Utc>) -> Result<()> {
        {
            let mut inner = self.inner.write();
            for p in points {
                let slot = slot_floor(p.start);
                let channel = inner.channels.entry(p.channel.clone()).or_default();
                let keep_existing = channel
                    .get(&slot)
                    .map_or(false, |existing| existing.quality > p.quality);
                if !keep_existing {
                    channel.insert(slot, PricePoint { start: slot, ..p });
                }
            }
            inner.last_success = Some(now);
            inner.consecutive_errors = 0;
        }
        self.persist()
    }

    /// Append usage rows to the time-bounded ring and persist.
    pub fn append_usage(&self, rows: Vec<UsageRow>, now: DateTime<Utc>) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        {
            let mut inner = self.inner.write();
            let cutoff = now - self.usage_retention;
            for row in rows {
                if !inner.usage.iter().any(|u| u.start == row.start && u.channel == row.channel) {
                    inner.usage.push(row);
                }
            }
            inner.usage.retain(|u| u.start >= cutoff);
            inner.usage.sort_by_key(|u| u.start);
        }
        self.persist()
    }

    /// Record a refresh failure; returns the consecutive failure count.
    pub fn record_failure(&self) -> u32 {
        let mut inner = self.inner.write();
        inner.consecutive_errors = inner.consecutive_errors.saturating_add(1);
        inner.consecutive_errors
    }

    /// The source is DOWN after too many consecutive refresh failures.
    pub fn is_down(&self) -> bool {
        self.inner.read().consecutive_errors >= self.max_concurrent_errors
    }

    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        self.inner.read().last_success
    }

    /// The price covering `t` on a channel, if cached. Quality is
    /// downgraded to cached-stale when the source has not succeeded within
    /// the staleness TTL; the stored point is untouched.
    pub fn price_at(&self, channel: &str, t: DateTime<Utc>, now: DateTime<Utc>) -> Option<PricePoint> {
        let inner = self.inner.read();
        let stale = self.is_stale(&inner, now);
        inner
            .channels
            .get(channel)
            .and_then(|c| c.get(&slot_floor(t)))
            .map(|p| Self::serve(p.clone(), stale))
    }

    /// Ordered points with slot start in `[from, to)`.
    pub fn forecast(
        &self,
        channel: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Vec<PricePoint> {
        let inner = self.inner.read();
        let stale = self.is_stale(&inner, now);
        inner
            .channels
            .get(channel)
            .map(|c| {
                c.range(from..to)
                    .map(|(_, p)| Self::serve(p.clone(), stale))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn usage_rows(&self) -> Vec<UsageRow> {
        self.inner.read().usage.clone()
    }

    fn is_stale(&self, inner: &Inner, now: DateTime<Utc>) -> bool {
        match inner.last_success {
            Some(t) => now - t > self.stale_after,
            None => true,
        }
    }

    fn serve(mut p: PricePoint, stale: bool) -> PricePoint {
        if stale && matches!(p.quality, PriceQuality::Forecast | PriceQuality::Current) {
            p.quality = PriceQuality::CachedStale;
        }
        p
    }

    fn persist(&self) -> Result<()> {
        let doc = {
            let inner = self.inner.read();
            CacheDoc {
                points: inner
                    .channels
                    .values()
                    .flat_map(|c| c.values().cloned())
                    .collect(),
                usage: inner.usage.clone(),
                last_success: inner.last_success,
            }
        };
        let bytes = serde_json::to_vec(&doc).context("failed to serialise price cache")?;
        write_atomic(&self.path, &bytes)
            .with_context(|| format!("failed to write price cache {}", self.path.display()))
    }
}

/// Synthesise fallback points for `[from, to)` when the price source is
/// DOWN or an output plans by schedule: the window's nominal price where
/// the slot lies inside the schedule, the configured default otherwise.
pub fn fallback_points(
    channel: &str,
    schedule: Option<&OperatingSchedule>,
    clock: &Clock,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    default_price: f64,
) -> Vec<PricePoint> {
    let mut points = Vec::new();
    let mut slot = slot_floor(from);
    while slot < to {
        let local = clock.local(slot);
        let daylight = clock.daylight(local.date_naive());
        let window_price = schedule.and_then(|s| {
            let (hit, price) = s.in_window(local.weekday(), local.time(), daylight);
            if hit {
                Some(price.unwrap_or(default_price))
            } else {
                None
            }
        });
        let (per_kwh, quality) = match window_price {
            Some(p) => (p, PriceQuality::FallbackSchedule),
            None => (default_price, PriceQuality::Default),
        };
        points.push(PricePoint {
            start: slot,
            channel: channel.to_string(),
            per_kwh,
            quality,
        });
        slot += Duration::minutes(SLOT_MINUTES);
    }
    points
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn point(start: DateTime<Utc>, per_kwh: f64, quality: PriceQuality) -> PricePoint {
        PricePoint {
            start,
            channel: "general".into(),
            per_kwh,
            quality,
        }
    }

    fn cache_in(dir: &tempfile::TempDir) -> PriceCache {
        PriceCache::open(
            dir.path().join("prices.json"),
            Duration::minutes(90),
            3,
            Duration::days(14),
        )
    }

    fn t(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, h, m, 0).unwrap()
    }

    #[test]
    fn merge_never_downgrades_quality() {
        let dir = tempdir().unwrap();
        let cache = cache_in(&dir);
        let now = t(12, 0);

        cache
            .merge(vec![point(t(10, 0), 20.0, PriceQuality::Actual)], now)
            .unwrap();
        cache
            .merge(vec![point(t(10, 0), 35.0, PriceQuality::Forecast)], now)
            .unwrap();

        let got = cache.price_at("general", t(10, 0), now).unwrap();
        assert_eq!(got.quality, PriceQuality::Actual);
        assert_eq!(got.per_kwh, 20.0);
    }

    #[test]
    fn newer_forecast_replaces_older_forecast() {
        let dir = tempdir().unwrap();
        let cache = cache_in(&dir);
        let now = t(12, 0);

        cache
            .merge(vec![point(t(14, 0), 30.0, PriceQuality::Forecast)], now)
            .unwrap();
        cache
            .merge(vec![point(t(14, 0), 26.5, PriceQuality::Forecast)], now)
            .unwrap();

        let got = cache.price_at("general", t(14, 0), now).unwrap();
        assert_eq!(got.per_kwh, 26.5);
    }

    #[test]
    fn served_quality_downgrades_when_stale() {
        let dir = tempdir().unwrap();
        let cache = cache_in(&dir);
        let refreshed_at = t(8, 0);

        cache
            .merge(vec![point(t(10, 0), 20.0, PriceQuality::Current)], refreshed_at)
            .unwrap();

        // Within the TTL the quality is served untouched.
        let fresh = cache.price_at("general", t(10, 0), t(9, 0)).unwrap();
        assert_eq!(fresh.quality, PriceQuality::Current);

        // Three hours later the source has been silent too long.
        let stale = cache.price_at("general", t(10, 0), t(11, 0)).unwrap();
        assert_eq!(stale.quality, PriceQuality::CachedStale);
    }

    #[test]
    fn down_after_max_consecutive_failures() {
        let dir = tempdir().unwrap();
        let cache = cache_in(&dir);
        assert!(!cache.is_down());
        cache.record_failure();
        cache.record_failure();
        assert!(!cache.is_down());
        cache.record_failure();
        assert!(cache.is_down());

        cache.merge(Vec::new(), t(12, 0)).unwrap();
        assert!(!cache.is_down());
    }

    #[test]
    fn cache_survives_reopen() {
        let dir = tempdir().unwrap();
        let now = t(12, 0);
        {
            let cache = cache_in(&dir);
            cache
                .merge(vec![point(t(10, 0), 20.0, PriceQuality::Actual)], now)
                .unwrap();
        }
        let cache = cache_in(&dir);
        let got = cache.price_at("general", t(10, 0), now).unwrap();
        assert_eq!(got.per_kwh, 20.0);
        assert_eq!(cache.last_success(), Some(now));
    }

    #[test]
    fn forecast_returns_ordered_range() {
        let dir = tempdir().unwrap();
        let cache = cache_in(&dir);
        let now = t(9, 0);
        cache
            .merge(
                vec![
                    point(t(11, 0), 30.0, PriceQuality::Forecast),
                    point(t(10, 0), 20.0, PriceQuality::Forecast),
                    point(t(10, 30), 25.0, PriceQuality::Forecast),
                ],
                now,
            )
            .unwrap();

        let range = cache.forecast("general", t(10, 0), t(11, 0), now);
        assert_eq!(range.len(), 2);
        assert_eq!(range[0].start, t(10, 0));
        assert_eq!(range[1].start, t(10, 30));
    }

    #[test]
    fn fallback_uses_schedule_price_inside_window() {
        use crate::domain::{DayMask, ScheduleWindow, TimeOfDay};
        let clock = Clock::new("UTC", 0.0, 0.0).unwrap();
        let schedule = OperatingSchedule {
            name: "overnight".into(),
            windows: vec![ScheduleWindow {
                days: DayMask::ALL,
                start: TimeOfDay::parse("10:00").unwrap(),
                end: TimeOfDay::parse("11:00").unwrap(),
                price: Some(18.0),
            }],
        };
        let points = fallback_points("general", Some(&schedule), &clock, t(9, 0), t(12, 0), 30.0);
        assert_eq!(points.len(), 6);
        assert_eq!(points[0].per_kwh, 30.0);
        assert_eq!(points[0].quality, PriceQuality::Default);
        assert_eq!(points[2].per_kwh, 18.0);
        assert_eq!(points[2].quality, PriceQuality::FallbackSchedule);
        assert_eq!(points[3].per_kwh, 18.0);
        assert_eq!(points[4].per_kwh, 30.0);
    }
}
