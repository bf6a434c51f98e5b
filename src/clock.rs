//! Wall time, local-timezone conversion and a compact dawn/dusk
//! calculation for the configured site location.

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::domain::Daylight;

/// Site clock: timezone plus coordinates for sunrise/sunset.
#[derive(Debug, Clone)]
pub struct Clock {
    tz: Tz,
    latitude: f64,
    longitude: f64,
}

impl Clock {
    pub fn new(timezone: &str, latitude: f64, longitude: f64) -> Result<Self> {
        let tz: Tz = timezone
            .parse()
            .ok()
            .with_context(|| format!("unknown timezone {timezone:?}"))?;
        Ok(Self {
            tz,
            latitude,
            longitude,
        })
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    /// Convert a UTC instant into site-local time.
    pub fn local(&self, t: DateTime<Utc>) -> DateTime<Tz> {
        t.with_timezone(&self.tz)
    }

    /// The site-local calendar date containing `t`.
    pub fn local_date(&self, t: DateTime<Utc>) -> NaiveDate {
        self.local(t).date_naive()
    }

    /// The UTC instant at which the given local date begins. On a DST gap
    /// that swallows midnight, the first valid local instant is used; on an
    /// ambiguous midnight the earlier one wins.
    pub fn local_midnight_utc(&self, date: NaiveDate) -> DateTime<Utc> {
        let naive = date.and_time(NaiveTime::MIN);
        match self.tz.from_local_datetime(&naive) {
            LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => dt.with_timezone(&Utc),
            LocalResult::None => {
                let mut probe = naive + Duration::minutes(30);
                loop {
                    if let Some(dt) = self.tz.from_local_datetime(&probe).earliest() {
                        return dt.with_timezone(&Utc);
                    }
                    probe += Duration::minutes(30);
                }
            }
        }
    }

    /// Dawn and dusk as local clock times for the given local date, using
    /// the NOAA low-accuracy solar position equations with the standard
    /// -0.833 degree horizon. Sites inside polar day/night fall back to
    /// 06:00/18:00.
    pub fn daylight(&self, date: NaiveDate) -> Daylight {
        match self.sunrise_sunset_utc_minutes(date) {
            Some((rise, set)) => Daylight {
                dawn: self.utc_minutes_to_local_time(date, rise),
                dusk: self.utc_minutes_to_local_time(date, set),
            },
            None => Daylight {
                dawn: NaiveTime::from_hms_opt(6, 0, 0).unwrap_or(NaiveTime::MIN),
                dusk: NaiveTime::from_hms_opt(18, 0, 0).unwrap_or(NaiveTime::MIN),
            },
        }
    }

    /// Sunrise and sunset in minutes after 00:00 UTC, or None inside polar
    /// day or night.
    fn sunrise_sunset_utc_minutes(&self, date: NaiveDate) -> Option<(f64, f64)> {
        let doy = date.ordinal() as f64;
        let gamma = 2.0 * std::f64::consts::PI / 365.0 * (doy - 1.0);

        let decl = 0.006918 - 0.399912 * gamma.cos() + 0.070257 * gamma.sin()
            - 0.006758 * (2.0 * gamma).cos()
            + 0.000907 * (2.0 * gamma).sin()
            - 0.002697 * (3.0 * gamma).cos()
            + 0.00148 * (3.0 * gamma).sin();

        let eqtime = 229.18
            * (0.000075 + 0.001868 * gamma.cos()
                - 0.032077 * gamma.sin()
                - 0.014615 * (2.0 * gamma).cos()
                - 0.040849 * (2.0 * gamma).sin());

        let lat = self.latitude.to_radians();
        let zenith = 90.833_f64.to_radians();
        let cos_ha = zenith.cos() / (lat.cos() * decl.cos()) - lat.tan() * decl.tan();
        if !(-1.0..=1.0).contains(&cos_ha) {
            return None;
        }
        let ha_deg = cos_ha.acos().to_degrees();

        let sunrise = 720.0 - 4.0 * (self.longitude + ha_deg) - eqtime;
        let sunset = 720.0 - 4.0 * (self.longitude - ha_deg) - eqtime;
        Some((sunrise, sunset))
    }

    fn utc_minutes_to_local_time(&self, date: NaiveDate, minutes: f64) -> NaiveTime {
        let midnight_utc = Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN));
        let instant = midnight_utc + Duration::seconds((minutes * 60.0) as i64);
        self.local(instant).time()
    }
}
