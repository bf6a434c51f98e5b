use chrono::{NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Dawn and dusk for one local date, resolved by the clock module.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Daylight {
    pub dawn: NaiveTime,
    pub dusk: NaiveTime,
}

/// A window boundary: a fixed clock time, or dawn/dusk with a minute offset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TimeOfDay {
    Clock(NaiveTime),
    Dawn { offset_minutes: i32 },
    Dusk { offset_minutes: i32 },
}

#[derive(Debug, Error, PartialEq)]
pub enum TimeOfDayParseError {
    #[error("unrecognised time of day: {0:?}")]
    Unrecognised(String),
    #[error("bad offset in time of day: {0:?}")]
    BadOffset(String),
}

impl TimeOfDay {
    /// Parse `"HH:MM"`, `"dawn"`, `"dusk"`, or `"dawn+30"` / `"dusk-15"`
    /// (offsets in minutes).
    pub fn parse(s: &str) -> Result<Self, TimeOfDayParseError> {
        let s = s.trim();
        let lower = s.to_ascii_lowercase();
        for (word, dawn) in [("dawn", true), ("dusk", false)] {
            if let Some(rest) = lower.strip_prefix(word) {
                let offset_minutes = if rest.is_empty() {
                    0
                } else {
                    rest.parse::<i32>()
                        .map_err(|_| TimeOfDayParseError::BadOffset(s.to_string()))?
                };
                return Ok(if dawn {
                    TimeOfDay::Dawn { offset_minutes }
                } else {
                    TimeOfDay::Dusk { offset_minutes }
                });
            }
        }
        NaiveTime::parse_from_str(s, "%H:%M")
            .map(TimeOfDay::Clock)
            .map_err(|_| TimeOfDayParseError::Unrecognised(s.to_string()))
    }

    /// Resolve to a concrete clock time for a given date's daylight.
    pub fn resolve(&self, daylight: Daylight) -> NaiveTime {
        match *self {
            TimeOfDay::Clock(t) => t,
            TimeOfDay::Dawn { offset_minutes } => {
                daylight.dawn + chrono::Duration::minutes(offset_minutes as i64)
            }
            TimeOfDay::Dusk { offset_minutes } => {
                daylight.dusk + chrono::Duration::minutes(offset_minutes as i64)
            }
        }
    }
}

/// Days-of-week membership as a 7-bit mask, Monday = bit 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayMask(pub u8);

impl DayMask {
    pub const ALL: DayMask = DayMask(0x7f);

    pub fn contains(&self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_monday()) != 0
    }

    pub fn with(mut self, day: Weekday) -> Self {
        self.0 |= 1 << day.num_days_from_monday();
        self
    }

    /// Parse a day-list such as `["All"]` or `["Mon", "Sat", "Sun"]`.
    pub fn parse(days: &[String]) -> Option<DayMask> {
        let mut mask = DayMask(0);
        for d in days {
            match d.to_ascii_lowercase().as_str() {
                "all" => return Some(DayMask::ALL),
                "mon" | "monday" => mask = mask.with(Weekday::Mon),
                "tue" | "tuesday" => mask = mask.with(Weekday::Tue),
                "wed" | "wednesday" => mask = mask.with(Weekday::Wed),
                "thu" | "thursday" => mask = mask.with(Weekday::Thu),
                "fri" | "friday" => mask = mask.with(Weekday::Fri),
                "sat" | "saturday" => mask = mask.with(Weekday::Sat),
                "sun" | "sunday" => mask = mask.with(Weekday::Sun),
                _ => return None,
            }
        }
        Some(mask)
    }
}

/// One time-of-week window with an optional nominal price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleWindow {
    pub days: DayMask,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
    pub price: Option<f64>,
}

impl ScheduleWindow {
    /// Window membership for a local weekday/time. A window whose resolved
    /// end is not after its start wraps past midnight.
    pub fn admits(&self, day: Weekday, time: NaiveTime, daylight: Daylight) -> bool {
        let start = self.start.resolve(daylight);
        let end = self.end.resolve(daylight);
        if end > start {
            self.days.contains(day) && time >= start && time < end
        } else {
            // Wrapped: [start, midnight) belongs to `day`, [midnight, end)
            // belongs to the following day.
            (self.days.contains(day) && time >= start)
                || (self.days.contains(day.pred()) && time < end)
        }
    }
}

/// A named time-of-week schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatingSchedule {
    pub name: String,
    pub windows: Vec<ScheduleWindow>,
}

impl OperatingSchedule {
    /// Whether the given local instant lies inside the schedule, and the
    /// nominal price for it. Overlapping windows resolve to the lowest price.
    pub fn in_window(
        &self,
        day: Weekday,
        time: NaiveTime,
        daylight: Daylight,
    ) -> (bool, Option<f64>) {
        let mut hit = false;
        let mut best: Option<f64> = None;
        for w in &self.windows {
            if w.admits(day, time, daylight) {
                hit = true;
                if let Some(p) = w.price {
                    best = Some(match best {
                        Some(b) => b.min(p),
                        None => p,
                    });
                }
            }
        }
        (hit, best)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn daylight() -> Daylight {
        Daylight {
            dawn: NaiveTime::from_hms_opt(6, 30, 0).unwrap(),
            dusk: NaiveTime::from_hms_opt(19, 45, 0).unwrap(),
        }
    }

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn parses_clock_and_symbolic_times() {
        assert_eq!(TimeOfDay::parse("08:15"), Ok(TimeOfDay::Clock(t(8, 15))));
        assert_eq!(TimeOfDay::parse("dawn"), Ok(TimeOfDay::Dawn { offset_minutes: 0 }));
        assert_eq!(
            TimeOfDay::parse("dusk-15"),
            Ok(TimeOfDay::Dusk { offset_minutes: -15 })
        );
        assert_eq!(
            TimeOfDay::parse("Dawn+30"),
            Ok(TimeOfDay::Dawn { offset_minutes: 30 })
        );
        assert!(TimeOfDay::parse("noonish").is_err());
    }

    #[test]
    fn dawn_offset_resolves_against_daylight() {
        let tod = TimeOfDay::Dawn { offset_minutes: 30 };
        assert_eq!(tod.resolve(daylight()), t(7, 0));
    }

    #[test]
    fn plain_window_membership() {
        let w = ScheduleWindow {
            days: DayMask::parse(&["Mon".into(), "Tue".into()]).unwrap(),
            start: TimeOfDay::Clock(t(9, 0)),
            end: TimeOfDay::Clock(t(17, 0)),
            price: None,
        };
        assert!(w.admits(Weekday::Mon, t(9, 0), daylight()));
        assert!(w.admits(Weekday::Tue, t(16, 59), daylight()));
        assert!(!w.admits(Weekday::Mon, t(17, 0), daylight()));
        assert!(!w.admits(Weekday::Wed, t(12, 0), daylight()));
    }

    #[test]
    fn wrapped_window_admits_either_side_of_midnight() {
        let w = ScheduleWindow {
            days: DayMask::parse(&["Fri".into()]).unwrap(),
            start: TimeOfDay::Clock(t(22, 0)),
            end: TimeOfDay::Clock(t(6, 0)),
            price: None,
        };
        // Friday late evening.
        assert!(w.admits(Weekday::Fri, t(23, 30), daylight()));
        // Saturday small hours belong to the Friday window.
        assert!(w.admits(Weekday::Sat, t(2, 0), daylight()));
        assert!(!w.admits(Weekday::Sat, t(6, 0), daylight()));
        // Friday small hours do not (Thursday is not in the mask).
        assert!(!w.admits(Weekday::Fri, t(2, 0), daylight()));
    }

    #[test]
    fn overlapping_windows_return_lowest_price() {
        let sched = OperatingSchedule {
            name: "overnight".into(),
            windows: vec![
                ScheduleWindow {
                    days: DayMask::ALL,
                    start: TimeOfDay::Clock(t(0, 0)),
                    end: TimeOfDay::Clock(t(12, 0)),
                    price: Some(30.0),
                },
                ScheduleWindow {
                    days: DayMask::ALL,
                    start: TimeOfDay::Clock(t(8, 0)),
                    end: TimeOfDay::Clock(t(10, 0)),
                    price: Some(18.0),
                },
            ],
        };
        let (hit, price) = sched.in_window(Weekday::Mon, t(9, 0), daylight());
        assert!(hit);
        assert_eq!(price, Some(18.0));

        let (hit, price) = sched.in_window(Weekday::Mon, t(11, 0), daylight());
        assert!(hit);
        assert_eq!(price, Some(30.0));

        let (hit, _) = sched.in_window(Weekday::Mon, t(13, 0), daylight());
        assert!(!hit);
    }
}
