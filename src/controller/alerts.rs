//! Rate-limited alerting. A condition must persist for the configured
//! delay before the first alert fires, and the same condition is never
//! re-alerted within the window. Alerts land in the log and the status
//! snapshot; external notifier transports sit behind this contract.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tracing::error;

#[derive(Debug, Clone)]
struct Condition {
    since: DateTime<Utc>,
    message: String,
    last_alerted: Option<DateTime<Utc>>,
}

/// An alert that has crossed the persistence threshold.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ActiveAlert {
    pub key: String,
    pub message: String,
    pub since: DateTime<Utc>,
}

#[derive(Debug)]
pub struct AlertTracker {
    delay: Duration,
    conditions: HashMap<String, Condition>,
}

impl AlertTracker {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            conditions: HashMap::new(),
        }
    }

    /// Note that a condition is currently present. Returns true exactly
    /// when an alert should be emitted now.
    pub fn observe(&mut self, key: &str, message: &str, now: DateTime<Utc>) -> bool {
        let entry = self
            .conditions
            .entry(key.to_string())
            .or_insert_with(|| Condition {
                since: now,
                message: message.to_string(),
                last_alerted: None,
            });
        entry.message = message.to_string();

        if now - entry.since < self.delay {
            return false;
        }
        let due = match entry.last_alerted {
            None => true,
            Some(last) => now - last >= self.delay,
        };
        if due {
            entry.last_alerted = Some(now);
            error!(condition = %key, message = %message, "alert");
        }
        due
    }

    /// The condition went away.
    pub fn clear(&mut self, key: &str) {
        self.conditions.remove(key);
    }

    /// Conditions that have persisted past the threshold, for the status
    /// snapshot.
    pub fn active(&self, now: DateTime<Utc>) -> Vec<ActiveAlert> {
        let mut alerts: Vec<ActiveAlert> = self
            .conditions
            .iter()
            .filter(|(_, c)| now - c.since >= self.delay)
            .map(|(k, c)| ActiveAlert {
                key: k.clone(),
                message: c.message.clone(),
                since: c.since,
            })
            .collect();
        alerts.sort_by(|a, b| a.key.cmp(&b.key));
        alerts
    }
}
