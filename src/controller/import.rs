//! Imported-session ingest. Imported outputs own no hardware: an external
//! integration drops completed energy sessions into a JSON file, and the
//! control loop pulls new ones on a cadence, pricing each session at the
//! channel price in force when it started.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One externally recorded energy session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportedSession {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub energy_wh: f64,
}

impl ImportedSession {
    pub fn duration_seconds(&self) -> i64 {
        (self.end - self.start).num_seconds().max(0)
    }

    /// Cost in dollars at a c/kWh price.
    pub fn cost_at(&self, per_kwh_cents: f64) -> f64 {
        self.energy_wh / 1000.0 * per_kwh_cents / 100.0
    }
}

/// Read the session file. A missing file is an empty set, not an error;
/// sessions come back ordered by start.
pub fn read_sessions(path: &Path) -> Result<Vec<ImportedSession>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read sessions {}", path.display()))
        }
    };
    let mut sessions: Vec<ImportedSession> = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse sessions {}", path.display()))?;
    sessions.retain(|s| s.end > s.start);
    sessions.sort_by_key(|s| s.start);
    Ok(sessions)
}

/// Sessions strictly after the ingest cursor.
pub fn sessions_after(
    sessions: &[ImportedSession],
    cursor: Option<DateTime<Utc>>,
) -> Vec<ImportedSession> {
    sessions
        .iter()
        .filter(|s| cursor.map_or(true, |c| s.start > c))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn t(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, h, 0, 0).unwrap()
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempdir().unwrap();
        assert!(read_sessions(&dir.path().join("none.json")).unwrap().is_empty());
    }

    #[test]
    fn sessions_are_sorted_and_sanitised() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        let doc = serde_json::json!([
            {"start": t(10), "end": t(12), "energy_wh": 7000.0},
            {"start": t(6), "end": t(7), "energy_wh": 3500.0},
            {"start": t(9), "end": t(9), "energy_wh": 100.0}
        ]);
        std::fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();

        let sessions = read_sessions(&path).unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].start, t(6));
        assert_eq!(sessions[1].start, t(10));
    }

    #[test]
    fn cursor_filters_already_ingested() {
        let sessions = vec![
            ImportedSession {
                start: t(6),
                end: t(7),
                energy_wh: 1000.0,
            },
            ImportedSession {
                start: t(10),
                end: t(12),
                energy_wh: 7000.0,
            },
        ];
        let fresh = sessions_after(&sessions, Some(t(6)));
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].start, t(10));
        assert_eq!(sessions_after(&sessions, None).len(), 2);
    }

    #[test]
    fn cost_attribution_uses_session_start_price() {
        let session = ImportedSession {
            start: t(10),
            end: t(12),
            energy_wh: 7000.0,
        };
        // 7 kWh at 30 c/kWh is $2.10.
        assert!((session.cost_at(30.0) - 2.1).abs() < 1e-9);
    }
}
