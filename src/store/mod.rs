//! Persistent state: a single JSON document written atomically so a crash
//! mid-write can never leave a torn file. Unknown fields survive a
//! load/save cycle, allowing older builds to run against newer state.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::domain::{AppOverride, RelayState};

pub const SCHEMA_VERSION: u32 = 2;

/// One day of accounting for an output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyRecord {
    pub date: NaiveDate,
    pub on_seconds: i64,
    pub energy_wh: f64,
    pub cost: f64,
}

/// Persisted per-output state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputState {
    #[serde(default = "unknown_relay")]
    pub relay: RelayState,
    #[serde(default)]
    pub last_change: Option<DateTime<Utc>>,
    #[serde(default)]
    pub on_seconds_today: i64,
    #[serde(default)]
    pub energy_wh_today: f64,
    #[serde(default)]
    pub cost_today: f64,
    #[serde(default)]
    pub shortfall_hours: f64,
    #[serde(default)]
    pub app_override: Option<AppOverride>,
    #[serde(default)]
    pub history: Vec<DailyRecord>,
    #[serde(default)]
    pub last_meter_w: Option<f64>,
    #[serde(default)]
    pub last_meter_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_contact: Option<DateTime<Utc>>,
    /// Last ingested session start for imported outputs.
    #[serde(default)]
    pub import_cursor: Option<DateTime<Utc>>,
    /// Fields written by newer builds, carried through untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn unknown_relay() -> RelayState {
    RelayState::Unknown
}

impl Default for OutputState {
    fn default() -> Self {
        Self {
            relay: RelayState::Unknown,
            last_change: None,
            on_seconds_today: 0,
            energy_wh_today: 0.0,
            cost_today: 0.0,
            shortfall_hours: 0.0,
            app_override: None,
            history: Vec::new(),
            last_meter_w: None,
            last_meter_at: None,
            last_contact: None,
            import_cursor: None,
            extra: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMeta {
    pub schema_version: u32,
    pub written_at: DateTime<Utc>,
}

/// The whole state document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub outputs: HashMap<String, OutputState>,
    pub meta: StateMeta,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PersistedState {
    pub fn empty() -> Self {
        Self {
            outputs: HashMap::new(),
            meta: StateMeta {
                schema_version: SCHEMA_VERSION,
                written_at: Utc::now(),
            },
            extra: serde_json::Map::new(),
        }
    }

    pub fn output_mut(&mut self, name: &str) -> &mut OutputState {
        self.outputs.entry(name.to_string()).or_default()
    }
}

/// Owner of the state file. All writes go through [`StateStore::save`],
/// which serialises to a temp file, fsyncs and renames over the target.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    days_of_history: u32,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>, days_of_history: u32) -> Self {
        Self {
            path: path.into(),
            days_of_history,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load state at startup. A missing file yields empty state; a corrupt
    /// one is backed up with a timestamp suffix and replaced by empty
    /// state with a startup warning.
    pub fn load(&self) -> Result<PersistedState> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no state file yet, starting fresh");
                return Ok(PersistedState::empty());
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to read state file {}", self.path.display())
                })
            }
        };

        match serde_json::from_str::<PersistedState>(&text) {
            Ok(state) => Ok(state),
            Err(e) => {
                let backup = self.backup_path();
                error!(
                    error = %e,
                    backup = %backup.display(),
                    "state file is corrupt; backing it up and starting fresh"
                );
                if let Err(copy_err) = fs::copy(&self.path, &backup) {
                    warn!(error = %copy_err, "could not back up corrupt state file");
                }
                Ok(PersistedState::empty())
            }
        }
    }

    /// Persist the document. History rings are truncated to the configured
    /// depth and `meta.written_at` is refreshed before serialising.
    pub fn save(&self, state: &mut PersistedState) -> Result<()> {
        for output in state.outputs.values_mut() {
            let keep = self.days_of_history as usize;
            if output.history.len() > keep {
                let drop = output.history.len() - keep;
                output.history.drain(..drop);
            }
        }
        state.meta.schema_version = SCHEMA_VERSION;
        state.meta.written_at = Utc::now();

        let json = serde_json::to_vec_pretty(state).context("failed to serialise state")?;
        self.write_atomic(&json)
            .with_context(|| format!("failed to write state file {}", self.path.display()))
    }

    fn write_atomic(&self, bytes: &[u8]) -> Result<()> {
        write_atomic(&self.path, bytes)
    }

    fn backup_path(&self) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S");
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "state.json".to_string());
        self.path.with_file_name(format!("{name}.corrupt-{stamp}"))
    }
}

/// Write bytes to `path` via a temp file in the same directory, fsync and
/// rename, so readers never observe a partial document.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        use std::io::Write;
        let mut f = File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store_in(dir: &tempfile::TempDir) -> StateStore {
        StateStore::new(dir.path().join("state.json"), 3)
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        let state = store.load().unwrap();
        assert!(state.outputs.is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        let mut state = PersistedState::empty();
        {
            let out = state.output_mut("pool-pump");
            out.relay = RelayState::On;
            out.on_seconds_today = 5400;
            out.shortfall_hours = 1.5;
        }
        store.save(&mut state).unwrap();

        let loaded = store.load().unwrap();
        let out = &loaded.outputs["pool-pump"];
        assert_eq!(out.relay, RelayState::On);
        assert_eq!(out.on_seconds_today, 5400);
        assert_eq!(out.shortfall_hours, 1.5);
    }

    #[test]
    fn corrupt_file_is_backed_up_and_replaced() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        fs::write(store.path(), b"{ not json").unwrap();

        let state = store.load().unwrap();
        assert!(state.outputs.is_empty());

        let backups: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("corrupt"))
            .collect();
        assert_eq!(backups.len(), 1);
    }

    #[test]
    fn history_ring_is_truncated_on_save() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        let mut state = PersistedState::empty();
        let out = state.output_mut("pool-pump");
        for day in 1..=10 {
            out.history.push(DailyRecord {
                date: NaiveDate::from_ymd_opt(2025, 6, day).unwrap(),
                on_seconds: 3600,
                energy_wh: 1000.0,
                cost: 25.0,
            });
        }
        store.save(&mut state).unwrap();

        let loaded = store.load().unwrap();
        let history = &loaded.outputs["pool-pump"].history;
        assert_eq!(history.len(), 3);
        // Oldest rows dropped, newest kept.
        assert_eq!(history[0].date, NaiveDate::from_ymd_opt(2025, 6, 8).unwrap());
    }

    #[test]
    fn unknown_fields_survive_rewrite() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        let doc = serde_json::json!({
            "outputs": {
                "pool-pump": {
                    "relay": "off",
                    "future_field": {"nested": true}
                }
            },
            "meta": {"schema_version": 99, "written_at": "2025-06-01T00:00:00Z"},
            "top_level_extra": [1, 2, 3]
        });
        fs::write(store.path(), serde_json::to_vec(&doc).unwrap()).unwrap();

        let mut state = store.load().unwrap();
        assert!(state.outputs["pool-pump"].extra.contains_key("future_field"));
        store.save(&mut state).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["outputs"]["pool-pump"]["future_field"]["nested"], true);
        assert_eq!(raw["top_level_extra"][0], 1);
    }
}
