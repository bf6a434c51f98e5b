//! YAML configuration model, validation and cross-reference resolution.
//!
//! Configuration is loaded from a YAML file merged with `PC__`-prefixed
//! environment variables. Secret fields left empty in the file are filled
//! from their conventional environment variables (`AMBER_API_KEY`,
//! `WEBAPP_ACCESS_KEY`). After structural validation the raw model is
//! resolved into a [`Registry`]: every name reference checked, schedule
//! windows parsed, parent links verified acyclic.

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;
use validator::Validate;

use crate::domain::{
    AntiChatter, DailyBudget, DateOff, DayMask, DeviceChannel, InputPin, InputPinMode,
    MeterThresholds, OffTimer, OperatingSchedule, OutputConfig, OutputKind, PlanMode,
    PriceCeilings, ScheduleWindow, Sequence, SequenceStep, TempComparison, TempConstraint,
    TimeOfDay, UnhealthyAction, UpsLink, UpsThresholds,
};

/// Top-level raw configuration as it appears in the YAML file.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct Settings {
    #[validate(nested)]
    pub general: GeneralConfig,

    #[validate(nested)]
    pub files: FilesConfig,

    #[serde(default)]
    #[validate(nested)]
    pub location: LocationConfig,

    #[serde(default)]
    pub amber_api: Option<AmberConfig>,

    pub shelly_devices: Vec<ShellyDeviceConfig>,

    pub outputs: Vec<RawOutput>,

    pub operating_schedules: Vec<RawSchedule>,

    #[serde(default)]
    pub output_sequences: Vec<Sequence>,

    #[serde(default)]
    pub ups_integration: Option<UpsIntegrationConfig>,

    #[serde(default)]
    pub temp_probes: Vec<ProbeConfig>,

    #[serde(default)]
    #[validate(nested)]
    pub website: WebsiteConfig,
}

/// General daemon behaviour.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct GeneralConfig {
    #[serde(default = "default_polling_interval_secs")]
    #[validate(range(min = 1, max = 3600))]
    pub polling_interval_secs: u64,

    #[serde(default = "default_days_of_history")]
    #[validate(range(min = 1, max = 365))]
    pub days_of_history: u32,

    /// How long a fault condition must persist before an alert is raised,
    /// and the minimum spacing between repeat alerts for one condition.
    #[serde(default = "default_alert_delay_mins")]
    pub report_critical_errors_delay_mins: u64,

    /// Price assumed when neither forecast nor schedule supplies one.
    #[serde(default = "default_price")]
    pub default_price: f64,

    /// Forward planning horizon.
    #[serde(default = "default_horizon_hours")]
    #[validate(range(min = 24, max = 168))]
    pub horizon_hours: u32,

    /// Backward accounting horizon.
    #[serde(default = "default_lookback_hours")]
    #[validate(range(min = 12, max = 72))]
    pub lookback_hours: u32,
}

/// Paths owned by the daemon.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct FilesConfig {
    pub state_file: PathBuf,
    pub price_cache_file: PathBuf,
}

/// Site location for local-time accounting and dawn/dusk.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct LocationConfig {
    #[serde(default = "default_timezone")]
    pub timezone: String,

    #[serde(default = "default_latitude")]
    #[validate(range(min = -90.0, max = 90.0))]
    pub latitude: f64,

    #[serde(default = "default_longitude")]
    #[validate(range(min = -180.0, max = 180.0))]
    pub longitude: f64,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            latitude: default_latitude(),
            longitude: default_longitude(),
        }
    }
}

/// Spot price API access.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AmberConfig {
    #[validate(url)]
    pub base_url: String,

    /// Bearer token; falls back to the AMBER_API_KEY environment variable.
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_refresh_minutes")]
    #[validate(range(min = 1, max = 120))]
    pub refresh_minutes: u64,

    #[serde(default = "default_api_timeout_secs")]
    pub timeout_secs: u64,

    /// Consecutive refresh failures before the source is declared DOWN.
    #[serde(default = "default_max_concurrent_errors")]
    pub max_concurrent_errors: u32,

    /// Age after which served prices are downgraded to cached-stale.
    #[serde(default = "default_stale_after_minutes")]
    pub stale_after_minutes: u64,
}

/// One Shelly-class relay/meter device on the LAN.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ShellyDeviceConfig {
    #[validate(length(min = 1))]
    pub name: String,

    #[validate(length(min = 1))]
    pub host: String,

    #[serde(default = "default_response_timeout_secs")]
    pub response_timeout_secs: u64,

    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,

    #[serde(default = "default_max_concurrent_errors")]
    pub max_concurrent_errors: u32,

    /// Meter reads within this window are served from the last reading.
    #[serde(default = "default_meter_staleness_secs")]
    pub meter_staleness_secs: u64,
}

/// Raw output definition; kind-dependent fields validated during resolve.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawOutput {
    pub name: String,
    pub kind: OutputKind,

    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub relay: Option<u8>,
    #[serde(default)]
    pub meter_device: Option<String>,
    #[serde(default)]
    pub meter: Option<u8>,
    #[serde(default)]
    pub input_pin: Option<RawInputPin>,

    #[serde(default = "default_plan_mode")]
    pub mode: PlanMode,
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub constraint_schedule: Option<String>,
    #[serde(default = "default_price_channel")]
    pub price_channel: String,

    #[serde(default)]
    pub min_hours: f64,
    #[serde(default = "default_max_hours")]
    pub max_hours: f64,
    #[serde(default = "default_target_hours")]
    pub target_hours: f64,
    /// Month number ("1"-"12") to target-hours override. Keys arrive as
    /// strings from the config layer and are parsed during resolve.
    #[serde(default)]
    pub month_targets: HashMap<String, f64>,
    #[serde(default)]
    pub max_shortfall_hours: f64,

    #[serde(default = "default_price")]
    pub max_best_price: f64,
    #[serde(default)]
    pub max_priority_price: Option<f64>,

    #[serde(default)]
    pub min_on_minutes: u32,
    #[serde(default)]
    pub min_off_minutes: Option<u32>,
    #[serde(default)]
    pub max_off_minutes: Option<u32>,

    #[serde(default)]
    pub dates_off: Vec<RawDateOff>,
    #[serde(default)]
    pub stop_on_exit: bool,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub turn_on_sequence: Option<String>,
    #[serde(default)]
    pub turn_off_sequence: Option<String>,
    #[serde(default)]
    pub max_app_on_minutes: u32,

    #[serde(default)]
    pub temp_constraints: Vec<RawTempConstraint>,
    #[serde(default)]
    pub ups: Option<RawUpsLink>,

    #[serde(default)]
    pub power_on_w: Option<f64>,
    #[serde(default)]
    pub power_off_w: Option<f64>,
    #[serde(default)]
    pub min_energy_to_log_wh: Option<f64>,

    /// Imported-kind only: session file polled on a cadence.
    #[serde(default)]
    pub sessions_file: Option<PathBuf>,
    #[serde(default = "default_import_interval_minutes")]
    pub import_interval_minutes: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawInputPin {
    pub device: String,
    pub input: u8,
    pub mode: InputPinMode,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawDateOff {
    pub from: chrono::NaiveDate,
    pub to: chrono::NaiveDate,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawTempConstraint {
    pub probe: String,
    pub comparison: TempComparison,
    pub threshold_c: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawUpsLink {
    pub name: String,
    #[serde(default = "default_unhealthy_action")]
    pub action: UnhealthyAction,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawSchedule {
    pub name: String,
    pub windows: Vec<RawWindow>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawWindow {
    pub days: Vec<String>,
    pub start: String,
    pub end: String,
    #[serde(default)]
    pub price: Option<f64>,
}

/// UPS monitoring scripts.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpsIntegrationConfig {
    #[serde(default = "default_ups_script_timeout_secs")]
    pub script_timeout_secs: u64,

    pub ups: Vec<UpsUnitConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpsUnitConfig {
    pub name: String,
    pub script: PathBuf,
    #[serde(default = "default_ups_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_ups_min_charge")]
    pub min_charge_percent: f64,
    #[serde(default = "default_ups_min_runtime")]
    pub min_runtime_seconds: i64,
}

impl UpsUnitConfig {
    pub fn thresholds(&self) -> UpsThresholds {
        UpsThresholds {
            min_charge_percent: self.min_charge_percent,
            min_runtime_seconds: self.min_runtime_seconds,
        }
    }
}

/// A temperature probe polled through a device.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProbeConfig {
    pub name: String,
    pub device: String,
    pub probe_id: u32,
    #[serde(default = "default_probe_interval_secs")]
    pub interval_secs: u64,
}

/// HTTP command surface.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct WebsiteConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    #[validate(range(min = 1, max = 65535))]
    pub port: u16,

    /// Bearer key guarding mutating routes; falls back to WEBAPP_ACCESS_KEY.
    #[serde(default)]
    pub access_key: Option<String>,
}

impl Default for WebsiteConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            access_key: None,
        }
    }
}

impl WebsiteConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .context("failed to parse website listen address")
    }
}

// Default value functions
fn default_polling_interval_secs() -> u64 { 30 }
fn default_days_of_history() -> u32 { 30 }
fn default_alert_delay_mins() -> u64 { 15 }
fn default_price() -> f64 { 30.0 }
fn default_horizon_hours() -> u32 { 30 }
fn default_lookback_hours() -> u32 { 12 }
fn default_timezone() -> String { "Australia/Sydney".to_string() }
fn default_latitude() -> f64 { -33.87 }
fn default_longitude() -> f64 { 151.21 }
fn default_refresh_minutes() -> u64 { 5 }
fn default_api_timeout_secs() -> u64 { 10 }
fn default_max_concurrent_errors() -> u32 { 5 }
fn default_stale_after_minutes() -> u64 { 90 }
fn default_response_timeout_secs() -> u64 { 5 }
fn default_retry_count() -> u32 { 3 }
fn default_retry_delay_secs() -> u64 { 2 }
fn default_meter_staleness_secs() -> u64 { 10 }
fn default_plan_mode() -> PlanMode { PlanMode::BestPrice }
fn default_price_channel() -> String { "general".to_string() }
fn default_max_hours() -> f64 { 24.0 }
fn default_target_hours() -> f64 { DailyBudget::ALL_ELIGIBLE }
fn default_import_interval_minutes() -> u64 { 30 }
fn default_unhealthy_action() -> UnhealthyAction { UnhealthyAction::TurnOff }
fn default_ups_script_timeout_secs() -> u64 { 5 }
fn default_ups_interval_secs() -> u64 { 60 }
fn default_ups_min_charge() -> f64 { 10.0 }
fn default_ups_min_runtime() -> i64 { 300 }
fn default_probe_interval_secs() -> u64 { 60 }
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8086 }

/// Section names this daemon understands; anything else in the file is
/// warned about rather than rejected.
const KNOWN_SECTIONS: &[&str] = &[
    "general",
    "files",
    "location",
    "amber_api",
    "shelly_devices",
    "outputs",
    "operating_schedules",
    "output_sequences",
    "ups_integration",
    "temp_probes",
    "website",
];

/// Errors found while resolving name references and kind constraints.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("duplicate output name {0:?}")]
    DuplicateOutput(String),
    #[error("duplicate device name {0:?}")]
    DuplicateDevice(String),
    #[error("duplicate schedule name {0:?}")]
    DuplicateSchedule(String),
    #[error("output {output:?} references unknown device {device:?}")]
    UnknownDevice { output: String, device: String },
    #[error("output {output:?} references unknown schedule {schedule:?}")]
    UnknownSchedule { output: String, schedule: String },
    #[error("output {output:?} references unknown sequence {sequence:?}")]
    UnknownSequence { output: String, sequence: String },
    #[error("output {output:?} references unknown UPS {ups:?}")]
    UnknownUps { output: String, ups: String },
    #[error("output {output:?} references unknown probe {probe:?}")]
    UnknownProbe { output: String, probe: String },
    #[error("output {output:?} references unknown parent {parent:?}")]
    UnknownParent { output: String, parent: String },
    #[error("output {0:?} lists itself as parent")]
    SelfParent(String),
    #[error("parent links form a cycle involving {0:?}")]
    ParentCycle(String),
    #[error("output {0:?} sets both min_off_minutes and max_off_minutes")]
    OffTimerConflict(String),
    #[error("output {output:?}: {message}")]
    KindMismatch { output: String, message: String },
    #[error("output {output:?}: min_hours {min} exceeds max_hours {max}")]
    HoursInverted { output: String, min: f64, max: f64 },
    #[error("output {output:?}: bad month key {key:?} in month_targets")]
    BadMonth { output: String, key: String },
    #[error("output {output:?} in Schedule mode needs a schedule")]
    ScheduleModeWithoutSchedule { output: String },
    #[error("schedule {schedule:?} window {index}: {message}")]
    BadWindow {
        schedule: String,
        index: usize,
        message: String,
    },
    #[error("sequence {sequence:?} step {index} references unknown output {output:?}")]
    SequenceUnknownOutput {
        sequence: String,
        index: usize,
        output: String,
    },
}

/// Fully resolved configuration: the registry every component works from.
/// Name references are guaranteed to resolve and parent links form a DAG.
#[derive(Debug, Clone)]
pub struct Registry {
    pub general: GeneralConfig,
    pub files: FilesConfig,
    pub location: LocationConfig,
    pub amber: Option<AmberConfig>,
    pub website: WebsiteConfig,
    pub devices: HashMap<String, ShellyDeviceConfig>,
    pub outputs: Vec<OutputConfig>,
    pub schedules: HashMap<String, OperatingSchedule>,
    pub sequences: HashMap<String, Sequence>,
    pub ups_units: HashMap<String, UpsUnitConfig>,
    pub ups_script_timeout_secs: u64,
    pub probes: HashMap<String, ProbeConfig>,
    /// Output indices ordered parents-first.
    pub topo_order: Vec<usize>,
    /// Imported-kind outputs and their session sources.
    pub imports: Vec<ImportSource>,
}

/// Session source for one imported-kind output.
#[derive(Debug, Clone)]
pub struct ImportSource {
    pub output: String,
    pub sessions_file: PathBuf,
    pub interval_minutes: u64,
}

impl Registry {
    pub fn output(&self, name: &str) -> Option<&OutputConfig> {
        self.outputs.iter().find(|o| o.name == name)
    }
}

impl Settings {
    /// Load and validate configuration from a YAML file, overlaying
    /// `PC__`-prefixed environment variables (`PC__WEBSITE__PORT` maps to
    /// `website.port`).
    pub fn load(path: &Path) -> Result<Self> {
        warn_unknown_sections(path);

        let mut settings: Settings = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed("PC__").split("__"))
            .extract()
            .with_context(|| format!("failed to parse configuration {}", path.display()))?;

        if let Some(amber) = settings.amber_api.as_mut() {
            if amber.api_key.as_deref().map_or(true, str::is_empty) {
                amber.api_key = std::env::var("AMBER_API_KEY").ok();
            }
        }
        if settings.website.access_key.as_deref().map_or(true, str::is_empty) {
            settings.website.access_key = std::env::var("WEBAPP_ACCESS_KEY").ok();
        }

        settings
            .validate()
            .context("configuration validation failed")?;
        Ok(settings)
    }

    /// Resolve the raw model into a [`Registry`].
    pub fn resolve(self) -> Result<Registry, ConfigError> {
        let mut devices = HashMap::new();
        for d in &self.shelly_devices {
            if devices.insert(d.name.clone(), d.clone()).is_some() {
                return Err(ConfigError::DuplicateDevice(d.name.clone()));
            }
        }

        let mut schedules = HashMap::new();
        for raw in &self.operating_schedules {
            let schedule = resolve_schedule(raw)?;
            if schedules.insert(raw.name.clone(), schedule).is_some() {
                return Err(ConfigError::DuplicateSchedule(raw.name.clone()));
            }
        }

        let sequences: HashMap<String, Sequence> = self
            .output_sequences
            .iter()
            .map(|s| (s.name.clone(), s.clone()))
            .collect();

        let ups_units: HashMap<String, UpsUnitConfig> = self
            .ups_integration
            .iter()
            .flat_map(|u| u.ups.iter())
            .map(|u| (u.name.clone(), u.clone()))
            .collect();

        let probes: HashMap<String, ProbeConfig> = self
            .temp_probes
            .iter()
            .map(|p| (p.name.clone(), p.clone()))
            .collect();

        let mut seen = HashSet::new();
        let mut outputs = Vec::with_capacity(self.outputs.len());
        let mut imports = Vec::new();
        for raw in &self.outputs {
            if !seen.insert(raw.name.clone()) {
                return Err(ConfigError::DuplicateOutput(raw.name.clone()));
            }
            let resolved = resolve_output(raw, &devices, &schedules, &sequences, &ups_units, &probes)?;
            if raw.kind == OutputKind::Imported {
                if let Some(file) = &raw.sessions_file {
                    imports.push(ImportSource {
                        output: raw.name.clone(),
                        sessions_file: file.clone(),
                        interval_minutes: raw.import_interval_minutes,
                    });
                }
            }
            outputs.push(resolved);
        }

        // Parent references and cycle detection.
        for o in &outputs {
            if let Some(parent) = &o.parent {
                if parent == &o.name {
                    return Err(ConfigError::SelfParent(o.name.clone()));
                }
                if !outputs.iter().any(|p| &p.name == parent) {
                    return Err(ConfigError::UnknownParent {
                        output: o.name.clone(),
                        parent: parent.clone(),
                    });
                }
            }
        }
        let topo_order = topo_sort(&outputs)?;

        // Sequence steps may reference outputs; check once all are known.
        for seq in sequences.values() {
            for (i, step) in seq.steps.iter().enumerate() {
                if let SequenceStep::ChangeOutput { output, .. } = step {
                    if !outputs.iter().any(|o| &o.name == output) {
                        return Err(ConfigError::SequenceUnknownOutput {
                            sequence: seq.name.clone(),
                            index: i,
                            output: output.clone(),
                        });
                    }
                }
            }
        }

        let ups_script_timeout_secs = self
            .ups_integration
            .as_ref()
            .map(|u| u.script_timeout_secs)
            .unwrap_or_else(default_ups_script_timeout_secs);

        Ok(Registry {
            general: self.general,
            files: self.files,
            location: self.location,
            amber: self.amber_api,
            website: self.website,
            devices,
            outputs,
            schedules,
            sequences,
            ups_units,
            ups_script_timeout_secs,
            probes,
            topo_order,
            imports,
        })
    }
}

/// Warn about unrecognised top-level sections. Parse failures are left for
/// the figment pass to report with better context.
fn warn_unknown_sections(path: &Path) {
    let Ok(text) = std::fs::read_to_string(path) else {
        return;
    };
    let Ok(serde_yaml::Value::Mapping(map)) = serde_yaml::from_str::<serde_yaml::Value>(&text)
    else {
        return;
    };
    for key in map.keys() {
        if let serde_yaml::Value::String(name) = key {
            if !KNOWN_SECTIONS.contains(&name.as_str()) {
                warn!(section = %name, "ignoring unknown configuration section");
            }
        }
    }
}

fn resolve_schedule(raw: &RawSchedule) -> Result<OperatingSchedule, ConfigError> {
    let mut windows = Vec::with_capacity(raw.windows.len());
    for (i, w) in raw.windows.iter().enumerate() {
        let days = DayMask::parse(&w.days).ok_or_else(|| ConfigError::BadWindow {
            schedule: raw.name.clone(),
            index: i,
            message: format!("unrecognised day list {:?}", w.days),
        })?;
        let start = TimeOfDay::parse(&w.start).map_err(|e| ConfigError::BadWindow {
            schedule: raw.name.clone(),
            index: i,
            message: e.to_string(),
        })?;
        let end = TimeOfDay::parse(&w.end).map_err(|e| ConfigError::BadWindow {
            schedule: raw.name.clone(),
            index: i,
            message: e.to_string(),
        })?;
        windows.push(ScheduleWindow {
            days,
            start,
            end,
            price: w.price,
        });
    }
    Ok(OperatingSchedule {
        name: raw.name.clone(),
        windows,
    })
}

fn resolve_output(
    raw: &RawOutput,
    devices: &HashMap<String, ShellyDeviceConfig>,
    schedules: &HashMap<String, OperatingSchedule>,
    sequences: &HashMap<String, Sequence>,
    ups_units: &HashMap<String, UpsUnitConfig>,
    probes: &HashMap<String, ProbeConfig>,
) -> Result<OutputConfig, ConfigError> {
    let check_device = |device: &String| -> Result<(), ConfigError> {
        if devices.contains_key(device) {
            Ok(())
        } else {
            Err(ConfigError::UnknownDevice {
                output: raw.name.clone(),
                device: device.clone(),
            })
        }
    };

    if raw.min_hours > raw.max_hours {
        return Err(ConfigError::HoursInverted {
            output: raw.name.clone(),
            min: raw.min_hours,
            max: raw.max_hours,
        });
    }
    if raw.min_off_minutes.is_some() && raw.max_off_minutes.is_some() {
        return Err(ConfigError::OffTimerConflict(raw.name.clone()));
    }

    // Kind-dependent field constraints.
    let kind_err = |message: &str| ConfigError::KindMismatch {
        output: raw.name.clone(),
        message: message.to_string(),
    };
    match raw.kind {
        OutputKind::Switched => {
            if raw.device.is_none() || raw.relay.is_none() {
                return Err(kind_err("switched outputs need device and relay"));
            }
            if raw.sessions_file.is_some() {
                return Err(kind_err("sessions_file is only valid on imported outputs"));
            }
        }
        OutputKind::Meter => {
            if raw.relay.is_some() || raw.turn_on_sequence.is_some() || raw.turn_off_sequence.is_some() {
                return Err(kind_err("meter outputs cannot drive a relay or sequences"));
            }
            if raw.meter.is_none() {
                return Err(kind_err("meter outputs need a meter channel"));
            }
            if raw.power_on_w.is_none() || raw.power_off_w.is_none() {
                return Err(kind_err("meter outputs need power_on_w and power_off_w"));
            }
        }
        OutputKind::Imported => {
            if raw.device.is_some() || raw.relay.is_some() || raw.meter.is_some() {
                return Err(kind_err("imported outputs take no device references"));
            }
            if raw.sessions_file.is_none() {
                return Err(kind_err("imported outputs need a sessions_file"));
            }
        }
    }

    let relay = match (&raw.device, raw.relay) {
        (Some(device), Some(index)) => {
            check_device(device)?;
            Some(DeviceChannel {
                device: device.clone(),
                index,
            })
        }
        _ => None,
    };

    let meter = match raw.meter {
        Some(index) => {
            let device = raw
                .meter_device
                .as_ref()
                .or(raw.device.as_ref())
                .ok_or_else(|| kind_err("meter channel given without a device"))?;
            check_device(device)?;
            Some(DeviceChannel {
                device: device.clone(),
                index,
            })
        }
        None => None,
    };

    let input_pin = match &raw.input_pin {
        Some(pin) => {
            check_device(&pin.device)?;
            Some(InputPin {
                device: pin.device.clone(),
                input: pin.input,
                mode: pin.mode,
            })
        }
        None => None,
    };

    for s in [&raw.schedule, &raw.constraint_schedule].into_iter().flatten() {
        if !schedules.contains_key(s) {
            return Err(ConfigError::UnknownSchedule {
                output: raw.name.clone(),
                schedule: s.clone(),
            });
        }
    }
    if raw.mode == PlanMode::Schedule && raw.schedule.is_none() {
        return Err(ConfigError::ScheduleModeWithoutSchedule {
            output: raw.name.clone(),
        });
    }

    for s in [&raw.turn_on_sequence, &raw.turn_off_sequence].into_iter().flatten() {
        if !sequences.contains_key(s) {
            return Err(ConfigError::UnknownSequence {
                output: raw.name.clone(),
                sequence: s.clone(),
            });
        }
    }

    let ups_link = match &raw.ups {
        Some(link) => {
            if !ups_units.contains_key(&link.name) {
                return Err(ConfigError::UnknownUps {
                    output: raw.name.clone(),
                    ups: link.name.clone(),
                });
            }
            Some(UpsLink {
                ups: link.name.clone(),
                action: link.action,
            })
        }
        None => None,
    };

    for t in &raw.temp_constraints {
        if !probes.contains_key(&t.probe) {
            return Err(ConfigError::UnknownProbe {
                output: raw.name.clone(),
                probe: t.probe.clone(),
            });
        }
    }

    let off_timer = match (raw.min_off_minutes, raw.max_off_minutes) {
        (Some(m), None) => OffTimer::MinOff { minutes: m },
        (None, Some(m)) => OffTimer::MaxOff { minutes: m },
        (None, None) => OffTimer::None,
        (Some(_), Some(_)) => unreachable!("checked above"),
    };

    let mut month_targets = HashMap::new();
    for (key, hours) in &raw.month_targets {
        let month: u32 = key
            .parse()
            .ok()
            .filter(|m| (1..=12).contains(m))
            .ok_or_else(|| ConfigError::BadMonth {
                output: raw.name.clone(),
                key: key.clone(),
            })?;
        month_targets.insert(month, *hours);
    }

    let meter_thresholds = match (raw.power_on_w, raw.power_off_w) {
        (Some(on), Some(off)) => Some(MeterThresholds {
            power_on_w: on,
            power_off_w: off,
            min_energy_to_log_wh: raw.min_energy_to_log_wh.unwrap_or(0.0),
        }),
        _ => None,
    };

    Ok(OutputConfig {
        name: raw.name.clone(),
        kind: raw.kind,
        relay,
        meter,
        input_pin,
        mode: raw.mode,
        schedule: raw.schedule.clone(),
        constraint_schedule: raw.constraint_schedule.clone(),
        price_channel: raw.price_channel.clone(),
        budget: DailyBudget {
            min_hours: raw.min_hours,
            max_hours: raw.max_hours,
            target_hours: raw.target_hours,
            month_targets,
            max_shortfall_hours: raw.max_shortfall_hours,
        },
        ceilings: PriceCeilings {
            max_best_price: raw.max_best_price,
            max_priority_price: raw.max_priority_price.unwrap_or(raw.max_best_price),
        },
        chatter: AntiChatter {
            min_on_minutes: raw.min_on_minutes,
            off_timer,
        },
        dates_off: raw
            .dates_off
            .iter()
            .map(|d| DateOff {
                from: d.from,
                to: d.to,
            })
            .collect(),
        stop_on_exit: raw.stop_on_exit,
        parent: raw.parent.clone(),
        turn_on_sequence: raw.turn_on_sequence.clone(),
        turn_off_sequence: raw.turn_off_sequence.clone(),
        max_app_on_minutes: raw.max_app_on_minutes,
        temp_constraints: raw
            .temp_constraints
            .iter()
            .map(|t| TempConstraint {
                probe: t.probe.clone(),
                comparison: t.comparison,
                threshold_c: t.threshold_c,
            })
            .collect(),
        ups_link,
        meter_thresholds,
    })
}

/// Kahn's algorithm over parent edges; parents come before children.
fn topo_sort(outputs: &[OutputConfig]) -> Result<Vec<usize>, ConfigError> {
    let index_of: HashMap<&str, usize> = outputs
        .iter()
        .enumerate()
        .map(|(i, o)| (o.name.as_str(), i))
        .collect();

    let mut in_degree = vec![0usize; outputs.len()];
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); outputs.len()];
    for (i, o) in outputs.iter().enumerate() {
        if let Some(parent) = &o.parent {
            let p = index_of[parent.as_str()];
            children[p].push(i);
            in_degree[i] += 1;
        }
    }

    let mut queue: Vec<usize> = (0..outputs.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(outputs.len());
    while let Some(i) = queue.pop() {
        order.push(i);
        for &c in &children[i] {
            in_degree[c] -= 1;
            if in_degree[c] == 0 {
                queue.push(c);
            }
        }
    }

    if order.len() != outputs.len() {
        let stuck = (0..outputs.len())
            .find(|&i| in_degree[i] > 0)
            .map(|i| outputs[i].name.clone())
            .unwrap_or_default();
        return Err(ConfigError::ParentCycle(stuck));
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
general:
  polling_interval_secs: 30
files:
  state_file: /tmp/pc-state.json
  price_cache_file: /tmp/pc-prices.json
shelly_devices:
  - name: shed
    host: 192.168.1.40
outputs:
  - name: pool-pump
    kind: switched
    device: shed
    relay: 0
    target_hours: 4
    max_best_price: 25
operating_schedules:
  - name: overnight
    windows:
      - days: [All]
        start: "22:00"
        end: "06:00"
        price: 18.0
"#
    }

    fn parse(yaml: &str) -> Settings {
        serde_yaml::from_str(yaml).expect("yaml parses")
    }

    #[test]
    fn minimal_config_resolves() {
        let registry = parse(minimal_yaml()).resolve().unwrap();
        assert_eq!(registry.outputs.len(), 1);
        let out = &registry.outputs[0];
        assert_eq!(out.name, "pool-pump");
        assert_eq!(out.budget.target_hours, 4.0);
        // max_priority_price defaults to max_best_price.
        assert_eq!(out.ceilings.max_priority_price, 25.0);
        assert!(registry.schedules.contains_key("overnight"));
    }

    #[test]
    fn unknown_device_is_rejected() {
        let yaml = minimal_yaml().replace("device: shed", "device: garage");
        let err = parse(&yaml).resolve().unwrap_err();
        assert!(matches!(err, ConfigError::UnknownDevice { .. }));
    }

    #[test]
    fn both_off_timers_conflict() {
        let mut settings = parse(minimal_yaml());
        settings.outputs[0].min_off_minutes = Some(10);
        settings.outputs[0].max_off_minutes = Some(720);
        let err = settings.resolve().unwrap_err();
        assert_eq!(err, ConfigError::OffTimerConflict("pool-pump".into()));
    }

    #[test]
    fn self_parent_is_rejected() {
        let mut settings = parse(minimal_yaml());
        settings.outputs[0].parent = Some("pool-pump".into());
        let err = settings.resolve().unwrap_err();
        assert_eq!(err, ConfigError::SelfParent("pool-pump".into()));
    }

    #[test]
    fn parent_cycle_is_rejected() {
        let mut settings = parse(minimal_yaml());
        let mut second = settings.outputs[0].clone();
        second.name = "heater".into();
        second.parent = Some("pool-pump".into());
        settings.outputs[0].parent = Some("heater".into());
        settings.outputs.push(second);
        let err = settings.resolve().unwrap_err();
        assert!(matches!(err, ConfigError::ParentCycle(_)));
    }

    #[test]
    fn topo_order_puts_parents_first() {
        let mut settings = parse(minimal_yaml());
        let mut child = settings.outputs[0].clone();
        child.name = "chlorinator".into();
        child.parent = Some("pool-pump".into());
        settings.outputs.push(child);
        let registry = settings.resolve().unwrap();
        let pos = |name: &str| {
            registry
                .topo_order
                .iter()
                .position(|&i| registry.outputs[i].name == name)
                .unwrap()
        };
        assert!(pos("pool-pump") < pos("chlorinator"));
    }

    #[test]
    fn meter_kind_requires_thresholds() {
        let mut settings = parse(minimal_yaml());
        settings.outputs[0] = RawOutput {
            kind: OutputKind::Meter,
            relay: None,
            meter: Some(0),
            power_on_w: None,
            power_off_w: None,
            ..settings.outputs[0].clone()
        };
        let err = settings.resolve().unwrap_err();
        assert!(matches!(err, ConfigError::KindMismatch { .. }));
    }

    #[test]
    fn schedule_mode_without_schedule_is_rejected() {
        let mut settings = parse(minimal_yaml());
        settings.outputs[0].mode = PlanMode::Schedule;
        let err = settings.resolve().unwrap_err();
        assert!(matches!(err, ConfigError::ScheduleModeWithoutSchedule { .. }));
    }

    #[test]
    fn sequence_step_must_reference_known_output() {
        let mut settings = parse(minimal_yaml());
        settings.output_sequences.push(Sequence {
            name: "boot".into(),
            timeout_secs: 60,
            steps: vec![SequenceStep::ChangeOutput {
                output: "no-such-output".into(),
                turn_on: true,
                retries: 0,
                retry_backoff_secs: 1,
            }],
        });
        let err = settings.resolve().unwrap_err();
        assert!(matches!(err, ConfigError::SequenceUnknownOutput { .. }));
    }
}
