//! The control loop: sole owner of all per-output controller state. Wakes
//! on the polling tick or on any worker event, rebuilds plans whose inputs
//! changed, advances each output's state machine, and flushes persistent
//! state at most once per wake.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use itertools::Itertools;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::alerts::{ActiveAlert, AlertTracker};
use super::import::{read_sessions, sessions_after};
use super::machine::{Action, ControllerState, Gates, OutputMachine};
use super::sequence::{spawn_sequence, SequenceContext, SequenceOutcome};
use crate::clock::Clock;
use crate::config::Registry;
use crate::domain::{
    AppOverride, HealthVerdict, InputPinMode, OutputConfig, OutputKind, PlanDecision, RelayState,
    RunPlan, UnhealthyAction, UpsHealth,
};
use crate::hardware::{DeviceEvent, DeviceHandle, DeviceRequest, RelayCommand};
use crate::planner::{apply_parent_gate, build_plan, roll_shortfall, PlanContext};
use crate::prices::{fallback_points, PriceCache, PriceUpdate};
use crate::store::{DailyRecord, PersistedState, StateStore};

/// Commands arriving from the HTTP surface.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    Override {
        output: String,
        state: OverrideRequest,
        ttl_minutes: Option<u32>,
    },
    Webhook {
        device: String,
        input: u8,
        state: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideRequest {
    On,
    Off,
    Auto,
}

/// Read-only view published to the HTTP surface after every wake.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub generated_at: DateTime<Utc>,
    pub price_source_down: bool,
    pub outputs: Vec<OutputStatus>,
    pub ups: Vec<UpsHealth>,
    pub alerts: Vec<ActiveAlert>,
}

impl StatusSnapshot {
    pub fn startup() -> Self {
        Self {
            generated_at: Utc::now(),
            price_source_down: false,
            outputs: Vec::new(),
            ups: Vec::new(),
            alerts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputStatus {
    pub name: String,
    pub kind: OutputKind,
    pub state: ControllerState,
    pub relay: RelayState,
    pub on_hours_today: f64,
    pub energy_wh_today: f64,
    pub cost_today: f64,
    pub shortfall_hours: f64,
    pub app_override: Option<AppOverride>,
    pub current_price: Option<f64>,
    pub current_decision: Option<PlanDecision>,
    pub planned_on_slots_today: usize,
    pub last_fault: Option<String>,
}

/// Open meter session for a meter-kind output.
#[derive(Debug, Clone, Copy)]
struct MeterSession {
    energy_wh: f64,
    cost: f64,
}

/// All receive channels feeding the loop.
pub struct LoopChannels {
    pub device_rx: mpsc::Receiver<DeviceEvent>,
    pub price_rx: mpsc::Receiver<PriceUpdate>,
    pub ups_rx: mpsc::Receiver<UpsHealth>,
    pub commands_rx: mpsc::Receiver<ControlEvent>,
    pub sequence_tx: mpsc::Sender<SequenceOutcome>,
    pub sequence_rx: mpsc::Receiver<SequenceOutcome>,
}

pub struct ControlLoop {
    registry: Arc<Registry>,
    clock: Clock,
    cache: Arc<PriceCache>,
    store: StateStore,
    state: PersistedState,
    devices: HashMap<String, DeviceHandle>,
    sequence_ctx: SequenceContext,
    channels: LoopChannels,
    status_tx: watch::Sender<StatusSnapshot>,

    machines: HashMap<String, OutputMachine>,
    plans: HashMap<String, RunPlan>,
    probe_readings: HashMap<String, (f64, DateTime<Utc>)>,
    input_states: HashMap<(String, u8), bool>,
    ups_health: HashMap<String, UpsHealth>,
    meter_sessions: HashMap<String, MeterSession>,
    downs: HashSet<String>,
    alerts: AlertTracker,
    /// device/relay channel back to the owning output.
    relay_owner: HashMap<(String, u8), String>,

    current_day: NaiveDate,
    last_accounted: DateTime<Utc>,
    next_import_due: HashMap<String, DateTime<Utc>>,
    dirty: bool,
}

impl ControlLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<Registry>,
        clock: Clock,
        cache: Arc<PriceCache>,
        store: StateStore,
        state: PersistedState,
        devices: HashMap<String, DeviceHandle>,
        channels: LoopChannels,
        status_tx: watch::Sender<StatusSnapshot>,
    ) -> Self {
        let now = Utc::now();
        let mut machines = HashMap::new();
        let mut relay_owner = HashMap::new();
        for output in &registry.outputs {
            let relay_on = match state.outputs.get(&output.name).map(|s| s.relay) {
                Some(RelayState::On) => Some(true),
                Some(RelayState::Off) => Some(false),
                _ => None,
            };
            machines.insert(
                output.name.clone(),
                OutputMachine::new(output.chatter, relay_on, now),
            );
            if let Some(relay) = &output.relay {
                relay_owner.insert((relay.device.clone(), relay.index), output.name.clone());
            }
        }

        let sequence_ctx = SequenceContext {
            devices: devices.clone(),
            relays: registry
                .outputs
                .iter()
                .filter_map(|o| o.relay.clone().map(|r| (o.name.clone(), r)))
                .collect(),
        };

        let alerts = AlertTracker::new(Duration::minutes(
            registry.general.report_critical_errors_delay_mins as i64,
        ));
        let current_day = clock.local_date(now);

        Self {
            registry,
            clock,
            cache,
            store,
            state,
            devices,
            sequence_ctx,
            channels,
            status_tx,
            machines,
            plans: HashMap::new(),
            probe_readings: HashMap::new(),
            input_states: HashMap::new(),
            ups_health: HashMap::new(),
            meter_sessions: HashMap::new(),
            downs: HashSet::new(),
            alerts,
            relay_owner,
            current_day,
            last_accounted: now,
            next_import_due: HashMap::new(),
            dirty: false,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = interval(std::time::Duration::from_secs(
            self.registry.general.polling_interval_secs,
        ));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("control loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.shutdown().await;
                    return;
                }
                _ = ticker.tick() => {
                    self.tick(Utc::now()).await;
                }
                Some(event) = self.channels.device_rx.recv() => {
                    self.on_device_event(event);
                    self.tick(Utc::now()).await;
                }
                Some(update) = self.channels.price_rx.recv() => {
                    self.on_price_update(update);
                    self.tick(Utc::now()).await;
                }
                Some(health) = self.channels.ups_rx.recv() => {
                    self.ups_health.insert(health.name.clone(), health);
                    self.tick(Utc::now()).await;
                }
                Some(outcome) = self.channels.sequence_rx.recv() => {
                    self.on_sequence_outcome(outcome);
                    self.tick(Utc::now()).await;
                }
                Some(command) = self.channels.commands_rx.recv() => {
                    self.on_command(command);
                    self.tick(Utc::now()).await;
                }
            }
        }
    }

    /// One reconciliation pass.
    async fn tick(&mut self, now: DateTime<Utc>) {
        self.account(now);
        self.rollover_if_due(now);
        self.request_meter_reads();
        self.ingest_imports(now).await;
        self.rebuild_plans(now);
        self.reconcile(now);
        self.classify_meters(now);
        self.raise_alerts(now);
        self.flush(now).await;
        self.publish(now);
    }

    /// Accrue ON-time, energy and cost since the previous wake.
    fn account(&mut self, now: DateTime<Utc>) {
        let elapsed = (now - self.last_accounted).num_seconds();
        self.last_accounted = now;
        if elapsed <= 0 {
            return;
        }
        let hours = elapsed as f64 / 3600.0;
        for output in &self.registry.outputs {
            let price = self
                .cache
                .price_at(&output.price_channel, now, now)
                .map(|p| p.per_kwh)
                .unwrap_or(self.registry.general.default_price);
            let entry = self.state.outputs.entry(output.name.clone()).or_default();
            if entry.relay != RelayState::On {
                continue;
            }
            entry.on_seconds_today += elapsed;
            self.dirty = true;
            if let Some(power) = entry.last_meter_w {
                let energy_wh = power * hours;
                let cost = energy_wh / 1000.0 * price / 100.0;
                entry.energy_wh_today += energy_wh;
                entry.cost_today += cost;
                if output.kind == OutputKind::Meter {
                    let session = self
                        .meter_sessions
                        .entry(output.name.clone())
                        .or_insert(MeterSession {
                            energy_wh: 0.0,
                            cost: 0.0,
                        });
                    session.energy_wh += energy_wh;
                    session.cost += cost;
                }
            }
        }
    }

    /// Local-midnight rollover: close the day, carry shortfall forward.
    fn rollover_if_due(&mut self, now: DateTime<Utc>) {
        let today = self.clock.local_date(now);
        if today == self.current_day {
            return;
        }
        info!(from = %self.current_day, to = %today, "day rollover");
        let closed_day = self.current_day;
        for output in &self.registry.outputs {
            let entry = self.state.outputs.entry(output.name.clone()).or_default();
            let actual_hours = entry.on_seconds_today as f64 / 3600.0;
            entry.shortfall_hours = roll_shortfall(
                &output.budget,
                closed_day.month(),
                actual_hours,
                entry.shortfall_hours,
            );
            entry.history.push(DailyRecord {
                date: closed_day,
                on_seconds: entry.on_seconds_today,
                energy_wh: entry.energy_wh_today,
                cost: entry.cost_today,
            });
            let keep = self.registry.general.days_of_history as usize;
            if entry.history.len() > keep {
                let drop = entry.history.len() - keep;
                entry.history.drain(..drop);
            }
            entry.on_seconds_today = 0;
            entry.energy_wh_today = 0.0;
            entry.cost_today = 0.0;
        }
        self.current_day = today;
        self.dirty = true;
    }

    fn request_meter_reads(&self) {
        for output in &self.registry.outputs {
            if let Some(meter) = &output.meter {
                if let Some(handle) = self.devices.get(&meter.device) {
                    handle.send(DeviceRequest::ReadMeter { index: meter.index });
                }
            }
        }
    }

    /// Pull externally recorded sessions for imported outputs on cadence.
    async fn ingest_imports(&mut self, now: DateTime<Utc>) {
        for import in self.registry.imports.clone() {
            let due = self
                .next_import_due
                .get(&import.output)
                .copied()
                .unwrap_or(now);
            if now < due {
                continue;
            }
            self.next_import_due.insert(
                import.output.clone(),
                now + Duration::minutes(import.interval_minutes as i64),
            );

            let path = import.sessions_file.clone();
            let sessions = tokio::task::spawn_blocking(move || read_sessions(&path)).await;
            let sessions = match sessions {
                Ok(Ok(sessions)) => sessions,
                Ok(Err(e)) => {
                    warn!(output = %import.output, error = %e, "session import failed");
                    continue;
                }
                Err(e) => {
                    warn!(output = %import.output, error = %e, "session import task failed");
                    continue;
                }
            };

            let Some(output) = self.registry.output(&import.output).cloned() else {
                continue;
            };
            let cursor = self
                .state
                .outputs
                .get(&import.output)
                .and_then(|s| s.import_cursor);
            let fresh = sessions_after(&sessions, cursor);
            if fresh.is_empty() {
                continue;
            }
            let default_price = self.registry.general.default_price;
            let mut cursor = cursor;
            let mut added_seconds = 0i64;
            let mut added_energy = 0.0;
            let mut added_cost = 0.0;
            for session in &fresh {
                let price = self
                    .cache
                    .price_at(&output.price_channel, session.start, now)
                    .map(|p| p.per_kwh)
                    .unwrap_or(default_price);
                added_seconds += session.duration_seconds();
                added_energy += session.energy_wh;
                added_cost += session.cost_at(price);
                cursor = Some(cursor.map_or(session.start, |c| c.max(session.start)));
            }
            let entry = self.state.outputs.entry(import.output.clone()).or_default();
            entry.on_seconds_today += added_seconds;
            entry.energy_wh_today += added_energy;
            entry.cost_today += added_cost;
            entry.import_cursor = cursor;
            self.dirty = true;
            info!(output = %import.output, sessions = fresh.len(), "ingested imported sessions");
        }
    }

    /// Rebuild every plan, parents before children so gating can apply.
    fn rebuild_plans(&mut self, now: DateTime<Utc>) {
        let lookback = Duration::hours(self.registry.general.lookback_hours as i64);
        let horizon = Duration::hours(self.registry.general.horizon_hours as i64);
        let from = now - lookback;
        let to = now + horizon;
        let price_source_up = self.registry.amber.is_some() && !self.cache.is_down();

        for &idx in &self.registry.topo_order {
            let output = self.registry.outputs[idx].clone();
            if output.kind == OutputKind::Imported {
                continue;
            }
            let schedule = output
                .schedule
                .as_ref()
                .and_then(|name| self.registry.schedules.get(name));
            let constraint_schedule = output
                .constraint_schedule
                .as_ref()
                .and_then(|name| self.registry.schedules.get(name));

            // Base fallback grid, overlaid with real cache points when the
            // source is healthy.
            let mut prices = fallback_points(
                &output.price_channel,
                schedule,
                &self.clock,
                from,
                to,
                self.registry.general.default_price,
            );
            if price_source_up {
                let cached = self.cache.forecast(&output.price_channel, from, to, now);
                let by_slot: HashMap<_, _> =
                    cached.into_iter().map(|p| (p.start, p)).collect();
                for point in prices.iter_mut() {
                    if let Some(real) = by_slot.get(&point.start) {
                        *point = real.clone();
                    }
                }
            }

            let ups_verdict = output.ups_link.as_ref().map(|link| {
                self.ups_health
                    .get(&link.ups)
                    .map(|h| h.verdict)
                    .unwrap_or(HealthVerdict::Unknown)
            });

            let probe_temps = self.fresh_probe_temps(now);
            let entry = self.state.outputs.entry(output.name.clone()).or_default();
            let app_override = entry.app_override.filter(|o| o.active(now));

            let ctx = PlanContext {
                clock: &self.clock,
                now,
                lookback,
                horizon,
                prices: &prices,
                schedule,
                constraint_schedule,
                ups_verdict,
                app_override,
                probe_temps: &probe_temps,
                today_on_hours: entry.on_seconds_today as f64 / 3600.0,
                shortfall_hours: entry.shortfall_hours,
            };
            let mut plan = build_plan(&output, &ctx);
            if let Some(parent) = &output.parent {
                if let Some(parent_plan) = self.plans.get(parent) {
                    apply_parent_gate(&mut plan, parent_plan);
                }
            }
            self.plans.insert(output.name.clone(), plan);
        }
    }

    /// Probe readings younger than twice their polling interval.
    fn fresh_probe_temps(&self, now: DateTime<Utc>) -> HashMap<String, f64> {
        self.probe_readings
            .iter()
            .filter_map(|(name, (celsius, at))| {
                let interval_secs = self
                    .registry
                    .probes
                    .get(name)
                    .map(|p| p.interval_secs)
                    .unwrap_or(60);
                if (now - *at).num_seconds() <= 2 * interval_secs as i64 {
                    Some((name.clone(), *celsius))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Advance every switched output's state machine toward its plan.
    fn reconcile(&mut self, now: DateTime<Utc>) {
        let ordered: Vec<OutputConfig> = self
            .registry
            .topo_order
            .iter()
            .map(|&idx| self.registry.outputs[idx].clone())
            .collect();
        for output in ordered {
            if output.kind != OutputKind::Switched {
                continue;
            }
            self.expire_override(&output.name, now);

            if let Some(machine) = self.machines.get_mut(&output.name) {
                machine.expire_locks(now);
            } else {
                continue;
            }

            let plan_on = self
                .plans
                .get(&output.name)
                .map(|p| p.decision_at(now) == PlanDecision::On)
                .unwrap_or(false);

            let pin_force = output.input_pin.as_ref().and_then(|pin| {
                let state = self
                    .input_states
                    .get(&(pin.device.clone(), pin.input))
                    .copied();
                match (pin.mode, state) {
                    (InputPinMode::Ignore, _) | (_, None) => None,
                    (InputPinMode::TurnOn, Some(false)) => Some(true),
                    (InputPinMode::TurnOn, Some(true)) => None,
                    (InputPinMode::TurnOff, Some(false)) => Some(false),
                    (InputPinMode::TurnOff, Some(true)) => None,
                }
            });

            let override_target = self
                .state
                .outputs
                .get(&output.name)
                .and_then(|s| s.app_override)
                .filter(|o| o.active(now))
                .map(|o| o.target_on);

            let parent_on = match &output.parent {
                Some(parent) => self
                    .machines
                    .get(parent)
                    .map(|m| m.is_on())
                    .unwrap_or(false),
                None => true,
            };

            let ups_blocks = output
                .ups_link
                .as_ref()
                .is_some_and(|link| {
                    link.action == UnhealthyAction::TurnOff
                        && self
                            .ups_health
                            .get(&link.ups)
                            .map(|h| h.verdict == HealthVerdict::Unhealthy)
                            .unwrap_or(false)
                });

            let max_off_forced = self
                .machines
                .get(&output.name)
                .map(|m| m.max_off_exceeded(now))
                .unwrap_or(false);

            let want_on = if ups_blocks {
                false
            } else if let Some(pin) = pin_force {
                pin
            } else if let Some(target) = override_target {
                target && parent_on
            } else if max_off_forced {
                true
            } else {
                plan_on && parent_on
            };
            let gates = Gates {
                want_on,
                ignore_locks: pin_force.is_some() || override_target.is_some(),
            };

            let started = {
                let Some(machine) = self.machines.get_mut(&output.name) else {
                    continue;
                };
                machine.step(now, gates).map(|action| {
                    let correlation_id = Uuid::new_v4();
                    machine.begin(action, correlation_id);
                    (action, correlation_id)
                })
            };
            if let Some((action, correlation_id)) = started {
                if max_off_forced && action == Action::TurnOn {
                    info!(output = %output.name, "max-off exercise turn-on");
                }
                self.dispatch(&output, action, correlation_id);
            }
        }
    }

    fn dispatch(&self, output: &OutputConfig, action: Action, correlation_id: Uuid) {
        let turn_on = action == Action::TurnOn;
        let sequence_name = if turn_on {
            &output.turn_on_sequence
        } else {
            &output.turn_off_sequence
        };
        if let Some(name) = sequence_name {
            if let Some(sequence) = self.registry.sequences.get(name) {
                debug!(output = %output.name, sequence = %name, turn_on, "starting sequence");
                spawn_sequence(
                    self.sequence_ctx.clone(),
                    sequence.clone(),
                    output.name.clone(),
                    correlation_id,
                    turn_on,
                    self.channels.sequence_tx.clone(),
                );
                return;
            }
        }
        if let Some(relay) = &output.relay {
            if let Some(handle) = self.devices.get(&relay.device) {
                debug!(output = %output.name, turn_on, "dispatching relay command");
                handle.send(DeviceRequest::SetRelay {
                    command: RelayCommand {
                        correlation_id,
                        relay: relay.index,
                        turn_on,
                    },
                    reply: None,
                });
            }
        }
    }

    /// Hysteresis classification of meter-kind outputs.
    fn classify_meters(&mut self, now: DateTime<Utc>) {
        for output in &self.registry.outputs {
            let (Some(thresholds), OutputKind::Meter) = (&output.meter_thresholds, output.kind)
            else {
                continue;
            };
            let entry = self.state.outputs.entry(output.name.clone()).or_default();
            let Some(power) = entry.last_meter_w else {
                continue;
            };
            let running = entry.relay == RelayState::On;
            if !running && power >= thresholds.power_on_w {
                entry.relay = RelayState::On;
                entry.last_change = Some(now);
                self.meter_sessions.insert(
                    output.name.clone(),
                    MeterSession {
                        energy_wh: 0.0,
                        cost: 0.0,
                    },
                );
                self.dirty = true;
                info!(output = %output.name, power, "meter load started");
            } else if running && power <= thresholds.power_off_w {
                entry.relay = RelayState::Off;
                entry.last_change = Some(now);
                self.dirty = true;
                if let Some(session) = self.meter_sessions.remove(&output.name) {
                    if session.energy_wh < thresholds.min_energy_to_log_wh {
                        // Too small to log: back the session out of the
                        // daily totals.
                        entry.energy_wh_today =
                            (entry.energy_wh_today - session.energy_wh).max(0.0);
                        entry.cost_today = (entry.cost_today - session.cost).max(0.0);
                        debug!(output = %output.name, energy_wh = session.energy_wh,
                               "discarding short meter session");
                    } else {
                        info!(output = %output.name, energy_wh = session.energy_wh,
                              "meter load stopped");
                    }
                }
            }
        }
    }

    fn expire_override(&mut self, output: &str, now: DateTime<Utc>) {
        if let Some(entry) = self.state.outputs.get_mut(output) {
            if let Some(ov) = entry.app_override {
                if !ov.active(now) {
                    info!(output = %output, "app override expired, resuming plan");
                    entry.app_override = None;
                    self.dirty = true;
                }
            }
        }
    }

    fn raise_alerts(&mut self, now: DateTime<Utc>) {
        for device in self.downs.clone() {
            self.alerts.observe(
                &format!("device:{device}"),
                &format!("device {device} is not responding"),
                now,
            );
        }
        if self.cache.is_down() {
            self.alerts
                .observe("price-source", "price source is down", now);
        } else {
            self.alerts.clear("price-source");
        }
        for (name, machine) in &self.machines {
            let key = format!("fault:{name}");
            if machine.state == ControllerState::Fault {
                let message = machine
                    .last_fault
                    .clone()
                    .unwrap_or_else(|| "actuation failed".to_string());
                self.alerts
                    .observe(&key, &format!("output {name} is faulted: {message}"), now);
            } else {
                self.alerts.clear(&key);
            }
        }
    }

    /// Coalesced persistence: at most one write per wake.
    async fn flush(&mut self, _now: DateTime<Utc>) {
        if !self.dirty {
            return;
        }
        self.dirty = false;
        let store = self.store.clone();
        let mut snapshot = self.state.clone();
        let result = tokio::task::spawn_blocking(move || store.save(&mut snapshot)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "state flush failed"),
            Err(e) => warn!(error = %e, "state flush task failed"),
        }
    }

    fn publish(&self, now: DateTime<Utc>) {
        let outputs = self
            .registry
            .outputs
            .iter()
            .map(|output| {
                let entry = self.state.outputs.get(&output.name);
                let machine = self.machines.get(&output.name);
                let plan = self.plans.get(&output.name);
                let slot = plan.and_then(|p| p.slot_at(now));
                let day_start = self.clock.local_midnight_utc(self.current_day);
                let day_end = day_start + Duration::days(1);
                OutputStatus {
                    name: output.name.clone(),
                    kind: output.kind,
                    state: machine
                        .map(|m| m.state)
                        .unwrap_or(ControllerState::Off),
                    relay: entry.map(|e| e.relay).unwrap_or(RelayState::Unknown),
                    on_hours_today: entry
                        .map(|e| e.on_seconds_today as f64 / 3600.0)
                        .unwrap_or(0.0),
                    energy_wh_today: entry.map(|e| e.energy_wh_today).unwrap_or(0.0),
                    cost_today: entry.map(|e| e.cost_today).unwrap_or(0.0),
                    shortfall_hours: entry.map(|e| e.shortfall_hours).unwrap_or(0.0),
                    app_override: entry.and_then(|e| e.app_override),
                    current_price: slot.and_then(|s| s.price),
                    current_decision: slot.map(|s| s.decision),
                    planned_on_slots_today: plan
                        .map(|p| p.on_slots_between(day_start, day_end))
                        .unwrap_or(0),
                    last_fault: machine.and_then(|m| m.last_fault.clone()),
                }
            })
            .collect();

        let ups: Vec<UpsHealth> = self
            .ups_health
            .values()
            .cloned()
            .sorted_by(|a, b| a.name.cmp(&b.name))
            .collect();

        let snapshot = StatusSnapshot {
            generated_at: now,
            price_source_down: self.cache.is_down(),
            outputs,
            ups,
            alerts: self.alerts.active(now),
        };
        let _ = self.status_tx.send(snapshot);
    }

    fn on_device_event(&mut self, event: DeviceEvent) {
        let now = Utc::now();
        match event {
            DeviceEvent::CommandResult {
                device,
                command,
                ok,
                error,
            } => {
                // First try to match an in-flight controller command.
                let owner = self
                    .machines
                    .iter()
                    .find(|(_, m)| m.pending == Some(command.correlation_id))
                    .map(|(name, _)| name.clone());
                if let Some(name) = owner {
                    if let Some(machine) = self.machines.get_mut(&name) {
                        machine.complete(now, ok, error);
                    }
                    if ok {
                        self.record_relay(&name, command.turn_on, now);
                    }
                    return;
                }
                // Otherwise it was a sequence step or external change:
                // record the observed state against the owning output.
                if ok {
                    if let Some(name) = self
                        .relay_owner
                        .get(&(device.clone(), command.relay))
                        .cloned()
                    {
                        if let Some(machine) = self.machines.get_mut(&name) {
                            machine.observe(now, command.turn_on);
                        }
                        self.record_relay(&name, command.turn_on, now);
                    }
                }
            }
            DeviceEvent::MeterReading {
                device,
                index,
                reading,
            } => {
                for output in &self.registry.outputs {
                    let matches = output
                        .meter
                        .as_ref()
                        .is_some_and(|m| m.device == device && m.index == index);
                    if matches {
                        let entry = self.state.outputs.entry(output.name.clone()).or_default();
                        entry.last_meter_w = Some(reading.power_w);
                        entry.last_meter_at = Some(reading.at);
                        entry.last_contact = Some(now);
                    }
                }
            }
            DeviceEvent::TempReading { probe, celsius, at, .. } => {
                self.probe_readings.insert(probe, (celsius, at));
            }
            DeviceEvent::Status { device, status, at } => {
                for (channel, name) in self.relay_owner.clone() {
                    if channel.0 != device {
                        continue;
                    }
                    if let Some(&relay_on) = status.relays.get(channel.1 as usize) {
                        if let Some(machine) = self.machines.get_mut(&name) {
                            machine.observe(at, relay_on);
                        }
                        self.record_relay(&name, relay_on, at);
                    }
                }
                for (i, &state) in status.inputs.iter().enumerate() {
                    self.input_states.insert((device.clone(), i as u8), state);
                }
            }
            DeviceEvent::Down { device } => {
                warn!(device = %device, "device down");
                self.downs.insert(device.clone());
                for output in &self.registry.outputs {
                    let affected = output
                        .relay
                        .as_ref()
                        .is_some_and(|r| r.device == device);
                    if affected {
                        if let Some(machine) = self.machines.get_mut(&output.name) {
                            if !machine.in_flight() {
                                machine.state = ControllerState::Fault;
                                machine.last_fault = Some(format!("device {device} down"));
                            }
                        }
                    }
                }
            }
            DeviceEvent::Recovered { device } => {
                info!(device = %device, "device recovered");
                self.downs.remove(&device);
                self.alerts.clear(&format!("device:{device}"));
            }
        }
    }

    fn record_relay(&mut self, output: &str, on: bool, now: DateTime<Utc>) {
        let entry = self.state.outputs.entry(output.to_string()).or_default();
        let new_state = if on { RelayState::On } else { RelayState::Off };
        if entry.relay != new_state {
            entry.relay = new_state;
            entry.last_change = Some(now);
        }
        entry.last_contact = Some(now);
        self.dirty = true;
    }

    fn on_price_update(&mut self, update: PriceUpdate) {
        match update {
            PriceUpdate::Refreshed => debug!("prices refreshed, replanning"),
            PriceUpdate::RefreshFailed {
                consecutive_errors,
                down,
            } => {
                debug!(consecutive_errors, down, "price refresh failure noted");
            }
        }
    }

    fn on_sequence_outcome(&mut self, outcome: SequenceOutcome) {
        let now = Utc::now();
        let Some(machine) = self.machines.get_mut(&outcome.output) else {
            return;
        };
        if machine.pending != Some(outcome.correlation_id) {
            debug!(output = %outcome.output, "stale sequence outcome ignored");
            return;
        }
        machine.complete(now, outcome.ok, outcome.error.clone());
        if outcome.ok {
            self.record_relay(&outcome.output, outcome.turn_on, now);
        } else {
            self.dirty = true;
        }
    }

    fn on_command(&mut self, command: ControlEvent) {
        let now = Utc::now();
        match command {
            ControlEvent::Override {
                output,
                state,
                ttl_minutes,
            } => {
                let Some(config) = self.registry.output(&output).cloned() else {
                    warn!(output = %output, "override for unknown output ignored");
                    return;
                };
                let entry = self.state.outputs.entry(output.clone()).or_default();
                match state {
                    OverrideRequest::Auto => {
                        entry.app_override = None;
                        info!(output = %output, "override cleared");
                    }
                    OverrideRequest::On | OverrideRequest::Off => {
                        let target_on = state == OverrideRequest::On;
                        // The configured cap bounds the requested TTL; a
                        // cap of zero means no expiry.
                        let cap = config.max_app_on_minutes;
                        let ttl = match (ttl_minutes, cap) {
                            (Some(t), 0) => Some(t),
                            (Some(t), c) => Some(t.min(c)),
                            (None, 0) => None,
                            (None, c) => Some(c),
                        };
                        entry.app_override = Some(AppOverride {
                            target_on,
                            expires_at: ttl.map(|m| now + Duration::minutes(m as i64)),
                        });
                        info!(output = %output, target_on, ?ttl, "override set");
                    }
                }
                self.dirty = true;
            }
            ControlEvent::Webhook {
                device,
                input,
                state,
            } => {
                debug!(device = %device, input, state, "input webhook");
                self.input_states.insert((device, input), state);
            }
        }
    }

    /// Graceful shutdown: command stop-on-exit outputs OFF, give the
    /// workers a moment to drain, flush state.
    async fn shutdown(&mut self) {
        info!("control loop stopping");
        let now = Utc::now();
        for output in &self.registry.outputs {
            if !output.stop_on_exit {
                continue;
            }
            if let Some(relay) = &output.relay {
                if let Some(handle) = self.devices.get(&relay.device) {
                    info!(output = %output.name, "stop-on-exit: commanding off");
                    handle.send(DeviceRequest::SetRelay {
                        command: RelayCommand {
                            correlation_id: Uuid::new_v4(),
                            relay: relay.index,
                            turn_on: false,
                        },
                        reply: None,
                    });
                    let entry = self.state.outputs.entry(output.name.clone()).or_default();
                    entry.relay = RelayState::Off;
                    entry.last_change = Some(now);
                    self.dirty = true;
                }
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        self.flush(now).await;
    }
}
