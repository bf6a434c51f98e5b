//! Controller assembly: output state machines, the control loop, sequence
//! runner, UPS pollers and alerting, plus the wiring that spawns the whole
//! worker constellation at startup.

pub mod alerts;
pub mod control_loop;
pub mod import;
pub mod machine;
pub mod sequence;
pub mod ups;

pub use control_loop::{ControlEvent, ControlLoop, OutputStatus, OverrideRequest, StatusSnapshot};
pub use machine::{Action, ControllerState, Gates, OutputMachine};
pub use sequence::{SequenceContext, SequenceOutcome};

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::clock::Clock;
use crate::config::Registry;
use crate::hardware::{DeviceClient, DeviceHandle, DeviceRequest, DeviceWorker, ShellyClient};
use crate::prices::{AmberClient, PriceCache, PriceRefresher, PriceSource};
use crate::store::StateStore;

/// Shared handles the HTTP surface works through. Controller state itself
/// stays with the control loop; this only carries channels and snapshots.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub status_rx: watch::Receiver<StatusSnapshot>,
    pub commands_tx: mpsc::Sender<ControlEvent>,
    pub refresh_tx: mpsc::Sender<()>,
    pub access_key: Option<String>,
}

/// Everything `main` needs to drive and tear down the daemon.
pub struct Runtime {
    pub app: AppState,
    pub loop_handle: JoinHandle<()>,
    /// Cancels the control loop first so it can run its shutdown pass.
    pub loop_cancel: CancellationToken,
    /// Cancels workers after the loop has drained.
    pub worker_cancel: CancellationToken,
}

/// Build and spawn the full worker constellation: device workers, price
/// refresher, UPS runners, probe pollers and the control loop.
pub fn start(registry: Arc<Registry>) -> Result<Runtime> {
    let clock = Clock::new(
        &registry.location.timezone,
        registry.location.latitude,
        registry.location.longitude,
    )?;

    let store = StateStore::new(
        registry.files.state_file.clone(),
        registry.general.days_of_history,
    );
    let state = store.load().context("failed to load state store")?;

    let stale_after = chrono::Duration::minutes(
        registry
            .amber
            .as_ref()
            .map(|a| a.stale_after_minutes)
            .unwrap_or(90) as i64,
    );
    let max_errors = registry
        .amber
        .as_ref()
        .map(|a| a.max_concurrent_errors)
        .unwrap_or(5);
    let cache = Arc::new(PriceCache::open(
        registry.files.price_cache_file.clone(),
        stale_after,
        max_errors,
        chrono::Duration::days(registry.general.days_of_history as i64),
    ));

    let worker_cancel = CancellationToken::new();
    let loop_cancel = CancellationToken::new();

    // One worker per physical device.
    let (device_events_tx, device_rx) = mpsc::channel(128);
    let mut devices: HashMap<String, DeviceHandle> = HashMap::new();
    for cfg in registry.devices.values() {
        let client: Arc<dyn DeviceClient> = Arc::new(ShellyClient::new(cfg)?);
        let handle = DeviceWorker::spawn(cfg, client, device_events_tx.clone(), worker_cancel.clone());
        devices.insert(cfg.name.clone(), handle);
    }

    // Price refresher, when a source is configured.
    let (price_tx, price_rx) = mpsc::channel(8);
    let (refresh_tx, refresh_rx) = mpsc::channel(4);
    if let Some(amber) = &registry.amber {
        let source: Arc<dyn PriceSource> = Arc::new(AmberClient::new(amber)?);
        let refresher = PriceRefresher::new(
            source,
            cache.clone(),
            Duration::from_secs(amber.refresh_minutes * 60),
            price_tx.clone(),
            refresh_rx,
        );
        tokio::spawn(refresher.run(worker_cancel.clone()));
    } else {
        info!("no price source configured, planning from schedules only");
    }

    // UPS script runners.
    let (ups_tx, ups_rx) = mpsc::channel(16);
    for unit in registry.ups_units.values() {
        ups::UpsRunner::new(unit.clone(), registry.ups_script_timeout_secs, ups_tx.clone())
            .spawn(worker_cancel.clone());
    }

    // Probe pollers: periodic temperature read requests routed through the
    // owning device's worker.
    for probe in registry.probes.values() {
        if let Some(handle) = devices.get(&probe.device).cloned() {
            let probe = probe.clone();
            let cancel = worker_cancel.clone();
            tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval(Duration::from_secs(probe.interval_secs));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = ticker.tick() => {
                            handle.send(DeviceRequest::ReadTemp {
                                probe: probe.name.clone(),
                                probe_id: probe.probe_id,
                            });
                        }
                    }
                }
            });
        }
    }

    // Startup status refresh so machines can adopt real relay state early.
    for handle in devices.values() {
        handle.send(DeviceRequest::RefreshStatus);
    }

    let (commands_tx, commands_rx) = mpsc::channel(32);
    let (sequence_tx, sequence_rx) = mpsc::channel(32);
    let (status_tx, status_rx) = watch::channel(StatusSnapshot::startup());

    let channels = control_loop::LoopChannels {
        device_rx,
        price_rx,
        ups_rx,
        commands_rx,
        sequence_tx,
        sequence_rx,
    };

    let control = ControlLoop::new(
        registry.clone(),
        clock,
        cache,
        store,
        state,
        devices,
        channels,
        status_tx,
    );
    let loop_handle = tokio::spawn(control.run(loop_cancel.clone()));

    let app = AppState {
        registry: registry.clone(),
        status_rx,
        commands_tx,
        refresh_tx,
        access_key: registry.website.access_key.clone(),
    };

    Ok(Runtime {
        app,
        loop_handle,
        loop_cancel,
        worker_cancel,
    })
}
