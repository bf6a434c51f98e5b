//! Per-device single-writer worker. All RPC to one physical device flows
//! through its worker's queue, so commands are never interleaved and the
//! control loop never blocks on device I/O. Results come back as events.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{DeviceClient, DeviceStatus, MeterReading};
use crate::config::ShellyDeviceConfig;

const REQUEST_QUEUE_DEPTH: usize = 32;

/// A relay change request; the correlation id ties the eventual
/// [`DeviceEvent::CommandResult`] back to the issuing controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayCommand {
    pub correlation_id: Uuid,
    pub relay: u8,
    pub turn_on: bool,
}

/// Requests accepted by a device worker. Relay changes always produce a
/// [`DeviceEvent::CommandResult`]; a sequence runner may additionally
/// attach a oneshot for direct step acknowledgement.
#[derive(Debug)]
pub enum DeviceRequest {
    SetRelay {
        command: RelayCommand,
        reply: Option<oneshot::Sender<Result<(), String>>>,
    },
    ReadMeter { index: u8 },
    ReadTemp { probe: String, probe_id: u32 },
    RefreshStatus,
}

/// Events emitted back to the control loop.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    CommandResult {
        device: String,
        command: RelayCommand,
        ok: bool,
        error: Option<String>,
    },
    MeterReading {
        device: String,
        index: u8,
        reading: MeterReading,
    },
    TempReading {
        device: String,
        probe: String,
        celsius: f64,
        at: DateTime<Utc>,
    },
    Status {
        device: String,
        status: DeviceStatus,
        at: DateTime<Utc>,
    },
    /// Too many consecutive failures; dependent outputs go FAULT.
    Down { device: String },
    Recovered { device: String },
}

/// Cheap cloneable handle for enqueueing requests to one worker.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    pub name: String,
    tx: mpsc::Sender<DeviceRequest>,
}

impl DeviceHandle {
    /// Enqueue a request; a full queue drops it with a warning rather than
    /// blocking the caller.
    pub fn send(&self, request: DeviceRequest) {
        if let Err(e) = self.tx.try_send(request) {
            warn!(device = %self.name, error = %e, "device queue full, dropping request");
        }
    }
}

/// Worker state for one device.
pub struct DeviceWorker {
    name: String,
    client: Arc<dyn DeviceClient>,
    rx: mpsc::Receiver<DeviceRequest>,
    events: mpsc::Sender<DeviceEvent>,
    retry_count: u32,
    retry_delay: Duration,
    max_concurrent_errors: u32,
    meter_staleness: ChronoDuration,
    last_meter: HashMap<u8, MeterReading>,
    consecutive_errors: u32,
    down: bool,
}

impl DeviceWorker {
    /// Spawn the worker task and return its handle.
    pub fn spawn(
        cfg: &ShellyDeviceConfig,
        client: Arc<dyn DeviceClient>,
        events: mpsc::Sender<DeviceEvent>,
        cancel: CancellationToken,
    ) -> DeviceHandle {
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let worker = DeviceWorker {
            name: cfg.name.clone(),
            client,
            rx,
            events,
            retry_count: cfg.retry_count,
            retry_delay: Duration::from_secs(cfg.retry_delay_secs),
            max_concurrent_errors: cfg.max_concurrent_errors,
            meter_staleness: ChronoDuration::seconds(cfg.meter_staleness_secs as i64),
            last_meter: HashMap::new(),
            consecutive_errors: 0,
            down: false,
        };
        let name = cfg.name.clone();
        tokio::spawn(worker.run(cancel));
        DeviceHandle { name, tx }
    }

    async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(device = %self.name, "device worker stopping");
                    return;
                }
                request = self.rx.recv() => {
                    let Some(request) = request else { return };
                    self.handle(request).await;
                }
            }
        }
    }

    async fn handle(&mut self, request: DeviceRequest) {
        match request {
            DeviceRequest::SetRelay { command, reply } => {
                let client = self.client.clone();
                let result = self
                    .with_retry(|| {
                        let client = client.clone();
                        async move { client.set_output(command.relay, command.turn_on).await }
                    })
                    .await;
                let (ok, error) = match result {
                    Ok(()) => (true, None),
                    Err(e) => (false, Some(e.to_string())),
                };
                if let Some(reply) = reply {
                    let step_result = match &error {
                        None => Ok(()),
                        Some(e) => Err(e.clone()),
                    };
                    let _ = reply.send(step_result);
                }
                self.emit(DeviceEvent::CommandResult {
                    device: self.name.clone(),
                    command,
                    ok,
                    error,
                })
                .await;
            }
            DeviceRequest::ReadMeter { index } => {
                let now = Utc::now();
                if let Some(cached) = self.last_meter.get(&index) {
                    if now - cached.at < self.meter_staleness {
                        debug!(device = %self.name, index, "serving coalesced meter reading");
                        let reading = *cached;
                        self.emit(DeviceEvent::MeterReading {
                            device: self.name.clone(),
                            index,
                            reading,
                        })
                        .await;
                        return;
                    }
                }
                let client = self.client.clone();
                match self
                    .with_retry(|| {
                        let client = client.clone();
                        async move { client.read_meter(index).await }
                    })
                    .await
                {
                    Ok(reading) => {
                        self.last_meter.insert(index, reading);
                        self.emit(DeviceEvent::MeterReading {
                            device: self.name.clone(),
                            index,
                            reading,
                        })
                        .await;
                    }
                    Err(e) => warn!(device = %self.name, index, error = %e, "meter read failed"),
                }
            }
            DeviceRequest::ReadTemp { probe, probe_id } => {
                let client = self.client.clone();
                match self
                    .with_retry(|| {
                        let client = client.clone();
                        async move { client.read_temp(probe_id).await }
                    })
                    .await
                {
                    Ok(celsius) => {
                        self.emit(DeviceEvent::TempReading {
                            device: self.name.clone(),
                            probe,
                            celsius,
                            at: Utc::now(),
                        })
                        .await;
                    }
                    Err(e) => warn!(device = %self.name, probe = %probe, error = %e, "temp read failed"),
                }
            }
            DeviceRequest::RefreshStatus => {
                let client = self.client.clone();
                match self
                    .with_retry(|| {
                        let client = client.clone();
                        async move { client.get_status().await }
                    })
                    .await
                {
                    Ok(status) => {
                        self.emit(DeviceEvent::Status {
                            device: self.name.clone(),
                            status,
                            at: Utc::now(),
                        })
                        .await;
                    }
                    Err(e) => warn!(device = %self.name, error = %e, "status refresh failed"),
                }
            }
        }
    }

    /// Run one RPC with fixed-delay retries, tracking the consecutive
    /// failure count that drives down/recovered events.
    async fn with_retry<T, Fut>(&mut self, mut op: impl FnMut() -> Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 0..=self.retry_count {
            match op().await {
                Ok(v) => {
                    self.consecutive_errors = 0;
                    if self.down {
                        self.down = false;
                        let device = self.name.clone();
                        self.emit(DeviceEvent::Recovered { device }).await;
                    }
                    return Ok(v);
                }
                Err(e) => {
                    debug!(device = %self.name, attempt, error = %e, "device call failed");
                    last_err = Some(e);
                    if attempt < self.retry_count {
                        sleep(self.retry_delay).await;
                    }
                }
            }
        }
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        if !self.down && self.consecutive_errors >= self.max_concurrent_errors {
            self.down = true;
            let device = self.name.clone();
            self.emit(DeviceEvent::Down { device }).await;
        }
        Err(last_err.unwrap_or_else(|| anyhow!("device call failed with no attempts")))
    }

    async fn emit(&self, event: DeviceEvent) {
        if self.events.send(event).await.is_err() {
            warn!(device = %self.name, "event channel closed");
        }
    }
}
