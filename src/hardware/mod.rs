//! Device access: the client trait the rest of the daemon consumes, the
//! Shelly HTTP implementation, the per-device single-writer worker, and a
//! simulated device for development and tests.

pub mod shelly;
pub mod sim;
pub mod worker;

pub use shelly::ShellyClient;
pub use sim::SimulatedDevice;
pub use worker::{DeviceEvent, DeviceHandle, DeviceRequest, DeviceWorker, RelayCommand};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Snapshot of a device's switches and inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub relays: Vec<bool>,
    pub inputs: Vec<bool>,
}

/// One power/energy reading from a metered channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeterReading {
    pub power_w: f64,
    /// Lifetime energy counter where the device provides one.
    pub energy_wh: Option<f64>,
    pub at: DateTime<Utc>,
}

/// The relay/meter RPC surface the controller consumes. Implemented by
/// [`ShellyClient`] for real hardware and [`SimulatedDevice`] in tests.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceClient: Send + Sync {
    async fn get_status(&self) -> Result<DeviceStatus>;
    async fn set_output(&self, index: u8, on: bool) -> Result<()>;
    async fn read_meter(&self, index: u8) -> Result<MeterReading>;
    async fn read_temp(&self, probe_id: u32) -> Result<f64>;
}
