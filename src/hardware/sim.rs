//! In-memory device used for development without hardware and throughout
//! the test suite. Supports scripted failures so worker retry and
//! device-down paths can be exercised.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;

use super::{DeviceClient, DeviceStatus, MeterReading};

#[derive(Debug, Default)]
struct SimState {
    relays: Vec<bool>,
    inputs: Vec<bool>,
    temps: HashMap<u32, f64>,
    /// Watts drawn per relay channel while on.
    load_w: HashMap<u8, f64>,
    fail_remaining: u32,
    set_calls: u32,
}

/// A fake relay/meter device.
#[derive(Debug, Default)]
pub struct SimulatedDevice {
    state: Mutex<SimState>,
}

impl SimulatedDevice {
    pub fn new(relay_count: usize, input_count: usize) -> Self {
        Self {
            state: Mutex::new(SimState {
                relays: vec![false; relay_count],
                inputs: vec![true; input_count],
                ..SimState::default()
            }),
        }
    }

    pub fn set_temp(&self, probe_id: u32, celsius: f64) {
        self.state.lock().temps.insert(probe_id, celsius);
    }

    pub fn set_load(&self, index: u8, watts: f64) {
        self.state.lock().load_w.insert(index, watts);
    }

    pub fn set_input(&self, index: usize, high: bool) {
        let mut s = self.state.lock();
        if index < s.inputs.len() {
            s.inputs[index] = high;
        }
    }

    /// Fail the next `n` RPC calls with a transport error.
    pub fn fail_next(&self, n: u32) {
        self.state.lock().fail_remaining = n;
    }

    pub fn relay(&self, index: u8) -> bool {
        self.state
            .lock()
            .relays
            .get(index as usize)
            .copied()
            .unwrap_or(false)
    }

    pub fn set_calls(&self) -> u32 {
        self.state.lock().set_calls
    }

    fn maybe_fail(&self) -> Result<()> {
        let mut s = self.state.lock();
        if s.fail_remaining > 0 {
            s.fail_remaining -= 1;
            return Err(anyhow!("simulated device timeout"));
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceClient for SimulatedDevice {
    async fn get_status(&self) -> Result<DeviceStatus> {
        self.maybe_fail()?;
        let s = self.state.lock();
        Ok(DeviceStatus {
            relays: s.relays.clone(),
            inputs: s.inputs.clone(),
        })
    }

    async fn set_output(&self, index: u8, on: bool) -> Result<()> {
        self.maybe_fail()?;
        let mut s = self.state.lock();
        s.set_calls += 1;
        let i = index as usize;
        if i >= s.relays.len() {
            return Err(anyhow!("no such relay {index}"));
        }
        s.relays[i] = on;
        Ok(())
    }

    async fn read_meter(&self, index: u8) -> Result<MeterReading> {
        self.maybe_fail()?;
        let s = self.state.lock();
        let on = s.relays.get(index as usize).copied().unwrap_or(false);
        let base = s.load_w.get(&index).copied().unwrap_or(0.0);
        // A little jitter so hysteresis code sees realistic readings.
        let noise = rand::thread_rng().gen_range(-2.0..2.0);
        Ok(MeterReading {
            power_w: if on { (base + noise).max(0.0) } else { 0.0 },
            energy_wh: None,
            at: Utc::now(),
        })
    }

    async fn read_temp(&self, probe_id: u32) -> Result<f64> {
        self.maybe_fail()?;
        self.state
            .lock()
            .temps
            .get(&probe_id)
            .copied()
            .ok_or_else(|| anyhow!("no such probe {probe_id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn relay_round_trip() {
        let dev = SimulatedDevice::new(2, 0);
        dev.set_output(1, true).await.unwrap();
        assert!(dev.relay(1));
        let status = dev.get_status().await.unwrap();
        assert_eq!(status.relays, vec![false, true]);
    }

    #[tokio::test]
    async fn scripted_failures_then_recovery() {
        let dev = SimulatedDevice::new(1, 0);
        dev.fail_next(2);
        assert!(dev.set_output(0, true).await.is_err());
        assert!(dev.set_output(0, true).await.is_err());
        dev.set_output(0, true).await.unwrap();
        assert!(dev.relay(0));
    }

    #[tokio::test]
    async fn meter_follows_relay_state() {
        let dev = SimulatedDevice::new(1, 0);
        dev.set_load(0, 1200.0);
        assert_eq!(dev.read_meter(0).await.unwrap().power_w, 0.0);
        dev.set_output(0, true).await.unwrap();
        assert!(dev.read_meter(0).await.unwrap().power_w > 1000.0);
    }
}
