//! Thin HTTP client for Shelly Gen2-style devices. Only the RPC calls the
//! controller needs; webhook ingestion lives on the HTTP surface.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::time::Duration;

use super::{DeviceClient, DeviceStatus, MeterReading};
use crate::config::ShellyDeviceConfig;

#[derive(Clone)]
pub struct ShellyClient {
    base_url: String,
    client: reqwest::Client,
}

impl ShellyClient {
    pub fn new(cfg: &ShellyDeviceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.response_timeout_secs))
            .build()
            .context("failed to build device HTTP client")?;
        Ok(Self {
            base_url: format!("http://{}", cfg.host.trim_end_matches('/')),
            client,
        })
    }

    async fn rpc<T: serde::de::DeserializeOwned>(&self, call: &str) -> Result<T> {
        let url = format!("{}/rpc/{call}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("device RPC {call} failed"))?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("device RPC {call}: HTTP {status}");
        }
        resp.json::<T>()
            .await
            .with_context(|| format!("device RPC {call}: bad JSON"))
    }
}

#[derive(Debug, Deserialize)]
struct RawSwitchStatus {
    output: bool,
    #[serde(default)]
    apower: Option<f64>,
    #[serde(default)]
    aenergy: Option<RawEnergy>,
}

#[derive(Debug, Deserialize)]
struct RawEnergy {
    total: f64,
}

#[derive(Debug, Deserialize)]
struct RawInputStatus {
    state: bool,
}

#[derive(Debug, Deserialize)]
struct RawTempStatus {
    #[serde(rename = "tC")]
    t_c: f64,
}

#[async_trait]
impl DeviceClient for ShellyClient {
    /// Poll switches then inputs in channel order until one is missing.
    async fn get_status(&self) -> Result<DeviceStatus> {
        let mut relays = Vec::new();
        for id in 0..8u8 {
            match self
                .rpc::<RawSwitchStatus>(&format!("Switch.GetStatus?id={id}"))
                .await
            {
                Ok(s) => relays.push(s.output),
                Err(_) if id > 0 => break,
                Err(e) => return Err(e),
            }
        }
        let mut inputs = Vec::new();
        for id in 0..8u8 {
            match self
                .rpc::<RawInputStatus>(&format!("Input.GetStatus?id={id}"))
                .await
            {
                Ok(s) => inputs.push(s.state),
                Err(_) => break,
            }
        }
        Ok(DeviceStatus { relays, inputs })
    }

    async fn set_output(&self, index: u8, on: bool) -> Result<()> {
        let _: serde_json::Value = self
            .rpc(&format!("Switch.Set?id={index}&on={on}"))
            .await?;
        Ok(())
    }

    async fn read_meter(&self, index: u8) -> Result<MeterReading> {
        let s: RawSwitchStatus = self
            .rpc(&format!("Switch.GetStatus?id={index}"))
            .await?;
        Ok(MeterReading {
            power_w: s.apower.unwrap_or(0.0),
            energy_wh: s.aenergy.map(|e| e.total),
            at: Utc::now(),
        })
    }

    async fn read_temp(&self, probe_id: u32) -> Result<f64> {
        let s: RawTempStatus = self
            .rpc(&format!("Temperature.GetStatus?id={probe_id}"))
            .await?;
        Ok(s.t_c)
    }
}
