//! UPS health polling. Each configured UPS gets a runner task that
//! executes its monitoring script on an interval, parses the JSON it
//! prints, and reports health to the control loop. Script failure of any
//! kind degrades health to unknown rather than unhealthy.

use anyhow::{Context, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::UpsUnitConfig;
use crate::domain::{UpsHealth, UpsReading};

pub struct UpsRunner {
    unit: UpsUnitConfig,
    script_timeout: Duration,
    health_tx: mpsc::Sender<UpsHealth>,
}

impl UpsRunner {
    pub fn new(
        unit: UpsUnitConfig,
        script_timeout_secs: u64,
        health_tx: mpsc::Sender<UpsHealth>,
    ) -> Self {
        Self {
            unit,
            script_timeout: Duration::from_secs(script_timeout_secs),
            health_tx,
        }
    }

    pub fn spawn(self, cancel: CancellationToken) {
        tokio::spawn(self.run(cancel));
    }

    async fn run(self, cancel: CancellationToken) {
        let mut ticker = interval(Duration::from_secs(self.unit.interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(ups = %self.unit.name, "ups runner stopping");
                    return;
                }
                _ = ticker.tick() => {
                    let health = self.poll().await;
                    if self.health_tx.send(health).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn poll(&self) -> UpsHealth {
        match self.run_script().await {
            Ok(reading) => {
                UpsHealth::from_reading(self.unit.name.clone(), reading, self.unit.thresholds())
            }
            Err(e) => {
                warn!(ups = %self.unit.name, error = %e, "ups script failed, health unknown");
                UpsHealth::unknown(self.unit.name.clone())
            }
        }
    }

    async fn run_script(&self) -> Result<UpsReading> {
        let child = Command::new(&self.unit.script)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = timeout(self.script_timeout, child)
            .await
            .context("ups script timed out")?
            .context("ups script failed to start")?;

        if !output.status.success() {
            anyhow::bail!("ups script exited with {}", output.status);
        }
        let reading: UpsReading =
            serde_json::from_slice(&output.stdout).context("ups script output is not valid JSON")?;
        if reading.battery_charge_percent.is_none() && reading.battery_runtime_seconds.is_none() {
            anyhow::bail!("ups script reported neither charge nor runtime");
        }
        Ok(reading)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::HealthVerdict;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn script(dir: &tempfile::TempDir, body: &str) -> std::path::PathBuf {
        let path = dir.path().join("ups.sh");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh\n{body}").unwrap();
        let mut perms = f.metadata().unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn runner(script_path: std::path::PathBuf) -> (UpsRunner, mpsc::Receiver<UpsHealth>) {
        let (tx, rx) = mpsc::channel(4);
        let unit = UpsUnitConfig {
            name: "rack".into(),
            script: script_path,
            interval_secs: 60,
            min_charge_percent: 10.0,
            min_runtime_seconds: 300,
        };
        (UpsRunner::new(unit, 5, tx), rx)
    }

    #[tokio::test]
    async fn healthy_reading_from_script() {
        let dir = tempdir().unwrap();
        let path = script(
            &dir,
            r#"echo '{"timestamp":"2025-06-02T08:00:00Z","battery_state":"charging","battery_charge_percent":95.0,"battery_runtime_seconds":3600}'"#,
        );
        let (runner, _rx) = runner(path);
        let health = runner.poll().await;
        assert_eq!(health.verdict, HealthVerdict::Healthy);
    }

    #[tokio::test]
    async fn discharging_below_threshold_is_unhealthy() {
        let dir = tempdir().unwrap();
        let path = script(
            &dir,
            r#"echo '{"timestamp":"2025-06-02T08:00:00Z","battery_state":"discharging","battery_charge_percent":8.0,"battery_runtime_seconds":3600}'"#,
        );
        let (runner, _rx) = runner(path);
        let health = runner.poll().await;
        assert_eq!(health.verdict, HealthVerdict::Unhealthy);
    }

    #[tokio::test]
    async fn nonzero_exit_is_unknown() {
        let dir = tempdir().unwrap();
        let path = script(&dir, "exit 3");
        let (runner, _rx) = runner(path);
        let health = runner.poll().await;
        assert_eq!(health.verdict, HealthVerdict::Unknown);
    }

    #[tokio::test]
    async fn malformed_output_is_unknown() {
        let dir = tempdir().unwrap();
        let path = script(&dir, "echo not-json");
        let (runner, _rx) = runner(path);
        let health = runner.poll().await;
        assert_eq!(health.verdict, HealthVerdict::Unknown);
    }

    #[tokio::test]
    async fn missing_both_figures_is_unknown() {
        let dir = tempdir().unwrap();
        let path = script(
            &dir,
            r#"echo '{"timestamp":"2025-06-02T08:00:00Z","battery_state":"charged","battery_charge_percent":null,"battery_runtime_seconds":null}'"#,
        );
        let (runner, _rx) = runner(path);
        let health = runner.poll().await;
        assert_eq!(health.verdict, HealthVerdict::Unknown);
    }
}
