//! Sequence runner: executes ordered turn-on/turn-off recipes against the
//! device workers. Each run is a spawned task; the owning controller stays
//! in TURNING_ON/OFF until the outcome event arrives.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::{DeviceChannel, Sequence, SequenceStep};
use crate::hardware::{DeviceHandle, DeviceRequest, RelayCommand};

/// Result of one sequence run, delivered to the control loop.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceOutcome {
    /// The output whose controller owns this run.
    pub output: String,
    pub sequence: String,
    /// Correlation id the owning machine is waiting on.
    pub correlation_id: Uuid,
    /// Whether the run was a turn-on.
    pub turn_on: bool,
    pub ok: bool,
    pub error: Option<String>,
}

/// Static context a run needs: worker handles and the relay channel for
/// every output a step may name.
#[derive(Debug, Clone)]
pub struct SequenceContext {
    pub devices: HashMap<String, DeviceHandle>,
    pub relays: HashMap<String, DeviceChannel>,
}

/// Spawn a sequence run. The overall timeout covers every step including
/// sleeps; on breach the remaining steps are cancelled and the run fails.
pub fn spawn_sequence(
    ctx: SequenceContext,
    sequence: Sequence,
    output: String,
    correlation_id: Uuid,
    turn_on: bool,
    results: mpsc::Sender<SequenceOutcome>,
) {
    tokio::spawn(async move {
        let budget = Duration::from_secs(sequence.timeout_secs);
        let name = sequence.name.clone();
        let run = execute_steps(&ctx, &sequence);
        let (ok, error) = match timeout(budget, run).await {
            Ok(Ok(())) => (true, None),
            Ok(Err(e)) => (false, Some(e)),
            Err(_) => (
                false,
                Some(format!("sequence timed out after {}s", sequence.timeout_secs)),
            ),
        };
        if let Some(e) = &error {
            warn!(sequence = %name, output = %output, error = %e, "sequence failed");
        }
        let _ = results
            .send(SequenceOutcome {
                output,
                sequence: name,
                correlation_id,
                turn_on,
                ok,
                error,
            })
            .await;
    });
}

async fn execute_steps(ctx: &SequenceContext, sequence: &Sequence) -> Result<(), String> {
    for (i, step) in sequence.steps.iter().enumerate() {
        match step {
            SequenceStep::ChangeOutput {
                output,
                turn_on,
                retries,
                retry_backoff_secs,
            } => {
                let channel = ctx
                    .relays
                    .get(output)
                    .ok_or_else(|| format!("step {i}: output {output:?} has no relay"))?;
                let handle = ctx
                    .devices
                    .get(&channel.device)
                    .ok_or_else(|| format!("step {i}: no worker for device {:?}", channel.device))?;
                change_output(handle, channel.index, *turn_on, *retries, *retry_backoff_secs)
                    .await
                    .map_err(|e| format!("step {i}: {e}"))?;
            }
            SequenceStep::Sleep { seconds } => {
                debug!(sequence = %sequence.name, seconds, "sequence sleep");
                sleep(Duration::from_secs(*seconds)).await;
            }
            SequenceStep::RefreshStatus { device } => {
                let handle = ctx
                    .devices
                    .get(device)
                    .ok_or_else(|| format!("step {i}: no worker for device {device:?}"))?;
                handle.send(DeviceRequest::RefreshStatus);
            }
            SequenceStep::GetLocation { device } => {
                // Location polls go to an external integration; from the
                // sequence's point of view they are fire-and-forget.
                debug!(sequence = %sequence.name, device = %device, "location poll requested");
            }
        }
    }
    Ok(())
}

/// One relay step with per-step fixed-backoff retries, acknowledged by the
/// device worker through a oneshot.
async fn change_output(
    handle: &DeviceHandle,
    relay: u8,
    turn_on: bool,
    retries: u32,
    backoff_secs: u64,
) -> Result<(), String> {
    let mut last_err = String::from("no attempts made");
    for attempt in 0..=retries {
        let (tx, rx) = oneshot::channel();
        handle.send(DeviceRequest::SetRelay {
            command: RelayCommand {
                correlation_id: Uuid::new_v4(),
                relay,
                turn_on,
            },
            reply: Some(tx),
        });
        match rx.await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => last_err = e,
            Err(_) => last_err = "device worker dropped the request".to_string(),
        }
        if attempt < retries {
            sleep(Duration::from_secs(backoff_secs)).await;
        }
    }
    Err(last_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShellyDeviceConfig;
    use crate::hardware::{DeviceWorker, SimulatedDevice};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn device_config(name: &str) -> ShellyDeviceConfig {
        ShellyDeviceConfig {
            name: name.into(),
            host: "127.0.0.1".into(),
            response_timeout_secs: 1,
            retry_count: 0,
            retry_delay_secs: 0,
            max_concurrent_errors: 10,
            meter_staleness_secs: 10,
        }
    }

    struct Rig {
        device: Arc<SimulatedDevice>,
        ctx: SequenceContext,
        results_rx: mpsc::Receiver<SequenceOutcome>,
        results_tx: mpsc::Sender<SequenceOutcome>,
        cancel: CancellationToken,
    }

    fn rig() -> Rig {
        let device = Arc::new(SimulatedDevice::new(2, 0));
        let (events_tx, _events_rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();
        let handle = DeviceWorker::spawn(
            &device_config("shed"),
            device.clone(),
            events_tx,
            cancel.clone(),
        );
        let ctx = SequenceContext {
            devices: HashMap::from([("shed".to_string(), handle)]),
            relays: HashMap::from([
                (
                    "heater".to_string(),
                    DeviceChannel {
                        device: "shed".into(),
                        index: 0,
                    },
                ),
                (
                    "pump".to_string(),
                    DeviceChannel {
                        device: "shed".into(),
                        index: 1,
                    },
                ),
            ]),
        };
        let (results_tx, results_rx) = mpsc::channel(4);
        Rig {
            device,
            ctx,
            results_rx,
            results_tx,
            cancel,
        }
    }

    fn change(output: &str, turn_on: bool) -> SequenceStep {
        SequenceStep::ChangeOutput {
            output: output.into(),
            turn_on,
            retries: 1,
            retry_backoff_secs: 0,
        }
    }

    #[tokio::test]
    async fn runs_steps_in_order() {
        let rig = rig();
        let sequence = Sequence {
            name: "boot".into(),
            timeout_secs: 10,
            steps: vec![change("pump", true), change("heater", true)],
        };
        let id = Uuid::new_v4();
        spawn_sequence(
            rig.ctx.clone(),
            sequence,
            "heater".into(),
            id,
            true,
            rig.results_tx.clone(),
        );

        let mut rx = rig.results_rx;
        let outcome = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.ok);
        assert_eq!(outcome.correlation_id, id);
        assert!(rig.device.relay(0));
        assert!(rig.device.relay(1));
        rig.cancel.cancel();
    }

    #[tokio::test]
    async fn step_retry_recovers_single_failure() {
        let rig = rig();
        rig.device.fail_next(1);
        let sequence = Sequence {
            name: "boot".into(),
            timeout_secs: 10,
            steps: vec![change("pump", true)],
        };
        spawn_sequence(
            rig.ctx.clone(),
            sequence,
            "pump".into(),
            Uuid::new_v4(),
            true,
            rig.results_tx.clone(),
        );

        let mut rx = rig.results_rx;
        let outcome = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.ok);
        assert!(rig.device.relay(1));
        rig.cancel.cancel();
    }

    #[tokio::test]
    async fn timeout_cancels_remaining_steps() {
        let rig = rig();
        let sequence = Sequence {
            name: "slow".into(),
            timeout_secs: 1,
            steps: vec![
                change("pump", true),
                SequenceStep::Sleep { seconds: 60 },
                change("heater", true),
            ],
        };
        spawn_sequence(
            rig.ctx.clone(),
            sequence,
            "heater".into(),
            Uuid::new_v4(),
            true,
            rig.results_tx.clone(),
        );

        let mut rx = rig.results_rx;
        let outcome = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!outcome.ok);
        assert!(outcome.error.unwrap().contains("timed out"));
        // First step landed, the step after the sleep never ran.
        assert!(rig.device.relay(1));
        assert!(!rig.device.relay(0));
        rig.cancel.cancel();
    }

    #[tokio::test]
    async fn exhausted_step_retries_fail_the_sequence() {
        let rig = rig();
        rig.device.fail_next(10);
        let sequence = Sequence {
            name: "boot".into(),
            timeout_secs: 10,
            steps: vec![change("pump", true)],
        };
        spawn_sequence(
            rig.ctx.clone(),
            sequence,
            "pump".into(),
            Uuid::new_v4(),
            true,
            rig.results_tx.clone(),
        );

        let mut rx = rig.results_rx;
        let outcome = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!outcome.ok);
        rig.cancel.cancel();
    }
}
