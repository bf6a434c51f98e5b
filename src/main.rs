use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use power_controller::{api, config::Settings, controller, telemetry};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config/power-controller.yaml"));

    let settings = Settings::load(&config_path)?;
    let registry = Arc::new(
        settings
            .resolve()
            .context("configuration resolution failed")?,
    );

    let addr = registry.website.socket_addr()?;
    let runtime = controller::start(registry.clone())?;
    let app = api::router(runtime.app.clone());

    info!(%addr, outputs = registry.outputs.len(), "starting power controller");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(telemetry::shutdown_signal())
        .await?;

    // HTTP is down; drain the control loop, then the workers.
    runtime.loop_cancel.cancel();
    if let Err(e) = runtime.loop_handle.await {
        warn!(error = %e, "control loop join failed");
    }
    runtime.worker_cancel.cancel();

    warn!("shutdown complete");
    Ok(())
}
