pub mod amber;
pub mod cache;

pub use amber::{AmberClient, PriceSource};
pub use cache::{fallback_points, PriceCache};

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Outcome of one refresh attempt, delivered to the control loop so it can
/// rebuild plans or raise a source-down alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceUpdate {
    Refreshed,
    RefreshFailed { consecutive_errors: u32, down: bool },
}

/// Periodic price refresher. Sole writer of the [`PriceCache`]; also
/// honours on-demand refresh requests from the HTTP surface.
pub struct PriceRefresher {
    source: Arc<dyn PriceSource>,
    cache: Arc<PriceCache>,
    refresh_every: Duration,
    notify: mpsc::Sender<PriceUpdate>,
    on_demand: mpsc::Receiver<()>,
}

impl PriceRefresher {
    pub fn new(
        source: Arc<dyn PriceSource>,
        cache: Arc<PriceCache>,
        refresh_every: Duration,
        notify: mpsc::Sender<PriceUpdate>,
        on_demand: mpsc::Receiver<()>,
    ) -> Self {
        Self {
            source,
            cache,
            refresh_every,
            notify,
            on_demand,
        }
    }

    /// Run until cancelled. A refresh is attempted immediately at startup
    /// so the first planning tick has data.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = interval(self.refresh_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("price refresher stopping");
                    return;
                }
                _ = ticker.tick() => self.refresh().await,
                Some(()) = self.on_demand.recv() => {
                    info!("on-demand price refresh requested");
                    self.refresh().await;
                }
            }
        }
    }

    /// One refresh pass. Idempotent: merging the same intervals twice is a
    /// no-op beyond the timestamp bump.
    pub async fn refresh(&self) {
        let now = Utc::now();
        match self.source.fetch_prices().await {
            Ok(points) => {
                let count = points.len();
                if let Err(e) = self.cache.merge(points, now) {
                    warn!(error = %e, "failed to persist price cache");
                }
                match self.source.fetch_usage().await {
                    Ok(rows) if !rows.is_empty() => {
                        if let Err(e) = self.cache.append_usage(rows, now) {
                            warn!(error = %e, "failed to persist usage rows");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "usage fetch failed"),
                }
                info!(points = count, "price refresh complete");
                let _ = self.notify.send(PriceUpdate::Refreshed).await;
            }
            Err(e) => {
                let consecutive_errors = self.cache.record_failure();
                let down = self.cache.is_down();
                warn!(error = %e, consecutive_errors, down, "price refresh failed");
                let _ = self
                    .notify
                    .send(PriceUpdate::RefreshFailed {
                        consecutive_errors,
                        down,
                    })
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{PricePoint, PriceQuality, UsageRow};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tempfile::tempdir;

    struct ScriptedSource {
        responses: Mutex<Vec<anyhow::Result<Vec<PricePoint>>>>,
    }

    #[async_trait]
    impl PriceSource for ScriptedSource {
        async fn fetch_prices(&self) -> anyhow::Result<Vec<PricePoint>> {
            self.responses
                .lock()
                .pop()
                .unwrap_or_else(|| Err(anyhow!("script exhausted")))
        }

        async fn fetch_usage(&self) -> anyhow::Result<Vec<UsageRow>> {
            Ok(Vec::new())
        }
    }

    fn refresher_with(
        responses: Vec<anyhow::Result<Vec<PricePoint>>>,
        dir: &tempfile::TempDir,
    ) -> (PriceRefresher, mpsc::Receiver<PriceUpdate>, Arc<PriceCache>) {
        let cache = Arc::new(PriceCache::open(
            dir.path().join("prices.json"),
            chrono::Duration::minutes(90),
            2,
            chrono::Duration::days(14),
        ));
        let (tx, rx) = mpsc::channel(8);
        let (_demand_tx, demand_rx) = mpsc::channel(1);
        let refresher = PriceRefresher::new(
            Arc::new(ScriptedSource {
                responses: Mutex::new(responses),
            }),
            cache.clone(),
            Duration::from_secs(300),
            tx,
            demand_rx,
        );
        (refresher, rx, cache)
    }

    #[tokio::test]
    async fn successful_refresh_notifies_and_merges() {
        let dir = tempdir().unwrap();
        let point = PricePoint {
            start: Utc::now(),
            channel: "general".into(),
            per_kwh: 22.0,
            quality: PriceQuality::Current,
        };
        let (refresher, mut rx, cache) = refresher_with(vec![Ok(vec![point])], &dir);

        refresher.refresh().await;
        assert_eq!(rx.recv().await, Some(PriceUpdate::Refreshed));
        assert!(!cache.is_down());
        assert!(cache.last_success().is_some());
    }

    #[tokio::test]
    async fn repeated_failures_declare_down() {
        let dir = tempdir().unwrap();
        let (refresher, mut rx, cache) =
            refresher_with(vec![Err(anyhow!("boom")), Err(anyhow!("boom"))], &dir);

        refresher.refresh().await;
        assert_eq!(
            rx.recv().await,
            Some(PriceUpdate::RefreshFailed {
                consecutive_errors: 1,
                down: false
            })
        );

        refresher.refresh().await;
        assert_eq!(
            rx.recv().await,
            Some(PriceUpdate::RefreshFailed {
                consecutive_errors: 2,
                down: true
            })
        );
        assert!(cache.is_down());
    }
}
