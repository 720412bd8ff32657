//! Background scheduling.
//!
//! Four loops run on their own intervals: predictor, arbitrage, expiry, and
//! stats. Every cycle runs in a spawned task so a panic is caught as a
//! `JoinError`, logged, and the loop keeps ticking. Nothing here ever reaches
//! a foreground caller.

use crate::arbitrage::ArbitrageMonitor;
use crate::config::Config;
use crate::predictor::AccessPredictor;
use crate::store::{StoreError, TieredStore};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Interval of each background loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    pub predictor: Duration,
    pub arbitrage: Duration,
    pub expiry: Duration,
    pub stats: Duration,
}

impl Schedule {
    pub fn from_config(config: &Config) -> Self {
        Self {
            predictor: Duration::from_secs(config.predictor.interval_secs),
            arbitrage: Duration::from_secs(config.arbitrage.interval_secs),
            expiry: Duration::from_secs(config.maintenance.expiry_interval_secs),
            stats: Duration::from_secs(config.maintenance.stats_interval_secs),
        }
    }
}

/// Handle on the running loops.
pub struct Scheduler {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn start(
        store: Arc<TieredStore>,
        predictor: AccessPredictor,
        arbitrage: ArbitrageMonitor,
        schedule: Schedule,
    ) -> Self {
        let cancel = CancellationToken::new();
        let predictor = Arc::new(predictor);
        let arbitrage = Arc::new(arbitrage);

        let handles = vec![
            spawn_loop("predictor", schedule.predictor, cancel.clone(), move || {
                let predictor = predictor.clone();
                async move { predictor.run_cycle(Utc::now()).await.map(|_| ()) }
            }),
            spawn_loop("arbitrage", schedule.arbitrage, cancel.clone(), move || {
                let arbitrage = arbitrage.clone();
                async move { arbitrage.run_cycle(Utc::now()).await.map(|_| ()) }
            }),
            spawn_loop("expiry", schedule.expiry, cancel.clone(), {
                let store = store.clone();
                move || {
                    let store = store.clone();
                    async move { store.expire(Utc::now()).await.map(|_| ()) }
                }
            }),
            spawn_loop("stats", schedule.stats, cancel.clone(), move || {
                let store = store.clone();
                async move { record_stats(&store).await }
            }),
        ];

        info!(?schedule, "Background scheduler started");
        Self { cancel, handles }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop every loop and wait for in-flight cycles to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Scheduler loop ended abnormally");
            }
        }
        info!("Background scheduler stopped");
    }
}

fn spawn_loop<F, Fut>(name: &'static str, period: Duration, cancel: CancellationToken, cycle: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), StoreError>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval(period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(task = name, "Background loop shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    match tokio::spawn(cycle()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!(task = name, error = %e, "Background cycle failed"),
                        Err(e) => error!(task = name, error = %e, "Background cycle panicked"),
                    }
                }
            }
        }
    })
}

/// Publish gauges from real store measurements.
pub async fn record_stats(store: &TieredStore) -> Result<(), StoreError> {
    let stats = store.stats().await?;

    metrics::gauge!("store.hit_rate").set(stats.hit_rate);
    metrics::gauge!("store.objects.total").set(stats.total_stored as f64);
    metrics::gauge!("store.bytes.original").set(stats.total_original_bytes as f64);
    metrics::gauge!("store.bytes.stored").set(stats.total_stored_bytes as f64);
    metrics::gauge!("store.cache.bytes").set(stats.cached_bytes as f64);
    metrics::gauge!("store.cost.savings_estimate").set(stats.cost_savings_estimate);
    for (layer, count) in &stats.layer_distribution {
        metrics::gauge!("store.objects.by_layer", "layer" => layer.to_string()).set(*count as f64);
    }

    debug!(
        objects = stats.total_stored,
        hit_rate = stats.hit_rate,
        cached_bytes = stats.cached_bytes,
        "Store stats recorded"
    );
    Ok(())
}
