//! Access-pattern predictor.
//!
//! Scores every object's temperature from its access history, persists the
//! score and predicted next access, and pre-warms the hottest uncached
//! objects into the hot cache. Scores are advisory; nothing on the
//! foreground path reads them.

use crate::codec::short_id;
use crate::config::PredictorConfig;
use crate::metadata::StoredObject;
use crate::store::{StoreError, TieredStore};
use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

const RECENCY_WEIGHT: f64 = 0.7;
const FREQUENCY_WEIGHT: f64 = 0.3;

/// Score computed for one object in one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub id: String,
    pub temperature: f64,
    pub predicted_next_access: Option<DateTime<Utc>>,
}

/// Outcome of one predictor cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub scored: usize,
    pub candidates: usize,
    pub prewarmed: usize,
    pub failed: usize,
}

/// `1 - elapsed / mean interval`, clamped to [0, 1]. Objects with fewer than
/// two recorded accesses use `default_interval`.
pub fn recency(object: &StoredObject, now: DateTime<Utc>, default_interval: Duration) -> f64 {
    let interval = object
        .mean_access_interval()
        .filter(|d| *d > Duration::zero())
        .unwrap_or(default_interval);
    let interval_ms = interval.num_milliseconds().max(1) as f64;
    let elapsed_ms = (now - object.last_accessed).num_milliseconds().max(0) as f64;
    (1.0 - elapsed_ms / interval_ms).clamp(0.0, 1.0)
}

pub fn frequency(object: &StoredObject, saturation: u64) -> f64 {
    (object.access_count as f64 / saturation.max(1) as f64).min(1.0)
}

pub fn temperature(object: &StoredObject, now: DateTime<Utc>, config: &PredictorConfig) -> f64 {
    let default_interval = Duration::seconds(config.default_interval_secs as i64);
    let score = RECENCY_WEIGHT * recency(object, now, default_interval)
        + FREQUENCY_WEIGHT * frequency(object, config.frequency_saturation);
    score.clamp(0.0, 1.0)
}

pub fn predict(object: &StoredObject, now: DateTime<Utc>, config: &PredictorConfig) -> Prediction {
    Prediction {
        id: object.id.clone(),
        temperature: temperature(object, now, config),
        predicted_next_access: object
            .mean_access_interval()
            .and_then(|interval| object.last_accessed.checked_add_signed(interval)),
    }
}

/// Hottest objects above the threshold that are not cached yet, hottest first.
pub fn rank_candidates<F>(predictions: &[Prediction], config: &PredictorConfig, is_cached: F) -> Vec<String>
where
    F: Fn(&str) -> bool,
{
    let mut hot: Vec<&Prediction> = predictions
        .iter()
        .filter(|p| p.temperature > config.hot_threshold && !is_cached(&p.id))
        .collect();
    hot.sort_by(|a, b| b.temperature.total_cmp(&a.temperature).then_with(|| a.id.cmp(&b.id)));
    hot.into_iter().take(config.top_n).map(|p| p.id.clone()).collect()
}

pub struct AccessPredictor {
    store: Arc<TieredStore>,
    config: PredictorConfig,
}

impl AccessPredictor {
    pub fn new(store: Arc<TieredStore>, config: PredictorConfig) -> Self {
        Self { store, config }
    }

    /// Score all objects and pre-warm the top candidates. Per-object failures
    /// are logged and counted, never returned.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<CycleReport, StoreError> {
        let metadata = self.store.metadata();
        let objects = metadata.list().await?;

        let predictions: Vec<Prediction> = objects.iter().map(|o| predict(o, now, &self.config)).collect();
        for p in &predictions {
            if let Err(e) = metadata
                .update_prediction(&p.id, p.temperature, p.predicted_next_access)
                .await
            {
                warn!(object_id = %short_id(&p.id), error = %e, "Failed to persist prediction");
            }
        }

        let cache = self.store.cache();
        let candidates = rank_candidates(&predictions, &self.config, |id| cache.contains(id));

        let prewarms: Vec<_> = candidates.iter().map(|id| self.prewarm_one(id)).collect();
        let outcomes: Vec<Result<bool, StoreError>> = stream::iter(prewarms)
            .buffer_unordered(self.config.prewarm_concurrency.max(1))
            .collect()
            .await;

        let prewarmed = outcomes.iter().filter(|r| matches!(r, Ok(true))).count();
        let failed = outcomes.iter().filter(|r| r.is_err()).count();
        metrics::counter!("store.prewarm.completed").increment(prewarmed as u64);
        metrics::counter!("store.prewarm.failed").increment(failed as u64);

        let report = CycleReport {
            scored: predictions.len(),
            candidates: candidates.len(),
            prewarmed,
            failed,
        };
        if report.candidates > 0 {
            info!(?report, "Predictor cycle completed");
        } else {
            debug!(scored = report.scored, "Predictor cycle completed, nothing to pre-warm");
        }
        Ok(report)
    }

    async fn prewarm_one(&self, id: &str) -> Result<bool, StoreError> {
        let result = self.store.prewarm(id).await;
        if let Err(e) = &result {
            warn!(object_id = %short_id(id), error = %e, "Pre-warm failed");
        }
        result
    }
}
