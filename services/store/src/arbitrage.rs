//! Temporal arbitrage monitor.
//!
//! Temporal backends offer free capacity during promotional windows. Each
//! cycle the monitor recomputes how much of every rotation's free ceiling is
//! in use, and while a window is open, materially discounted, and below the
//! safety buffer, moves warm and cold objects onto it. Migration itself is
//! copy, verify, swap, delete (see [`TieredStore::migrate`]).

use crate::codec::short_id;
use crate::config::{ArbitrageConfig, RotationConfig};
use crate::layers::Layer;
use crate::metadata::{PromoWindow, StoredObject};
use crate::store::{StoreError, TieredStore};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Free-tier state of one temporal backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRotation {
    pub provider: String,
    pub free_ceiling_bytes: u64,
    pub used_bytes: u64,
    pub window: PromoWindow,
}

impl ProviderRotation {
    pub fn from_config(config: &RotationConfig) -> Self {
        Self {
            provider: config.provider.clone(),
            free_ceiling_bytes: config.free_ceiling_bytes,
            used_bytes: 0,
            window: PromoWindow {
                start: config.promo_start,
                end: config.promo_end,
                discount: config.discount,
            },
        }
    }

    /// Bytes that may still be placed before the safety buffer is reached.
    pub fn headroom(&self, config: &ArbitrageConfig) -> u64 {
        let limit = (self.free_ceiling_bytes as f64 * config.safety_buffer) as u64;
        limit.saturating_sub(self.used_bytes)
    }

    pub fn is_eligible(&self, now: DateTime<Utc>, config: &ArbitrageConfig) -> bool {
        self.window.contains(now) && self.window.discount > config.min_discount && self.headroom(config) > 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArbitrageReport {
    pub eligible_rotations: usize,
    pub planned: usize,
    pub migrated: usize,
    pub declined: usize,
    pub failed: usize,
}

/// Bytes of `object` held on `provider`, counting any copy of a chunk.
fn bytes_on(object: &StoredObject, provider: &str) -> u64 {
    object
        .chunks
        .iter()
        .filter(|c| c.provider == provider || c.shards.iter().any(|s| s.provider == provider))
        .map(|c| c.size)
        .sum()
}

fn is_candidate(object: &StoredObject, now: DateTime<Utc>) -> bool {
    matches!(object.layer, Layer::Warm | Layer::Cold) && object.temporal_provider.is_none() && !object.is_expired(now)
}

pub struct ArbitrageMonitor {
    store: Arc<TieredStore>,
    config: ArbitrageConfig,
    rotations: Mutex<Vec<ProviderRotation>>,
}

impl ArbitrageMonitor {
    pub fn new(store: Arc<TieredStore>, config: ArbitrageConfig, rotations: &[RotationConfig]) -> Self {
        Self {
            store,
            config,
            rotations: Mutex::new(rotations.iter().map(ProviderRotation::from_config).collect()),
        }
    }

    /// Current rotation state, as of the last cycle.
    pub fn rotations(&self) -> Vec<ProviderRotation> {
        self.rotations.lock().clone()
    }

    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<ArbitrageReport, StoreError> {
        let objects = self.store.metadata().list().await?;

        let mut rotations = self.rotations();
        for rotation in &mut rotations {
            rotation.used_bytes = objects.iter().map(|o| bytes_on(o, &rotation.provider)).sum();
        }

        // Coldest first: they gain the most from cheap capacity and lose the least from latency
        let mut candidates: Vec<&StoredObject> = objects.iter().filter(|o| is_candidate(o, now)).collect();
        candidates.sort_by(|a, b| {
            a.temperature_score
                .total_cmp(&b.temperature_score)
                .then_with(|| a.created.cmp(&b.created))
        });

        let mut report = ArbitrageReport::default();
        let mut planned: Vec<(String, String, u64, PromoWindow)> = Vec::new();
        let mut taken = HashSet::new();

        for rotation in rotations.iter().filter(|r| r.is_eligible(now, &self.config)) {
            report.eligible_rotations += 1;
            let mut headroom = rotation.headroom(&self.config);

            for object in &candidates {
                if planned.len() >= self.config.max_migrations_per_cycle {
                    break;
                }
                if taken.contains(object.id.as_str()) {
                    continue;
                }
                if object.encrypted_size > headroom {
                    let declined = StoreError::CapacityExceeded {
                        provider: rotation.provider.clone(),
                    };
                    debug!(
                        object_id = %short_id(&object.id),
                        size_bytes = object.encrypted_size,
                        headroom_bytes = headroom,
                        reason = %declined,
                        "Migration declined"
                    );
                    report.declined += 1;
                    continue;
                }

                headroom -= object.encrypted_size;
                taken.insert(object.id.as_str());
                planned.push((
                    object.id.clone(),
                    rotation.provider.clone(),
                    object.encrypted_size,
                    rotation.window.clone(),
                ));
            }
        }
        report.planned = planned.len();

        if report.declined > 0 {
            warn!(declined = report.declined, "Migrations declined to stay under free ceilings");
            metrics::counter!("store.migrations.declined").increment(report.declined as u64);
        }

        let migrations: Vec<_> = planned
            .into_iter()
            .map(|(id, provider, size, window)| self.migrate_one(id, provider, size, window))
            .collect();
        let outcomes: Vec<(String, u64, Result<bool, StoreError>)> = stream::iter(migrations)
            .buffer_unordered(self.config.migration_concurrency.max(1))
            .collect()
            .await;

        for (provider, size, result) in outcomes {
            match result {
                Ok(true) => {
                    report.migrated += 1;
                    if let Some(rotation) = rotations.iter_mut().find(|r| r.provider == provider) {
                        rotation.used_bytes += size;
                    }
                }
                Ok(false) => {}
                Err(_) => report.failed += 1,
            }
        }

        metrics::counter!("store.migrations.completed").increment(report.migrated as u64);
        metrics::counter!("store.migrations.failed").increment(report.failed as u64);

        *self.rotations.lock() = rotations;

        if report.planned > 0 || report.declined > 0 {
            info!(?report, "Arbitrage cycle completed");
        }
        Ok(report)
    }

    async fn migrate_one(
        &self,
        id: String,
        provider: String,
        size: u64,
        window: PromoWindow,
    ) -> (String, u64, Result<bool, StoreError>) {
        let result = self.store.migrate(&id, &provider, Some(window)).await;
        if let Err(e) = &result {
            warn!(object_id = %short_id(&id), provider = %provider, error = %e, "Migration failed");
        }
        (provider, size, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LayerConfig, StoreConfig};
    use crate::crypto::StaticSecretProvider;
    use crate::metadata::InMemoryMetadataStore;
    use crate::provider::{MemoryProvider, ProviderRegistry};
    use crate::store::StoreOptions;
    use chrono::Duration;

    fn rotation_config(ceiling: u64, discount: f64) -> RotationConfig {
        RotationConfig {
            provider: "promo".to_string(),
            free_ceiling_bytes: ceiling,
            promo_start: Utc::now() - Duration::hours(1),
            promo_end: Utc::now() + Duration::hours(1),
            discount,
        }
    }

    fn setup() -> (Arc<TieredStore>, Arc<MemoryProvider>, Arc<MemoryProvider>) {
        let warm = Arc::new(MemoryProvider::new("warm"));
        let promo = Arc::new(MemoryProvider::new("promo"));
        let mut registry = ProviderRegistry::new();
        registry.register(Layer::Warm, warm.clone(), false);
        registry.register(Layer::Cold, promo.clone(), true);

        let store = Arc::new(TieredStore::new(
            StoreConfig::default(),
            LayerConfig::default(),
            Arc::new(InMemoryMetadataStore::new()),
            Arc::new(registry.with_memory_defaults()),
            Arc::new(StaticSecretProvider::new(vec![3u8; 32]).unwrap()),
        ));
        (store, warm, promo)
    }

    fn warm_options() -> StoreOptions {
        StoreOptions {
            force_layer: Some(Layer::Warm),
            ..Default::default()
        }
    }

    #[test]
    fn test_eligibility() {
        let config = ArbitrageConfig::default();
        let now = Utc::now();

        let rotation = ProviderRotation::from_config(&rotation_config(1000, 0.5));
        assert!(rotation.is_eligible(now, &config));
        assert_eq!(rotation.headroom(&config), 800);

        let small_discount = ProviderRotation::from_config(&rotation_config(1000, 0.3));
        assert!(!small_discount.is_eligible(now, &config));

        assert!(!rotation.is_eligible(now + Duration::hours(2), &config));

        let mut full = rotation.clone();
        full.used_bytes = 800;
        assert!(!full.is_eligible(now, &config));
    }

    #[tokio::test]
    async fn test_cycle_migrates_and_preserves_bytes() {
        let (store, warm, promo) = setup();
        let a = store.store("a", b"first object", warm_options()).await.unwrap();
        let b = store.store("b", b"second object", warm_options()).await.unwrap();

        let monitor = ArbitrageMonitor::new(
            store.clone(),
            ArbitrageConfig::default(),
            &[rotation_config(1024 * 1024, 0.5)],
        );
        let report = monitor.run_cycle(Utc::now()).await.unwrap();
        assert_eq!(report.eligible_rotations, 1);
        assert_eq!(report.migrated, 2);
        assert_eq!(warm.chunk_count(), 0);
        assert_eq!(promo.chunk_count(), 2);

        let rotation = &monitor.rotations()[0];
        assert_eq!(rotation.used_bytes, promo.stored_bytes());

        for (receipt, payload) in [(a, &b"first object"[..]), (b, &b"second object"[..])] {
            let obj = store.metadata().get(&receipt.id).await.unwrap().unwrap();
            assert_eq!(obj.promo_window.as_ref().map(|w| w.discount), Some(0.5));
            let got = store.retrieve(&receipt.id).await.unwrap().unwrap();
            assert_eq!(got.data.as_ref(), payload);
        }

        // Already migrated objects are left alone
        let again = monitor.run_cycle(Utc::now()).await.unwrap();
        assert_eq!(again.planned, 0);
    }

    #[tokio::test]
    async fn test_never_exceeds_ceiling() {
        let (store, warm, promo) = setup();
        let payload = vec![42u8; 4096];
        let receipt = store
            .store(
                "big",
                &payload,
                StoreOptions {
                    force_layer: Some(Layer::Warm),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let size = store.metadata().get(&receipt.id).await.unwrap().unwrap().encrypted_size;

        // Headroom is 80% of a ceiling just above the object size
        let monitor = ArbitrageMonitor::new(
            store.clone(),
            ArbitrageConfig::default(),
            &[rotation_config(size + 1, 0.5)],
        );
        let report = monitor.run_cycle(Utc::now()).await.unwrap();
        assert_eq!(report.declined, 1);
        assert_eq!(report.migrated, 0);
        assert_eq!(promo.chunk_count(), 0);
        assert_eq!(warm.chunk_count(), 1);
    }

    #[tokio::test]
    async fn test_closed_window_does_nothing() {
        let (store, warm, _promo) = setup();
        store.store("a", b"data", warm_options()).await.unwrap();

        let mut config = rotation_config(1024 * 1024, 0.5);
        config.promo_start = Utc::now() + Duration::hours(1);
        config.promo_end = Utc::now() + Duration::hours(2);

        let monitor = ArbitrageMonitor::new(store, ArbitrageConfig::default(), &[config]);
        let report = monitor.run_cycle(Utc::now()).await.unwrap();
        assert_eq!(report, ArbitrageReport::default());
        assert_eq!(warm.chunk_count(), 1);
    }

    #[tokio::test]
    async fn test_respects_max_migrations() {
        let (store, _warm, promo) = setup();
        for i in 0..5 {
            store
                .store(&format!("k{}", i), format!("payload {}", i).as_bytes(), warm_options())
                .await
                .unwrap();
        }

        let config = ArbitrageConfig {
            max_migrations_per_cycle: 2,
            ..Default::default()
        };
        let monitor = ArbitrageMonitor::new(store, config, &[rotation_config(1024 * 1024, 0.5)]);
        let report = monitor.run_cycle(Utc::now()).await.unwrap();
        assert_eq!(report.migrated, 2);
        assert_eq!(promo.chunk_count(), 2);
    }
}
