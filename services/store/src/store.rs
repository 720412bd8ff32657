//! The tiered store service.
//!
//! One long-lived [`TieredStore`] owns the cache, the hit-rate estimate, and
//! handles to metadata and providers. It is built once at startup and shared
//! behind an `Arc` by the API and the background loops.

use crate::cache::HotCache;
use crate::codec::{self, compression_ratio, content_id, short_id};
use crate::config::{LayerConfig, StoreConfig};
use crate::crypto::{self, CryptoParams, MasterSecretProvider};
use crate::distributor::{ChunkError, Distributor};
use crate::layers::{baseline_cost_for, Layer, LayerSelector, Priority, RoutingAdvisor, ThresholdAdvisor};
use crate::metadata::{ChunkSwap, MetadataError, MetadataStore, PromoWindow, StoredObject};
use crate::provider::ProviderRegistry;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Reads that race a migration or replacement follow the record this often
const FETCH_ATTEMPTS: usize = 3;

/// Errors surfaced by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Deduplication lookup failed: {0}")]
    DeduplicationLookupFailed(String),

    #[error("Compression failed: {0}")]
    CompressionFailed(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Storage write to layer {layer} failed on provider {provider}: {message}")]
    StorageWriteFailed {
        layer: Layer,
        provider: String,
        message: String,
    },

    #[error("Integrity violation in object {object} (chunk {chunk:?})")]
    IntegrityViolation { object: String, chunk: Option<u32> },

    #[error("Storage read failed on provider {provider}: {message}")]
    StorageReadFailed { provider: String, message: String },

    #[error("Capacity exceeded on provider {provider}")]
    CapacityExceeded { provider: String },

    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),
}

impl StoreError {
    fn from_write(layer: Layer, err: ChunkError) -> Self {
        let provider = match &err {
            ChunkError::Write { source, .. } => source.provider().to_string(),
            _ => "none".to_string(),
        };
        Self::StorageWriteFailed {
            layer,
            provider,
            message: err.to_string(),
        }
    }

    fn from_read(object: &str, err: ChunkError) -> Self {
        match err {
            ChunkError::Integrity { index } => Self::IntegrityViolation {
                object: object.to_string(),
                chunk: Some(index),
            },
            ChunkError::Read { source, .. } => Self::StorageReadFailed {
                provider: source.provider().to_string(),
                message: source.to_string(),
            },
            other => Self::StorageReadFailed {
                provider: "none".to_string(),
                message: other.to_string(),
            },
        }
    }
}

/// Per-call store options.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub ttl: Option<Duration>,
    pub force_layer: Option<Layer>,
    pub priority: Priority,
    pub deduplication: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            ttl: None,
            force_layer: None,
            priority: Priority::default(),
            deduplication: true,
        }
    }
}

/// Result of a store call.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreReceipt {
    pub id: String,
    pub layer: Layer,
    /// Monthly cost of the stored bytes at the layer's price; 0 on a dedup hit
    pub cost: f64,
    pub latency: Duration,
}

/// Result of a retrieve call.
#[derive(Debug, Clone)]
pub struct Retrieved {
    pub data: Bytes,
    /// Layer served from; cache hits report [`Layer::Lightning`]
    pub layer: Layer,
    pub latency: Duration,
    pub hit_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreStats {
    pub hit_rate: f64,
    pub total_stored: u64,
    pub total_original_bytes: u64,
    pub total_stored_bytes: u64,
    /// Object count per layer number
    pub layer_distribution: BTreeMap<u8, u64>,
    pub cost_savings_estimate: f64,
    pub cached_bytes: u64,
    pub cached_objects: u64,
}

pub struct TieredStore {
    config: StoreConfig,
    layers: LayerConfig,
    selector: LayerSelector,
    cache: HotCache,
    metadata: Arc<dyn MetadataStore>,
    distributor: Distributor,
    secrets: Arc<dyn MasterSecretProvider>,
    hit_rate: Mutex<f64>,
}

impl TieredStore {
    pub fn new(
        config: StoreConfig,
        layers: LayerConfig,
        metadata: Arc<dyn MetadataStore>,
        registry: Arc<ProviderRegistry>,
        secrets: Arc<dyn MasterSecretProvider>,
    ) -> Self {
        let cache = HotCache::new(config.cache_capacity_bytes, config.cache_object_fraction);
        let distributor = Distributor::new(
            registry,
            config.provider_timeout(),
            config.dispatch_concurrency,
            layers.archive_replicas,
        );
        let selector = LayerSelector::new(layers.clone(), Arc::new(ThresholdAdvisor));

        Self {
            config,
            layers,
            selector,
            cache,
            metadata,
            distributor,
            secrets,
            hit_rate: Mutex::new(0.0),
        }
    }

    /// Replace the routing advisor used for layer selection.
    pub fn with_advisor(mut self, advisor: Arc<dyn RoutingAdvisor>) -> Self {
        self.selector = LayerSelector::new(self.layers.clone(), advisor);
        self
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        self.distributor.registry()
    }

    pub fn cache(&self) -> &HotCache {
        &self.cache
    }

    pub fn hit_rate(&self) -> f64 {
        *self.hit_rate.lock()
    }

    fn observe_hit(&self, hit: bool) -> f64 {
        let weight = self.config.hit_rate_weight;
        let target = if hit { 1.0 } else { 0.0 };
        let mut rate = self.hit_rate.lock();
        *rate = *rate * (1.0 - weight) + target * weight;
        *rate
    }

    /// Store a payload under `key`.
    ///
    /// Content-addressed: storing bytes that already exist returns the existing
    /// id and layer at zero cost. Nothing is committed unless every chunk lands.
    #[instrument(skip(self, key, payload, options), fields(key = %key, size_bytes = payload.len()))]
    pub async fn store(&self, key: &str, payload: &[u8], options: StoreOptions) -> Result<StoreReceipt, StoreError> {
        let start = Instant::now();
        let now = Utc::now();
        let id = content_id(payload);

        if options.deduplication {
            match self
                .metadata
                .record_access(&id, now, self.config.access_history_limit)
                .await
            {
                // Expired but not yet swept: the sweep would take this caller's data with it
                Ok(Some(existing)) if existing.is_expired(now) => {
                    debug!(object_id = %short_id(&id), "Dedup match already expired, storing fresh");
                }
                Ok(Some(existing)) => {
                    metrics::counter!("store.objects.deduplicated").increment(1);
                    debug!(object_id = %short_id(&id), layer = existing.layer.number(), "Deduplicated store");
                    return Ok(StoreReceipt {
                        id,
                        layer: existing.layer,
                        cost: 0.0,
                        latency: start.elapsed(),
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    let err = StoreError::DeduplicationLookupFailed(e.to_string());
                    warn!(object_id = %short_id(&id), error = %err, "Proceeding with fresh store");
                }
            }
        }

        let compressed = codec::compress(payload, self.config.compression_level)
            .map_err(|e| StoreError::CompressionFailed(e.to_string()))?;
        let ratio = compression_ratio(payload.len(), compressed.len());

        let params = CryptoParams::generate();
        let secret = self
            .secrets
            .master_secret()
            .map_err(|e| StoreError::EncryptionFailed(e.to_string()))?;
        let encrypted = Bytes::from(
            crypto::encrypt(&secret, &params, &compressed).map_err(|e| StoreError::EncryptionFailed(e.to_string()))?,
        );

        let layer = self
            .selector
            .select(payload.len() as u64, options.priority, options.force_layer);

        let chunks = self
            .distributor
            .write(layer, encrypted.clone())
            .await
            .map_err(|e| StoreError::from_write(layer, e))?;

        let expires_at = options
            .ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .and_then(|ttl| now.checked_add_signed(ttl));

        let object = StoredObject {
            id: id.clone(),
            key: key.to_string(),
            original_size: payload.len() as u64,
            compressed_size: compressed.len() as u64,
            encrypted_size: encrypted.len() as u64,
            layer,
            chunks,
            access_count: 0,
            last_accessed: now,
            created: now,
            expires_at,
            checksum: codec::sha256_hex(&encrypted),
            iv: params.iv.to_vec(),
            salt: params.salt.to_vec(),
            compression_ratio: ratio,
            access_pattern: Vec::new(),
            temperature_score: 0.0,
            predicted_next_access: None,
            temporal_provider: None,
            promo_window: None,
            generation: 0,
        };

        // A replaced record (dedup off, expired match, or a concurrent store of
        // the same bytes) takes its chunks and cached bytes with it
        let replaced = match self.metadata.insert(object.clone()).await {
            Ok(replaced) => replaced,
            Err(e) => {
                self.distributor.delete(&object.chunks).await;
                return Err(e.into());
            }
        };

        if let Some(old) = replaced {
            self.cache.remove(&id);
            let failed = self.distributor.delete(&old.chunks).await;
            if failed > 0 {
                warn!(object_id = %short_id(&id), failed, "Replaced chunks not fully removed");
            }
        }

        if layer == Layer::Lightning {
            self.cache.insert(id.clone(), encrypted.clone());
        }

        let cost = layer.spec().cost_for(object.encrypted_size);
        let latency = start.elapsed();

        metrics::counter!("store.objects.stored", "layer" => layer.number().to_string()).increment(1);
        metrics::histogram!("store.store.duration_seconds").record(latency.as_secs_f64());
        info!(
            object_id = %short_id(&id),
            layer = layer.number(),
            chunks = object.chunks.len(),
            compression_ratio = ratio,
            "Object stored"
        );

        Ok(StoreReceipt {
            id,
            layer,
            cost,
            latency,
        })
    }

    /// Retrieve an object by id. `Ok(None)` means the id is unknown.
    #[instrument(skip(self, id), fields(object_id = %short_id(id)))]
    pub async fn retrieve(&self, id: &str) -> Result<Option<Retrieved>, StoreError> {
        let start = Instant::now();

        let Some(object) = self
            .metadata
            .record_access(id, Utc::now(), self.config.access_history_limit)
            .await?
        else {
            return Ok(None);
        };

        // Cached bytes from before a rewrite of the record no longer match it
        let cached = self
            .cache
            .get(id)
            .filter(|encrypted| codec::verify_checksum(encrypted, &object.checksum));
        if let Some(encrypted) = cached {
            let data = self.decode(&object, &encrypted)?;
            let hit_rate = self.observe_hit(true);
            let latency = start.elapsed();
            metrics::counter!("store.retrieve.hits").increment(1);
            metrics::histogram!("store.retrieve.duration_seconds").record(latency.as_secs_f64());
            return Ok(Some(Retrieved {
                data,
                layer: Layer::Lightning,
                latency,
                hit_rate,
            }));
        }

        let (object, encrypted) = self.fetch_current(object).await?;
        let data = self.decode(&object, &encrypted)?;

        if self.cache.is_eligible(encrypted.len() as u64) {
            self.cache.insert(id.to_string(), encrypted);
        }

        let hit_rate = self.observe_hit(false);
        let latency = start.elapsed();
        metrics::counter!("store.retrieve.misses").increment(1);
        metrics::histogram!("store.retrieve.duration_seconds").record(latency.as_secs_f64());
        debug!(layer = object.layer.number(), latency_ms = latency.as_millis() as u64, "Object reconstructed");

        Ok(Some(Retrieved {
            data,
            layer: object.layer,
            latency,
            hit_rate,
        }))
    }

    /// Fetch the bytes of `object`, following the current record if a
    /// migration or a replacement removed the chunks it points at meanwhile.
    async fn fetch_current(&self, mut object: StoredObject) -> Result<(StoredObject, Bytes), StoreError> {
        let mut attempt = 1;
        loop {
            let err = match self.fetch_verified(&object).await {
                Ok(encrypted) => return Ok((object, encrypted)),
                Err(e) => e,
            };
            if attempt >= FETCH_ATTEMPTS {
                return Err(err);
            }
            match self.metadata.get(&object.id).await? {
                Some(current) if current.generation != object.generation => {
                    debug!(
                        object_id = %short_id(&object.id),
                        generation = current.generation,
                        "Record changed during fetch, following it"
                    );
                    object = current;
                    attempt += 1;
                }
                _ => return Err(err),
            }
        }
    }

    /// Reassemble the encrypted payload from chunks, checking every chunk and
    /// the whole-object checksum.
    async fn fetch_verified(&self, object: &StoredObject) -> Result<Bytes, StoreError> {
        let encrypted = self.distributor.fetch(&object.chunks).await.map_err(|e| {
            let err = StoreError::from_read(&object.id, e);
            if matches!(err, StoreError::IntegrityViolation { .. }) {
                metrics::counter!("store.integrity.violations").increment(1);
            }
            err
        })?;

        if !codec::verify_checksum(&encrypted, &object.checksum) {
            metrics::counter!("store.integrity.violations").increment(1);
            return Err(StoreError::IntegrityViolation {
                object: object.id.clone(),
                chunk: None,
            });
        }
        Ok(encrypted)
    }

    fn decode(&self, object: &StoredObject, encrypted: &[u8]) -> Result<Bytes, StoreError> {
        let params = object
            .crypto_params()
            .map_err(|e| StoreError::DecryptionFailed(e.to_string()))?;
        let secret = self
            .secrets
            .master_secret()
            .map_err(|e| StoreError::DecryptionFailed(e.to_string()))?;
        let compressed =
            crypto::decrypt(&secret, &params, encrypted).map_err(|e| StoreError::DecryptionFailed(e.to_string()))?;
        let data = codec::decompress(&compressed).map_err(|e| StoreError::DecryptionFailed(e.to_string()))?;
        Ok(Bytes::from(data))
    }

    /// Aggregate statistics computed from the metadata records.
    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        let objects = self.metadata.list().await?;

        let mut layer_distribution: BTreeMap<u8, u64> = Layer::ALL.iter().map(|l| (l.number(), 0)).collect();
        let mut total_original_bytes = 0;
        let mut total_stored_bytes = 0;
        let mut baseline = 0.0;
        let mut actual = 0.0;

        for object in &objects {
            *layer_distribution.entry(object.layer.number()).or_default() += 1;
            total_original_bytes += object.original_size;
            total_stored_bytes += object.encrypted_size;
            baseline += baseline_cost_for(object.original_size);
            actual += object.layer.spec().cost_for(object.encrypted_size);
        }

        let usage = self.cache.usage();
        Ok(StoreStats {
            hit_rate: self.hit_rate(),
            total_stored: objects.len() as u64,
            total_original_bytes,
            total_stored_bytes,
            layer_distribution,
            cost_savings_estimate: baseline - actual,
            cached_bytes: usage.used_bytes,
            cached_objects: usage.entries as u64,
        })
    }

    /// Drop every object: chunks (best-effort), metadata, cache, hit rate.
    pub async fn reset(&self) -> Result<(), StoreError> {
        let objects = self.metadata.list().await?;
        for object in &objects {
            self.distributor.delete(&object.chunks).await;
        }
        self.metadata.clear().await?;
        self.cache.clear();
        *self.hit_rate.lock() = 0.0;
        warn!(objects = objects.len(), "Store reset");
        Ok(())
    }

    /// Load an object into the cache without counting an access.
    /// Returns false if it is unknown, already cached, or too large to cache.
    pub async fn prewarm(&self, id: &str) -> Result<bool, StoreError> {
        if self.cache.contains(id) {
            return Ok(false);
        }
        let Some(object) = self.metadata.get(id).await? else {
            return Ok(false);
        };
        if !self.cache.is_eligible(object.encrypted_size) {
            return Ok(false);
        }

        let (_, encrypted) = self.fetch_current(object).await?;
        self.cache.insert(id.to_string(), encrypted);
        debug!(object_id = %short_id(id), "Object pre-warmed");
        Ok(true)
    }

    /// Copy an object onto `target`, verify the copy, swap the chunk list,
    /// then delete the old chunks. Returns false if the object vanished or
    /// changed during the copy, in which case the copy is discarded.
    #[instrument(skip(self, id, target, promo_window), fields(object_id = %short_id(id), target = %target))]
    pub async fn migrate(&self, id: &str, target: &str, promo_window: Option<PromoWindow>) -> Result<bool, StoreError> {
        let Some(object) = self.metadata.get(id).await? else {
            return Ok(false);
        };

        let registry = self.distributor.registry();
        let layer = registry.layer_of(target).unwrap_or(object.layer);
        let adapter = registry
            .get(target)
            .map_err(|e| StoreError::StorageWriteFailed {
                layer,
                provider: target.to_string(),
                message: e.to_string(),
            })?;

        let encrypted = self.fetch_verified(&object).await?;
        let new_chunks = self
            .distributor
            .write_to(adapter, layer, encrypted.clone())
            .await
            .map_err(|e| StoreError::from_write(layer, e))?;

        // Verify the destination before the source is touched
        match self.distributor.fetch(&new_chunks).await {
            Ok(copy) if copy == encrypted => {}
            Ok(_) | Err(_) => {
                self.distributor.delete(&new_chunks).await;
                return Err(StoreError::IntegrityViolation {
                    object: id.to_string(),
                    chunk: None,
                });
            }
        }

        let swap = ChunkSwap {
            layer,
            chunks: new_chunks.clone(),
            temporal_provider: Some(target.to_string()),
            promo_window,
        };
        if !self.metadata.swap_chunks(id, object.generation, swap).await? {
            self.distributor.delete(&new_chunks).await;
            warn!("Object changed during migration, copy discarded");
            return Ok(false);
        }

        let failed = self.distributor.delete(&object.chunks).await;
        if failed > 0 {
            warn!(failed, "Old chunks not fully removed after migration");
        }
        info!(from_layer = object.layer.number(), to_layer = layer.number(), "Object migrated");
        Ok(true)
    }

    /// Remove every object whose TTL has passed. Returns the number removed.
    pub async fn expire(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let expired = self.metadata.expired(now).await?;
        let mut removed = 0;

        for object in expired {
            // Gone already, or stored again since the scan
            let Some(object) = self.metadata.remove_expired(&object.id, now).await? else {
                continue;
            };
            self.cache.remove(&object.id);
            self.distributor.delete(&object.chunks).await;
            removed += 1;
            debug!(object_id = %short_id(&object.id), "Object expired");
        }

        if removed > 0 {
            metrics::counter!("store.objects.expired").increment(removed as u64);
            info!(removed, "Expired objects removed");
        }
        Ok(removed)
    }
}
