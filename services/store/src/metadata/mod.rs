//! Per-object metadata records and the stores that hold them.
//!
//! A record is keyed by content hash and owns everything needed to rebuild
//! the payload: the ordered chunk list, sizes, checksums, and the crypto
//! parameters. Chunk lists are only ever replaced whole, through
//! [`MetadataStore::swap_chunks`], so a reader sees either the old chunk set
//! or the new one.

pub mod memory;
pub mod postgres;

use crate::crypto::{CryptoError, CryptoParams};
use crate::layers::Layer;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use memory::InMemoryMetadataStore;
pub use postgres::PgMetadataStore;

/// Errors raised by metadata backends.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Metadata store unavailable: {0}")]
    Unavailable(String),

    #[error("Metadata record could not be (de)serialized: {0}")]
    Serialization(String),
}

/// Redundant copy of a chunk on another backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRef {
    pub provider: String,
    pub location: String,
}

/// One contiguous slice of an object's encrypted payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub id: Uuid,
    /// Position in the object; chunks concatenate in index order
    pub index: u32,
    pub size: u64,
    /// Backend name holding the primary copy
    pub provider: String,
    /// Opaque locator returned by the backend
    pub location: String,
    /// SHA-256 of the chunk bytes
    pub checksum: String,
    #[serde(default)]
    pub shards: Vec<ShardRef>,
}

/// Promotional window an object was migrated under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromoWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub discount: f64,
}

impl PromoWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}

/// Metadata record for one stored object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredObject {
    /// SHA-256 of the original payload
    pub id: String,
    /// Caller key the object was first stored under
    pub key: String,
    pub original_size: u64,
    pub compressed_size: u64,
    pub encrypted_size: u64,
    pub layer: Layer,
    pub chunks: Vec<ChunkRef>,
    pub access_count: u64,
    pub last_accessed: DateTime<Utc>,
    pub created: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    /// SHA-256 of the whole encrypted payload
    pub checksum: String,
    #[serde(with = "base64_serde")]
    pub iv: Vec<u8>,
    #[serde(with = "base64_serde")]
    pub salt: Vec<u8>,
    pub compression_ratio: f64,
    /// Most recent access timestamps, oldest first
    #[serde(default)]
    pub access_pattern: Vec<DateTime<Utc>>,
    #[serde(default)]
    pub temperature_score: f64,
    pub predicted_next_access: Option<DateTime<Utc>>,
    pub temporal_provider: Option<String>,
    pub promo_window: Option<PromoWindow>,
    /// Bumped on every chunk-list swap
    #[serde(default)]
    pub generation: u64,
}

/// Replacement chunk set produced by a migration.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkSwap {
    pub layer: Layer,
    pub chunks: Vec<ChunkRef>,
    pub temporal_provider: Option<String>,
    pub promo_window: Option<PromoWindow>,
}

impl StoredObject {
    pub fn crypto_params(&self) -> Result<CryptoParams, CryptoError> {
        CryptoParams::from_slices(&self.iv, &self.salt)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    /// Record one access, keeping at most `history_limit` timestamps.
    pub fn apply_access(&mut self, at: DateTime<Utc>, history_limit: usize) {
        self.access_count += 1;
        self.last_accessed = at;
        self.access_pattern.push(at);
        if self.access_pattern.len() > history_limit {
            let excess = self.access_pattern.len() - history_limit;
            self.access_pattern.drain(..excess);
        }
    }

    /// Generation for a record that replaces `old`.
    pub fn succeed(&mut self, old: &StoredObject) {
        self.generation = self.generation.max(old.generation + 1);
    }

    pub fn apply_swap(&mut self, swap: ChunkSwap) {
        self.layer = swap.layer;
        self.chunks = swap.chunks;
        self.temporal_provider = swap.temporal_provider;
        self.promo_window = swap.promo_window;
        self.generation += 1;
    }

    /// Mean gap between recorded accesses, if at least two exist.
    pub fn mean_access_interval(&self) -> Option<Duration> {
        let first = self.access_pattern.first()?;
        let last = self.access_pattern.last()?;
        let gaps = self.access_pattern.len().checked_sub(1).filter(|n| *n > 0)?;
        Some((*last - *first) / gaps as i32)
    }

    /// Every backend holding at least one copy of a chunk of this object.
    pub fn providers(&self) -> Vec<&str> {
        let mut providers: Vec<&str> = self
            .chunks
            .iter()
            .flat_map(|c| {
                std::iter::once(c.provider.as_str()).chain(c.shards.iter().map(|s| s.provider.as_str()))
            })
            .collect();
        providers.sort_unstable();
        providers.dedup();
        providers
    }
}

/// Durable home for metadata records: point lookup by id plus scans.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<StoredObject>, MetadataError>;

    /// Insert or replace; the last writer wins. Returns the replaced record.
    /// A replacement is stored one generation past the record it replaces, so
    /// a chunk swap planned against the old record can never land on the new.
    async fn insert(&self, object: StoredObject) -> Result<Option<StoredObject>, MetadataError>;

    /// Atomically bump access bookkeeping and return the updated record.
    async fn record_access(
        &self,
        id: &str,
        at: DateTime<Utc>,
        history_limit: usize,
    ) -> Result<Option<StoredObject>, MetadataError>;

    async fn update_prediction(
        &self,
        id: &str,
        temperature_score: f64,
        predicted_next_access: Option<DateTime<Utc>>,
    ) -> Result<(), MetadataError>;

    /// Replace the chunk list if the record is still at `expected_generation`.
    /// Returns false when the record changed or disappeared.
    async fn swap_chunks(
        &self,
        id: &str,
        expected_generation: u64,
        swap: ChunkSwap,
    ) -> Result<bool, MetadataError>;

    async fn remove(&self, id: &str) -> Result<Option<StoredObject>, MetadataError>;

    /// Remove the record only if it is expired at `now`. A record rewritten
    /// since the expiry scan is left alone.
    async fn remove_expired(&self, id: &str, now: DateTime<Utc>) -> Result<Option<StoredObject>, MetadataError>;

    async fn list(&self) -> Result<Vec<StoredObject>, MetadataError>;

    /// Records whose `expires_at` is at or before `now`.
    async fn expired(&self, now: DateTime<Utc>) -> Result<Vec<StoredObject>, MetadataError>;

    async fn clear(&self) -> Result<(), MetadataError>;

    async fn ping(&self) -> Result<(), MetadataError>;
}

/// Base64 serialization helper
mod base64_serde {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_record_serde() {
        let obj = object("abc");
        let json = serde_json::to_value(&obj).unwrap();
        assert_eq!(json["layer"], 2);
        assert_eq!(json["iv"], "AQEBAQEBAQEBAQEB");
        let back: StoredObject = serde_json::from_value(json).unwrap();
        assert_eq!(back, obj);
        assert!(back.crypto_params().is_ok());
    }

    #[test]
    fn test_apply_access_caps_history() {
        let mut obj = object("abc");
        let start = Utc::now();
        for i in 0..5 {
            obj.apply_access(start + Duration::seconds(i), 3);
        }
        assert_eq!(obj.access_count, 5);
        assert_eq!(obj.access_pattern.len(), 3);
        assert_eq!(obj.access_pattern[0], start + Duration::seconds(2));
        assert_eq!(obj.last_accessed, start + Duration::seconds(4));
    }

    #[test]
    fn test_mean_access_interval() {
        let mut obj = object("abc");
        assert!(obj.mean_access_interval().is_none());

        let start = Utc::now();
        obj.access_pattern = vec![start];
        assert!(obj.mean_access_interval().is_none());

        obj.access_pattern = vec![start, start + Duration::seconds(10), start + Duration::seconds(30)];
        assert_eq!(obj.mean_access_interval(), Some(Duration::seconds(15)));
    }

    #[test]
    fn test_apply_swap_bumps_generation() {
        let mut obj = object("abc");
        obj.apply_swap(ChunkSwap {
            layer: Layer::Cold,
            chunks: vec![chunk(0, "promo")],
            temporal_provider: Some("promo".to_string()),
            promo_window: None,
        });
        assert_eq!(obj.generation, 1);
        assert_eq!(obj.layer, Layer::Cold);
        assert_eq!(obj.providers(), vec!["promo"]);
    }

    #[test]
    fn test_expiry() {
        let mut obj = object("abc");
        let now = Utc::now();
        assert!(!obj.is_expired(now));
        obj.expires_at = Some(now - Duration::milliseconds(1));
        assert!(obj.is_expired(now));
    }

    #[test]
    fn test_promo_window_contains() {
        let now = Utc::now();
        let window = PromoWindow {
            start: now - Duration::hours(1),
            end: now + Duration::hours(1),
            discount: 0.5,
        };
        assert!(window.contains(now));
        assert!(!window.contains(now + Duration::hours(2)));
    }
}
