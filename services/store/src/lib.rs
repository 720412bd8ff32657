//! Strata Store
//!
//! Cost-optimizing multi-tier content store. Payloads are deduplicated by
//! content hash, compressed, encrypted under a per-object key, chunked to the
//! target layer's provider backends, and reassembled with per-chunk integrity
//! checks on retrieval.
//!
//! ## Layers
//!
//! | Layer | Name             | Cost/GB  | Latency | Max chunk |
//! |-------|------------------|----------|---------|-----------|
//! | 1     | Lightning Cache  | 0        | <1ms    | 64 KB     |
//! | 2     | Zero-Egress Warm | 0.015    | ~50ms   | 1 MB      |
//! | 3     | Infinite Cold    | 0.001    | ~200ms  | 25 MB     |
//! | 4     | Ultra-Archive    | 0.00099  | ~1s     | 10 MB     |
//!
//! ## Architecture
//!
//! ```text
//!  store(key, payload)                           retrieve(id)
//!        │                                            │
//!        ▼                                            ▼
//! ┌──────────────┐  hit   ┌──────────────┐     ┌──────────────┐
//! │ Dedup lookup │◀──────▶│ Metadata     │◀───▶│ Hot cache    │
//! └──────────────┘        │ Store        │     │ (LRU)        │
//!        │ miss           └──────────────┘     └──────────────┘
//!        ▼                       ▲                    │ miss
//! ┌──────────────┐               │                    ▼
//! │ zstd + AES   │        ┌──────────────┐     ┌──────────────┐
//! │ GCM          │───────▶│ Distributor  │◀───▶│ Verified     │
//! └──────────────┘        └──────────────┘     │ fetch        │
//!                                │             └──────────────┘
//!                                ▼
//!                  ┌──────────────────────────┐
//!                  │ Provider backends        │
//!                  │ memory / S3-compatible   │
//!                  └──────────────────────────┘
//!                                ▲
//!        ┌───────────────────────┴───────────────────────┐
//!  ┌──────────────┐      ┌──────────────┐      ┌──────────────┐
//!  │ Predictor    │      │ Arbitrage    │      │ Expiry/stats │
//!  │ (pre-warm)   │      │ (migration)  │      │              │
//!  └──────────────┘      └──────────────┘      └──────────────┘
//! ```

pub mod api;
pub mod arbitrage;
pub mod cache;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod distributor;
pub mod layers;
pub mod maintenance;
pub mod metadata;
pub mod predictor;
pub mod provider;
pub mod store;

pub use arbitrage::{ArbitrageMonitor, ProviderRotation};
pub use cache::HotCache;
pub use config::Config;
pub use crypto::{EnvSecretProvider, MasterSecretProvider, StaticSecretProvider};
pub use layers::{Layer, Priority, RoutingAdvisor};
pub use maintenance::{Schedule, Scheduler};
pub use metadata::{InMemoryMetadataStore, MetadataStore, PgMetadataStore, StoredObject};
pub use predictor::AccessPredictor;
pub use provider::{MemoryProvider, ProviderAdapter, ProviderRegistry, S3Provider};
pub use store::{Retrieved, StoreError, StoreOptions, StoreReceipt, StoreStats, TieredStore};
