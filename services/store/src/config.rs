use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by [`Config::validate`]
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Rotation references unknown backend: {0}")]
    UnknownBackend(String),
}

/// Main configuration for the store service
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Foreground pipeline configuration
    #[serde(default)]
    pub store: StoreConfig,
    /// Layer routing configuration
    #[serde(default)]
    pub layers: LayerConfig,
    /// Named provider backends
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    /// Promotional windows for temporal backends
    #[serde(default)]
    pub rotations: Vec<RotationConfig>,
    /// Access-pattern predictor configuration
    #[serde(default)]
    pub predictor: PredictorConfig,
    /// Temporal arbitrage configuration
    #[serde(default)]
    pub arbitrage: ArbitrageConfig,
    /// Maintenance loop configuration
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    /// Metadata database configuration
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Ops API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Store/retrieve pipeline configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Hot cache capacity in bytes
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity_bytes: u64,
    /// Largest object (as a fraction of cache capacity) admitted on the retrieve slow path
    #[serde(default = "default_cache_object_fraction")]
    pub cache_object_fraction: f64,
    /// Weight of the rolling hit-rate moving average
    #[serde(default = "default_hit_rate_weight")]
    pub hit_rate_weight: f64,
    /// Timeout applied to every provider call, in milliseconds
    #[serde(default = "default_provider_timeout_ms")]
    pub provider_timeout_ms: u64,
    /// zstd compression level
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
    /// Concurrent chunk puts/gets per object
    #[serde(default = "default_dispatch_concurrency")]
    pub dispatch_concurrency: usize,
    /// Access timestamps kept per object
    #[serde(default = "default_access_history_limit")]
    pub access_history_limit: usize,
    /// Environment variable holding the base64 master secret
    #[serde(default = "default_master_secret_env")]
    pub master_secret_env: String,
}

/// Layer routing configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LayerConfig {
    /// Objects above this size never land in layer 1
    #[serde(default = "default_lightning_max_object")]
    pub lightning_max_object_bytes: u64,
    /// Objects above this size escalate past layer 2
    #[serde(default = "default_warm_max_object")]
    pub warm_max_object_bytes: u64,
    /// Objects above this size escalate past layer 3
    #[serde(default = "default_cold_max_object")]
    pub cold_max_object_bytes: u64,
    /// Orchestration-role payloads up to this size go to layer 1
    #[serde(default = "default_orchestration_cache_bytes")]
    pub orchestration_cache_bytes: u64,
    /// Execution-role payloads up to this size stay in layer 2
    #[serde(default = "default_execution_warm_bytes")]
    pub execution_warm_bytes: u64,
    /// Number of backends each archive chunk is written to
    #[serde(default = "default_archive_replicas")]
    pub archive_replicas: usize,
}

/// Kind of provider backend
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// In-process chunk map
    #[default]
    Memory,
    /// S3-compatible object store
    S3,
}

/// A named provider backend serving one layer
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Unique backend name, recorded on every chunk it holds
    pub name: String,
    /// Layer number (1-4) this backend serves
    pub layer: u8,
    /// Backend implementation
    #[serde(default)]
    pub kind: BackendKind,
    /// S3 settings, required when kind is s3
    pub s3: Option<S3Config>,
    /// Temporal backends only receive data through arbitrage migration
    #[serde(default)]
    pub temporal: bool,
}

/// S3-compatible storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Bucket name
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (R2, MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// Promotional free-capacity window offered by a temporal backend
#[derive(Debug, Clone, Deserialize)]
pub struct RotationConfig {
    /// Backend name (must be a temporal backend)
    pub provider: String,
    /// Free-tier ceiling in bytes
    pub free_ceiling_bytes: u64,
    /// Promo window start
    pub promo_start: DateTime<Utc>,
    /// Promo window end
    pub promo_end: DateTime<Utc>,
    /// Discount offered during the window (0.0 - 1.0)
    pub discount: f64,
}

/// Access-pattern predictor configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PredictorConfig {
    /// Seconds between predictor cycles
    #[serde(default = "default_predictor_interval_secs")]
    pub interval_secs: u64,
    /// Objects scoring above this are pre-warm candidates
    #[serde(default = "default_hot_threshold")]
    pub hot_threshold: f64,
    /// Candidates pre-warmed per cycle
    #[serde(default = "default_prewarm_top_n")]
    pub top_n: usize,
    /// Simultaneous pre-warms per cycle
    #[serde(default = "default_prewarm_concurrency")]
    pub prewarm_concurrency: usize,
    /// Access count at which frequency saturates to 1.0
    #[serde(default = "default_frequency_saturation")]
    pub frequency_saturation: u64,
    /// Inter-access interval assumed for objects with a single access
    #[serde(default = "default_interval_secs")]
    pub default_interval_secs: u64,
}

/// Temporal arbitrage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ArbitrageConfig {
    /// Seconds between arbitrage cycles
    #[serde(default = "default_arbitrage_interval_secs")]
    pub interval_secs: u64,
    /// Minimum discount worth migrating for
    #[serde(default = "default_min_discount")]
    pub min_discount: f64,
    /// Fraction of the free ceiling usable before migrations are declined
    #[serde(default = "default_safety_buffer")]
    pub safety_buffer: f64,
    /// Objects migrated per provider per cycle
    #[serde(default = "default_max_migrations")]
    pub max_migrations_per_cycle: usize,
    /// Simultaneous migrations
    #[serde(default = "default_migration_concurrency")]
    pub migration_concurrency: usize,
}

/// Maintenance loop configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MaintenanceConfig {
    /// Seconds between expiry sweeps
    #[serde(default = "default_expiry_interval_secs")]
    pub expiry_interval_secs: u64,
    /// Seconds between stats refreshes
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL; metadata stays in memory when unset
    pub url: Option<String>,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Ops API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
}

// Default value functions
fn default_service_name() -> String {
    "strata-store".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_cache_capacity() -> u64 {
    64 * 1024 * 1024 // 64MB
}

fn default_cache_object_fraction() -> f64 {
    0.1
}

fn default_hit_rate_weight() -> f64 {
    0.1
}

fn default_provider_timeout_ms() -> u64 {
    5000
}

fn default_compression_level() -> i32 {
    3
}

fn default_dispatch_concurrency() -> usize {
    4
}

fn default_access_history_limit() -> usize {
    100
}

fn default_master_secret_env() -> String {
    "STRATA_MASTER_SECRET".to_string()
}

fn default_lightning_max_object() -> u64 {
    1024 * 1024 // 1MB
}

fn default_warm_max_object() -> u64 {
    512 * 1024 * 1024 // 512MB
}

fn default_cold_max_object() -> u64 {
    5 * 1024 * 1024 * 1024 // 5GB
}

fn default_orchestration_cache_bytes() -> u64 {
    256 * 1024 // 256KB
}

fn default_execution_warm_bytes() -> u64 {
    8 * 1024 * 1024 // 8MB
}

fn default_archive_replicas() -> usize {
    2
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_predictor_interval_secs() -> u64 {
    60
}

fn default_hot_threshold() -> f64 {
    0.7
}

fn default_prewarm_top_n() -> usize {
    10
}

fn default_prewarm_concurrency() -> usize {
    5
}

fn default_frequency_saturation() -> u64 {
    100
}

fn default_interval_secs() -> u64 {
    3600
}

fn default_arbitrage_interval_secs() -> u64 {
    300
}

fn default_min_discount() -> f64 {
    0.3
}

fn default_safety_buffer() -> f64 {
    0.8
}

fn default_max_migrations() -> usize {
    10
}

fn default_migration_concurrency() -> usize {
    2
}

fn default_expiry_interval_secs() -> u64 {
    60
}

fn default_stats_interval_secs() -> u64 {
    30
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/store").required(false))
            .add_source(config::File::with_name("/etc/strata/store").required(false))
            // Override with environment variables
            // STRATA__STORE__CACHE_CAPACITY_BYTES -> store.cache_capacity_bytes
            .add_source(
                config::Environment::with_prefix("STRATA")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.cache_capacity_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                key: "store.cache_capacity_bytes".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        let fraction = self.store.cache_object_fraction;
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(ConfigError::InvalidValue {
                key: "store.cache_object_fraction".to_string(),
                message: format!("{} is outside (0, 1]", fraction),
            });
        }

        let mut names = HashSet::new();
        for backend in &self.backends {
            if !(1..=4).contains(&backend.layer) {
                return Err(ConfigError::InvalidValue {
                    key: format!("backends.{}.layer", backend.name),
                    message: format!("layer {} is outside 1-4", backend.layer),
                });
            }
            if backend.kind == BackendKind::S3 && backend.s3.is_none() {
                return Err(ConfigError::InvalidValue {
                    key: format!("backends.{}.s3", backend.name),
                    message: "s3 backends need bucket settings".to_string(),
                });
            }
            if !names.insert(backend.name.as_str()) {
                return Err(ConfigError::InvalidValue {
                    key: format!("backends.{}", backend.name),
                    message: "duplicate backend name".to_string(),
                });
            }
        }

        for rotation in &self.rotations {
            let backend = self
                .backends
                .iter()
                .find(|b| b.name == rotation.provider)
                .ok_or_else(|| ConfigError::UnknownBackend(rotation.provider.clone()))?;

            if !backend.temporal {
                return Err(ConfigError::InvalidValue {
                    key: format!("rotations.{}", rotation.provider),
                    message: "rotations may only target temporal backends".to_string(),
                });
            }
            if rotation.promo_end <= rotation.promo_start {
                return Err(ConfigError::InvalidValue {
                    key: format!("rotations.{}.promo_end", rotation.provider),
                    message: "promo window ends before it starts".to_string(),
                });
            }
        }

        Ok(())
    }
}

impl StoreConfig {
    /// Get provider call timeout as Duration
    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cache_capacity_bytes: default_cache_capacity(),
            cache_object_fraction: default_cache_object_fraction(),
            hit_rate_weight: default_hit_rate_weight(),
            provider_timeout_ms: default_provider_timeout_ms(),
            compression_level: default_compression_level(),
            dispatch_concurrency: default_dispatch_concurrency(),
            access_history_limit: default_access_history_limit(),
            master_secret_env: default_master_secret_env(),
        }
    }
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            lightning_max_object_bytes: default_lightning_max_object(),
            warm_max_object_bytes: default_warm_max_object(),
            cold_max_object_bytes: default_cold_max_object(),
            orchestration_cache_bytes: default_orchestration_cache_bytes(),
            execution_warm_bytes: default_execution_warm_bytes(),
            archive_replicas: default_archive_replicas(),
        }
    }
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_predictor_interval_secs(),
            hot_threshold: default_hot_threshold(),
            top_n: default_prewarm_top_n(),
            prewarm_concurrency: default_prewarm_concurrency(),
            frequency_saturation: default_frequency_saturation(),
            default_interval_secs: default_interval_secs(),
        }
    }
}

impl Default for ArbitrageConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_arbitrage_interval_secs(),
            min_discount: default_min_discount(),
            safety_buffer: default_safety_buffer(),
            max_migrations_per_cycle: default_max_migrations(),
            migration_concurrency: default_migration_concurrency(),
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            expiry_interval_secs: default_expiry_interval_secs(),
            stats_interval_secs: default_stats_interval_secs(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            run_migrations: default_true(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temporal_backend(name: &str) -> BackendConfig {
        BackendConfig {
            name: name.to_string(),
            layer: 3,
            kind: BackendKind::Memory,
            s3: None,
            temporal: true,
        }
    }

    fn rotation(provider: &str) -> RotationConfig {
        RotationConfig {
            provider: provider.to_string(),
            free_ceiling_bytes: 1024,
            promo_start: Utc::now(),
            promo_end: Utc::now() + chrono::Duration::days(1),
            discount: 0.5,
        }
    }

    #[test]
    fn test_default_values() {
        assert_eq!(default_cache_object_fraction(), 0.1);
        assert_eq!(default_hit_rate_weight(), 0.1);
        assert_eq!(default_prewarm_concurrency(), 5);
        assert_eq!(default_hot_threshold(), 0.7);
        assert_eq!(default_min_discount(), 0.3);
        assert_eq!(default_safety_buffer(), 0.8);
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_zero_cache_capacity_rejected() {
        let mut config = Config::default();
        config.store.cache_capacity_bytes = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_rotation_requires_known_temporal_backend() {
        let mut config = Config::default();
        config.rotations.push(rotation("promo-drive"));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownBackend(_))
        ));

        let mut backend = temporal_backend("promo-drive");
        backend.temporal = false;
        config.backends.push(backend);
        assert!(config.validate().is_err());

        config.backends[0].temporal = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backend_layer_range() {
        let mut config = Config::default();
        let mut backend = temporal_backend("bad");
        backend.layer = 5;
        config.backends.push(backend);
        assert!(config.validate().is_err());
    }
}
