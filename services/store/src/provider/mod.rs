//! Provider adapters: the backends that actually hold chunk bytes.
//!
//! Each backend is registered under a unique name and serves one layer.
//! Non-temporal backends of a layer share writes round-robin; temporal
//! backends only receive data through arbitrage migration.

pub mod memory;
pub mod s3;

use crate::config::{BackendConfig, BackendKind};
use crate::layers::Layer;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

pub use memory::MemoryProvider;
pub use s3::S3Provider;

/// Errors raised by a single backend call.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Provider {provider} write failed: {message}")]
    Write { provider: String, message: String },

    #[error("Provider {provider} read failed: {message}")]
    Read { provider: String, message: String },

    #[error("Provider {provider} has no chunk at {location}")]
    NotFound { provider: String, location: String },

    #[error("Provider {provider} timed out")]
    Timeout { provider: String },

    #[error("Unknown provider: {0}")]
    Unknown(String),
}

impl ProviderError {
    pub fn provider(&self) -> &str {
        match self {
            Self::Write { provider, .. }
            | Self::Read { provider, .. }
            | Self::NotFound { provider, .. }
            | Self::Timeout { provider } => provider,
            Self::Unknown(name) => name,
        }
    }
}

/// Capability interface over one storage backend.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Store one chunk, returning an opaque locator.
    async fn put(&self, layer: Layer, chunk: Bytes) -> Result<String, ProviderError>;

    async fn get(&self, location: &str) -> Result<Bytes, ProviderError>;

    async fn delete(&self, location: &str) -> Result<(), ProviderError>;
}

struct Registered {
    adapter: Arc<dyn ProviderAdapter>,
    layer: Layer,
    temporal: bool,
}

/// Named backends plus the per-layer write rotation.
#[derive(Default)]
pub struct ProviderRegistry {
    backends: HashMap<String, Registered>,
    /// Non-temporal backend names per layer, in registration order
    writers: HashMap<Layer, Vec<String>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend. A later registration under the same name replaces
    /// the earlier one.
    pub fn register(&mut self, layer: Layer, adapter: Arc<dyn ProviderAdapter>, temporal: bool) {
        let name = adapter.name().to_string();
        for names in self.writers.values_mut() {
            names.retain(|n| n != &name);
        }
        if !temporal {
            self.writers.entry(layer).or_default().push(name.clone());
        }
        self.backends.insert(
            name,
            Registered {
                adapter,
                layer,
                temporal,
            },
        );
    }

    /// Give every layer without a writable backend an in-memory one.
    pub fn with_memory_defaults(mut self) -> Self {
        for layer in Layer::ALL {
            if self.writers.get(&layer).map_or(true, |w| w.is_empty()) {
                let name = format!("layer{}-memory", layer.number());
                self.register(layer, Arc::new(MemoryProvider::new(name)), false);
            }
        }
        self
    }

    /// Build the registry from configured backends, filling gaps with
    /// in-memory defaults.
    pub async fn from_config(backends: &[BackendConfig]) -> Result<Self> {
        let mut registry = Self::new();

        for backend in backends {
            let layer = Layer::from_number(backend.layer)
                .with_context(|| format!("backend {} has invalid layer {}", backend.name, backend.layer))?;

            let adapter: Arc<dyn ProviderAdapter> = match backend.kind {
                BackendKind::Memory => Arc::new(MemoryProvider::new(&backend.name)),
                BackendKind::S3 => {
                    let s3 = backend
                        .s3
                        .as_ref()
                        .with_context(|| format!("backend {} is s3 but has no s3 section", backend.name))?;
                    Arc::new(S3Provider::new(&backend.name, s3).await?)
                }
            };

            info!(
                backend = %backend.name,
                layer = layer.number(),
                kind = ?backend.kind,
                temporal = backend.temporal,
                "Registered provider backend"
            );
            registry.register(layer, adapter, backend.temporal);
        }

        Ok(registry.with_memory_defaults())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ProviderAdapter>, ProviderError> {
        self.backends
            .get(name)
            .map(|b| b.adapter.clone())
            .ok_or_else(|| ProviderError::Unknown(name.to_string()))
    }

    /// Writable backends of a layer, in rotation order.
    pub fn writers(&self, layer: Layer) -> Vec<Arc<dyn ProviderAdapter>> {
        self.writers
            .get(&layer)
            .into_iter()
            .flatten()
            .filter_map(|name| self.backends.get(name))
            .map(|b| b.adapter.clone())
            .collect()
    }

    pub fn is_temporal(&self, name: &str) -> bool {
        self.backends.get(name).map_or(false, |b| b.temporal)
    }

    pub fn layer_of(&self, name: &str) -> Option<Layer> {
        self.backends.get(name).map(|b| b.layer)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_defaults_cover_every_layer() {
        let registry = ProviderRegistry::new().with_memory_defaults();
        for layer in Layer::ALL {
            assert_eq!(registry.writers(layer).len(), 1);
        }
        assert!(registry.get("layer2-memory").is_ok());
        assert_eq!(registry.names().len(), 4);
    }

    #[test]
    fn test_temporal_backends_are_not_writers() {
        let mut registry = ProviderRegistry::new();
        registry.register(Layer::Cold, Arc::new(MemoryProvider::new("cold-a")), false);
        registry.register(Layer::Cold, Arc::new(MemoryProvider::new("promo")), true);

        let writers = registry.writers(Layer::Cold);
        assert_eq!(writers.len(), 1);
        assert_eq!(writers[0].name(), "cold-a");
        assert!(registry.is_temporal("promo"));
        assert_eq!(registry.layer_of("promo"), Some(Layer::Cold));
        assert!(registry.get("promo").is_ok());
    }

    #[test]
    fn test_reregistration_replaces() {
        let mut registry = ProviderRegistry::new();
        registry.register(Layer::Warm, Arc::new(MemoryProvider::new("x")), false);
        registry.register(Layer::Cold, Arc::new(MemoryProvider::new("x")), false);
        assert!(registry.writers(Layer::Warm).is_empty());
        assert_eq!(registry.writers(Layer::Cold).len(), 1);
        assert_eq!(registry.layer_of("x"), Some(Layer::Cold));
    }

    #[test]
    fn test_unknown_provider() {
        let registry = ProviderRegistry::new();
        let err = registry.get("nope").err().unwrap();
        assert_eq!(err.provider(), "nope");
    }

    #[tokio::test]
    async fn test_from_config_memory_backends() {
        let backends = vec![
            BackendConfig {
                name: "cold-a".to_string(),
                layer: 3,
                kind: BackendKind::Memory,
                s3: None,
                temporal: false,
            },
            BackendConfig {
                name: "cold-b".to_string(),
                layer: 3,
                kind: BackendKind::Memory,
                s3: None,
                temporal: false,
            },
        ];
        let registry = ProviderRegistry::from_config(&backends).await.unwrap();
        assert_eq!(registry.writers(Layer::Cold).len(), 2);
        assert_eq!(registry.writers(Layer::Archive).len(), 1);
    }
}
