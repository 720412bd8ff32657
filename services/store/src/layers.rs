//! Storage layers and the layer selector.
//!
//! The four layers are fixed at startup. Selection derives a coarse routing
//! role from payload size and caller priority, maps the role onto a preferred
//! layer, then escalates past any layer whose size cutoff the payload exceeds.

use crate::config::LayerConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

const BYTES_PER_GB: f64 = 1_000_000_000.0;

/// Storage layer an object's chunks live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Layer {
    /// In-process hot tier
    Lightning = 1,
    /// Low-cost, zero-egress object store
    Warm = 2,
    /// Rotating free-tier providers
    Cold = 3,
    /// High-durability archive
    Archive = 4,
}

impl Layer {
    pub const ALL: [Layer; 4] = [Layer::Lightning, Layer::Warm, Layer::Cold, Layer::Archive];

    pub fn number(self) -> u8 {
        self as u8
    }

    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            1 => Some(Layer::Lightning),
            2 => Some(Layer::Warm),
            3 => Some(Layer::Cold),
            4 => Some(Layer::Archive),
            _ => None,
        }
    }

    /// Next slower/cheaper layer, if any.
    pub fn escalate(self) -> Option<Self> {
        Self::from_number(self.number() + 1)
    }

    /// Static characteristics of this layer.
    pub fn spec(self) -> &'static LayerSpec {
        &LAYER_SPECS[(self.number() - 1) as usize]
    }
}

impl From<Layer> for u8 {
    fn from(layer: Layer) -> Self {
        layer.number()
    }
}

impl TryFrom<u8> for Layer {
    type Error = String;

    fn try_from(n: u8) -> Result<Self, Self::Error> {
        Layer::from_number(n).ok_or_else(|| format!("invalid layer {}", n))
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{} ({})", self.number(), self.spec().name)
    }
}

/// Static layer characteristics.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerSpec {
    pub name: &'static str,
    /// Lower is preferred for latency-sensitive data
    pub priority: u8,
    /// None for effectively unbounded tiers
    pub capacity_bytes: Option<u64>,
    pub cost_per_gb: f64,
    pub target_latency: Duration,
    pub max_chunk_bytes: usize,
    pub reliability: f64,
}

impl LayerSpec {
    /// Monthly cost of holding `bytes` in this layer.
    pub fn cost_for(&self, bytes: u64) -> f64 {
        bytes as f64 / BYTES_PER_GB * self.cost_per_gb
    }
}

static LAYER_SPECS: [LayerSpec; 4] = [
    LayerSpec {
        name: "Lightning Cache",
        priority: 1,
        capacity_bytes: Some(1024 * 1024 * 1024),
        cost_per_gb: 0.0,
        target_latency: Duration::from_millis(1),
        max_chunk_bytes: 64 * 1024,
        reliability: 0.99,
    },
    LayerSpec {
        name: "Zero-Egress Warm",
        priority: 2,
        capacity_bytes: Some(10 * 1024 * 1024 * 1024 * 1024),
        cost_per_gb: 0.015,
        target_latency: Duration::from_millis(50),
        max_chunk_bytes: 1024 * 1024,
        reliability: 0.999_999_999,
    },
    LayerSpec {
        name: "Infinite Cold",
        priority: 3,
        capacity_bytes: None,
        cost_per_gb: 0.001,
        target_latency: Duration::from_millis(200),
        max_chunk_bytes: 25 * 1024 * 1024,
        reliability: 0.999,
    },
    LayerSpec {
        name: "Ultra-Archive",
        priority: 4,
        capacity_bytes: None,
        cost_per_gb: 0.000_99,
        target_latency: Duration::from_secs(1),
        max_chunk_bytes: 10 * 1024 * 1024,
        reliability: 0.999_999_999_99,
    },
];

/// Standard object storage price used as the savings baseline.
pub const BASELINE_COST_PER_GB: f64 = 0.023;

/// Cost of holding `bytes` at the baseline price.
pub fn baseline_cost_for(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_GB * BASELINE_COST_PER_GB
}

/// Caller-supplied urgency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn urgency(self) -> f64 {
        match self {
            Priority::Low => 0.1,
            Priority::Normal => 0.4,
            Priority::High => 0.8,
            Priority::Critical => 1.0,
        }
    }

    /// Spend tolerance; urgent data may occupy pricier layers.
    pub fn budget(self) -> f64 {
        match self {
            Priority::Low => 0.2,
            Priority::Normal => 0.5,
            Priority::High => 0.8,
            Priority::Critical => 1.0,
        }
    }
}

/// Input to the routing advisor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoutingRequest {
    /// Payload size normalized to [0, 1] on a log scale
    pub size_proxy: f64,
    pub urgency: f64,
    pub budget: f64,
}

impl RoutingRequest {
    pub fn new(size_bytes: u64, priority: Priority) -> Self {
        Self {
            size_proxy: size_proxy(size_bytes),
            urgency: priority.urgency(),
            budget: priority.budget(),
        }
    }
}

/// log2(size + 1) / log2(1 GiB), clamped to [0, 1].
pub fn size_proxy(size_bytes: u64) -> f64 {
    ((size_bytes as f64 + 1.0).log2() / 30.0).clamp(0.0, 1.0)
}

/// Coarse role a payload plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingRole {
    Orchestration,
    Execution,
    Analysis,
}

/// Maps a routing request to a role.
pub trait RoutingAdvisor: Send + Sync {
    fn advise(&self, request: &RoutingRequest) -> RoutingRole;
}

/// Threshold advisor: small urgent payloads orchestrate, large or
/// low-urgency payloads are analysis, everything else executes.
#[derive(Debug, Clone, Default)]
pub struct ThresholdAdvisor;

impl RoutingAdvisor for ThresholdAdvisor {
    fn advise(&self, request: &RoutingRequest) -> RoutingRole {
        if request.urgency >= 0.7 && request.size_proxy < 0.6 {
            RoutingRole::Orchestration
        } else if request.size_proxy >= 0.8 || request.urgency < 0.2 {
            RoutingRole::Analysis
        } else {
            RoutingRole::Execution
        }
    }
}

/// Always returns the same role.
#[derive(Debug, Clone)]
pub struct ConstantAdvisor(pub RoutingRole);

impl RoutingAdvisor for ConstantAdvisor {
    fn advise(&self, _request: &RoutingRequest) -> RoutingRole {
        self.0
    }
}

/// Chooses the target layer for a new object.
pub struct LayerSelector {
    config: LayerConfig,
    advisor: Arc<dyn RoutingAdvisor>,
}

impl LayerSelector {
    pub fn new(config: LayerConfig, advisor: Arc<dyn RoutingAdvisor>) -> Self {
        Self { config, advisor }
    }

    /// Select a layer; `force` always wins.
    pub fn select(&self, size_bytes: u64, priority: Priority, force: Option<Layer>) -> Layer {
        if let Some(layer) = force {
            return layer;
        }

        let request = RoutingRequest::new(size_bytes, priority);
        let role = self.advisor.advise(&request);
        let preferred = self.preferred_layer(role, size_bytes, &request);
        let layer = self.apply_size_cutoff(preferred, size_bytes);

        trace!(
            size_bytes = size_bytes,
            ?priority,
            ?role,
            preferred = preferred.number(),
            layer = layer.number(),
            "Layer selected"
        );

        layer
    }

    fn preferred_layer(&self, role: RoutingRole, size_bytes: u64, request: &RoutingRequest) -> Layer {
        match role {
            RoutingRole::Orchestration => {
                if size_bytes <= self.config.orchestration_cache_bytes {
                    Layer::Lightning
                } else {
                    Layer::Warm
                }
            }
            RoutingRole::Execution => {
                if size_bytes <= self.config.execution_warm_bytes {
                    Layer::Warm
                } else {
                    Layer::Cold
                }
            }
            RoutingRole::Analysis => {
                if request.urgency < 0.2 {
                    Layer::Archive
                } else {
                    Layer::Cold
                }
            }
        }
    }

    /// Largest object a layer accepts before escalating.
    pub fn max_object_bytes(&self, layer: Layer) -> Option<u64> {
        match layer {
            Layer::Lightning => Some(self.config.lightning_max_object_bytes),
            Layer::Warm => Some(self.config.warm_max_object_bytes),
            Layer::Cold => Some(self.config.cold_max_object_bytes),
            Layer::Archive => None,
        }
    }

    fn apply_size_cutoff(&self, mut layer: Layer, size_bytes: u64) -> Layer {
        while let Some(max) = self.max_object_bytes(layer) {
            if size_bytes <= max {
                break;
            }
            match layer.escalate() {
                Some(next) => layer = next,
                None => break,
            }
        }
        layer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector() -> LayerSelector {
        LayerSelector::new(LayerConfig::default(), Arc::new(ThresholdAdvisor))
    }

    #[test]
    fn test_layer_table() {
        assert_eq!(Layer::Lightning.spec().max_chunk_bytes, 64 * 1024);
        assert_eq!(Layer::Warm.spec().max_chunk_bytes, 1024 * 1024);
        assert_eq!(Layer::Cold.spec().max_chunk_bytes, 25 * 1024 * 1024);
        assert_eq!(Layer::Archive.spec().max_chunk_bytes, 10 * 1024 * 1024);
        assert_eq!(Layer::Lightning.spec().cost_per_gb, 0.0);
        for layer in Layer::ALL {
            assert_eq!(layer.spec().priority, layer.number());
        }
    }

    #[test]
    fn test_layer_numbering() {
        assert_eq!(Layer::from_number(3), Some(Layer::Cold));
        assert_eq!(Layer::from_number(0), None);
        assert_eq!(Layer::Archive.escalate(), None);
        assert_eq!(Layer::Warm.escalate(), Some(Layer::Cold));
        assert_eq!(serde_json::to_string(&Layer::Warm).unwrap(), "2");
        assert_eq!(serde_json::from_str::<Layer>("4").unwrap(), Layer::Archive);
        assert!(serde_json::from_str::<Layer>("7").is_err());
    }

    #[test]
    fn test_force_layer_always_wins() {
        let selector = selector();
        for layer in Layer::ALL {
            for size in [0u64, 10, 2 * 1024 * 1024, 10 * 1024 * 1024 * 1024] {
                for priority in [Priority::Low, Priority::Critical] {
                    assert_eq!(selector.select(size, priority, Some(layer)), layer);
                }
            }
        }
    }

    #[test]
    fn test_small_urgent_goes_to_lightning() {
        assert_eq!(selector().select(4 * 1024, Priority::High, None), Layer::Lightning);
    }

    #[test]
    fn test_two_megabytes_high_priority_leaves_lightning() {
        let layer = selector().select(2 * 1024 * 1024, Priority::High, None);
        assert!(layer >= Layer::Warm);
    }

    #[test]
    fn test_low_priority_archives() {
        assert_eq!(selector().select(1024, Priority::Low, None), Layer::Archive);
    }

    #[test]
    fn test_size_cutoff_escalates_regardless_of_role() {
        let selector = LayerSelector::new(
            LayerConfig::default(),
            Arc::new(ConstantAdvisor(RoutingRole::Orchestration)),
        );
        // Orchestration prefers layer 2 above 256KB, but 600MB exceeds the warm cutoff
        assert_eq!(
            selector.select(600 * 1024 * 1024, Priority::High, None),
            Layer::Cold
        );
        assert_eq!(
            selector.select(6 * 1024 * 1024 * 1024, Priority::High, None),
            Layer::Archive
        );
    }

    #[test]
    fn test_cost_for() {
        assert_eq!(Layer::Lightning.spec().cost_for(1_000_000_000), 0.0);
        assert!((Layer::Warm.spec().cost_for(1_000_000_000) - 0.015).abs() < 1e-12);
        assert!(baseline_cost_for(10) > 0.0);
    }

    #[test]
    fn test_size_proxy_bounds() {
        assert_eq!(size_proxy(0), 0.0);
        assert!(size_proxy(u64::MAX) <= 1.0);
        assert!(size_proxy(1024) < size_proxy(1024 * 1024));
    }
}
