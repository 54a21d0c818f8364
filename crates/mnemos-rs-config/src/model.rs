//! Configuration schema for Mnemos.

use mnemos_rs_protocol::{MemoryCategory, TierKind};
use serde::{Deserialize, Deserializer, Serialize};

/// Root config for a Mnemos deployment.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MnemosConfig {
    #[serde(default, rename = "$schema")]
    pub schema: Option<String>,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub backends: BackendsConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

impl MnemosConfig {
    /// Start building a config programmatically with defaults applied.
    pub fn builder() -> MnemosConfigBuilder {
        MnemosConfigBuilder::new()
    }
}

/// Builder for assembling a `MnemosConfig` in code.
#[derive(Debug, Default, Clone)]
pub struct MnemosConfigBuilder {
    config: MnemosConfig,
}

impl MnemosConfigBuilder {
    /// Create a new builder seeded with default config values.
    pub fn new() -> Self {
        Self {
            config: MnemosConfig::default(),
        }
    }

    /// Replace the store settings.
    pub fn store(mut self, store: StoreConfig) -> Self {
        self.config.store = store;
        self
    }

    /// Replace the backend settings.
    pub fn backends(mut self, backends: BackendsConfig) -> Self {
        self.config.backends = backends;
        self
    }

    /// Replace the routing table.
    pub fn routing(mut self, routing: RoutingConfig) -> Self {
        self.config.routing = routing;
        self
    }

    /// Replace the lifecycle settings.
    pub fn lifecycle(mut self, lifecycle: LifecycleConfig) -> Self {
        self.config.lifecycle = lifecycle;
        self
    }

    /// Replace the health check settings.
    pub fn health(mut self, health: HealthConfig) -> Self {
        self.config.health = health;
        self
    }

    /// Point the durable tier at a SQLite file.
    pub fn durable_path(mut self, path: impl Into<String>) -> Self {
        self.config.backends.durable.path = Some(path.into());
        self
    }

    /// Finalize and return the built `MnemosConfig`.
    pub fn build(self) -> MnemosConfig {
        self.config
    }
}

/// Store-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_embedding_dimension")]
    pub embedding_dimension: usize,
    #[serde(default)]
    pub operation_timeout_ms: Option<u64>,
    #[serde(default = "default_background_queue_capacity")]
    pub background_queue_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            embedding_dimension: default_embedding_dimension(),
            operation_timeout_ms: None,
            background_queue_capacity: default_background_queue_capacity(),
        }
    }
}

/// Default embedding dimension (MiniLM-sized vectors).
fn default_embedding_dimension() -> usize {
    384
}

/// Default number of concurrent fire-and-forget tasks.
fn default_background_queue_capacity() -> usize {
    256
}

/// Settings for each backend tier.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BackendsConfig {
    #[serde(default)]
    pub cache: CacheBackendConfig,
    #[serde(default)]
    pub vector: VectorBackendConfig,
    #[serde(default)]
    pub durable: DurableBackendConfig,
}

/// Volatile cache tier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheBackendConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
}

impl Default for CacheBackendConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: default_cache_capacity(),
        }
    }
}

/// Default maximum number of cached records.
fn default_cache_capacity() -> usize {
    10_000
}

/// Vector index tier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorBackendConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for VectorBackendConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Durable SQLite tier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurableBackendConfig {
    /// SQLite file path; defaults to `~/.mnemos/memory.db`.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DurableBackendConfig {
    fn default() -> Self {
        Self {
            path: None,
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_true() -> bool {
    true
}

/// Routing table, one row per memory category.
///
/// Layers may override single fields of a row; unspecified fields keep the
/// category default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "RoutingOverrides")]
pub struct RoutingConfig {
    pub working: RouteConfig,
    pub episodic: RouteConfig,
    pub semantic: RouteConfig,
    pub procedural: RouteConfig,
}

impl RoutingConfig {
    /// Route row for a category.
    pub fn route(&self, category: MemoryCategory) -> &RouteConfig {
        match category {
            MemoryCategory::Working => &self.working,
            MemoryCategory::Episodic => &self.episodic,
            MemoryCategory::Semantic => &self.semantic,
            MemoryCategory::Procedural => &self.procedural,
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            working: default_working_route(),
            episodic: default_episodic_route(),
            semantic: default_semantic_route(),
            procedural: default_procedural_route(),
        }
    }
}

/// Partially specified routing table as it appears in config files.
#[derive(Debug, Default, Deserialize)]
struct RoutingOverrides {
    #[serde(default)]
    working: Option<RouteOverride>,
    #[serde(default)]
    episodic: Option<RouteOverride>,
    #[serde(default)]
    semantic: Option<RouteOverride>,
    #[serde(default)]
    procedural: Option<RouteOverride>,
}

#[derive(Debug, Default, Deserialize)]
struct RouteOverride {
    #[serde(default)]
    primary: Option<TierKind>,
    #[serde(default)]
    write: Option<Vec<TierKind>>,
    /// Outer `None`: keep the default. `Some(None)`: explicit `null`.
    #[serde(default, deserialize_with = "explicit_option")]
    cache_ttl_secs: Option<Option<u64>>,
}

impl RouteOverride {
    fn apply(self, mut route: RouteConfig) -> RouteConfig {
        if let Some(primary) = self.primary {
            route.primary = primary;
        }
        if let Some(write) = self.write {
            route.write = write;
        }
        if let Some(ttl) = self.cache_ttl_secs {
            route.cache_ttl_secs = ttl;
        }
        route
    }
}

impl From<RoutingOverrides> for RoutingConfig {
    fn from(overrides: RoutingOverrides) -> Self {
        let apply = |row: Option<RouteOverride>, route: RouteConfig| match row {
            Some(row) => row.apply(route),
            None => route,
        };
        Self {
            working: apply(overrides.working, default_working_route()),
            episodic: apply(overrides.episodic, default_episodic_route()),
            semantic: apply(overrides.semantic, default_semantic_route()),
            procedural: apply(overrides.procedural, default_procedural_route()),
        }
    }
}

fn explicit_option<'de, D>(deserializer: D) -> Result<Option<Option<u64>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<u64>::deserialize(deserializer).map(Some)
}

/// Routing row for a single category.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteConfig {
    pub primary: TierKind,
    pub write: Vec<TierKind>,
    #[serde(default)]
    pub cache_ttl_secs: Option<u64>,
}

/// Working memory: cache-first, one hour in cache.
fn default_working_route() -> RouteConfig {
    RouteConfig {
        primary: TierKind::Cache,
        write: vec![TierKind::Cache, TierKind::Vector, TierKind::Durable],
        cache_ttl_secs: Some(60 * 60),
    }
}

/// Episodic memory: cache-first, one day in cache.
fn default_episodic_route() -> RouteConfig {
    RouteConfig {
        primary: TierKind::Cache,
        write: vec![TierKind::Cache, TierKind::Vector, TierKind::Durable],
        cache_ttl_secs: Some(24 * 60 * 60),
    }
}

/// Semantic memory: vector primary, durable write-through, never cached.
fn default_semantic_route() -> RouteConfig {
    RouteConfig {
        primary: TierKind::Vector,
        write: vec![TierKind::Vector, TierKind::Durable],
        cache_ttl_secs: None,
    }
}

fn default_procedural_route() -> RouteConfig {
    default_semantic_route()
}

/// Decay, consolidation, and eviction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_consolidation_threshold")]
    pub consolidation_threshold: u64,
    #[serde(default = "default_consolidation_target")]
    pub consolidation_target: MemoryCategory,
    #[serde(default = "default_consolidated_min_importance")]
    pub consolidated_min_importance: f32,
    #[serde(default = "default_eviction_floor")]
    pub eviction_floor: f32,
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sweep_interval_secs: default_sweep_interval_secs(),
            consolidation_threshold: default_consolidation_threshold(),
            consolidation_target: default_consolidation_target(),
            consolidated_min_importance: default_consolidated_min_importance(),
            eviction_floor: default_eviction_floor(),
            lease_ttl_secs: default_lease_ttl_secs(),
        }
    }
}

fn default_sweep_interval_secs() -> u64 {
    5 * 60
}

/// Access count a working record must exceed to be promoted.
fn default_consolidation_threshold() -> u64 {
    5
}

fn default_consolidation_target() -> MemoryCategory {
    MemoryCategory::Semantic
}

/// Importance floor applied to consolidated siblings.
fn default_consolidated_min_importance() -> f32 {
    0.6
}

/// Effective importance below which short-lived records are evicted.
fn default_eviction_floor() -> f32 {
    0.05
}

/// How long a sweep lease stays valid without renewal.
fn default_lease_ttl_secs() -> u64 {
    10 * 60
}

/// Periodic health check settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_secs: default_check_interval_secs(),
        }
    }
}

fn default_check_interval_secs() -> u64 {
    30
}
