//! Translation from config sections to memory-crate policies.

use crate::MnemosError;
use directories::UserDirs;
use mnemos_rs_config::{LifecycleConfig, MnemosConfig, RouteConfig, RoutingConfig};
use mnemos_rs_memory::{LifecyclePolicy, Route, RoutingPolicy, ValidationError};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_DATA_DIR: &str = ".mnemos";
const DEFAULT_DB_FILE: &str = "memory.db";

fn route(config: &RouteConfig) -> Route {
    Route::new(
        config.primary,
        config.write.clone(),
        config.cache_ttl_secs.map(Duration::from_secs),
    )
}

/// Build a validated routing table from config.
pub fn routing_policy(config: &RoutingConfig) -> Result<RoutingPolicy, ValidationError> {
    RoutingPolicy::new(
        route(&config.working),
        route(&config.episodic),
        route(&config.semantic),
        route(&config.procedural),
    )
}

pub fn lifecycle_policy(config: &LifecycleConfig) -> LifecyclePolicy {
    LifecyclePolicy {
        consolidation_threshold: config.consolidation_threshold,
        consolidation_target: config.consolidation_target,
        consolidated_min_importance: config.consolidated_min_importance,
        eviction_floor: config.eviction_floor,
        lease_ttl: Duration::from_secs(config.lease_ttl_secs),
    }
}

/// `~/.mnemos/memory.db`, if a home directory is known.
pub fn default_durable_path() -> Option<PathBuf> {
    UserDirs::new().map(|dirs| dirs.home_dir().join(DEFAULT_DATA_DIR).join(DEFAULT_DB_FILE))
}

/// Resolve the configured SQLite path, expanding a leading `~/`.
pub(crate) fn durable_path(config: &MnemosConfig) -> Result<PathBuf, MnemosError> {
    let Some(path) = config.backends.durable.path.as_deref() else {
        return default_durable_path().ok_or(MnemosError::NoHomeDirectory);
    };
    match path.strip_prefix("~/") {
        Some(rest) => UserDirs::new()
            .map(|dirs| dirs.home_dir().join(rest))
            .ok_or(MnemosError::NoHomeDirectory),
        None => Ok(PathBuf::from(path)),
    }
}
