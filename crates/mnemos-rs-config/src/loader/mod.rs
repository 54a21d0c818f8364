//! Layered configuration loader with requirement constraints.
//!
//! Discovers configuration layers (system/user/project/etc), validates each
//! against the schema, merges them while honouring locked keys, and produces
//! a final `MnemosConfig`.

mod layer_io;
mod merge;
mod schema;


use crate::{ConfigError, MnemosConfig};
use log::{debug, info};
use mnemos_rs_protocol::{MemoryCategory, TierKind};
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Default config filename in local layers.
const DEFAULT_CONFIG_FILE: &str = "mnemos.json5";
/// Default config directory under user or repo roots.
const DEFAULT_CONFIG_DIR: &str = ".mnemos";
/// Environment variable naming an extra config file.
const CONFIG_ENV_VAR: &str = "MNEMOS_CONFIG";
/// Marker files/dirs that identify a project root.
const DEFAULT_PROJECT_ROOT_MARKERS: &[&str] = &[".git"];

#[cfg(unix)]
/// Default system config path on Unix.
const SYSTEM_CONFIG_PATH: &str = "/etc/mnemos/mnemos.json5";
#[cfg(unix)]
/// Default requirements path on Unix.
const SYSTEM_REQUIREMENTS_PATH: &str = "/etc/mnemos/requirements.json5";
#[cfg(windows)]
/// Default system config path on Windows.
const SYSTEM_CONFIG_PATH: &str = "C:\\ProgramData\\mnemos\\mnemos.json5";
#[cfg(windows)]
/// Default requirements path on Windows.
const SYSTEM_REQUIREMENTS_PATH: &str = "C:\\ProgramData\\mnemos\\requirements.json5";

/// Effective config plus metadata about which layers were loaded.
#[derive(Debug, Clone)]
pub struct LayeredConfig {
    /// The merged, validated config.
    pub config: MnemosConfig,
    /// Metadata for each layer that contributed.
    pub layers: Vec<ConfigLayer>,
}

/// Origin for a single config layer in the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigLayerSource {
    /// Locked settings that later layers cannot override.
    Requirements,
    /// System-wide configuration.
    System,
    /// User-specific configuration.
    User,
    /// Project root configuration.
    Project,
    /// Current working directory configuration.
    Cwd,
    /// Repo-local configuration under `.mnemos/`.
    Repo,
    /// File named by `MNEMOS_CONFIG`.
    Env,
    /// Runtime overrides (highest precedence).
    Runtime,
}

/// Metadata about a config layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigLayer {
    /// Layer origin.
    pub source: ConfigLayerSource,
    /// Location on disk.
    pub path: PathBuf,
}

/// Options controlling layered config discovery and overrides.
#[derive(Debug, Clone)]
pub struct LayeredConfigOptions {
    /// Working directory used to find local layers.
    pub cwd: PathBuf,
    /// Optional system config path (defaults to `/etc/mnemos/mnemos.json5` on Unix).
    pub system_config_path: Option<PathBuf>,
    /// Optional user config path (defaults to `~/.mnemos/mnemos.json5`).
    pub user_config_path: Option<PathBuf>,
    /// Optional requirements path for locked settings.
    pub requirements_path: Option<PathBuf>,
    /// Optional path taken from `MNEMOS_CONFIG`.
    pub env_config_path: Option<PathBuf>,
    /// Runtime override config paths applied last.
    pub runtime_paths: Vec<PathBuf>,
    /// Marker files/dirs used to detect the project root.
    pub project_root_markers: Vec<String>,
}

impl LayeredConfigOptions {
    /// Create options with default layer locations for the provided cwd.
    pub fn new(cwd: impl AsRef<Path>) -> Self {
        Self {
            cwd: cwd.as_ref().to_path_buf(),
            system_config_path: layer_io::default_system_config_path(),
            user_config_path: layer_io::default_user_config_path(),
            requirements_path: layer_io::default_requirements_path(),
            env_config_path: std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from),
            runtime_paths: Vec::new(),
            project_root_markers: DEFAULT_PROJECT_ROOT_MARKERS
                .iter()
                .map(|marker| marker.to_string())
                .collect(),
        }
    }

    /// Options that only consider local and runtime layers.
    pub fn local_only(cwd: impl AsRef<Path>) -> Self {
        Self {
            system_config_path: None,
            user_config_path: None,
            requirements_path: None,
            env_config_path: None,
            ..Self::new(cwd)
        }
    }

    /// Add a runtime override config path that is applied last.
    pub fn with_runtime_path(mut self, path: impl AsRef<Path>) -> Self {
        self.runtime_paths.push(path.as_ref().to_path_buf());
        self
    }
}

impl MnemosConfig {
    /// Load a single config from a path (no layering).
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        info!("loading config from path: {}", path.as_ref().display());
        let contents = fs::read_to_string(path)?;
        Self::load_from_str(&contents)
    }

    /// Load a single config from JSON5 contents (no layering).
    pub fn load_from_str(contents: &str) -> Result<Self, ConfigError> {
        debug!("loading config from raw contents (len={})", contents.len());
        let value: Value = json5::from_str(contents)?;
        config_from_value(value, "config")
    }

    /// Load a layered config stack using the default layer locations.
    pub fn load_layered(cwd: impl AsRef<Path>) -> Result<LayeredConfig, ConfigError> {
        info!(
            "loading layered config with defaults (cwd={})",
            cwd.as_ref().display()
        );
        Self::load_layered_with_options(LayeredConfigOptions::new(cwd))
    }

    /// Load a layered config stack using explicit layer locations.
    ///
    /// Precedence (low -> high): requirements, system, user, project, cwd,
    /// repo, env, runtime. Keys set by the requirements layer are locked.
    pub fn load_layered_with_options(
        options: LayeredConfigOptions,
    ) -> Result<LayeredConfig, ConfigError> {
        let cwd = layer_io::normalize_path(&options.cwd)?;
        let project_root = layer_io::find_project_root(&cwd, &options.project_root_markers);
        match project_root.as_ref() {
            Some(root) => debug!("resolved project root: {}", root.display()),
            None => debug!("project root not found; skipping project/repo layers"),
        }

        let mut candidates: Vec<(ConfigLayerSource, PathBuf, bool)> = Vec::new();
        let optional = [
            (ConfigLayerSource::System, options.system_config_path.clone()),
            (ConfigLayerSource::User, options.user_config_path.clone()),
            (
                ConfigLayerSource::Project,
                project_root.as_ref().map(|root| root.join(DEFAULT_CONFIG_FILE)),
            ),
            (ConfigLayerSource::Cwd, Some(cwd.join(DEFAULT_CONFIG_FILE))),
            (
                ConfigLayerSource::Repo,
                project_root
                    .as_ref()
                    .map(|root| root.join(DEFAULT_CONFIG_DIR).join(DEFAULT_CONFIG_FILE)),
            ),
        ];
        for (source, path) in optional {
            if let Some(path) = path {
                candidates.push((source, path, false));
            }
        }
        if let Some(path) = options.env_config_path.clone() {
            candidates.push((ConfigLayerSource::Env, path, true));
        }
        for path in &options.runtime_paths {
            candidates.push((ConfigLayerSource::Runtime, path.clone(), true));
        }

        let requirements = match options.requirements_path.as_deref() {
            Some(path) => layer_io::read_layer(ConfigLayerSource::Requirements, path, false)?,
            None => None,
        };

        let mut layers = Vec::new();
        let mut merged = Value::Object(serde_json::Map::new());
        if let Some((meta, value)) = requirements.as_ref() {
            debug!("applying requirements layer (path={})", meta.path.display());
            merge::merge_layer(&mut merged, value, None);
            layers.push(meta.clone());
        }
        let constraints = requirements.as_ref().map(|(_, value)| value);

        let mut seen_paths = HashSet::new();
        for (source, path, required) in candidates {
            if !seen_paths.insert(layer_io::unique_path(&path)) {
                debug!(
                    "skipping duplicate layer (source={:?}, path={})",
                    source,
                    path.display()
                );
                continue;
            }
            let Some((meta, value)) = layer_io::read_layer(source, &path, required)? else {
                continue;
            };
            debug!("merging layer (source={:?}, path={})", source, path.display());
            merge::merge_layer(&mut merged, &value, constraints);
            layers.push(meta);
        }

        let config = config_from_value(merged, "effective")?;
        info!("layered config loaded (layers={})", layers.len());
        Ok(LayeredConfig { config, layers })
    }

    /// Validate invariants that cannot be expressed in serde.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.embedding_dimension == 0 {
            return Err(ConfigError::Invalid(
                "store.embedding_dimension must be positive".to_string(),
            ));
        }
        if self.store.background_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "store.background_queue_capacity must be positive".to_string(),
            ));
        }
        if self.backends.cache.enabled && self.backends.cache.capacity == 0 {
            return Err(ConfigError::Invalid(
                "backends.cache.capacity must be positive when the cache is enabled".to_string(),
            ));
        }
        ensure_unit_range(
            "lifecycle.eviction_floor",
            self.lifecycle.eviction_floor,
        )?;
        ensure_unit_range(
            "lifecycle.consolidated_min_importance",
            self.lifecycle.consolidated_min_importance,
        )?;
        if self.lifecycle.consolidation_target.is_short_lived() {
            return Err(ConfigError::Invalid(format!(
                "lifecycle.consolidation_target must be semantic or procedural, got {}",
                self.lifecycle.consolidation_target
            )));
        }
        if self.lifecycle.sweep_interval_secs == 0 || self.health.check_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "sweep and health check intervals must be positive".to_string(),
            ));
        }

        for category in MemoryCategory::ALL {
            let route = self.routing.route(category);
            if !route.write.contains(&TierKind::Durable) {
                return Err(ConfigError::Invalid(format!(
                    "routing.{category}.write must include the durable tier"
                )));
            }
            if !route.write.contains(&route.primary) {
                return Err(ConfigError::Invalid(format!(
                    "routing.{category}.primary ({}) must be one of its write tiers",
                    route.primary
                )));
            }
            if route.cache_ttl_secs.is_some() && !route.write.contains(&TierKind::Cache) {
                return Err(ConfigError::Invalid(format!(
                    "routing.{category}.cache_ttl_secs requires the cache tier in write"
                )));
            }
        }

        Ok(())
    }
}

fn ensure_unit_range(path: &str, value: f32) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        return Ok(());
    }
    Err(ConfigError::OutOfRange {
        path: path.to_string(),
        value: f64::from(value),
        min: 0.0,
        max: 1.0,
    })
}

fn config_from_value(value: Value, label: &str) -> Result<MnemosConfig, ConfigError> {
    schema::validate_layer_schema(&value, label)?;
    let config: MnemosConfig = serde_json::from_value(value)?;
    config.validate()?;
    Ok(config)
}
