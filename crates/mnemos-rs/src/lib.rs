//! Public SDK surface for Mnemos.
//!
//! Re-exports the workspace crates and wires a [`HybridStore`] from a
//! [`MnemosConfig`], starting the health checks and lifecycle sweeps the
//! config asks for.

mod error;
mod wiring;

/// Re-export for convenience.
pub use mnemos_rs_config as config;
/// Re-export for convenience.
pub use mnemos_rs_memory as memory;
/// Re-export for convenience.
pub use mnemos_rs_protocol as protocol;

pub use error::MnemosError;
pub use wiring::{default_durable_path, lifecycle_policy, routing_policy};

use log::info;
use mnemos_rs_config::{LayeredConfigOptions, MnemosConfig};
use mnemos_rs_memory::{
    Embedder, FlatVectorIndex, HybridStore, InMemoryCache, LifecycleManager, MemoryError,
    SqliteStore,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[inline]
/// Initialize logging using env_logger if the "logging" feature is enabled.
///
/// This is a no-op if the feature is not enabled. Binaries are still expected
/// to call this early in startup to ensure log output is wired up.
pub fn init_logging() {
    #[cfg(feature = "logging")]
    {
        let _ = env_logger::try_init();
    }
}

/// A running memory store plus its background jobs.
///
/// Dropping it stops the health checks and sweeps.
pub struct Mnemos {
    config: MnemosConfig,
    store: Arc<HybridStore>,
    lifecycle: Arc<LifecycleManager>,
    tasks: Vec<JoinHandle<()>>,
}

/// Options for [`Mnemos::open`] that do not live in config files.
pub struct MnemosBuilder {
    config: MnemosConfig,
    embedder: Option<Arc<dyn Embedder>>,
}

impl MnemosBuilder {
    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Open the tiers, build the store and start background jobs.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn open(self) -> Result<Mnemos, MnemosError> {
        let config = self.config;
        config.validate()?;

        let path = wiring::durable_path(&config)?;
        let durable = Arc::new(
            SqliteStore::open(
                &path,
                Duration::from_millis(config.backends.durable.busy_timeout_ms),
            )
            .map_err(|source| MnemosError::OpenDurable {
                path: path.clone(),
                source,
            })?,
        );

        let mut builder = HybridStore::builder(durable.clone())
            .routing(routing_policy(&config.routing).map_err(MemoryError::from)?)
            .embedding_dimension(config.store.embedding_dimension)
            .queue_capacity(config.store.background_queue_capacity);
        if config.backends.cache.enabled {
            builder = builder.cache(Arc::new(InMemoryCache::new(config.backends.cache.capacity)));
        }
        if config.backends.vector.enabled {
            builder = builder.vector(Arc::new(FlatVectorIndex::new()));
        }
        if let Some(timeout_ms) = config.store.operation_timeout_ms {
            builder = builder.operation_timeout(Duration::from_millis(timeout_ms));
        }
        if let Some(embedder) = self.embedder {
            builder = builder.embedder(embedder);
        }
        let store = Arc::new(builder.build()?);
        store.check_health().await;

        let lifecycle = Arc::new(LifecycleManager::new(
            store.clone(),
            lifecycle_policy(&config.lifecycle),
            durable,
        ));

        let mut tasks = Vec::new();
        if config.health.enabled {
            let interval = Duration::from_secs(config.health.check_interval_secs.max(1));
            tasks.push(store.clone().spawn_health_checks(interval));
        }
        if config.lifecycle.enabled {
            let interval = Duration::from_secs(config.lifecycle.sweep_interval_secs.max(1));
            tasks.push(lifecycle.clone().spawn(interval));
        }
        info!(
            "mnemos opened (path={}, background_tasks={})",
            path.display(),
            tasks.len()
        );
        Ok(Mnemos {
            config,
            store,
            lifecycle,
            tasks,
        })
    }
}

impl Mnemos {
    pub fn builder(config: MnemosConfig) -> MnemosBuilder {
        MnemosBuilder {
            config,
            embedder: None,
        }
    }

    /// Open a store from an in-code config.
    pub async fn open(config: MnemosConfig) -> Result<Self, MnemosError> {
        Self::builder(config).open().await
    }

    /// Open a store from layered config files.
    ///
    /// `LayeredConfigOptions::new(cwd)` gives the usual system, user and
    /// project layers.
    pub async fn open_layered(options: LayeredConfigOptions) -> Result<Self, MnemosError> {
        let layered = MnemosConfig::load_layered_with_options(options)?;
        Self::open(layered.config).await
    }

    pub fn config(&self) -> &MnemosConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<HybridStore> {
        &self.store
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    /// Stop background jobs and wait for queued work to finish.
    pub async fn shutdown(mut self) {
        self.stop_tasks();
        self.store.flush().await;
        info!("mnemos shut down");
    }

    fn stop_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Mnemos {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}
