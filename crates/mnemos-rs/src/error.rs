//! Errors returned by the SDK facade.

use mnemos_rs_config::ConfigError;
use mnemos_rs_memory::{BackendError, MemoryError};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MnemosError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    /// The durable SQLite file could not be opened.
    #[error("failed to open durable store at {path}: {source}")]
    OpenDurable {
        path: PathBuf,
        #[source]
        source: BackendError,
    },
    /// No durable path was configured and no home directory is known.
    #[error("no durable path configured and no home directory found")]
    NoHomeDirectory,
}
