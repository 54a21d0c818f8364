//! Error types for config loading and validation.

use thiserror::Error;

/// Errors returned while loading or validating config.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading a config file failed.
    #[error("failed to read config: {0}")]
    ReadFailed(#[from] std::io::Error),
    /// JSON5 syntax error.
    #[error("failed to parse config: {0}")]
    ParseFailed(#[from] json5::Error),
    /// The merged document did not match the typed model.
    #[error("failed to decode config: {0}")]
    DecodeFailed(#[from] serde_json::Error),
    /// A specific field failed schema validation.
    #[error("invalid config at {path}: {message}")]
    InvalidField { path: String, message: String },
    /// A numeric setting is outside its allowed range.
    #[error("invalid config at {path}: {value} is outside [{min}, {max}]")]
    OutOfRange {
        path: String,
        value: f64,
        min: f64,
        max: f64,
    },
    /// A cross-field invariant does not hold.
    #[error("invalid config: {0}")]
    Invalid(String),
}
