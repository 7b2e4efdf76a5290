//! Error types for the indicator engine

use thiserror::Error;

/// Result type used across the library
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can reach a caller of the engine.
///
/// Messy external data never ends up here: malformed records and fields are
/// skipped and logged by the normalizer, and cache outages are absorbed by the
/// coordinator.
#[derive(Error, Debug)]
pub enum Error {
    /// Threshold or application configuration rejected at construction
    #[error("Configuration error: {0}")]
    Config(String),

    /// The academic data source could not deliver a payload
    #[error("Source error: {0}")]
    Source(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}
