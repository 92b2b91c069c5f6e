//! Error types for xrmmap-core.

use thiserror::Error;

/// Result type alias for xrmmap-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for row validation and configuration handling.
#[derive(Error, Debug)]
pub enum Error {
    /// Array shapes are zero or disagree with each other.
    #[error("invalid shape: {0}")]
    InvalidShape(String),

    /// Scan configuration is incomplete or inconsistent.
    #[error("configuration error: {0}")]
    InvalidConfig(String),

    /// A named item (ROI, scaler, detector) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A text input (environment file, geometry file) could not be parsed.
    #[error("parse error at line {line}: {reason}")]
    Parse { line: usize, reason: String },

    /// Reading a configuration file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML deserialization failed.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}
