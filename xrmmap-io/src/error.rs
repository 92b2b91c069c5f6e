//! Map-file error types.

use thiserror::Error;

/// Result type for map-file operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Map-file error types.
#[derive(Error, Debug)]
pub enum Error {
    /// Container, area, work array, ROI or detector does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Container was built from a different scan folder.
    #[error("container belongs to folder '{found}', expected '{expected}'")]
    WrongFolder { expected: String, found: String },

    /// File exists but is not a readable map container.
    #[error("corrupt container: {0}")]
    Corrupt(String),

    /// Mutation attempted without holding ownership.
    #[error("not the owner of this container (owner: {0})")]
    NotOwner(String),

    /// Another live process owns the container.
    #[error("container busy: owned by {0}")]
    Busy(String),

    /// Mutation attempted on a read-only handle.
    #[error("container opened read-only")]
    ReadOnly,

    /// Schema has already been created.
    #[error("schema already built")]
    AlreadyBuilt,

    /// Schema has not been created yet.
    #[error("schema not built")]
    SchemaMissing,

    /// Array shapes are zero or inconsistent.
    #[error("invalid shape: {0}")]
    InvalidShape(String),

    /// Raw row files could not be read yet.
    #[error("failed to read row {row}: {reason}")]
    ReadFailed { row: usize, reason: String },

    /// Row geometry disagrees with the schema.
    #[error("row {row} does not match schema: {detail}")]
    ShapeMismatch { row: usize, detail: String },

    /// Rows must be ingested in increasing order without gaps.
    #[error("row {got} is out of order, expected {expected}")]
    OutOfOrder { expected: usize, got: usize },

    /// Query selected no pixels.
    #[error("selection contains no pixels: {0}")]
    EmptySelection(String),

    /// Name collision for an area or work array.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// HDF5 library error.
    #[error("HDF5 error: {0}")]
    Hdf5(#[from] hdf5::Error),

    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding of stored metadata failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Core library error.
    #[error("core error: {0}")]
    CoreError(#[from] xrmmap_core::Error),
}

impl Error {
    /// Whether waiting and retrying may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ReadFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_read_failed_is_retryable() {
        let transient = Error::ReadFailed {
            row: 3,
            reason: "truncated".to_string(),
        };
        assert!(transient.is_retryable());
        assert!(transient.to_string().contains("row 3"));
        let fatal = Error::ShapeMismatch {
            row: 3,
            detail: "channels".to_string(),
        };
        assert!(!fatal.is_retryable());
        assert!(!Error::NotOwner("host:1".to_string()).is_retryable());
    }
}
