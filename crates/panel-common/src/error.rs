//! Error types for snapshot handling

use thiserror::Error;

/// Snapshot handling error type
#[derive(Error, Debug)]
pub enum SnapshotError {
    /// Export document is not valid JSON
    #[error("malformed snapshot: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Result type for snapshot handling
pub type SnapshotResult<T> = Result<T, SnapshotError>;
