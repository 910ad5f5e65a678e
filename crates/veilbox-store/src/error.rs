use thiserror::Error;

/// Errors produced by the persistence layer.
///
/// Store operations themselves never fail; only loading and saving
/// snapshots can.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Reading or writing a snapshot file failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A snapshot file is not valid JSON for its record type.
    #[error("Snapshot encoding error: {0}")]
    Json(#[from] serde_json::Error),

    /// A snapshot file parsed but holds unusable data.
    #[error("Corrupt snapshot: {0}")]
    Corrupt(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
