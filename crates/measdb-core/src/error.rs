//! Error types for measdb-core.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MeasdbError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The file was written by a newer build. Nothing may touch it.
    #[error("Schema version {found} is newer than the highest supported version {supported}")]
    VersionMismatch { found: u32, supported: u32 },

    #[error("Schema version {found} is older than {current} and automatic upgrade is disabled")]
    UpgradeRequired { found: u32, current: u32 },

    #[error("Invalid parameter spec: {0}")]
    InvalidSpec(String),

    #[error("Run {0} not found")]
    RunNotFound(i64),

    #[error("Run {0} has not been started")]
    RunNotStarted(i64),

    #[error("Run {0} is already started")]
    AlreadyStarted(i64),

    #[error("Run {0} is already completed")]
    AlreadyCompleted(i64),

    #[error("Run {0} is not completed")]
    RunNotComplete(i64),

    #[error("Row {row} does not match the run's parameters: {reason}")]
    RowShapeMismatch { row: usize, reason: String },

    #[error("Stored data is corrupt: {0}")]
    Corrupt(String),

    #[error("Result writer channel closed")]
    ChannelClosed,

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, MeasdbError>;
