//! Error types for the research engine
//!
//! Only structural problems surface as `Error`: bad arguments, a research
//! folder collision, I/O on the persisted layout. Failures inside experiment
//! units are captured per experiment (see [`crate::experiment::ExceptionInfo`])
//! and never abort a run.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Research engine error types
#[derive(Error, Debug)]
pub enum Error {
    /// Rejected argument (filters, device partition, worker/branch shapes)
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Research folder already exists and would be overwritten
    #[error("Research with name '{}' already exists", .0.display())]
    ResearchExists(PathBuf),

    /// Persisted research or result entry is missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Arrow error
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Parquet error
    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// Generic error
    #[error("{0}")]
    Other(String),
}
