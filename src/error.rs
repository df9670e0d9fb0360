//! Error types for the trajgrid index engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GridError>;

#[derive(Error, Debug)]
pub enum GridError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Range error: {0}")]
    Range(String),

    #[error("Concurrency error: {0}")]
    Concurrency(String),

    #[error("Missing data: {0}")]
    MissingData(String),

    #[error("Corrupted file: {0}")]
    Corrupted(std::path::PathBuf),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}
