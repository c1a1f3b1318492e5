//! Errors surfaced by the command-line driver.

use stratus_data::ConfigurationError;
use stratus_train::ingest::IngestError;
use stratus_train::optimize::{CheckpointError, OptimizeError};
use stratus_train::reconstruction::{CarveError, EstimatorError};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed run configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid run configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Carve(#[from] CarveError),
    #[error(transparent)]
    Estimator(#[from] EstimatorError),
    #[error(transparent)]
    Optimize(#[from] OptimizeError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}
