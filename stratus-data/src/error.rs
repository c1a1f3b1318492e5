//! Configuration errors raised while building the data model.

use thiserror::Error;

/// Invalid input detected before any expensive work starts.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("grid axis '{axis}' is empty")]
    EmptyAxis { axis: char },

    #[error("grid axis '{axis}' is not strictly increasing at index {index}")]
    NonIncreasingAxis { axis: char, index: usize },

    #[error("grid axis '{axis}' contains a non-finite coordinate")]
    NonFiniteAxis { axis: char },

    #[error("data length {actual} does not match grid size {expected}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("invalid bounds [{min}, {max}]")]
    InvalidBounds { min: f64, max: f64 },

    #[error("timestamps are not strictly increasing at index {index}")]
    NonIncreasingTimestamps { index: usize },

    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: [usize; 3],
        actual: [usize; 3],
    },

    #[error("{0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),
}

impl From<std::io::Error> for ConfigurationError {
    fn from(err: std::io::Error) -> Self {
        ConfigurationError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ConfigurationError {
    fn from(err: serde_json::Error) -> Self {
        ConfigurationError::Json(err.to_string())
    }
}
