//! Dynamic reconstruction algorithms
//!
//! This module turns thresholded view masks into per-step occupancy and an
//! advection velocity (space carving), and assembles the masked medium state
//! the optimiser works on.

pub mod carver;
pub mod estimator;
pub mod velocity_search;

pub use carver::{CarveConfig, CarveResult, CarveWarning, SpaceCarver};
pub use estimator::DynamicMediumEstimator;
pub use velocity_search::{VelocityMode, VelocitySearch};

use stratus_data::ConfigurationError;

/// Errors that stop carving before any work is done.
#[derive(Debug, thiserror::Error)]
pub enum CarveError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("no time steps to carve")]
    NoTimeSteps,
    #[error("time step {step} has no views")]
    EmptyStep { step: usize },
    #[error("agreement threshold {0} is outside [0, 1]")]
    InvalidAgreement(f64),
    #[error("invalid velocity search: {0}")]
    InvalidSearch(String),
}

/// Errors raised while assembling or updating the masked medium state.
#[derive(Debug, thiserror::Error)]
pub enum EstimatorError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("state vector has length {actual}, expected {expected}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("state element {index} = {value} lies outside [{min}, {max}]")]
    OutOfBounds {
        index: usize,
        value: f64,
        min: f64,
        max: f64,
    },
}
