//! Measurement ingestion
//!
//! Provides the view geometry and radiance measurements consumed by the
//! space carver:
//! - Orthographic and perspective projections
//! - Per-time, per-view radiance images
//! - Thresholding of radiance into binary view masks
//! - Loading measurement manifests from disk

pub mod camera;
pub mod measurements;

pub use camera::{OrthographicView, PerspectiveParams, PerspectiveView, Projection};
pub use measurements::{
    MeasurementManifest, Measurements, RadianceImage, RadianceThreshold, ViewMask, ViewMeasurement,
};

use stratus_data::ConfigurationError;

/// Errors that can occur while ingesting measurements
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image decoding error: {0}")]
    ImageDecode(#[from] image::ImageError),
    #[error("Manifest parsing error: {0}")]
    Manifest(#[from] serde_json::Error),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("Invalid view: {0}")]
    InvalidView(String),
    #[error("View {view} at step {step}: image is {actual:?}, projection expects {expected:?}")]
    DimensionMismatch {
        step: usize,
        view: usize,
        expected: (u32, u32),
        actual: (u32, u32),
    },
    #[error("Expected {expected} radiance thresholds (one per view), got {actual}")]
    ThresholdCount { expected: usize, actual: usize },
    #[error("Radiance threshold {0} is not finite")]
    InvalidThreshold(f32),
}
