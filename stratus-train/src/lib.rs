//! Stratus Training Crate
//!
//! Reconstruction of a moving cloud's extinction field from multi-view,
//! multi-time radiance measurements.
//!
//! ## Modules
//!
//! - [`ingest`]: View geometry, radiance measurements and view masks
//! - [`scene`]: Time-varying medium state
//! - [`reconstruction`]: Dynamic space carving and masked state assembly
//! - [`optimize`]: Oracle seam, local and global optimisers, checkpoints

pub mod ingest;
pub mod optimize;
pub mod reconstruction;
pub mod scene;

pub use ingest::{Measurements, Projection, RadianceThreshold, ViewMask};
pub use optimize::{
    FieldMatchOracle, ForwardOracle, GlobalOptimizer, GlobalOptions, LocalOptimizer, OptimizerCheckpoint,
    OptimizerOptions,
};
pub use reconstruction::{CarveConfig, CarveResult, DynamicMediumEstimator, SpaceCarver};
pub use scene::MediumState;
