//! Stratus Data Crate
//!
//! Data model for dynamic cloud tomography: coordinate grids, bounded scalar
//! fields, time series, occupancy masks and the fixed optical properties that
//! accompany an extinction estimate. This crate is solver-agnostic and holds
//! no optimisation logic.

pub mod error;
pub mod field;
pub mod generator;
pub mod grid;
pub mod mask;
pub mod optics;
pub mod time_series;
pub mod velocity;

pub use error::ConfigurationError;
pub use field::{Bounds, ScalarField};
pub use generator::{GridDataFile, MediumGenerator};
pub use grid::Grid;
pub use mask::{OccupancyMask, VoxelMask};
pub use optics::{AirProfile, FixedOptics, PhaseFunction};
pub use time_series::TimeSeries;
pub use velocity::Velocity;
