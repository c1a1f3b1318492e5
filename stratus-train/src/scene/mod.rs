//! Medium representation for dynamic tomography
//!
//! This module holds the time-varying medium the optimiser manipulates:
//! one extinction field per acquisition time plus the optical properties
//! and advection velocity shared by every step.

pub mod medium;

pub use medium::MediumState;
