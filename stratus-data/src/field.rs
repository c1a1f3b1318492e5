//! Bounded scalar fields sampled on a [`Grid`].

use crate::{ConfigurationError, Grid};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Closed interval a field's values must stay inside.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
}

impl Bounds {
    pub fn new(min: f64, max: f64) -> Result<Self, ConfigurationError> {
        if !min.is_finite() || !max.is_finite() || min > max {
            return Err(ConfigurationError::InvalidBounds { min, max });
        }
        Ok(Self { min, max })
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    /// Clamp `value` into the interval. NaN maps to the lower bound.
    pub fn clamp(&self, value: f64) -> f64 {
        if value.is_nan() {
            self.min
        } else {
            value.clamp(self.min, self.max)
        }
    }
}

/// Extinction (or any scalar) values on a shared grid.
///
/// Every update clamps into [`Bounds`], so the field never holds a value
/// outside its interval.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarField {
    grid: Arc<Grid>,
    data: Vec<f64>,
    bounds: Bounds,
}

impl ScalarField {
    /// Create a field, clamping `data` into `bounds`.
    pub fn new(grid: Arc<Grid>, data: Vec<f64>, bounds: Bounds) -> Result<Self, ConfigurationError> {
        if data.len() != grid.len() {
            return Err(ConfigurationError::LengthMismatch {
                expected: grid.len(),
                actual: data.len(),
            });
        }
        let data = data.into_iter().map(|v| bounds.clamp(v)).collect();
        Ok(Self { grid, data, bounds })
    }

    /// Field with the same value in every cell.
    pub fn constant(grid: Arc<Grid>, value: f64, bounds: Bounds) -> Self {
        let data = vec![bounds.clamp(value); grid.len()];
        Self { grid, data, bounds }
    }

    pub fn grid(&self) -> &Arc<Grid> {
        &self.grid
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<f64> {
        self.data.get(index).copied()
    }

    /// Set one cell, returning the stored (clamped) value.
    pub fn set(&mut self, index: usize, value: f64) -> f64 {
        let stored = self.bounds.clamp(value);
        self.data[index] = stored;
        stored
    }

    pub fn set_data(&mut self, data: &[f64]) -> Result<(), ConfigurationError> {
        if data.len() != self.data.len() {
            return Err(ConfigurationError::LengthMismatch {
                expected: self.data.len(),
                actual: data.len(),
            });
        }
        for (dst, src) in self.data.iter_mut().zip(data) {
            *dst = self.bounds.clamp(*src);
        }
        Ok(())
    }

    pub fn fill(&mut self, value: f64) {
        let stored = self.bounds.clamp(value);
        self.data.iter_mut().for_each(|v| *v = stored);
    }

    /// Resample onto `grid` by nearest-neighbour lookup.
    pub fn resample(&self, grid: Arc<Grid>) -> ScalarField {
        let data = (0..grid.len())
            .map(|i| self.data[self.grid.nearest_index(grid.cell_center(i))])
            .collect();
        ScalarField {
            grid,
            data,
            bounds: self.bounds,
        }
    }

    /// Same values on a grid of identical shape (e.g. a translated copy).
    pub fn rebased(&self, grid: Arc<Grid>) -> Result<ScalarField, ConfigurationError> {
        if !grid.same_shape(&self.grid) {
            return Err(ConfigurationError::ShapeMismatch {
                expected: self.grid.shape(),
                actual: grid.shape(),
            });
        }
        Ok(ScalarField {
            grid,
            data: self.data.clone(),
            bounds: self.bounds,
        })
    }
}
