//! Voxel occupancy masks.

use crate::{ConfigurationError, Grid, TimeSeries};
use serde::{Deserialize, Serialize};

/// Boolean occupancy over the cells of a grid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoxelMask {
    shape: [usize; 3],
    cells: Vec<bool>,
}

/// One voxel mask per time step, each aligned to that step's grid.
pub type OccupancyMask = TimeSeries<VoxelMask>;

impl VoxelMask {
    pub fn new(shape: [usize; 3], cells: Vec<bool>) -> Result<Self, ConfigurationError> {
        let expected = shape.iter().product();
        if cells.len() != expected {
            return Err(ConfigurationError::LengthMismatch {
                expected,
                actual: cells.len(),
            });
        }
        Ok(Self { shape, cells })
    }

    /// Mask with every cell occupied.
    pub fn full(grid: &Grid) -> Self {
        Self {
            shape: grid.shape(),
            cells: vec![true; grid.len()],
        }
    }

    pub fn empty(grid: &Grid) -> Self {
        Self {
            shape: grid.shape(),
            cells: vec![false; grid.len()],
        }
    }

    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn get(&self, index: usize) -> bool {
        self.cells.get(index).copied().unwrap_or(false)
    }

    pub fn set(&mut self, index: usize, occupied: bool) {
        self.cells[index] = occupied;
    }

    pub fn cells(&self) -> &[bool] {
        &self.cells
    }

    /// Number of occupied cells.
    pub fn count(&self) -> usize {
        self.cells.iter().filter(|c| **c).count()
    }

    /// True when no cell is occupied.
    pub fn is_empty(&self) -> bool {
        !self.cells.iter().any(|c| *c)
    }

    /// Flat indices of occupied cells, ascending.
    pub fn active_indices(&self) -> Vec<usize> {
        self.cells
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.then_some(i))
            .collect()
    }

    pub fn matches_grid(&self, grid: &Grid) -> bool {
        self.shape == grid.shape()
    }
}
