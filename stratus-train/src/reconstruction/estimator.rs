//! Masked state assembly for the dynamic medium

use std::sync::Arc;

use stratus_data::{
    Bounds, ConfigurationError, FixedOptics, Grid, OccupancyMask, ScalarField, TimeSeries, Velocity,
};
use tracing::{debug, info};

use crate::reconstruction::{CarveResult, EstimatorError};
use crate::scene::MediumState;

/// Owns the [`MediumState`] and maps it to and from the flat vector the
/// optimiser manipulates.
///
/// Only occupied cells enter the vector, so its length follows the cloud
/// volume rather than the bounding grid. Unoccupied cells sit at a floor
/// value and are never touched again.
#[derive(Debug, Clone)]
pub struct DynamicMediumEstimator {
    state: MediumState,
    active: Vec<Vec<usize>>,
    offsets: Vec<usize>,
    dimension: usize,
}

impl DynamicMediumEstimator {
    /// Assemble the estimator from initial extinction, carving output and
    /// fixed optics.
    ///
    /// Initial fields on a grid other than the step grid are resampled onto
    /// it. `floor` defaults to each field's lower bound.
    pub fn new(
        initial: &TimeSeries<ScalarField>,
        masks: &OccupancyMask,
        grids: &TimeSeries<Arc<Grid>>,
        velocity: Velocity,
        optics: Arc<FixedOptics>,
        floor: Option<f64>,
    ) -> Result<Self, EstimatorError> {
        if !initial.same_times(masks) || !initial.same_times(grids) {
            return Err(ConfigurationError::Invalid(
                "extinction, mask and grid timestamps differ".into(),
            )
            .into());
        }

        let mut fields = Vec::with_capacity(initial.len());
        let mut active = Vec::with_capacity(initial.len());
        for ((field, mask), grid) in initial.values().iter().zip(masks.values()).zip(grids.values()) {
            if !mask.matches_grid(grid) {
                return Err(ConfigurationError::ShapeMismatch {
                    expected: grid.shape(),
                    actual: mask.shape(),
                }
                .into());
            }
            let mut field = if field.grid().as_ref() == grid.as_ref() {
                field.rebased(grid.clone())?
            } else {
                field.resample(grid.clone())
            };
            let bounds = field.bounds();
            let floor = floor.unwrap_or(bounds.min);
            if !bounds.contains(floor) {
                return Err(ConfigurationError::Invalid(format!(
                    "floor value {floor} lies outside [{}, {}]",
                    bounds.min, bounds.max
                ))
                .into());
            }
            for (i, occupied) in mask.cells().iter().enumerate() {
                if !occupied {
                    field.set(i, floor);
                }
            }
            active.push(mask.active_indices());
            fields.push(field);
        }

        let mut offsets = Vec::with_capacity(active.len());
        let mut dimension = 0;
        for indices in &active {
            offsets.push(dimension);
            dimension += indices.len();
        }

        let extinction = TimeSeries::new(initial.times().to_vec(), fields)?;
        let state = MediumState::new(extinction, optics, velocity)?;
        info!(
            "Medium estimator: {} steps, {} free parameters",
            state.num_steps(),
            dimension
        );
        Ok(Self {
            state,
            active,
            offsets,
            dimension,
        })
    }

    /// Convenience constructor taking masks, grids and velocity from carving.
    pub fn from_carve(
        initial: &TimeSeries<ScalarField>,
        carve: &CarveResult,
        optics: Arc<FixedOptics>,
        floor: Option<f64>,
    ) -> Result<Self, EstimatorError> {
        Self::new(initial, &carve.masks, &carve.grids, carve.velocity, optics, floor)
    }

    /// One copy of `field` per step grid, values unchanged (the medium moves
    /// with the grid).
    pub fn replicate(
        field: &ScalarField,
        grids: &TimeSeries<Arc<Grid>>,
    ) -> Result<TimeSeries<ScalarField>, ConfigurationError> {
        grids.try_map(|grid| field.rebased(grid.clone()))
    }

    pub fn state(&self) -> &MediumState {
        &self.state
    }

    /// Number of free parameters.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn num_steps(&self) -> usize {
        self.active.len()
    }

    /// Flat indices of the free cells of `step`.
    pub fn active_indices(&self, step: usize) -> &[usize] {
        &self.active[step]
    }

    /// Range of the flat state vector belonging to `step`.
    pub fn step_range(&self, step: usize) -> std::ops::Range<usize> {
        let start = self.offsets[step];
        start..start + self.active[step].len()
    }

    /// Occupied cell values of every step, concatenated in time order.
    pub fn flatten(&self) -> Vec<f64> {
        let mut flat = Vec::with_capacity(self.dimension);
        for (field, indices) in self.state.extinction().values().iter().zip(&self.active) {
            flat.extend(indices.iter().map(|i| field.data()[*i]));
        }
        flat
    }

    /// Write a flat vector back into the occupied cells.
    ///
    /// Values are not clipped: anything non-finite or outside its bounds is
    /// rejected and the state is left untouched.
    pub fn unflatten(&mut self, flat: &[f64]) -> Result<(), EstimatorError> {
        if flat.len() != self.dimension {
            return Err(EstimatorError::LengthMismatch {
                expected: self.dimension,
                actual: flat.len(),
            });
        }
        for (step, field) in self.state.extinction().values().iter().enumerate() {
            let bounds = field.bounds();
            for index in self.step_range(step) {
                let value = flat[index];
                if !bounds.contains(value) {
                    return Err(EstimatorError::OutOfBounds {
                        index,
                        value,
                        min: bounds.min,
                        max: bounds.max,
                    });
                }
            }
        }
        let ranges: Vec<_> = (0..self.num_steps()).map(|k| self.step_range(k)).collect();
        for ((field, indices), range) in self.state.extinction_mut().iter_mut().zip(&self.active).zip(ranges) {
            for (cell, value) in indices.iter().zip(&flat[range]) {
                field.set(*cell, *value);
            }
        }
        Ok(())
    }

    /// Bounds of every state element.
    pub fn bounds(&self) -> Vec<Bounds> {
        self.state
            .extinction()
            .values()
            .iter()
            .zip(&self.active)
            .flat_map(|(field, indices)| std::iter::repeat_n(field.bounds(), indices.len()))
            .collect()
    }

    /// Pick the free-cell entries of a dense per-step gradient.
    pub fn gather(&self, step: usize, dense: &[f64]) -> Vec<f64> {
        self.active[step].iter().map(|i| dense[*i]).collect()
    }

    /// Dense view of a flat vector for `step`: free cells from `flat`, the
    /// rest from the current state.
    pub fn scatter(&self, step: usize, flat: &[f64]) -> Vec<f64> {
        let mut dense = self.state.field(step).data().to_vec();
        for (cell, value) in self.active[step].iter().zip(&flat[self.step_range(step)]) {
            dense[*cell] = *value;
        }
        debug!("Scattered {} free values into step {}", self.active[step].len(), step);
        dense
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::DVec3;
    use stratus_data::{PhaseFunction, VoxelMask};

    fn grid() -> Arc<Grid> {
        Arc::new(Grid::uniform(DVec3::ZERO, DVec3::splat(1.0), [2, 2, 2]).unwrap())
    }

    fn optics(grid: &Arc<Grid>) -> Arc<FixedOptics> {
        let albedo = ScalarField::constant(grid.clone(), 0.99, Bounds::new(0.0, 1.0).unwrap());
        Arc::new(FixedOptics::new(0.672, albedo, PhaseFunction::isotropic(), None).unwrap())
    }

    fn estimator(cells: [Vec<bool>; 2], bounds: Bounds) -> DynamicMediumEstimator {
        let g = grid();
        let grids = TimeSeries::new(vec![0.0, 1.0], vec![g.clone(), g.clone()]).unwrap();
        let field = ScalarField::new(g.clone(), (0..8).map(|i| 1.0 + i as f64).collect(), bounds).unwrap();
        let initial = DynamicMediumEstimator::replicate(&field, &grids).unwrap();
        let [a, b] = cells;
        let masks = TimeSeries::new(
            vec![0.0, 1.0],
            vec![VoxelMask::new([2, 2, 2], a).unwrap(), VoxelMask::new([2, 2, 2], b).unwrap()],
        )
        .unwrap();
        DynamicMediumEstimator::new(&initial, &masks, &grids, Velocity::ZERO, optics(&g), None).unwrap()
    }

    fn checker() -> [Vec<bool>; 2] {
        [
            (0..8).map(|i| i % 2 == 0).collect(),
            (0..8).map(|i| i < 3).collect(),
        ]
    }

    #[test]
    fn test_dimension_follows_mask() {
        let est = estimator(checker(), Bounds::new(0.5, 20.0).unwrap());
        assert_eq!(est.dimension(), 4 + 3);
        assert_eq!(est.step_range(1), 4..7);
        assert_eq!(est.flatten(), vec![1.0, 3.0, 5.0, 7.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_unoccupied_cells_held_at_floor() {
        let est = estimator(checker(), Bounds::new(0.5, 20.0).unwrap());
        let field = est.state().field(0);
        assert_eq!(field.data()[1], 0.5);
        assert_eq!(field.data()[2], 3.0);
    }

    #[test]
    fn test_flatten_unflatten_round_trip() {
        let mut est = estimator(checker(), Bounds::new(0.5, 20.0).unwrap());
        let before = est.state().extinction().clone();
        let flat = est.flatten();
        est.unflatten(&flat).unwrap();
        assert_eq!(est.state().extinction(), &before);

        let changed: Vec<f64> = flat.iter().map(|v| v + 0.25).collect();
        est.unflatten(&changed).unwrap();
        assert_eq!(est.flatten(), changed);
    }

    #[test]
    fn test_unflatten_rejects_out_of_bounds_without_partial_write() {
        let mut est = estimator(checker(), Bounds::new(0.5, 20.0).unwrap());
        let before = est.flatten();
        let mut bad = before.clone();
        bad[0] = 2.0;
        bad[6] = 50.0;
        let err = est.unflatten(&bad).unwrap_err();
        assert!(matches!(err, EstimatorError::OutOfBounds { index: 6, .. }));
        assert_eq!(est.flatten(), before);
    }

    #[test]
    fn test_unflatten_rejects_wrong_length() {
        let mut est = estimator(checker(), Bounds::new(0.5, 20.0).unwrap());
        assert!(matches!(
            est.unflatten(&[1.0]),
            Err(EstimatorError::LengthMismatch { expected: 7, actual: 1 })
        ));
    }

    #[test]
    fn test_empty_masks_give_zero_dimension() {
        let mut est = estimator([vec![false; 8], vec![false; 8]], Bounds::new(0.5, 20.0).unwrap());
        assert_eq!(est.dimension(), 0);
        assert!(est.flatten().is_empty());
        est.unflatten(&[]).unwrap();
        assert!(est.bounds().is_empty());
    }

    #[test]
    fn test_gather_and_scatter() {
        let est = estimator(checker(), Bounds::new(0.5, 20.0).unwrap());
        let dense: Vec<f64> = (0..8).map(|i| i as f64 * 10.0).collect();
        assert_eq!(est.gather(1, &dense), vec![0.0, 10.0, 20.0]);
        let flat = vec![9.0; 7];
        let scattered = est.scatter(1, &flat);
        assert_eq!(&scattered[..4], &[9.0, 9.0, 9.0, 0.5]);
    }

    #[test]
    fn test_mask_shape_mismatch_rejected() {
        let g = grid();
        let grids = TimeSeries::new(vec![0.0], vec![g.clone()]).unwrap();
        let field = ScalarField::constant(g.clone(), 1.0, Bounds::new(0.0, 2.0).unwrap());
        let initial = DynamicMediumEstimator::replicate(&field, &grids).unwrap();
        let masks = TimeSeries::new(vec![0.0], vec![VoxelMask::new([1, 1, 1], vec![true]).unwrap()]).unwrap();
        let result = DynamicMediumEstimator::new(&initial, &masks, &grids, Velocity::ZERO, optics(&g), None);
        assert!(matches!(
            result,
            Err(EstimatorError::Configuration(ConfigurationError::ShapeMismatch { .. }))
        ));
    }
}
