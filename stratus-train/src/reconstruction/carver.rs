//! Dynamic space carving: occupancy and advection velocity from view masks

use std::sync::Arc;

use glam::DVec3;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use stratus_data::{Grid, OccupancyMask, TimeSeries, Velocity, VoxelMask};
use tracing::{debug, info, warn};

use crate::ingest::ViewMask;
use crate::reconstruction::velocity_search::select_best;
use crate::reconstruction::{CarveError, VelocityMode};

/// Carving parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CarveConfig {
    /// A cell is occupied when the fraction of views flagging it exceeds this.
    pub agreement: f64,
    pub velocity: VelocityMode,
}

impl Default for CarveConfig {
    fn default() -> Self {
        Self {
            agreement: 0.9,
            velocity: VelocityMode::default(),
        }
    }
}

/// Recoverable degeneracies recorded while carving.
#[derive(Debug, Clone, PartialEq)]
pub enum CarveWarning {
    /// Fewer than two time steps: the velocity was forced to zero.
    UndefinedVelocity { steps: usize },
    /// No cell was occupied at this step; the empty mask was kept.
    EmptyMask { step: usize, time: f64 },
}

/// Output of [`SpaceCarver::carve`].
#[derive(Debug, Clone)]
pub struct CarveResult {
    /// One mask per time step, aligned to the matching entry of `grids`.
    pub masks: OccupancyMask,
    /// The initial grid advected to each time step.
    pub grids: TimeSeries<Arc<Grid>>,
    pub velocity: Velocity,
    /// Sum over cells of the smallest per-step agreement. Independent of
    /// the agreement threshold.
    pub score: f64,
    pub warnings: Vec<CarveWarning>,
}

impl CarveResult {
    pub fn occupied_cells(&self) -> usize {
        self.masks.values().iter().map(VoxelMask::count).sum()
    }
}

/// Per-step agreement fractions for one candidate velocity.
struct Agreement {
    per_step: Vec<Vec<f64>>,
}

impl Agreement {
    fn occupied(&self, step: usize, cell: usize, threshold: f64) -> bool {
        self.per_step[step][cell] > threshold
    }

    /// Sum over cells of the weakest agreement across steps.
    ///
    /// Computed on the unthresholded fractions, so the winning velocity
    /// does not move with the agreement threshold.
    fn consistent_score(&self) -> f64 {
        let cells = self.per_step.first().map_or(0, Vec::len);
        (0..cells)
            .map(|c| self.per_step.iter().map(|a| a[c]).fold(f64::INFINITY, f64::min))
            .sum()
    }
}

/// Infers per-step occupancy and a rigid horizontal velocity from binary
/// view masks.
pub struct SpaceCarver {
    masks: TimeSeries<Vec<ViewMask>>,
}

impl SpaceCarver {
    pub fn new(masks: TimeSeries<Vec<ViewMask>>) -> Result<Self, CarveError> {
        if masks.is_empty() {
            return Err(CarveError::NoTimeSteps);
        }
        if let Some(step) = masks.values().iter().position(Vec::is_empty) {
            return Err(CarveError::EmptyStep { step });
        }
        Ok(Self { masks })
    }

    pub fn masks(&self) -> &TimeSeries<Vec<ViewMask>> {
        &self.masks
    }

    /// Fraction of step-`k` views flagging each cell of `grid` advected by `velocity`.
    fn agreement(&self, grid: &Grid, velocity: Velocity) -> Agreement {
        let per_step = (0..self.masks.len())
            .map(|k| {
                let views = &self.masks.values()[k];
                let offset = velocity.displacement(self.masks.elapsed(k));
                let total = views.len() as f64;
                (0..grid.len())
                    .map(|i| {
                        let center = grid.cell_center(i);
                        let p = DVec3::new(center.x + offset.x, center.y + offset.y, center.z);
                        views.iter().filter(|m| m.sees(p)).count() as f64 / total
                    })
                    .collect()
            })
            .collect();
        Agreement { per_step }
    }

    /// Score every candidate in parallel and reduce in candidate order.
    fn search(&self, grid: &Grid, candidates: &[Velocity]) -> (Velocity, f64) {
        let scored: Vec<(Velocity, f64)> = candidates
            .par_iter()
            .map(|v| (*v, self.agreement(grid, *v).consistent_score()))
            .collect();
        for (v, score) in &scored {
            debug!("Velocity candidate ({:.3}, {:.3}): score {:.4}", v.vx(), v.vy(), score);
        }
        select_best(&scored).unwrap_or((Velocity::ZERO, 0.0))
    }

    /// Carve occupancy on `grid` and select the advection velocity.
    #[tracing::instrument(skip_all, fields(steps = self.masks.len(), cells = grid.len()))]
    pub fn carve(&self, grid: &Grid, config: &CarveConfig) -> Result<CarveResult, CarveError> {
        let threshold = config.agreement;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(CarveError::InvalidAgreement(threshold));
        }

        let mut warnings = Vec::new();
        let steps = self.masks.len();
        let velocity = if steps < 2 {
            warn!("Only {} time step(s): advection velocity undefined, using zero", steps);
            warnings.push(CarveWarning::UndefinedVelocity { steps });
            Velocity::ZERO
        } else {
            match config.velocity {
                VelocityMode::Known { velocity } => {
                    warn!(
                        "Using supplied velocity ({}, {}) instead of searching",
                        velocity.vx(),
                        velocity.vy()
                    );
                    velocity
                }
                VelocityMode::Search(search) => {
                    search.validate()?;
                    let candidates = search.candidates();
                    let (velocity, score) = self.search(grid, &candidates);
                    info!(
                        "Selected velocity ({}, {}) from {} candidates (score {:.4})",
                        velocity.vx(),
                        velocity.vy(),
                        candidates.len(),
                        score
                    );
                    velocity
                }
            }
        };

        let agreement = self.agreement(grid, velocity);
        let score = agreement.consistent_score();

        let mut masks = Vec::with_capacity(steps);
        let mut grids = Vec::with_capacity(steps);
        for (k, time) in self.masks.times().iter().enumerate() {
            let cells = (0..grid.len()).map(|c| agreement.occupied(k, c, threshold)).collect();
            let mask = VoxelMask::new(grid.shape(), cells)?;
            if mask.is_empty() {
                warn!("Carved mask at step {} (t = {}) is empty", k, time);
                warnings.push(CarveWarning::EmptyMask { step: k, time: *time });
            } else {
                debug!("Step {}: {} occupied cells", k, mask.count());
            }
            masks.push(mask);
            grids.push(Arc::new(grid.translated(velocity.displacement(self.masks.elapsed(k)))));
        }

        let times = self.masks.times().to_vec();
        Ok(CarveResult {
            masks: TimeSeries::new(times.clone(), masks)?,
            grids: TimeSeries::new(times, grids)?,
            velocity,
            score,
            warnings,
        })
    }
}
