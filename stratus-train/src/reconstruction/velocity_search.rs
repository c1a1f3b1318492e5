//! Candidate lattice and arg-max selection for the advection velocity

use std::cmp::Reverse;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use stratus_data::Velocity;

use crate::reconstruction::CarveError;

/// Bounded 2-D lattice of candidate velocities.
///
/// Candidates run from `-vx_max` to `vx_max` in increments of `step` (and
/// likewise for y). A zero bound disables that axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VelocitySearch {
    pub vx_max: f64,
    pub vy_max: f64,
    #[serde(default = "default_step")]
    pub step: f64,
}

fn default_step() -> f64 {
    1.0
}

impl Default for VelocitySearch {
    fn default() -> Self {
        Self {
            vx_max: 5.0,
            vy_max: 0.0,
            step: default_step(),
        }
    }
}

impl VelocitySearch {
    pub fn validate(&self) -> Result<(), CarveError> {
        let finite_non_negative = |v: f64| v.is_finite() && v >= 0.0;
        if !finite_non_negative(self.vx_max) || !finite_non_negative(self.vy_max) {
            return Err(CarveError::InvalidSearch(format!(
                "velocity bounds must be finite and non-negative, got ({}, {})",
                self.vx_max, self.vy_max
            )));
        }
        if !(self.step.is_finite() && self.step > 0.0) {
            return Err(CarveError::InvalidSearch(format!(
                "velocity step must be positive, got {}",
                self.step
            )));
        }
        Ok(())
    }

    fn axis(&self, bound: f64) -> Vec<f64> {
        let n = (bound / self.step + 1e-9).floor() as i64;
        (-n..=n).map(|i| i as f64 * self.step).collect()
    }

    /// Every candidate, x-major, in ascending order.
    pub fn candidates(&self) -> Vec<Velocity> {
        let ys = self.axis(self.vy_max);
        self.axis(self.vx_max)
            .into_iter()
            .flat_map(|vx| ys.iter().map(move |vy| Velocity::new(vx, *vy)))
            .collect()
    }
}

/// How the carver obtains the advection velocity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum VelocityMode {
    /// Search the lattice for the most consistent velocity.
    Search(VelocitySearch),
    /// Use a velocity known in advance (ground truth). Validation only.
    Known { velocity: Velocity },
}

impl Default for VelocityMode {
    fn default() -> Self {
        VelocityMode::Search(VelocitySearch::default())
    }
}

/// Pick the highest score; ties go to the slowest candidate, then to the
/// lexicographically smallest `(vx, vy)`.
pub fn select_best(scored: &[(Velocity, f64)]) -> Option<(Velocity, f64)> {
    scored.iter().copied().max_by_key(|(v, score)| {
        (
            OrderedFloat(*score),
            Reverse(OrderedFloat(v.norm())),
            Reverse((OrderedFloat(v.vx()), OrderedFloat(v.vy()))),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_bound_disables_axis() {
        let search = VelocitySearch {
            vx_max: 2.0,
            vy_max: 0.0,
            step: 1.0,
        };
        let candidates = search.candidates();
        assert_eq!(candidates.len(), 5);
        assert!(candidates.iter().all(|v| v.vy() == 0.0));
        assert_eq!(candidates[0], Velocity::new(-2.0, 0.0));
        assert_eq!(candidates[4], Velocity::new(2.0, 0.0));
    }

    #[test]
    fn test_two_axis_lattice() {
        let search = VelocitySearch {
            vx_max: 1.0,
            vy_max: 0.5,
            step: 0.5,
        };
        assert_eq!(search.candidates().len(), 5 * 3);
    }

    #[test]
    fn test_invalid_search_rejected() {
        let negative = VelocitySearch {
            vx_max: -1.0,
            vy_max: 0.0,
            step: 1.0,
        };
        assert!(negative.validate().is_err());
        let zero_step = VelocitySearch {
            vx_max: 1.0,
            vy_max: 0.0,
            step: 0.0,
        };
        assert!(zero_step.validate().is_err());
    }

    #[test]
    fn test_ties_prefer_slowest() {
        let scored = vec![
            (Velocity::new(-1.0, 0.0), 4.0),
            (Velocity::new(0.0, 0.0), 4.0),
            (Velocity::new(1.0, 0.0), 4.0),
        ];
        assert_eq!(select_best(&scored), Some((Velocity::ZERO, 4.0)));
    }

    #[test]
    fn test_ties_at_equal_speed_prefer_smallest_components() {
        let scored = vec![(Velocity::new(1.0, 0.0), 2.0), (Velocity::new(-1.0, 0.0), 2.0)];
        assert_eq!(select_best(&scored).map(|(v, _)| v), Some(Velocity::new(-1.0, 0.0)));
    }

    #[test]
    fn test_highest_score_wins() {
        let scored = vec![(Velocity::ZERO, 1.0), (Velocity::new(1.0, 0.0), 3.0)];
        assert_eq!(select_best(&scored), Some((Velocity::new(1.0, 0.0), 3.0)));
    }
}
