//! Temporal smoothness penalty between consecutive steps
//!
//! Step grids are translated copies of one another, so cell `c` refers to the
//! same parcel of medium at every step and the fields can be compared index
//! by index.

use stratus_data::ScalarField;

/// `S = sum_k sum_c (f_{k+1}(c) - f_k(c))^2`.
pub fn temporal_smoothness(fields: &[ScalarField]) -> f64 {
    fields
        .windows(2)
        .map(|pair| {
            pair[1]
                .data()
                .iter()
                .zip(pair[0].data())
                .map(|(next, current)| (next - current).powi(2))
                .sum::<f64>()
        })
        .sum()
}

/// Dense gradient of [`temporal_smoothness`] for every step.
pub fn temporal_smoothness_gradient(fields: &[ScalarField]) -> Vec<Vec<f64>> {
    let mut gradient: Vec<Vec<f64>> = fields.iter().map(|f| vec![0.0; f.len()]).collect();
    for k in 0..fields.len().saturating_sub(1) {
        let current = fields[k].data();
        let next = fields[k + 1].data();
        for (c, (a, b)) in current.iter().zip(next).enumerate() {
            let diff = 2.0 * (a - b);
            gradient[k][c] += diff;
            gradient[k + 1][c] -= diff;
        }
    }
    gradient
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::DVec3;
    use std::sync::Arc;
    use stratus_data::{Bounds, Grid};

    fn fields(values: &[[f64; 2]]) -> Vec<ScalarField> {
        let grid = Arc::new(Grid::uniform(DVec3::ZERO, DVec3::ONE, [2, 1, 1]).unwrap());
        let bounds = Bounds::new(-10.0, 10.0).unwrap();
        values
            .iter()
            .map(|v| ScalarField::new(grid.clone(), v.to_vec(), bounds).unwrap())
            .collect()
    }

    #[test]
    fn test_single_step_has_no_penalty() {
        let f = fields(&[[1.0, 2.0]]);
        assert_eq!(temporal_smoothness(&f), 0.0);
        assert_eq!(temporal_smoothness_gradient(&f), vec![vec![0.0, 0.0]]);
    }

    #[test]
    fn test_three_step_penalty_and_gradient() {
        let f = fields(&[[0.0, 1.0], [1.0, 1.0], [3.0, 1.0]]);
        assert_eq!(temporal_smoothness(&f), 1.0 + 4.0);
        let g = temporal_smoothness_gradient(&f);
        // Interior step: 2(f1 - f0) + 2(f1 - f2)
        assert_eq!(g[0], vec![-2.0, 0.0]);
        assert_eq!(g[1], vec![2.0 - 4.0, 0.0]);
        assert_eq!(g[2], vec![4.0, 0.0]);
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let f = fields(&[[0.3, 1.2], [0.7, 0.1], [2.0, 1.5]]);
        let g = temporal_smoothness_gradient(&f);
        let h = 1e-6;
        for k in 0..3 {
            for c in 0..2 {
                let mut plus = f.clone();
                plus[k].set(c, f[k].data()[c] + h);
                let mut minus = f.clone();
                minus[k].set(c, f[k].data()[c] - h);
                let fd = (temporal_smoothness(&plus) - temporal_smoothness(&minus)) / (2.0 * h);
                assert!((fd - g[k][c]).abs() < 1e-5, "step {k} cell {c}: {fd} vs {}", g[k][c]);
            }
        }
    }
}
