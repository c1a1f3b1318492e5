//! Limited-memory quasi-Newton state and the projected search direction
//!
//! - Box projection and the projected-gradient norm
//! - Free-variable selection (cells pinned at a bound are held)
//! - Two-loop recursion restricted to the free variables

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use stratus_data::Bounds;

/// One curvature pair `s = x_{k+1} - x_k`, `y = g_{k+1} - g_k`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionPair {
    pub s: Vec<f64>,
    pub y: Vec<f64>,
}

/// The most recent `capacity` correction pairs, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LbfgsMemory {
    capacity: usize,
    pairs: VecDeque<CorrectionPair>,
}

impl LbfgsMemory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            pairs: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn pairs(&self) -> impl Iterator<Item = &CorrectionPair> {
        self.pairs.iter()
    }

    pub fn clear(&mut self) {
        self.pairs.clear();
    }

    /// Store a pair unless it violates the curvature condition. Returns
    /// whether the pair was kept.
    pub fn push(&mut self, s: Vec<f64>, y: Vec<f64>) -> bool {
        let sy = dot(&s, &y);
        let yy = dot(&y, &y);
        if !(sy > f64::EPSILON * yy) || !sy.is_finite() {
            return false;
        }
        if self.pairs.len() == self.capacity {
            self.pairs.pop_front();
        }
        self.pairs.push_back(CorrectionPair { s, y });
        true
    }

    /// Reject memories that do not fit a state of `dimension` elements.
    pub fn check(&self, dimension: usize) -> Result<(), String> {
        if self.pairs.len() > self.capacity {
            return Err(format!(
                "{} correction pairs exceed the memory size {}",
                self.pairs.len(),
                self.capacity
            ));
        }
        for (i, pair) in self.pairs.iter().enumerate() {
            if pair.s.len() != dimension || pair.y.len() != dimension {
                return Err(format!("correction pair {i} does not match dimension {dimension}"));
            }
            if pair.s.iter().chain(&pair.y).any(|v| !v.is_finite()) {
                return Err(format!("correction pair {i} contains non-finite values"));
            }
        }
        Ok(())
    }

    /// Quasi-Newton descent direction `-H g` over the free variables.
    ///
    /// Held variables get a zero component. Falls back to steepest descent
    /// when the memory is empty or the result is not a descent direction.
    pub fn direction(&self, gradient: &[f64], free: &[bool]) -> Vec<f64> {
        let masked_dot = |a: &[f64], b: &[f64]| -> f64 {
            a.iter()
                .zip(b)
                .zip(free)
                .filter(|(_, f)| **f)
                .map(|((x, y), _)| x * y)
                .sum()
        };

        let mut q: Vec<f64> = gradient
            .iter()
            .zip(free)
            .map(|(g, f)| if *f { *g } else { 0.0 })
            .collect();
        let steepest: Vec<f64> = q.iter().map(|g| -g).collect();

        let mut alphas = Vec::with_capacity(self.pairs.len());
        for pair in self.pairs.iter().rev() {
            let sy = masked_dot(&pair.s, &pair.y);
            if !(sy > 0.0) {
                alphas.push(None);
                continue;
            }
            let rho = 1.0 / sy;
            let alpha = rho * masked_dot(&pair.s, &q);
            axpy(&mut q, -alpha, &pair.y, free);
            alphas.push(Some((rho, alpha)));
        }

        let gamma = self
            .pairs
            .back()
            .map(|p| masked_dot(&p.s, &p.y) / masked_dot(&p.y, &p.y))
            .filter(|g| g.is_finite() && *g > 0.0)
            .unwrap_or(1.0);
        q.iter_mut().for_each(|v| *v *= gamma);

        for (pair, coeffs) in self.pairs.iter().zip(alphas.into_iter().rev()) {
            if let Some((rho, alpha)) = coeffs {
                let beta = rho * masked_dot(&pair.y, &q);
                axpy(&mut q, alpha - beta, &pair.s, free);
            }
        }

        let direction: Vec<f64> = q.iter().map(|v| -v).collect();
        let slope = masked_dot(&direction, gradient);
        if slope < 0.0 && direction.iter().all(|d| d.is_finite()) {
            direction
        } else {
            steepest
        }
    }
}

fn axpy(target: &mut [f64], a: f64, x: &[f64], free: &[bool]) {
    for ((t, x), f) in target.iter_mut().zip(x).zip(free) {
        if *f {
            *t += a * x;
        }
    }
}

pub(crate) fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Clamp every element into its bounds.
pub fn project(x: &mut [f64], bounds: &[Bounds]) {
    for (v, b) in x.iter_mut().zip(bounds) {
        *v = b.clamp(*v);
    }
}

/// Infinity norm of `P(x - g) - x`, zero exactly at a bound-constrained
/// stationary point.
pub fn projected_gradient_norm(x: &[f64], gradient: &[f64], bounds: &[Bounds]) -> f64 {
    x.iter()
        .zip(gradient)
        .zip(bounds)
        .map(|((x, g), b)| (b.clamp(x - g) - x).abs())
        .fold(0.0, f64::max)
}

/// Variables the next step may move: not fixed, and not pinned at a bound
/// by a gradient pushing outward.
pub fn free_variables(x: &[f64], gradient: &[f64], bounds: &[Bounds]) -> Vec<bool> {
    x.iter()
        .zip(gradient)
        .zip(bounds)
        .map(|((x, g), b)| {
            let at_lower = *x <= b.min && *g > 0.0;
            let at_upper = *x >= b.max && *g < 0.0;
            b.min < b.max && !at_lower && !at_upper
        })
        .collect()
}
