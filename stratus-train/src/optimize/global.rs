//! Basin hopping around the local optimiser

use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::optimize::checkpoint::{CheckpointError, CheckpointPolicy, OptimizerCheckpoint};
use crate::optimize::local::{
    LocalOptimizer, OptimizeError, OptimizeResult, OptimizerOptions, OptimizerStatus, StopReason,
};
use crate::optimize::oracle::ForwardOracle;
use crate::reconstruction::DynamicMediumEstimator;

/// Basin-hopping settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalOptions {
    /// Maximum number of hops.
    pub niter: usize,
    /// Stop after this many consecutive hops without a new best.
    pub niter_success: usize,
    pub temperature: f64,
    /// Half-width of the uniform perturbation applied to every element.
    pub stepsize: f64,
    pub seed: u64,
}

impl Default for GlobalOptions {
    fn default() -> Self {
        Self {
            niter: 100,
            niter_success: 20,
            temperature: 1e-3,
            stepsize: 0.5,
            seed: 0,
        }
    }
}

impl GlobalOptions {
    pub fn validate(&self) -> Result<(), OptimizeError> {
        if !(self.temperature.is_finite() && self.temperature >= 0.0) {
            return Err(OptimizeError::InvalidOptions(format!(
                "temperature must be finite and non-negative, got {}",
                self.temperature
            )));
        }
        if !(self.stepsize.is_finite() && self.stepsize >= 0.0) {
            return Err(OptimizeError::InvalidOptions(format!(
                "stepsize must be finite and non-negative, got {}",
                self.stepsize
            )));
        }
        if self.niter_success == 0 {
            return Err(OptimizeError::InvalidOptions("niter_success must be at least 1".into()));
        }
        Ok(())
    }
}

/// Loss recorded for a local run that faulted before producing one. Finite
/// so it survives JSON checkpoints; any real loss compares below it.
pub const UNEVALUATED_LOSS: f64 = f64::MAX;

/// Progress of a basin-hopping search, stored in checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalSearchState {
    pub seed: u64,
    /// Next hop to run.
    pub hop: usize,
    pub temperature: f64,
    /// Last accepted local minimum.
    pub current: Vec<f64>,
    pub current_loss: f64,
    /// Best local result so far.
    pub best: OptimizeResult,
    /// Consecutive hops without improving `best`.
    pub streak: usize,
    pub accepted: usize,
}

/// Outcome of [`GlobalOptimizer::minimize`].
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalResult {
    pub best_state: Vec<f64>,
    /// Local run that produced the best state.
    pub best: OptimizeResult,
    pub hops: usize,
    pub accepted: usize,
}

/// Repeats local optimisation from perturbed starting points and keeps the
/// best minimum. Never calls the oracle itself.
///
/// A local run that ends in an oracle fault is discarded and counts toward
/// the `niter_success` streak; this includes the initial run, whose start
/// state then seeds the search with [`UNEVALUATED_LOSS`].
///
/// Checkpoints are written only between hops. A hop interrupted mid-run is
/// not saved and is repeated in full on resume, with the same perturbation.
pub struct GlobalOptimizer<O> {
    local: LocalOptimizer<O>,
    options: GlobalOptions,
    checkpoint: Option<CheckpointPolicy>,
    search: Option<GlobalSearchState>,
}

impl<O: ForwardOracle> GlobalOptimizer<O> {
    /// Takes over the local optimiser's checkpoint policy: checkpoints are
    /// written between hops and carry the search state.
    pub fn new(mut local: LocalOptimizer<O>, options: GlobalOptions) -> Result<Self, OptimizeError> {
        options.validate()?;
        let checkpoint = local.take_checkpoint_policy();
        Ok(Self {
            local,
            options,
            checkpoint,
            search: None,
        })
    }

    /// Resume a search. The checkpoint's seed and temperature override
    /// `options`, so the remaining hops draw the same perturbations as an
    /// uninterrupted run.
    pub fn from_checkpoint(
        checkpoint: OptimizerCheckpoint,
        estimator: DynamicMediumEstimator,
        oracle: O,
        local_options: OptimizerOptions,
        mut options: GlobalOptions,
    ) -> Result<Self, OptimizeError> {
        let search = checkpoint.global.clone().ok_or(CheckpointError::MissingSearchState)?;
        options.seed = search.seed;
        options.temperature = search.temperature;
        let local = LocalOptimizer::from_checkpoint(checkpoint, estimator, oracle, local_options)?;
        let mut global = Self::new(local, options)?;
        info!(
            "Resuming basin hopping at hop {} (best loss {:.6e}, streak {})",
            search.hop, search.best.loss, search.streak
        );
        global.search = Some(search);
        Ok(global)
    }

    pub fn local(&self) -> &LocalOptimizer<O> {
        &self.local
    }

    pub fn local_mut(&mut self) -> &mut LocalOptimizer<O> {
        &mut self.local
    }

    pub fn search_state(&self) -> Option<&GlobalSearchState> {
        self.search.as_ref()
    }

    /// Snapshot between hops. `None` before the first local run finished.
    pub fn checkpoint(&self) -> Option<OptimizerCheckpoint> {
        let search = self.search.as_ref()?;
        let mut checkpoint = self.local.checkpoint();
        checkpoint.state = search.current.clone();
        checkpoint.iteration = 0;
        checkpoint.memory.clear();
        checkpoint.global = Some(search.clone());
        Some(checkpoint)
    }

    pub fn into_local(self) -> LocalOptimizer<O> {
        self.local
    }

    #[tracing::instrument(skip_all, fields(seed = self.options.seed))]
    pub fn minimize(&mut self) -> Result<GlobalResult, OptimizeError> {
        let stop = self.local.stop_handle();
        let mut last_checkpoint = (self.search.as_ref().map_or(0, |s| s.hop), Instant::now());

        if self.search.is_none() {
            let start = self.local.state().to_vec();
            let (initial, streak) = match self.local.minimize() {
                Ok(result) => (result, 0),
                Err(OptimizeError::Oracle { fault, iteration, .. }) => {
                    warn!("Initial local run failed, hopping from the start state: {}", fault);
                    let failed = OptimizeResult {
                        state: start,
                        converged: false,
                        status: OptimizerStatus::Failed,
                        reason: StopReason::OracleFault,
                        message: fault.to_string(),
                        loss: UNEVALUATED_LOSS,
                        iterations: iteration,
                    };
                    (failed, 1)
                }
                Err(other) => return Err(other),
            };
            self.search = Some(GlobalSearchState {
                seed: self.options.seed,
                hop: 0,
                temperature: self.options.temperature,
                current: initial.state.clone(),
                current_loss: initial.loss,
                best: initial,
                streak,
                accepted: 0,
            });
        }

        loop {
            let Some(search) = self.search.as_mut() else {
                break;
            };
            if search.hop >= self.options.niter || search.streak >= self.options.niter_success {
                break;
            }
            if stop.is_stop_requested() {
                info!("Basin hopping stopped at hop {}", search.hop);
                break;
            }

            let hop = search.hop;
            let mut rng = StdRng::seed_from_u64(search.seed.wrapping_add(hop as u64));
            let start: Vec<f64> = search
                .current
                .iter()
                .map(|v| v + self.options.stepsize * rng.gen_range(-1.0..=1.0))
                .collect();
            let draw: f64 = rng.r#gen();

            self.local.restart_from(start)?;
            let outcome = self.local.minimize();
            let Some(search) = self.search.as_mut() else {
                break;
            };
            match outcome {
                Ok(result) => {
                    let delta = result.loss - search.current_loss;
                    let accept = delta < 0.0 || draw < (-delta / search.temperature).exp();
                    if accept {
                        search.current = result.state.clone();
                        search.current_loss = result.loss;
                        search.accepted += 1;
                    }
                    if result.loss < search.best.loss {
                        info!("Hop {}: new best loss {:.6e}", hop, result.loss);
                        search.best = result;
                        search.streak = 0;
                    } else {
                        search.streak += 1;
                    }
                    debug!("Hop {}: accepted {}, streak {}", hop, accept, search.streak);
                }
                Err(OptimizeError::Oracle { fault, .. }) => {
                    warn!("Hop {} discarded after oracle fault: {}", hop, fault);
                    search.streak += 1;
                }
                Err(other) => return Err(other),
            }
            search.hop += 1;
            self.maybe_checkpoint(&mut last_checkpoint);
        }

        let Some(search) = self.search.as_ref() else {
            return Err(OptimizeError::InvalidOptions("search never started".into()));
        };
        let result = GlobalResult {
            best_state: search.best.state.clone(),
            best: search.best.clone(),
            hops: search.hop,
            accepted: search.accepted,
        };
        self.local.restart_from(result.best_state.clone())?;
        info!(
            "Basin hopping finished after {} hops ({} accepted), best loss {:.6e}",
            result.hops, result.accepted, result.best.loss
        );
        Ok(result)
    }

    fn maybe_checkpoint(&self, last: &mut (usize, Instant)) {
        let (Some(policy), Some(search)) = (&self.checkpoint, &self.search) else {
            return;
        };
        // One hop counts as one iteration of the policy.
        if !policy.is_due(search.hop - last.0, last.1.elapsed()) {
            return;
        }
        let Some(checkpoint) = self.checkpoint() else {
            return;
        };
        match checkpoint.save(&policy.path) {
            Ok(()) => *last = (search.hop, Instant::now()),
            Err(e) => warn!("Failed to write checkpoint {}: {}", policy.path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimize::oracle::{OracleFault, OracleOutput, StepInput};
    use glam::DVec3;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use stratus_data::{Bounds, FixedOptics, Grid, PhaseFunction, ScalarField, TimeSeries, Velocity, VoxelMask};

    fn estimator(initial: f64) -> DynamicMediumEstimator {
        let g = Arc::new(Grid::uniform(DVec3::ZERO, DVec3::ONE, [1, 1, 1]).unwrap());
        let grids = TimeSeries::new(vec![0.0], vec![g.clone()]).unwrap();
        let field = ScalarField::constant(g.clone(), initial, Bounds::new(-3.0, 3.0).unwrap());
        let extinction = DynamicMediumEstimator::replicate(&field, &grids).unwrap();
        let masks = TimeSeries::new(vec![0.0], vec![VoxelMask::full(&g)]).unwrap();
        let albedo = ScalarField::constant(g.clone(), 1.0, Bounds::new(0.0, 1.0).unwrap());
        let optics = Arc::new(FixedOptics::new(0.672, albedo, PhaseFunction::isotropic(), None).unwrap());
        DynamicMediumEstimator::new(&extinction, &masks, &grids, Velocity::ZERO, optics, None).unwrap()
    }

    /// Double well with the shallow minimum near +1 and the deep one near -1.
    struct DoubleWell;

    impl ForwardOracle for DoubleWell {
        fn evaluate(&self, step: StepInput<'_>) -> Result<OracleOutput, OracleFault> {
            let x = step.extinction.data()[0];
            let loss = (x * x - 1.0).powi(2) + 0.3 * x;
            let gradient = 4.0 * x * (x * x - 1.0) + 0.3;
            Ok(OracleOutput {
                loss,
                gradient: vec![gradient],
            })
        }
    }

    /// The double well, faulting on the first `faults` calls.
    struct ColdStart {
        faults: usize,
        calls: AtomicUsize,
    }

    impl ColdStart {
        fn new(faults: usize) -> Self {
            Self {
                faults,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl ForwardOracle for ColdStart {
        fn evaluate(&self, step: StepInput<'_>) -> Result<OracleOutput, OracleFault> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.faults {
                return Err(OracleFault::Solver {
                    step: step.index,
                    message: "solver diverged".into(),
                });
            }
            DoubleWell.evaluate(step)
        }
    }

    fn local(initial: f64) -> LocalOptimizer<DoubleWell> {
        let options = OptimizerOptions {
            gtol: 1e-9,
            ftol: 0.0,
            disp: false,
            ..OptimizerOptions::default()
        };
        LocalOptimizer::new(estimator(initial), DoubleWell, options).unwrap()
    }

    fn options() -> GlobalOptions {
        GlobalOptions {
            niter: 40,
            niter_success: 15,
            temperature: 0.5,
            stepsize: 2.5,
            seed: 7,
        }
    }

    #[test]
    fn test_escapes_shallow_minimum() {
        let mut global = GlobalOptimizer::new(local(1.0), options()).unwrap();
        let result = global.minimize().unwrap();
        assert!(result.best_state[0] < 0.0, "stuck at {}", result.best_state[0]);
        assert!(result.hops >= 15);
        assert_eq!(global.local().state(), result.best_state.as_slice());
    }

    #[test]
    fn test_same_seed_same_search() {
        let first = GlobalOptimizer::new(local(1.0), options()).unwrap().minimize().unwrap();
        let second = GlobalOptimizer::new(local(1.0), options()).unwrap().minimize().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_resume_matches_uninterrupted_search() {
        let full = GlobalOptimizer::new(local(1.0), options()).unwrap().minimize().unwrap();

        let mut partial = GlobalOptimizer::new(
            local(1.0),
            GlobalOptions {
                niter: 4,
                ..options()
            },
        )
        .unwrap();
        partial.minimize().unwrap();
        let checkpoint = partial.checkpoint().unwrap();

        let local_options = OptimizerOptions {
            gtol: 1e-9,
            ftol: 0.0,
            disp: false,
            ..OptimizerOptions::default()
        };
        let mut resumed = GlobalOptimizer::from_checkpoint(
            checkpoint,
            estimator(1.0),
            DoubleWell,
            local_options,
            GlobalOptions { seed: 999, ..options() },
        )
        .unwrap();
        let result = resumed.minimize().unwrap();
        assert_eq!(result, full);
    }

    #[test]
    fn test_missing_search_state_rejected() {
        let checkpoint = local(1.0).checkpoint();
        let result = GlobalOptimizer::from_checkpoint(
            checkpoint,
            estimator(1.0),
            DoubleWell,
            OptimizerOptions::default(),
            options(),
        );
        assert!(matches!(
            result,
            Err(OptimizeError::Checkpoint(CheckpointError::MissingSearchState))
        ));
    }

    #[test]
    fn test_failed_hops_are_discarded() {
        /// Faults whenever the state leaves [0, 2].
        struct Fragile;
        impl ForwardOracle for Fragile {
            fn evaluate(&self, step: StepInput<'_>) -> Result<OracleOutput, OracleFault> {
                let x = step.extinction.data()[0];
                if !(0.0..=2.0).contains(&x) {
                    return Err(OracleFault::NonFinite { step: step.index });
                }
                Ok(OracleOutput {
                    loss: (x - 1.0).powi(2),
                    gradient: vec![2.0 * (x - 1.0)],
                })
            }
        }
        let local_options = OptimizerOptions {
            gtol: 1e-9,
            disp: false,
            ..OptimizerOptions::default()
        };
        let local = LocalOptimizer::new(estimator(1.5), Fragile, local_options).unwrap();
        let mut global = GlobalOptimizer::new(
            local,
            GlobalOptions {
                niter: 20,
                niter_success: 5,
                temperature: 1.0,
                stepsize: 3.0,
                seed: 1,
            },
        )
        .unwrap();
        let result = global.minimize().unwrap();
        assert!((result.best_state[0] - 1.0).abs() < 1e-6);
        assert!(result.hops <= 20);
    }

    #[test]
    fn test_failed_initial_run_keeps_hopping() {
        let local_options = OptimizerOptions {
            gtol: 1e-9,
            ftol: 0.0,
            disp: false,
            ..OptimizerOptions::default()
        };
        // The initial evaluation is retried once, so two faults fail the run.
        let local = LocalOptimizer::new(estimator(1.0), ColdStart::new(2), local_options.clone()).unwrap();
        let mut global = GlobalOptimizer::new(local, options()).unwrap();
        let result = global.minimize().unwrap();
        assert!(result.best.loss < UNEVALUATED_LOSS);
        assert_eq!(result.best.status, OptimizerStatus::Converged);
        assert!(result.hops > 0);

        let local = LocalOptimizer::new(estimator(1.0), ColdStart::new(2), local_options).unwrap();
        let mut global = GlobalOptimizer::new(
            local,
            GlobalOptions {
                niter_success: 1,
                ..options()
            },
        )
        .unwrap();
        let result = global.minimize().unwrap();
        // The failed initial run already exhausts a streak of one.
        assert_eq!(result.hops, 0);
        assert_eq!(result.best.reason, StopReason::OracleFault);
        assert_eq!(result.best.loss, UNEVALUATED_LOSS);
        assert_eq!(result.best_state, vec![1.0]);
        let checkpoint = global.checkpoint().unwrap();
        assert_eq!(checkpoint.global.as_ref().map(|g| g.streak), Some(1));
        checkpoint.validate(&[Bounds::new(-3.0, 3.0).unwrap()]).unwrap();
    }
}
