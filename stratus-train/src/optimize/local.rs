//! Bound-constrained quasi-Newton minimisation of the medium state
//!
//! Each iteration evaluates the oracle on every time step (optionally on a
//! worker pool), takes one projected L-BFGS step with a backtracking line
//! search, then notifies observers and writes a checkpoint when one is due.

use std::time::{Duration, Instant};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use stratus_data::Bounds;
use tracing::{debug, info, warn};

use crate::optimize::checkpoint::{CHECKPOINT_VERSION, CheckpointError, CheckpointPolicy, OptimizerCheckpoint};
use crate::optimize::lbfgs::{self, LbfgsMemory};
use crate::optimize::observer::{IterationEvent, IterationObserver, StopHandle};
use crate::optimize::oracle::{ForwardOracle, OracleFault, OracleOutput, StepInput};
use crate::optimize::regularization::{temporal_smoothness, temporal_smoothness_gradient};
use crate::reconstruction::{DynamicMediumEstimator, EstimatorError};

/// Sufficient-decrease constant of the Armijo condition.
const ARMIJO: f64 = 1e-4;
/// Step damping applied when a trial point makes the oracle fault.
const FAULT_DAMPING: f64 = 0.1;
const BACKTRACK: f64 = 0.5;

/// Local optimiser settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerOptions {
    pub maxiter: usize,
    /// Line-search trials per iteration.
    pub maxls: usize,
    pub gtol: f64,
    pub ftol: f64,
    /// Number of correction pairs kept.
    pub memory: usize,
    /// Worker threads for per-step oracle evaluation.
    pub parallelism: usize,
    /// Weight of the temporal smoothness term. Zero disables it.
    pub regularization: f64,
    /// Log every iteration at info level.
    pub disp: bool,
    pub checkpoint: Option<CheckpointPolicy>,
}

impl Default for OptimizerOptions {
    fn default() -> Self {
        Self {
            maxiter: 1000,
            maxls: 30,
            gtol: 1e-16,
            ftol: 1e-16,
            memory: 10,
            parallelism: 1,
            regularization: 0.0,
            disp: true,
            checkpoint: None,
        }
    }
}

impl OptimizerOptions {
    pub fn validate(&self) -> Result<(), OptimizeError> {
        let non_negative = |v: f64| v.is_finite() && v >= 0.0;
        if self.maxls == 0 {
            return Err(OptimizeError::InvalidOptions("maxls must be at least 1".into()));
        }
        if self.memory == 0 {
            return Err(OptimizeError::InvalidOptions("memory must be at least 1".into()));
        }
        if self.parallelism == 0 {
            return Err(OptimizeError::InvalidOptions("parallelism must be at least 1".into()));
        }
        if !non_negative(self.gtol) || !non_negative(self.ftol) {
            return Err(OptimizeError::InvalidOptions(format!(
                "tolerances must be finite and non-negative (gtol {}, ftol {})",
                self.gtol, self.ftol
            )));
        }
        if !non_negative(self.regularization) {
            return Err(OptimizeError::InvalidOptions(format!(
                "regularization must be finite and non-negative, got {}",
                self.regularization
            )));
        }
        Ok(())
    }
}

/// Lifecycle of a [`LocalOptimizer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizerStatus {
    Initialized,
    Running,
    Converged,
    Failed,
}

/// Which stopping rule ended a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    GradientTolerance,
    FunctionTolerance,
    MaxIterations,
    LineSearchExhausted,
    StopRequested,
    /// The forward model faulted twice in a row.
    OracleFault,
}

impl StopReason {
    /// Whether the rule certifies a (local) optimum.
    pub fn is_converged(self) -> bool {
        matches!(self, StopReason::GradientTolerance | StopReason::FunctionTolerance)
    }

    pub fn message(self) -> &'static str {
        match self {
            StopReason::GradientTolerance => "projected gradient norm below gtol",
            StopReason::FunctionTolerance => "relative reduction of the loss below ftol",
            StopReason::MaxIterations => "iteration limit reached",
            StopReason::LineSearchExhausted => "line search found no acceptable step within maxls trials",
            StopReason::StopRequested => "stop requested",
            StopReason::OracleFault => "forward model fault",
        }
    }
}

/// Outcome of [`LocalOptimizer::minimize`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizeResult {
    /// Final flattened state.
    pub state: Vec<f64>,
    pub converged: bool,
    pub status: OptimizerStatus,
    pub reason: StopReason,
    pub message: String,
    pub loss: f64,
    /// Iterations completed, including those restored from a checkpoint.
    pub iterations: usize,
}

/// Errors that end a local run.
#[derive(Debug, thiserror::Error)]
pub enum OptimizeError {
    #[error("oracle fault at iteration {iteration}: {fault}")]
    Oracle {
        fault: OracleFault,
        /// The state the oracle faulted on.
        state: Vec<f64>,
        iteration: usize,
    },
    #[error(transparent)]
    Estimator(#[from] EstimatorError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error("Failed to build oracle worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("Invalid optimizer options: {0}")]
    InvalidOptions(String),
}

/// Loss and free-variable gradient at one point.
#[derive(Debug, Clone)]
struct Evaluation {
    loss: f64,
    gradient: Vec<f64>,
}

/// Drives the medium state to a bound-constrained local minimum of the
/// oracle loss plus temporal regularisation.
pub struct LocalOptimizer<O> {
    estimator: DynamicMediumEstimator,
    oracle: O,
    options: OptimizerOptions,
    bounds: Vec<Bounds>,
    x: Vec<f64>,
    memory: LbfgsMemory,
    iteration: usize,
    elapsed: Duration,
    status: OptimizerStatus,
    pool: Option<rayon::ThreadPool>,
    observers: Vec<Box<dyn IterationObserver>>,
    stop: StopHandle,
}

impl<O: ForwardOracle> LocalOptimizer<O> {
    /// Start from the estimator's current state.
    pub fn new(
        estimator: DynamicMediumEstimator,
        oracle: O,
        options: OptimizerOptions,
    ) -> Result<Self, OptimizeError> {
        options.validate()?;
        let bounds = estimator.bounds();
        let mut x = estimator.flatten();
        lbfgs::project(&mut x, &bounds);
        let pool = build_pool(options.parallelism)?;
        Ok(Self {
            estimator,
            oracle,
            memory: LbfgsMemory::new(options.memory),
            options,
            bounds,
            x,
            iteration: 0,
            elapsed: Duration::ZERO,
            status: OptimizerStatus::Initialized,
            pool,
            observers: Vec::new(),
            stop: StopHandle::new(),
        })
    }

    /// Rebuild an optimiser from a checkpoint.
    ///
    /// The checkpoint's state, iteration count, elapsed time, regularisation
    /// weight and quasi-Newton memory replace whatever `estimator` and
    /// `options` say. A checkpoint that does not fit the medium is rejected
    /// before anything is restored.
    pub fn from_checkpoint(
        checkpoint: OptimizerCheckpoint,
        mut estimator: DynamicMediumEstimator,
        oracle: O,
        mut options: OptimizerOptions,
    ) -> Result<Self, OptimizeError> {
        let bounds = estimator.bounds();
        checkpoint.validate(&bounds)?;
        options.regularization = checkpoint.regularization;
        options.validate()?;
        estimator.unflatten(&checkpoint.state)?;
        let pool = build_pool(options.parallelism)?;
        info!(
            "Resuming from iteration {} ({:.1}s elapsed, {} correction pairs)",
            checkpoint.iteration,
            checkpoint.elapsed_seconds,
            checkpoint.memory.len()
        );
        Ok(Self {
            elapsed: checkpoint.elapsed(),
            estimator,
            oracle,
            options,
            bounds,
            x: checkpoint.state,
            memory: checkpoint.memory,
            iteration: checkpoint.iteration,
            status: OptimizerStatus::Initialized,
            pool,
            observers: Vec::new(),
            stop: StopHandle::new(),
        })
    }

    /// Snapshot at the current iteration boundary.
    pub fn checkpoint(&self) -> OptimizerCheckpoint {
        OptimizerCheckpoint {
            version: CHECKPOINT_VERSION,
            state: self.x.clone(),
            iteration: self.iteration,
            elapsed_seconds: self.elapsed.as_secs_f64(),
            regularization: self.options.regularization,
            memory: self.memory.clone(),
            global: None,
        }
    }

    pub fn add_observer(&mut self, observer: Box<dyn IterationObserver>) {
        self.observers.push(observer);
    }

    /// Handle that stops the run at the next iteration boundary.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn status(&self) -> OptimizerStatus {
        self.status
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Current flattened state.
    pub fn state(&self) -> &[f64] {
        &self.x
    }

    pub fn bounds(&self) -> &[Bounds] {
        &self.bounds
    }

    pub fn options(&self) -> &OptimizerOptions {
        &self.options
    }

    pub fn estimator(&self) -> &DynamicMediumEstimator {
        &self.estimator
    }

    pub fn into_estimator(self) -> DynamicMediumEstimator {
        self.estimator
    }

    pub(crate) fn take_checkpoint_policy(&mut self) -> Option<CheckpointPolicy> {
        self.options.checkpoint.take()
    }

    /// Start a fresh run from `x`: memory cleared, iteration count reset.
    /// `x` is clamped into bounds.
    pub fn restart_from(&mut self, mut x: Vec<f64>) -> Result<(), OptimizeError> {
        if x.len() != self.bounds.len() {
            return Err(EstimatorError::LengthMismatch {
                expected: self.bounds.len(),
                actual: x.len(),
            }
            .into());
        }
        lbfgs::project(&mut x, &self.bounds);
        self.estimator.unflatten(&x)?;
        self.x = x;
        self.memory.clear();
        self.iteration = 0;
        self.status = OptimizerStatus::Initialized;
        Ok(())
    }

    /// Run until a stopping rule fires.
    ///
    /// Oracle faults are retried once with a damped step; a second
    /// consecutive fault fails the run. The estimator is left holding the
    /// last accepted state either way.
    #[tracing::instrument(skip_all, fields(dimension = self.x.len(), start = self.iteration))]
    pub fn minimize(&mut self) -> Result<OptimizeResult, OptimizeError> {
        let started = Instant::now();
        let base_elapsed = self.elapsed;
        let mut last_checkpoint = (self.iteration, Instant::now());
        self.status = OptimizerStatus::Running;

        let x0 = self.x.clone();
        let mut current = match self.evaluate(&x0)? {
            Ok(eval) => eval,
            Err(fault) => {
                warn!("Oracle fault on the initial state, re-evaluating: {}", fault);
                match self.evaluate(&x0)? {
                    Ok(eval) => eval,
                    Err(fault) => return self.fail(fault, x0),
                }
            }
        };

        let reason = loop {
            let pg_norm = lbfgs::projected_gradient_norm(&self.x, &current.gradient, &self.bounds);
            if pg_norm <= self.options.gtol {
                break StopReason::GradientTolerance;
            }
            if self.iteration >= self.options.maxiter {
                break StopReason::MaxIterations;
            }
            if self.stop.is_stop_requested() {
                break StopReason::StopRequested;
            }

            let free = lbfgs::free_variables(&self.x, &current.gradient, &self.bounds);
            let direction = self.memory.direction(&current.gradient, &free);
            let (trial, next) = match self.line_search(&current, &direction)? {
                Some(accepted) => accepted,
                None => break StopReason::LineSearchExhausted,
            };

            let s: Vec<f64> = trial.iter().zip(&self.x).map(|(a, b)| a - b).collect();
            let y: Vec<f64> = next.gradient.iter().zip(&current.gradient).map(|(a, b)| a - b).collect();
            if !self.memory.push(s, y) {
                debug!("Skipped correction pair violating the curvature condition");
            }
            let previous = current.loss;
            self.x = trial;
            current = next;
            self.iteration += 1;
            self.elapsed = base_elapsed + started.elapsed();

            let pg_norm = lbfgs::projected_gradient_norm(&self.x, &current.gradient, &self.bounds);
            if self.options.disp {
                info!(
                    "iter {:>5}  loss {:.6e}  |pg| {:.3e}",
                    self.iteration, current.loss, pg_norm
                );
            }
            let event = IterationEvent {
                iteration: self.iteration,
                loss: current.loss,
                projected_gradient_norm: pg_norm,
                state: &self.x,
                elapsed: self.elapsed,
            };
            for observer in &mut self.observers {
                observer.on_iteration(&event);
            }
            self.maybe_checkpoint(&mut last_checkpoint);

            let scale = previous.abs().max(current.loss.abs()).max(1.0);
            if (previous - current.loss) / scale <= self.options.ftol {
                break StopReason::FunctionTolerance;
            }
        };

        self.estimator.unflatten(&self.x)?;
        self.elapsed = base_elapsed + started.elapsed();
        self.status = OptimizerStatus::Converged;
        if reason == StopReason::LineSearchExhausted {
            warn!("Stopping: {}", reason.message());
        }
        info!(
            "Local optimisation finished after {} iterations: {} (loss {:.6e})",
            self.iteration,
            reason.message(),
            current.loss
        );
        for observer in &mut self.observers {
            observer.on_finish(reason.message());
        }
        Ok(OptimizeResult {
            state: self.x.clone(),
            converged: reason.is_converged(),
            status: self.status,
            reason,
            message: reason.message().to_string(),
            loss: current.loss,
            iterations: self.iteration,
        })
    }

    /// Projected backtracking along `direction`. Returns the accepted point
    /// and its evaluation, or `None` when `maxls` trials found none.
    fn line_search(
        &mut self,
        current: &Evaluation,
        direction: &[f64],
    ) -> Result<Option<(Vec<f64>, Evaluation)>, OptimizeError> {
        let norm = lbfgs::dot(direction, direction).sqrt();
        if !(norm > 0.0) {
            return Ok(None);
        }
        let mut step = if self.memory.is_empty() { (1.0 / norm).min(1.0) } else { 1.0 };
        let mut faulted = false;

        for trial_index in 0..self.options.maxls {
            let mut trial: Vec<f64> = self.x.iter().zip(direction).map(|(x, d)| x + step * d).collect();
            lbfgs::project(&mut trial, &self.bounds);

            match self.evaluate(&trial)? {
                Err(fault) if faulted => return self.fail(fault, trial),
                Err(fault) => {
                    warn!("Oracle fault on trial {}, retrying with a damped step: {}", trial_index, fault);
                    faulted = true;
                    step *= FAULT_DAMPING;
                }
                Ok(eval) => {
                    faulted = false;
                    let moved: Vec<f64> = trial.iter().zip(&self.x).map(|(t, x)| t - x).collect();
                    let decrease = lbfgs::dot(&current.gradient, &moved);
                    if eval.loss <= current.loss + ARMIJO * decrease {
                        return Ok(Some((trial, eval)));
                    }
                    step *= BACKTRACK;
                }
            }
        }
        Ok(None)
    }

    fn fail<T>(&mut self, fault: OracleFault, state: Vec<f64>) -> Result<T, OptimizeError> {
        self.status = OptimizerStatus::Failed;
        self.estimator.unflatten(&self.x)?;
        warn!("Local optimisation failed at iteration {}: {}", self.iteration, fault);
        for observer in &mut self.observers {
            observer.on_finish(&fault.to_string());
        }
        Err(OptimizeError::Oracle {
            fault,
            state,
            iteration: self.iteration,
        })
    }

    /// Loss and gradient at `x`. An outer error is fatal; an inner fault may
    /// be retried by the caller.
    fn evaluate(&mut self, x: &[f64]) -> Result<Result<Evaluation, OracleFault>, OptimizeError> {
        self.estimator.unflatten(x)?;
        let state = self.estimator.state();
        let inputs: Vec<StepInput<'_>> = state
            .extinction()
            .iter()
            .enumerate()
            .map(|(index, (time, extinction))| StepInput {
                index,
                time,
                extinction,
                optics: state.optics(),
                velocity: state.velocity(),
            })
            .collect();

        let oracle = &self.oracle;
        let outputs: Vec<Result<OracleOutput, OracleFault>> = match &self.pool {
            Some(pool) => pool.install(|| inputs.par_iter().map(|input| oracle.evaluate(*input)).collect()),
            None => inputs.iter().map(|input| oracle.evaluate(*input)).collect(),
        };

        let mut loss = 0.0;
        let mut gradient = Vec::with_capacity(self.estimator.dimension());
        for (step, output) in outputs.into_iter().enumerate() {
            let output = match output {
                Ok(output) => output,
                Err(fault) => return Ok(Err(fault)),
            };
            if let Err(fault) = output.validate(step, state.field(step).len()) {
                return Ok(Err(fault));
            }
            loss += output.loss;
            gradient.extend(self.estimator.gather(step, &output.gradient));
        }

        let lambda = self.options.regularization;
        if lambda > 0.0 {
            let fields = state.extinction().values();
            loss += lambda * temporal_smoothness(fields);
            for (step, dense) in temporal_smoothness_gradient(fields).iter().enumerate() {
                let range = self.estimator.step_range(step);
                for (g, r) in gradient[range].iter_mut().zip(self.estimator.gather(step, dense)) {
                    *g += lambda * r;
                }
            }
        }
        Ok(Ok(Evaluation { loss, gradient }))
    }

    fn maybe_checkpoint(&self, last: &mut (usize, Instant)) {
        let Some(policy) = &self.options.checkpoint else {
            return;
        };
        if !policy.is_due(self.iteration - last.0, last.1.elapsed()) {
            return;
        }
        match self.checkpoint().save(&policy.path) {
            Ok(()) => *last = (self.iteration, Instant::now()),
            Err(e) => warn!("Failed to write checkpoint {}: {}", policy.path.display(), e),
        }
    }
}

fn build_pool(parallelism: usize) -> Result<Option<rayon::ThreadPool>, OptimizeError> {
    if parallelism <= 1 {
        return Ok(None);
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(parallelism)
        .thread_name(|i| format!("stratus-oracle-{i}"))
        .build()?;
    debug!("Oracle worker pool: {} threads", parallelism);
    Ok(Some(pool))
}
