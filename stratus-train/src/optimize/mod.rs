//! Optimisation driver
//!
//! Turns a forward/adjoint evaluator into a converged medium estimate:
//! - [`ForwardOracle`]: the evaluator seam, called once per time step
//! - [`LocalOptimizer`]: projected L-BFGS with temporal regularisation
//! - [`GlobalOptimizer`]: basin hopping over repeated local runs
//! - [`OptimizerCheckpoint`]: resumable snapshots
//! - [`IterationObserver`]: progress reporting at iteration boundaries

pub mod checkpoint;
pub mod global;
pub mod lbfgs;
pub mod local;
pub mod observer;
pub mod oracle;
pub mod regularization;

pub use checkpoint::{CHECKPOINT_VERSION, CheckpointError, CheckpointPolicy, OptimizerCheckpoint};
pub use global::{GlobalOptimizer, GlobalOptions, GlobalResult, GlobalSearchState, UNEVALUATED_LOSS};
pub use lbfgs::LbfgsMemory;
pub use local::{
    LocalOptimizer, OptimizeError, OptimizeResult, OptimizerOptions, OptimizerStatus, StopReason,
};
pub use observer::{IterationEvent, IterationObserver, LossHistory, LoggingObserver, StopHandle};
pub use oracle::{FieldMatchOracle, ForwardOracle, OracleFault, OracleOutput, StepInput};
