//! Iteration observers and cooperative stop requests

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::info;

/// Snapshot handed to observers after each completed iteration.
#[derive(Debug, Clone, Copy)]
pub struct IterationEvent<'a> {
    pub iteration: usize,
    pub loss: f64,
    pub projected_gradient_norm: f64,
    /// Flattened state after the iteration.
    pub state: &'a [f64],
    /// Total optimisation time, including time restored from a checkpoint.
    pub elapsed: Duration,
}

/// Receives progress from the optimiser at iteration boundaries.
///
/// Observers own their backing store; the optimiser only calls them.
pub trait IterationObserver: Send {
    /// Called once per accepted iteration.
    fn on_iteration(&mut self, event: &IterationEvent<'_>);

    /// Called when a run finishes, successfully or not.
    fn on_finish(&mut self, _message: &str) {
        // Default: no-op
    }
}

/// Logs every `every`-th iteration through `tracing`.
#[derive(Debug, Clone)]
pub struct LoggingObserver {
    every: usize,
}

impl LoggingObserver {
    pub fn new(every: usize) -> Self {
        Self { every: every.max(1) }
    }
}

impl Default for LoggingObserver {
    fn default() -> Self {
        Self::new(1)
    }
}

impl IterationObserver for LoggingObserver {
    fn on_iteration(&mut self, event: &IterationEvent<'_>) {
        if event.iteration % self.every == 0 {
            info!(
                iteration = event.iteration,
                loss = event.loss,
                pg_norm = event.projected_gradient_norm,
                elapsed_s = event.elapsed.as_secs_f64(),
                "optimizer iteration"
            );
        }
    }

    fn on_finish(&mut self, message: &str) {
        info!("Optimizer finished: {}", message);
    }
}

/// Records the loss curve. Cloning shares the record, so a copy can be kept
/// by the caller while another is handed to the optimiser.
#[derive(Debug, Clone, Default)]
pub struct LossHistory {
    losses: Arc<Mutex<Vec<(usize, f64)>>>,
}

impl LossHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(iteration, loss)` pairs recorded so far.
    pub fn losses(&self) -> Vec<(usize, f64)> {
        match self.losses.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl IterationObserver for LossHistory {
    fn on_iteration(&mut self, event: &IterationEvent<'_>) {
        let mut guard = match self.losses.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.push((event.iteration, event.loss));
    }
}

/// Shared flag asking a running optimiser to stop at the next iteration
/// boundary.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    requested: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Clear a previous request so the optimiser can be run again.
    pub fn reset(&self) {
        self.requested.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(iteration: usize, loss: f64) -> IterationEvent<'static> {
        IterationEvent {
            iteration,
            loss,
            projected_gradient_norm: 0.0,
            state: &[],
            elapsed: Duration::ZERO,
        }
    }

    #[test]
    fn test_loss_history_shared_between_clones() {
        let history = LossHistory::new();
        let mut handed_out = history.clone();
        handed_out.on_iteration(&event(1, 3.0));
        handed_out.on_iteration(&event(2, 1.5));
        assert_eq!(history.losses(), vec![(1, 3.0), (2, 1.5)]);
    }

    #[test]
    fn test_stop_handle_shared() {
        let handle = StopHandle::new();
        let other = handle.clone();
        assert!(!handle.is_stop_requested());
        other.request_stop();
        assert!(handle.is_stop_requested());
        handle.reset();
        assert!(!other.is_stop_requested());
    }
}
