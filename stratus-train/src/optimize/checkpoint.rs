//! Resumable optimiser snapshots
//!
//! Checkpoints are JSON documents carrying a format version. They are written
//! next to the target as `<path>.tmp` and renamed over it, so a reader never
//! sees a partially written file.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stratus_data::Bounds;
use tracing::{debug, info};

use crate::optimize::GlobalSearchState;
use crate::optimize::lbfgs::LbfgsMemory;

/// Current on-disk format version.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Errors raised while writing or restoring a checkpoint.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed checkpoint: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Checkpoint version {found:?} is not supported (expected {expected})")]
    Version { found: Option<u64>, expected: u32 },
    #[error("Checkpoint state has {actual} elements, the medium has {expected}")]
    Dimension { expected: usize, actual: usize },
    #[error("Checkpoint field `{0}` is not finite")]
    NonFinite(&'static str),
    #[error("Checkpoint element {index} = {value} lies outside its bounds")]
    OutOfBounds { index: usize, value: f64 },
    #[error("Invalid quasi-Newton memory: {0}")]
    Memory(String),
    #[error("Checkpoint carries no global search state")]
    MissingSearchState,
}

/// Everything needed to continue an optimisation exactly where it stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerCheckpoint {
    pub version: u32,
    /// Flattened state at the last completed iteration.
    pub state: Vec<f64>,
    pub iteration: usize,
    pub elapsed_seconds: f64,
    pub regularization: f64,
    pub memory: LbfgsMemory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global: Option<GlobalSearchState>,
}

impl OptimizerCheckpoint {
    pub fn elapsed(&self) -> Duration {
        Duration::from_secs_f64(self.elapsed_seconds)
    }

    /// Check the checkpoint against the medium it is about to be restored
    /// into. Nothing is modified.
    pub fn validate(&self, bounds: &[Bounds]) -> Result<(), CheckpointError> {
        if self.version != CHECKPOINT_VERSION {
            return Err(CheckpointError::Version {
                found: Some(u64::from(self.version)),
                expected: CHECKPOINT_VERSION,
            });
        }
        check_state(&self.state, bounds, "state")?;
        if !(self.elapsed_seconds.is_finite() && self.elapsed_seconds >= 0.0) {
            return Err(CheckpointError::NonFinite("elapsed_seconds"));
        }
        if !(self.regularization.is_finite() && self.regularization >= 0.0) {
            return Err(CheckpointError::NonFinite("regularization"));
        }
        self.memory.check(bounds.len()).map_err(CheckpointError::Memory)?;
        if let Some(global) = &self.global {
            check_state(&global.current, bounds, "global.current")?;
            check_state(&global.best.state, bounds, "global.best.state")?;
            if !global.current_loss.is_finite() || !global.best.loss.is_finite() {
                return Err(CheckpointError::NonFinite("global loss"));
            }
            if !(global.temperature.is_finite() && global.temperature >= 0.0) {
                return Err(CheckpointError::NonFinite("global.temperature"));
            }
        }
        Ok(())
    }

    /// Write atomically: `<path>.tmp` first, then rename over `path`.
    pub fn save(&self, path: &Path) -> Result<(), CheckpointError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = temporary_path(path);
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            serde_json::to_writer_pretty(&mut writer, self)?;
            writer.flush()?;
        }
        fs::rename(&tmp, path)?;
        debug!("Checkpoint written: {} (iteration {})", path.display(), self.iteration);
        Ok(())
    }

    /// Read and version-check a checkpoint. Semantic validation against a
    /// medium happens in [`OptimizerCheckpoint::validate`].
    #[tracing::instrument(skip_all, fields(path = %path.display()))]
    pub fn load(path: &Path) -> Result<Self, CheckpointError> {
        let value: serde_json::Value = serde_json::from_reader(BufReader::new(File::open(path)?))?;
        let found = value.get("version").and_then(serde_json::Value::as_u64);
        if found != Some(u64::from(CHECKPOINT_VERSION)) {
            return Err(CheckpointError::Version {
                found,
                expected: CHECKPOINT_VERSION,
            });
        }
        let checkpoint: Self = serde_json::from_value(value)?;
        info!(
            "Loaded checkpoint: iteration {}, {} parameters",
            checkpoint.iteration,
            checkpoint.state.len()
        );
        Ok(checkpoint)
    }
}

fn check_state(state: &[f64], bounds: &[Bounds], field: &'static str) -> Result<(), CheckpointError> {
    if state.len() != bounds.len() {
        return Err(CheckpointError::Dimension {
            expected: bounds.len(),
            actual: state.len(),
        });
    }
    if state.iter().any(|v| !v.is_finite()) {
        return Err(CheckpointError::NonFinite(field));
    }
    match state.iter().zip(bounds).position(|(v, b)| !b.contains(*v)) {
        Some(index) => Err(CheckpointError::OutOfBounds {
            index,
            value: state[index],
        }),
        None => Ok(()),
    }
}

fn temporary_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

/// When the optimiser writes checkpoints. Either trigger suffices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointPolicy {
    pub path: PathBuf,
    #[serde(default)]
    pub every_iterations: Option<usize>,
    #[serde(default = "default_period")]
    pub every_seconds: Option<f64>,
}

fn default_period() -> Option<f64> {
    Some(1200.0)
}

impl CheckpointPolicy {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            every_iterations: None,
            every_seconds: default_period(),
        }
    }

    pub fn every_iterations(mut self, iterations: usize) -> Self {
        self.every_iterations = Some(iterations.max(1));
        self
    }

    pub fn every_seconds(mut self, seconds: Option<f64>) -> Self {
        self.every_seconds = seconds;
        self
    }

    /// Whether a checkpoint is due given the progress since the last one.
    pub fn is_due(&self, iterations_since: usize, since: Duration) -> bool {
        let by_iterations = self.every_iterations.is_some_and(|n| iterations_since >= n);
        let by_time = self.every_seconds.is_some_and(|s| since.as_secs_f64() >= s);
        by_iterations || by_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint() -> OptimizerCheckpoint {
        let mut memory = LbfgsMemory::new(3);
        memory.push(vec![0.5, 0.25], vec![1.0, 0.5]);
        OptimizerCheckpoint {
            version: CHECKPOINT_VERSION,
            state: vec![1.0, 2.0],
            iteration: 7,
            elapsed_seconds: 12.5,
            regularization: 0.1,
            memory,
            global: None,
        }
    }

    fn bounds() -> Vec<Bounds> {
        vec![Bounds::new(0.0, 5.0).unwrap(); 2]
    }

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("stratus-checkpoint-{}-{name}.json", std::process::id()))
    }

    #[test]
    fn test_save_and_load() {
        let path = scratch("save");
        let original = checkpoint();
        original.save(&path).unwrap();
        assert!(!temporary_path(&path).exists());
        let loaded = OptimizerCheckpoint::load(&path).unwrap();
        assert_eq!(loaded, original);
        loaded.validate(&bounds()).unwrap();
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let path = scratch("version");
        let mut value = serde_json::to_value(checkpoint()).unwrap();
        value["version"] = serde_json::json!(2);
        fs::write(&path, value.to_string()).unwrap();
        assert!(matches!(
            OptimizerCheckpoint::load(&path),
            Err(CheckpointError::Version { found: Some(2), .. })
        ));
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_malformed_json_rejected() {
        let path = scratch("malformed");
        fs::write(&path, "{\"version\": 1, \"state\": [1.0,").unwrap();
        assert!(matches!(OptimizerCheckpoint::load(&path), Err(CheckpointError::Json(_))));
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let path = scratch("missing");
        assert!(matches!(OptimizerCheckpoint::load(&path), Err(CheckpointError::Io(_))));
    }

    #[test]
    fn test_validate_rejects_inconsistent_checkpoints() {
        let b = bounds();
        let mut wrong_len = checkpoint();
        wrong_len.state.push(1.0);
        assert!(matches!(wrong_len.validate(&b), Err(CheckpointError::Dimension { .. })));

        let mut outside = checkpoint();
        outside.state[1] = 9.0;
        assert!(matches!(
            outside.validate(&b),
            Err(CheckpointError::OutOfBounds { index: 1, .. })
        ));

        let mut nan = checkpoint();
        nan.regularization = f64::NAN;
        assert!(matches!(nan.validate(&b), Err(CheckpointError::NonFinite(_))));

        let mut memory = checkpoint();
        memory.memory.push(vec![1.0, 0.0, 0.0], vec![1.0, 0.0, 0.0]);
        assert!(matches!(memory.validate(&b), Err(CheckpointError::Memory(_))));
    }

    #[test]
    fn test_policy_due() {
        let policy = CheckpointPolicy::new("run.json").every_iterations(5).every_seconds(None);
        assert!(!policy.is_due(4, Duration::from_secs(10_000)));
        assert!(policy.is_due(5, Duration::ZERO));
        let timed = CheckpointPolicy::new("run.json");
        assert!(!timed.is_due(100, Duration::from_secs(60)));
        assert!(timed.is_due(0, Duration::from_secs(1200)));
    }
}
