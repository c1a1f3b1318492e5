//! The carve, estimate and optimise pipeline behind the subcommands.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use glam::DVec2;
use serde::Serialize;
use stratus_data::{Bounds, FixedOptics, Grid, GridDataFile, ScalarField, TimeSeries, Velocity, VoxelMask};
use stratus_train::ingest::{Measurements, RadianceThreshold};
use stratus_train::optimize::{
    FieldMatchOracle, GlobalOptimizer, LocalOptimizer, LossHistory, OptimizerCheckpoint,
};
use stratus_train::reconstruction::{CarveResult, DynamicMediumEstimator, SpaceCarver};
use tracing::{debug, info, warn};

use crate::config::{ReferenceFiles, RunConfig};
use crate::error::AppError;

/// Written periodically while optimising.
pub const CHECKPOINT_FILE: &str = "checkpoint.ckpt";
/// Written once when a run ends.
pub const FINAL_STATE_FILE: &str = "final_state.ckpt";
const LOSS_FILE: &str = "losses.json";
const CARVE_FILE: &str = "carve.json";

/// Inputs shared by the carve and optimise commands.
struct Prepared {
    measurements: Measurements,
    grid: Arc<Grid>,
    /// Reference extinction of each step, sampled on that step's grid, unclamped.
    references: TimeSeries<ScalarField>,
    carve: CarveResult,
}

#[derive(Debug, Serialize)]
pub struct CarveSummary {
    pub velocity: [f64; 2],
    pub score: f64,
    pub occupied: Vec<usize>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub converged: bool,
    pub message: String,
    pub loss: f64,
    pub iterations: usize,
    /// Basin-hopping hops, when the global search ran.
    pub hops: Option<usize>,
    pub final_state: PathBuf,
}

#[derive(Debug, Serialize)]
pub struct CheckpointSummary {
    pub version: u32,
    pub iteration: usize,
    pub elapsed_seconds: f64,
    pub regularization: f64,
    pub parameters: usize,
    pub correction_pairs: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub hop: Option<usize>,
    pub best_loss: Option<f64>,
}

fn unbounded() -> Result<Bounds, AppError> {
    Ok(Bounds::new(f64::MIN, f64::MAX)?)
}

fn load_reference(path: &Path) -> Result<ScalarField, AppError> {
    Ok(GridDataFile::load(path)?.into_field(unbounded()?)?)
}

fn sample_on(field: &ScalarField, grid: &Arc<Grid>) -> Result<ScalarField, AppError> {
    if field.grid().as_ref() == grid.as_ref() {
        Ok(field.rebased(grid.clone())?)
    } else {
        debug!("Resampling reference extinction onto the step grid");
        Ok(field.resample(grid.clone()))
    }
}

/// Reference extinction for every step, sampled on that step's grid. A
/// static reference is read once and shared by all steps.
fn load_references(
    files: &ReferenceFiles,
    grids: &TimeSeries<Arc<Grid>>,
) -> Result<TimeSeries<ScalarField>, AppError> {
    files.check_steps(grids.len())?;
    match files {
        ReferenceFiles::Static(path) => {
            let field = load_reference(path)?;
            grids.try_map(|grid| sample_on(&field, grid))
        }
        ReferenceFiles::PerStep(paths) => {
            let fields = paths
                .iter()
                .zip(grids.values())
                .map(|(path, grid)| sample_on(&load_reference(path)?, grid))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(TimeSeries::new(grids.times().to_vec(), fields)?)
        }
    }
}

/// Grid of the first reference file with its horizontal corner moved to
/// the origin.
fn forward_grid(files: &ReferenceFiles) -> Result<Grid, AppError> {
    let path = files
        .paths()
        .first()
        .ok_or_else(|| AppError::Config("reference must name at least one file".into()))?;
    let grid = GridDataFile::load(path)?.grid()?;
    let corner = DVec2::new(
        grid.x().first().copied().unwrap_or(0.0),
        grid.y().first().copied().unwrap_or(0.0),
    );
    Ok(grid.translated(-corner))
}

/// `grid` advected to every measurement time.
fn advected_grids(grid: &Arc<Grid>, times: &[f64], velocity: Velocity) -> Result<TimeSeries<Arc<Grid>>, AppError> {
    let t0 = times.first().copied().unwrap_or(0.0);
    let grids = times
        .iter()
        .map(|t| Arc::new(grid.translated(velocity.displacement(t - t0))))
        .collect();
    Ok(TimeSeries::new(times.to_vec(), grids)?)
}

/// Occupancy taken from the reference medium instead of carving: a cell is
/// occupied at a step when that step's reference exceeds `threshold`.
fn forward_masks(
    references: &TimeSeries<ScalarField>,
    grids: TimeSeries<Arc<Grid>>,
    velocity: Velocity,
    threshold: f64,
) -> Result<CarveResult, AppError> {
    let masks = references.try_map(|field| {
        let cells = field.data().iter().map(|v| *v > threshold).collect();
        VoxelMask::new(field.grid().shape(), cells)
    })?;
    for (k, mask) in masks.values().iter().enumerate() {
        debug!("Reference occupancy at step {}: {} cells", k, mask.count());
    }
    Ok(CarveResult {
        masks,
        grids,
        velocity,
        score: 0.0,
        warnings: Vec::new(),
    })
}

fn prepare(config: &RunConfig) -> Result<Prepared, AppError> {
    config.validate()?;
    let measurements = Measurements::load_manifest(&config.measurements)?;
    config.reference.check_steps(measurements.time_list().len())?;
    let grid = if config.use_forward_grid {
        info!("Using the reference grid for reconstruction");
        Arc::new(forward_grid(&config.reference)?)
    } else {
        Arc::new(config.medium.grid()?)
    };

    let (carve, references) = if config.use_forward_mask {
        let velocity = match config.cloud_velocity {
            Some(v) if config.use_forward_cloud_velocity => v,
            _ => Velocity::ZERO,
        };
        let grids = advected_grids(&grid, measurements.time_list(), velocity)?;
        let references = load_references(&config.reference, &grids)?;
        info!("Using reference occupancy");
        let carve = forward_masks(&references, grids, velocity, config.forward_mask_threshold)?;
        (carve, references)
    } else {
        let threshold = RadianceThreshold::from_values(config.radiance_threshold.clone());
        let masks = measurements.masks(&threshold)?;
        let carve = SpaceCarver::new(masks)?.carve(&grid, &config.carve_config())?;
        let references = load_references(&config.reference, &carve.grids)?;
        (carve, references)
    };
    for warning in &carve.warnings {
        warn!("Carving: {:?}", warning);
    }
    info!(
        "Velocity ({}, {}), {} occupied cells over {} steps",
        carve.velocity.vx(),
        carve.velocity.vy(),
        carve.occupied_cells(),
        carve.masks.len()
    );
    Ok(Prepared {
        measurements,
        grid,
        references,
        carve,
    })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

/// Carve only: write the summary and one 0/1 grid-data file per step.
#[tracing::instrument(skip_all)]
pub fn carve(config: &RunConfig) -> Result<CarveSummary, AppError> {
    let prepared = prepare(config)?;
    let carve = &prepared.carve;
    let output = config.output_dir();

    let unit = Bounds::new(0.0, 1.0)?;
    for (step, (mask, grid)) in carve.masks.values().iter().zip(carve.grids.values()).enumerate() {
        let data = mask.cells().iter().map(|c| if *c { 1.0 } else { 0.0 }).collect();
        let field = ScalarField::new(grid.clone(), data, unit)?;
        write_json(&output.join(format!("mask_{step:03}.json")), &GridDataFile::from_field(&field))?;
    }

    let summary = CarveSummary {
        velocity: [carve.velocity.vx(), carve.velocity.vy()],
        score: carve.score,
        occupied: carve.masks.values().iter().map(VoxelMask::count).collect(),
        warnings: carve.warnings.iter().map(|w| format!("{w:?}")).collect(),
    };
    write_json(&output.join(CARVE_FILE), &summary)?;
    info!("Carving written to {}", output.display());
    Ok(summary)
}

/// Full reconstruction: carve, build the estimator and minimise.
#[tracing::instrument(skip_all)]
pub fn optimize(config: &RunConfig) -> Result<RunSummary, AppError> {
    let prepared = prepare(config)?;
    let output = config.output_dir();
    let bounds = Bounds::new(config.min_bound, config.max_bound)?;

    let initial = config.medium.extinction(&prepared.grid, bounds)?;
    let initial = DynamicMediumEstimator::replicate(&initial, &prepared.carve.grids)?;
    let albedo = ScalarField::constant(prepared.grid.clone(), config.optics.albedo, Bounds::new(0.0, 1.0)?);
    let air = config.optics.air.as_ref().map(|a| a.build()).transpose()?;
    let optics = Arc::new(FixedOptics::new(
        prepared.measurements.wavelength(),
        albedo,
        config.optics.phase.build()?,
        air,
    )?);
    let estimator = DynamicMediumEstimator::from_carve(&initial, &prepared.carve, optics, config.floor)?;

    let reference = prepared
        .references
        .try_map(|field| ScalarField::new(field.grid().clone(), field.data().to_vec(), bounds))?;
    let oracle = FieldMatchOracle::new(reference);

    let options = config.optimizer_options(Some(output.join(CHECKPOINT_FILE)));
    let reload = config
        .reload_path
        .as_deref()
        .map(OptimizerCheckpoint::load)
        .transpose()?;
    let history = LossHistory::new();

    let (result, hops, mut last) = if config.globalopt {
        let mut global = match reload {
            Some(checkpoint) if checkpoint.global.is_some() => GlobalOptimizer::from_checkpoint(
                checkpoint,
                estimator,
                oracle,
                options,
                config.global.clone(),
            )?,
            Some(checkpoint) => {
                let local = LocalOptimizer::from_checkpoint(checkpoint, estimator, oracle, options)?;
                GlobalOptimizer::new(local, config.global.clone())?
            }
            None => GlobalOptimizer::new(LocalOptimizer::new(estimator, oracle, options)?, config.global.clone())?,
        };
        global.local_mut().add_observer(Box::new(history.clone()));
        let outcome = global.minimize()?;
        let mut last = global.local().checkpoint();
        last.global = global.search_state().cloned();
        (outcome.best, Some(outcome.hops), last)
    } else {
        let mut local = match reload {
            Some(checkpoint) => LocalOptimizer::from_checkpoint(checkpoint, estimator, oracle, options)?,
            None => LocalOptimizer::new(estimator, oracle, options)?,
        };
        local.add_observer(Box::new(history.clone()));
        let result = local.minimize()?;
        (result, None, local.checkpoint())
    };

    last.state = result.state.clone();
    let final_state = output.join(FINAL_STATE_FILE);
    last.save(&final_state)?;
    write_json(&output.join(LOSS_FILE), &history.losses())?;

    Ok(RunSummary {
        converged: result.converged,
        message: result.message,
        loss: result.loss,
        iterations: result.iterations,
        hops,
        final_state,
    })
}

/// Summarise a checkpoint file without a medium to restore it into.
pub fn inspect(path: &Path) -> Result<CheckpointSummary, AppError> {
    let checkpoint = OptimizerCheckpoint::load(path)?;
    let n = checkpoint.state.len();
    let (min, max, sum) = checkpoint
        .state
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY, 0.0), |(lo, hi, s), v| {
            (lo.min(*v), hi.max(*v), s + v)
        });
    Ok(CheckpointSummary {
        version: checkpoint.version,
        iteration: checkpoint.iteration,
        elapsed_seconds: checkpoint.elapsed_seconds,
        regularization: checkpoint.regularization,
        parameters: n,
        correction_pairs: checkpoint.memory.len(),
        min: if n == 0 { 0.0 } else { min },
        max: if n == 0 { 0.0 } else { max },
        mean: if n == 0 { 0.0 } else { sum / n as f64 },
        hop: checkpoint.global.as_ref().map(|g| g.hop),
        best_loss: checkpoint.global.as_ref().map(|g| g.best.loss),
    })
}
