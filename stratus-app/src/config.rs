//! Run configuration loaded from JSON.
//!
//! Every optional key falls back to the value the reconstruction has
//! historically been run with; only the input files and the fixed optics
//! must be given.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use glam::DVec3;
use serde::{Deserialize, Serialize};
use stratus_data::{AirProfile, ConfigurationError, MediumGenerator, PhaseFunction, Velocity};
use stratus_train::optimize::{CheckpointPolicy, GlobalOptions, OptimizerOptions};
use stratus_train::reconstruction::{CarveConfig, VelocityMode, VelocitySearch};
use tracing::debug;

use crate::error::AppError;

/// Everything one reconstruction run needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Measurement manifest (JSON).
    pub measurements: PathBuf,
    /// Reference extinction the oracle fits: one grid-data file for a
    /// static cloud, or a list with one file per time step.
    pub reference: ReferenceFiles,
    /// Fixed albedo and phase function. There is no default for these.
    pub optics: OpticsConfig,

    #[serde(default = "default_medium")]
    pub medium: MediumGenerator,
    /// Value held by unoccupied cells. Defaults to `min_bound`.
    #[serde(default)]
    pub floor: Option<f64>,

    // Carving
    #[serde(default = "default_agreement")]
    pub agreement: f64,
    #[serde(default = "default_radiance_threshold")]
    pub radiance_threshold: Vec<f32>,
    #[serde(default = "default_vx_max")]
    pub vx_max: f64,
    #[serde(default)]
    pub vy_max: f64,
    #[serde(default = "default_velocity_step")]
    pub velocity_step: f64,

    // Ground truth shortcuts
    /// Reconstruct on the grid of the first reference file, moved so its
    /// horizontal corner sits at the origin.
    #[serde(default)]
    pub use_forward_grid: bool,
    #[serde(default)]
    pub use_forward_cloud_velocity: bool,
    #[serde(default)]
    pub cloud_velocity: Option<Velocity>,
    #[serde(default)]
    pub use_forward_mask: bool,
    #[serde(default = "default_forward_mask_threshold")]
    pub forward_mask_threshold: f64,

    // Optimisation
    #[serde(default = "default_min_bound")]
    pub min_bound: f64,
    #[serde(default = "default_max_bound")]
    pub max_bound: f64,
    #[serde(default)]
    pub reg_const: f64,
    #[serde(default = "default_n_jobs")]
    pub n_jobs: usize,
    #[serde(default = "default_maxiter")]
    pub maxiter: usize,
    #[serde(default = "default_maxls")]
    pub maxls: usize,
    #[serde(default = "default_tolerance")]
    pub gtol: f64,
    #[serde(default = "default_tolerance")]
    pub ftol: f64,
    #[serde(default = "default_disp")]
    pub disp: bool,
    #[serde(default)]
    pub globalopt: bool,
    #[serde(default)]
    pub global: GlobalOptions,

    // Checkpoints and output
    #[serde(default = "default_checkpoint_seconds")]
    pub checkpoint_seconds: Option<f64>,
    #[serde(default)]
    pub checkpoint_iterations: Option<usize>,
    /// Output directory. Defaults to the directory of the manifest.
    #[serde(default)]
    pub output: Option<PathBuf>,
    #[serde(default)]
    pub reload_path: Option<PathBuf>,
}

fn default_medium() -> MediumGenerator {
    MediumGenerator::Homogeneous {
        min: DVec3::ZERO,
        max: DVec3::ONE,
        shape: [10, 10, 10],
        extinction: 1.0,
    }
}

fn default_agreement() -> f64 {
    0.9
}

fn default_radiance_threshold() -> Vec<f32> {
    vec![0.04]
}

fn default_vx_max() -> f64 {
    5.0
}

fn default_velocity_step() -> f64 {
    1.0
}

fn default_forward_mask_threshold() -> f64 {
    1e-6
}

fn default_min_bound() -> f64 {
    1e-3
}

fn default_max_bound() -> f64 {
    2e2
}

fn default_n_jobs() -> usize {
    1
}

fn default_maxiter() -> usize {
    1000
}

fn default_maxls() -> usize {
    30
}

fn default_tolerance() -> f64 {
    1e-16
}

fn default_disp() -> bool {
    true
}

fn default_checkpoint_seconds() -> Option<f64> {
    Some(1200.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReferenceFiles {
    /// Used for every time step.
    Static(PathBuf),
    PerStep(Vec<PathBuf>),
}

impl ReferenceFiles {
    pub fn paths(&self) -> &[PathBuf] {
        match self {
            ReferenceFiles::Static(path) => std::slice::from_ref(path),
            ReferenceFiles::PerStep(paths) => paths,
        }
    }

    fn paths_mut(&mut self) -> &mut [PathBuf] {
        match self {
            ReferenceFiles::Static(path) => std::slice::from_mut(path),
            ReferenceFiles::PerStep(paths) => paths,
        }
    }

    /// Check the file count against the number of measured time steps.
    pub fn check_steps(&self, steps: usize) -> Result<(), AppError> {
        match self {
            ReferenceFiles::PerStep(paths) if paths.len() != steps => Err(AppError::Config(format!(
                "{} reference files for {steps} time steps",
                paths.len()
            ))),
            _ => Ok(()),
        }
    }
}

/// Albedo and phase held fixed during optimisation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpticsConfig {
    /// Single-scattering albedo, constant over the grid.
    pub albedo: f64,
    pub phase: PhaseConfig,
    /// Rayleigh scattering profile, when air is modelled.
    #[serde(default)]
    pub air: Option<AirConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PhaseConfig {
    Isotropic,
    HenyeyGreenstein { g: f64, terms: usize },
    Legendre { coefficients: Vec<f64> },
}

impl PhaseConfig {
    pub fn build(&self) -> Result<PhaseFunction, ConfigurationError> {
        match self {
            PhaseConfig::Isotropic => Ok(PhaseFunction::isotropic()),
            PhaseConfig::HenyeyGreenstein { g, terms } => {
                if !(g.is_finite() && g.abs() < 1.0) {
                    return Err(ConfigurationError::Invalid(format!(
                        "Henyey-Greenstein asymmetry must lie in (-1, 1), got {g}"
                    )));
                }
                Ok(PhaseFunction::henyey_greenstein(*g, *terms))
            }
            PhaseConfig::Legendre { coefficients } => PhaseFunction::new(coefficients.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AirConfig {
    pub altitudes: Vec<f64>,
    pub extinction: Vec<f64>,
}

impl AirConfig {
    pub fn build(&self) -> Result<AirProfile, ConfigurationError> {
        AirProfile::new(self.altitudes.clone(), self.extinction.clone())
    }
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub reload_path: Option<PathBuf>,
    pub globalopt: bool,
    pub output: Option<PathBuf>,
}

impl RunConfig {
    #[tracing::instrument(skip_all, fields(path = %path.display()))]
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let mut config: RunConfig = serde_json::from_reader(BufReader::new(File::open(path)?))?;
        // Relative inputs are resolved against the configuration file.
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.measurements = base.join(&config.measurements);
        for reference in config.reference.paths_mut() {
            *reference = base.join(&*reference);
        }
        if let MediumGenerator::FromFile { path } = &mut config.medium {
            *path = base.join(&*path);
        }
        debug!("Run configuration: {:?}", config);
        Ok(config)
    }

    pub fn apply(&mut self, overrides: Overrides) {
        if overrides.reload_path.is_some() {
            self.reload_path = overrides.reload_path;
        }
        if overrides.globalopt {
            self.globalopt = true;
        }
        if overrides.output.is_some() {
            self.output = overrides.output;
        }
    }

    /// Reject inconsistent settings before anything is loaded.
    pub fn validate(&self) -> Result<(), AppError> {
        if !(self.agreement.is_finite() && (0.0..=1.0).contains(&self.agreement)) {
            return Err(AppError::Config(format!(
                "agreement must lie in [0, 1], got {}",
                self.agreement
            )));
        }
        if !(0.0..=1.0).contains(&self.optics.albedo) {
            return Err(AppError::Config(format!(
                "albedo must lie in [0, 1], got {}",
                self.optics.albedo
            )));
        }
        if self.reference.paths().is_empty() {
            return Err(AppError::Config("reference must name at least one file".into()));
        }
        if self.radiance_threshold.is_empty() {
            return Err(AppError::Config("radiance_threshold must not be empty".into()));
        }
        if self.use_forward_cloud_velocity && self.cloud_velocity.is_none() {
            return Err(AppError::Config(
                "use_forward_cloud_velocity is set but no cloud_velocity is given".into(),
            ));
        }
        if !(self.min_bound.is_finite() && self.max_bound.is_finite() && self.min_bound <= self.max_bound) {
            return Err(ConfigurationError::InvalidBounds {
                min: self.min_bound,
                max: self.max_bound,
            }
            .into());
        }
        if let VelocityMode::Search(search) = self.velocity_mode() {
            search.validate()?;
        }
        self.optimizer_options(None).validate()?;
        if self.globalopt {
            self.global.validate()?;
        }
        Ok(())
    }

    pub fn velocity_mode(&self) -> VelocityMode {
        match self.cloud_velocity {
            Some(velocity) if self.use_forward_cloud_velocity => VelocityMode::Known { velocity },
            _ => VelocityMode::Search(VelocitySearch {
                vx_max: self.vx_max,
                vy_max: self.vy_max,
                step: self.velocity_step,
            }),
        }
    }

    pub fn carve_config(&self) -> CarveConfig {
        CarveConfig {
            agreement: self.agreement,
            velocity: self.velocity_mode(),
        }
    }

    pub fn optimizer_options(&self, checkpoint: Option<PathBuf>) -> OptimizerOptions {
        OptimizerOptions {
            maxiter: self.maxiter,
            maxls: self.maxls,
            gtol: self.gtol,
            ftol: self.ftol,
            parallelism: self.n_jobs,
            regularization: self.reg_const,
            disp: self.disp,
            checkpoint: checkpoint.map(|path| {
                let policy = CheckpointPolicy::new(path).every_seconds(self.checkpoint_seconds);
                match self.checkpoint_iterations {
                    Some(n) => policy.every_iterations(n),
                    None => policy,
                }
            }),
            ..OptimizerOptions::default()
        }
    }

    pub fn output_dir(&self) -> PathBuf {
        match &self.output {
            Some(dir) => dir.clone(),
            None => self
                .measurements
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }
}
