//! Medium generators used to initialise an extinction estimate.

use crate::{Bounds, ConfigurationError, Grid, ScalarField};
use glam::DVec3;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Grid plus dense values, as stored on disk (JSON).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridDataFile {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub z: Vec<f64>,
    pub data: Vec<f64>,
}

impl GridDataFile {
    #[tracing::instrument(skip_all, fields(path = %path.display()))]
    pub fn load(path: &Path) -> Result<Self, ConfigurationError> {
        debug!("Loading grid data from: {}", path.display());
        let reader = BufReader::new(File::open(path)?);
        let file: GridDataFile = serde_json::from_reader(reader)?;
        info!(
            "Grid data loaded: {}x{}x{} cells",
            file.x.len(),
            file.y.len(),
            file.z.len()
        );
        Ok(file)
    }

    pub fn from_field(field: &ScalarField) -> Self {
        let grid = field.grid();
        Self {
            x: grid.x().to_vec(),
            y: grid.y().to_vec(),
            z: grid.z().to_vec(),
            data: field.data().to_vec(),
        }
    }

    pub fn grid(&self) -> Result<Grid, ConfigurationError> {
        Grid::new(self.x.clone(), self.y.clone(), self.z.clone())
    }

    pub fn into_field(self, bounds: Bounds) -> Result<ScalarField, ConfigurationError> {
        let grid = Arc::new(self.grid()?);
        ScalarField::new(grid, self.data, bounds)
    }
}

/// Source of the reconstruction grid and the initial extinction.
///
/// Selected by the `init` configuration key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "init", rename_all = "snake_case")]
pub enum MediumGenerator {
    /// Constant extinction on a uniform grid.
    Homogeneous {
        min: DVec3,
        max: DVec3,
        shape: [usize; 3],
        extinction: f64,
    },
    /// Grid and extinction read from a grid-data file.
    FromFile { path: PathBuf },
}

impl MediumGenerator {
    pub fn grid(&self) -> Result<Grid, ConfigurationError> {
        match self {
            MediumGenerator::Homogeneous { min, max, shape, .. } => {
                if shape.iter().any(|n| *n == 0) {
                    return Err(ConfigurationError::Invalid(format!(
                        "homogeneous generator shape {shape:?} has an empty axis"
                    )));
                }
                Grid::uniform(*min, *max, *shape)
            }
            MediumGenerator::FromFile { path } => GridDataFile::load(path)?.grid(),
        }
    }

    /// Initial extinction sampled on `grid`.
    pub fn extinction(&self, grid: &Arc<Grid>, bounds: Bounds) -> Result<ScalarField, ConfigurationError> {
        match self {
            MediumGenerator::Homogeneous { extinction, .. } => {
                if !extinction.is_finite() {
                    return Err(ConfigurationError::Invalid(
                        "homogeneous extinction must be finite".into(),
                    ));
                }
                Ok(ScalarField::constant(grid.clone(), *extinction, bounds))
            }
            MediumGenerator::FromFile { path } => {
                let field = GridDataFile::load(path)?.into_field(bounds)?;
                if field.grid().as_ref() == grid.as_ref() {
                    field.rebased(grid.clone())
                } else {
                    debug!("Resampling file extinction onto the reconstruction grid");
                    Ok(field.resample(grid.clone()))
                }
            }
        }
    }
}
