//! Three-dimensional coordinate lattice shared by every field defined on it.

use crate::ConfigurationError;
use glam::{DVec2, DVec3};
use serde::{Deserialize, Serialize};

/// Immutable rectilinear grid described by three strictly increasing axes.
///
/// Cells are addressed by a flat index in x-major order:
/// `(ix * ny + iy) * nz + iz`. Grids are shared through `Arc<Grid>`; a
/// translated copy is a new grid, never a mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawGrid")]
pub struct Grid {
    x: Vec<f64>,
    y: Vec<f64>,
    z: Vec<f64>,
}

#[derive(Deserialize)]
struct RawGrid {
    x: Vec<f64>,
    y: Vec<f64>,
    z: Vec<f64>,
}

impl TryFrom<RawGrid> for Grid {
    type Error = ConfigurationError;

    fn try_from(raw: RawGrid) -> Result<Self, Self::Error> {
        Grid::new(raw.x, raw.y, raw.z)
    }
}

fn validate_axis(axis: char, values: &[f64]) -> Result<(), ConfigurationError> {
    if values.is_empty() {
        return Err(ConfigurationError::EmptyAxis { axis });
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(ConfigurationError::NonFiniteAxis { axis });
    }
    if let Some(index) = values.windows(2).position(|w| w[1] <= w[0]) {
        return Err(ConfigurationError::NonIncreasingAxis {
            axis,
            index: index + 1,
        });
    }
    Ok(())
}

impl Grid {
    /// Create a grid from three coordinate arrays.
    pub fn new(x: Vec<f64>, y: Vec<f64>, z: Vec<f64>) -> Result<Self, ConfigurationError> {
        validate_axis('x', &x)?;
        validate_axis('y', &y)?;
        validate_axis('z', &z)?;
        Ok(Self { x, y, z })
    }

    /// Create a grid with `shape` evenly spaced samples per axis in `[min, max]`.
    ///
    /// An axis with a single sample sits at `min`.
    pub fn uniform(min: DVec3, max: DVec3, shape: [usize; 3]) -> Result<Self, ConfigurationError> {
        fn axis(min: f64, max: f64, n: usize) -> Vec<f64> {
            match n {
                0 => Vec::new(),
                1 => vec![min],
                _ => {
                    let step = (max - min) / (n - 1) as f64;
                    (0..n).map(|i| min + step * i as f64).collect()
                }
            }
        }
        Self::new(
            axis(min.x, max.x, shape[0]),
            axis(min.y, max.y, shape[1]),
            axis(min.z, max.z, shape[2]),
        )
    }

    pub fn x(&self) -> &[f64] {
        &self.x
    }

    pub fn y(&self) -> &[f64] {
        &self.y
    }

    pub fn z(&self) -> &[f64] {
        &self.z
    }

    /// Number of samples per axis `[nx, ny, nz]`.
    pub fn shape(&self) -> [usize; 3] {
        [self.x.len(), self.y.len(), self.z.len()]
    }

    /// Total number of cells.
    pub fn len(&self) -> usize {
        self.x.len() * self.y.len() * self.z.len()
    }

    /// Always false for a validated grid; provided for symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn same_shape(&self, other: &Grid) -> bool {
        self.shape() == other.shape()
    }

    pub fn flat_index(&self, ix: usize, iy: usize, iz: usize) -> usize {
        (ix * self.y.len() + iy) * self.z.len() + iz
    }

    /// Inverse of [`Grid::flat_index`].
    pub fn unravel(&self, index: usize) -> [usize; 3] {
        let nz = self.z.len();
        let ny = self.y.len();
        [index / (ny * nz), (index / nz) % ny, index % nz]
    }

    /// World-space position of the cell sample at `index`.
    pub fn cell_center(&self, index: usize) -> DVec3 {
        let [ix, iy, iz] = self.unravel(index);
        DVec3::new(self.x[ix], self.y[iy], self.z[iz])
    }

    /// Mean sample spacing per axis (zero along single-sample axes).
    pub fn spacing(&self) -> DVec3 {
        fn mean_step(values: &[f64]) -> f64 {
            if values.len() < 2 {
                0.0
            } else {
                (values[values.len() - 1] - values[0]) / (values.len() - 1) as f64
            }
        }
        DVec3::new(mean_step(&self.x), mean_step(&self.y), mean_step(&self.z))
    }

    /// Lower and upper corners of the sampled region.
    pub fn extent(&self) -> (DVec3, DVec3) {
        let first = |v: &[f64]| v[0];
        let last = |v: &[f64]| v[v.len() - 1];
        (
            DVec3::new(first(&self.x), first(&self.y), first(&self.z)),
            DVec3::new(last(&self.x), last(&self.y), last(&self.z)),
        )
    }

    /// Copy of this grid shifted horizontally by `offset`; z is unchanged.
    pub fn translated(&self, offset: DVec2) -> Grid {
        Grid {
            x: self.x.iter().map(|v| v + offset.x).collect(),
            y: self.y.iter().map(|v| v + offset.y).collect(),
            z: self.z.clone(),
        }
    }

    /// Index of the sample nearest to `value` along one axis.
    pub fn nearest_on_axis(values: &[f64], value: f64) -> usize {
        match values.binary_search_by(|sample| sample.total_cmp(&value)) {
            Ok(i) => i,
            Err(0) => 0,
            Err(i) if i >= values.len() => values.len() - 1,
            Err(i) => {
                if (value - values[i - 1]) <= (values[i] - value) {
                    i - 1
                } else {
                    i
                }
            }
        }
    }

    /// Flat index of the cell nearest to `point`.
    pub fn nearest_index(&self, point: DVec3) -> usize {
        self.flat_index(
            Self::nearest_on_axis(&self.x, point.x),
            Self::nearest_on_axis(&self.y, point.y),
            Self::nearest_on_axis(&self.z, point.z),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cube(n: usize) -> Grid {
        Grid::uniform(DVec3::ZERO, DVec3::splat((n - 1) as f64), [n, n, n]).unwrap()
    }

    #[test]
    fn test_grid_rejects_non_increasing_axis() {
        let err = Grid::new(vec![0.0, 1.0, 1.0], vec![0.0], vec![0.0]).unwrap_err();
        assert_eq!(err, ConfigurationError::NonIncreasingAxis { axis: 'x', index: 2 });
    }

    #[test]
    fn test_grid_rejects_empty_axis() {
        let err = Grid::new(vec![0.0], vec![], vec![0.0]).unwrap_err();
        assert_eq!(err, ConfigurationError::EmptyAxis { axis: 'y' });
    }

    #[test]
    fn test_flat_index_round_trip() {
        let grid = Grid::uniform(DVec3::ZERO, DVec3::new(1.0, 2.0, 3.0), [2, 3, 4]).unwrap();
        for i in 0..grid.len() {
            let [ix, iy, iz] = grid.unravel(i);
            assert_eq!(grid.flat_index(ix, iy, iz), i);
        }
    }

    #[test]
    fn test_cell_center() {
        let grid = cube(4);
        let i = grid.flat_index(1, 2, 3);
        assert_eq!(grid.cell_center(i), DVec3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn test_translated_keeps_z() {
        let grid = cube(3);
        let moved = grid.translated(DVec2::new(1.5, -0.5));
        assert_eq!(moved.x(), &[1.5, 2.5, 3.5]);
        assert_eq!(moved.y(), &[-0.5, 0.5, 1.5]);
        assert_eq!(moved.z(), grid.z());
        assert!(moved.same_shape(&grid));
    }

    #[test]
    fn test_nearest_index() {
        let grid = cube(4);
        let i = grid.nearest_index(DVec3::new(0.4, 2.6, 10.0));
        assert_eq!(grid.unravel(i), [0, 3, 3]);
    }

    #[test]
    fn test_grid_deserialize_validates() {
        let bad = r#"{"x":[0.0,0.0],"y":[0.0],"z":[0.0]}"#;
        assert!(serde_json::from_str::<Grid>(bad).is_err());
        let good = r#"{"x":[0.0,1.0],"y":[0.0],"z":[0.0]}"#;
        let grid: Grid = serde_json::from_str(good).unwrap();
        assert_eq!(grid.shape(), [2, 1, 1]);
    }
}
