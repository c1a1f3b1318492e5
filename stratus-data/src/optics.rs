//! Known (non-optimised) optical properties that accompany an extinction estimate.

use crate::{ConfigurationError, ScalarField};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Scattering phase function as a Legendre expansion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseFunction {
    legendre: Vec<f64>,
}

impl PhaseFunction {
    /// The zeroth coefficient must be 1 (normalised phase function).
    pub fn new(legendre: Vec<f64>) -> Result<Self, ConfigurationError> {
        match legendre.first() {
            Some(c0) if (c0 - 1.0).abs() < 1e-9 => {}
            _ => {
                return Err(ConfigurationError::Invalid(
                    "phase function must start with a unit zeroth Legendre coefficient".into(),
                ));
            }
        }
        if legendre.iter().any(|c| !c.is_finite()) {
            return Err(ConfigurationError::Invalid(
                "phase function has non-finite coefficients".into(),
            ));
        }
        Ok(Self { legendre })
    }

    pub fn isotropic() -> Self {
        Self {
            legendre: vec![1.0],
        }
    }

    /// Henyey-Greenstein expansion truncated at `terms` coefficients.
    pub fn henyey_greenstein(g: f64, terms: usize) -> Self {
        let legendre = (0..terms.max(1))
            .map(|l| (2 * l + 1) as f64 * g.powi(l as i32))
            .collect();
        Self { legendre }
    }

    pub fn legendre(&self) -> &[f64] {
        &self.legendre
    }

    /// Asymmetry parameter `g = c1 / 3`.
    pub fn asymmetry(&self) -> f64 {
        self.legendre.get(1).map_or(0.0, |c1| c1 / 3.0)
    }
}

/// Vertical molecular (Rayleigh) extinction profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AirProfile {
    altitudes: Vec<f64>,
    extinction: Vec<f64>,
}

impl AirProfile {
    pub fn new(altitudes: Vec<f64>, extinction: Vec<f64>) -> Result<Self, ConfigurationError> {
        if altitudes.is_empty() {
            return Err(ConfigurationError::EmptyAxis { axis: 'z' });
        }
        if altitudes.len() != extinction.len() {
            return Err(ConfigurationError::LengthMismatch {
                expected: altitudes.len(),
                actual: extinction.len(),
            });
        }
        if let Some(index) = altitudes.windows(2).position(|w| w[1] <= w[0]) {
            return Err(ConfigurationError::NonIncreasingAxis { axis: 'z', index: index + 1 });
        }
        if extinction.iter().any(|e| !e.is_finite() || *e < 0.0) {
            return Err(ConfigurationError::Invalid(
                "air extinction must be finite and non-negative".into(),
            ));
        }
        Ok(Self {
            altitudes,
            extinction,
        })
    }

    pub fn altitudes(&self) -> &[f64] {
        &self.altitudes
    }

    /// Linearly interpolated extinction at altitude `z`, held constant past the ends.
    pub fn extinction_at(&self, z: f64) -> f64 {
        let n = self.altitudes.len();
        if z <= self.altitudes[0] {
            return self.extinction[0];
        }
        if z >= self.altitudes[n - 1] {
            return self.extinction[n - 1];
        }
        let upper = self.altitudes.partition_point(|a| *a <= z);
        let (z0, z1) = (self.altitudes[upper - 1], self.altitudes[upper]);
        let (e0, e1) = (self.extinction[upper - 1], self.extinction[upper]);
        e0 + (e1 - e0) * (z - z0) / (z1 - z0)
    }
}

/// Albedo, phase and air scattering held fixed during optimisation.
///
/// Shared by reference between every time step of a medium state.
#[derive(Debug, Clone)]
pub struct FixedOptics {
    pub wavelength: f64,
    pub albedo: Arc<ScalarField>,
    pub phase: Arc<PhaseFunction>,
    pub air: Option<Arc<AirProfile>>,
}

impl FixedOptics {
    pub fn new(
        wavelength: f64,
        albedo: ScalarField,
        phase: PhaseFunction,
        air: Option<AirProfile>,
    ) -> Result<Self, ConfigurationError> {
        if !(wavelength.is_finite() && wavelength > 0.0) {
            return Err(ConfigurationError::Invalid(format!(
                "wavelength must be positive, got {wavelength}"
            )));
        }
        let albedo_bounds = albedo.bounds();
        if albedo_bounds.min < 0.0 || albedo_bounds.max > 1.0 {
            return Err(ConfigurationError::InvalidBounds {
                min: albedo_bounds.min,
                max: albedo_bounds.max,
            });
        }
        Ok(Self {
            wavelength,
            albedo: Arc::new(albedo),
            phase: Arc::new(phase),
            air: air.map(Arc::new),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Bounds, Grid};
    use glam::DVec3;

    #[test]
    fn test_phase_requires_normalisation() {
        assert!(PhaseFunction::new(vec![2.0, 0.5]).is_err());
        assert!(PhaseFunction::new(vec![]).is_err());
        let phase = PhaseFunction::new(vec![1.0, 2.55]).unwrap();
        assert!((phase.asymmetry() - 0.85).abs() < 1e-12);
    }

    #[test]
    fn test_henyey_greenstein_asymmetry() {
        let phase = PhaseFunction::henyey_greenstein(0.5, 8);
        assert_eq!(phase.legendre().len(), 8);
        assert!((phase.asymmetry() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_air_profile_interpolation() {
        let air = AirProfile::new(vec![0.0, 10.0], vec![0.02, 0.0]).unwrap();
        assert!((air.extinction_at(5.0) - 0.01).abs() < 1e-12);
        assert_eq!(air.extinction_at(-1.0), 0.02);
        assert_eq!(air.extinction_at(20.0), 0.0);
    }

    #[test]
    fn test_fixed_optics_rejects_albedo_above_one() {
        let grid = Arc::new(Grid::uniform(DVec3::ZERO, DVec3::ONE, [2, 2, 2]).unwrap());
        let albedo = ScalarField::constant(grid, 0.9, Bounds::new(0.0, 2.0).unwrap());
        assert!(FixedOptics::new(0.672, albedo, PhaseFunction::isotropic(), None).is_err());
    }
}
