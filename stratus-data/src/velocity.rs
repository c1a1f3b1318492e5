//! Rigid horizontal advection velocity.

use glam::{DVec2, DVec3};
use serde::{Deserialize, Serialize};

/// Horizontal velocity `(vx, vy)` shared by every time step of a medium.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Velocity(pub DVec2);

impl Velocity {
    pub const ZERO: Velocity = Velocity(DVec2::ZERO);

    pub fn new(vx: f64, vy: f64) -> Self {
        Self(DVec2::new(vx, vy))
    }

    pub fn vx(&self) -> f64 {
        self.0.x
    }

    pub fn vy(&self) -> f64 {
        self.0.y
    }

    pub fn norm(&self) -> f64 {
        self.0.length()
    }

    /// Horizontal offset accumulated over `dt`.
    pub fn displacement(&self, dt: f64) -> DVec2 {
        self.0 * dt
    }

    /// `point` advected forward by `dt`; altitude is unchanged.
    pub fn advect(&self, point: DVec3, dt: f64) -> DVec3 {
        let d = self.displacement(dt);
        DVec3::new(point.x + d.x, point.y + d.y, point.z)
    }

    pub fn scaled(&self, factor: f64) -> Self {
        Self(self.0 * factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advect_is_horizontal() {
        let v = Velocity::new(2.0, -1.0);
        let p = v.advect(DVec3::new(1.0, 1.0, 5.0), 0.5);
        assert_eq!(p, DVec3::new(2.0, 0.5, 5.0));
    }

    #[test]
    fn test_scaled_converts_units() {
        let v = Velocity::new(0.25, 0.0).scaled(4.0);
        assert_eq!(v.vx(), 1.0);
        assert_eq!(v.norm(), 1.0);
    }
}
