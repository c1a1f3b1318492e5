//! View geometry: mapping world-space points to image pixels

use glam::{DMat4, DVec3, DVec4};
use serde::{Deserialize, Serialize};

use crate::ingest::IngestError;

/// Parallel projection onto an image plane spanned by `u_axis` and `v_axis`.
///
/// Pixel `(0, 0)` has its corner at `origin`; pixel `(i, j)` covers
/// `origin + [i, i + 1) * pixel_size * u + [j, j + 1) * pixel_size * v`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawOrthographicView")]
pub struct OrthographicView {
    pub origin: DVec3,
    pub u_axis: DVec3,
    pub v_axis: DVec3,
    pub pixel_size: f64,
    pub width: u32,
    pub height: u32,
}

#[derive(Deserialize)]
struct RawOrthographicView {
    origin: DVec3,
    u_axis: DVec3,
    v_axis: DVec3,
    pixel_size: f64,
    width: u32,
    height: u32,
}

impl TryFrom<RawOrthographicView> for OrthographicView {
    type Error = IngestError;

    fn try_from(raw: RawOrthographicView) -> Result<Self, Self::Error> {
        OrthographicView::new(raw.origin, raw.u_axis, raw.v_axis, raw.pixel_size, raw.width, raw.height)
    }
}

impl OrthographicView {
    /// Create an orthographic view; the axes are normalised.
    pub fn new(
        origin: DVec3,
        u_axis: DVec3,
        v_axis: DVec3,
        pixel_size: f64,
        width: u32,
        height: u32,
    ) -> Result<Self, IngestError> {
        let u_axis = u_axis.try_normalize().ok_or_else(|| {
            IngestError::InvalidView("orthographic u axis has zero length".into())
        })?;
        let v_axis = v_axis.try_normalize().ok_or_else(|| {
            IngestError::InvalidView("orthographic v axis has zero length".into())
        })?;
        if u_axis.dot(v_axis).abs() > 1e-6 {
            return Err(IngestError::InvalidView(
                "orthographic image axes must be perpendicular".into(),
            ));
        }
        if !(pixel_size.is_finite() && pixel_size > 0.0) || width == 0 || height == 0 {
            return Err(IngestError::InvalidView(format!(
                "invalid orthographic raster {width}x{height} with pixel size {pixel_size}"
            )));
        }
        Ok(Self {
            origin,
            u_axis,
            v_axis,
            pixel_size,
            width,
            height,
        })
    }

    fn project(&self, point: DVec3) -> Option<(u32, u32)> {
        let d = point - self.origin;
        let u = (d.dot(self.u_axis) / self.pixel_size).floor();
        let v = (d.dot(self.v_axis) / self.pixel_size).floor();
        pixel_in_raster(u, v, self.width, self.height)
    }
}

/// Serialisable parameters of a pinhole camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerspectiveParams {
    pub position: DVec3,
    pub look_at: DVec3,
    pub up: DVec3,
    /// Vertical field of view in radians.
    pub fov_y: f64,
    pub width: u32,
    pub height: u32,
}

/// Pinhole camera with a precomputed view-projection matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PerspectiveParams", into = "PerspectiveParams")]
pub struct PerspectiveView {
    params: PerspectiveParams,
    view_projection: DMat4,
}

impl TryFrom<PerspectiveParams> for PerspectiveView {
    type Error = IngestError;

    fn try_from(params: PerspectiveParams) -> Result<Self, Self::Error> {
        PerspectiveView::new(params)
    }
}

impl From<PerspectiveView> for PerspectiveParams {
    fn from(view: PerspectiveView) -> Self {
        view.params
    }
}

impl PerspectiveView {
    const NEAR: f64 = 1e-3;
    const FAR: f64 = 1e7;

    pub fn new(params: PerspectiveParams) -> Result<Self, IngestError> {
        let forward = params.look_at - params.position;
        if forward.length_squared() == 0.0 {
            return Err(IngestError::InvalidView(
                "camera position coincides with its look-at point".into(),
            ));
        }
        if forward.cross(params.up).length_squared() == 0.0 {
            return Err(IngestError::InvalidView(
                "camera up vector is parallel to the view direction".into(),
            ));
        }
        if !(params.fov_y > 0.0 && params.fov_y < std::f64::consts::PI) || params.width == 0 || params.height == 0 {
            return Err(IngestError::InvalidView(format!(
                "invalid perspective raster {}x{} with fov {}",
                params.width, params.height, params.fov_y
            )));
        }
        let view = DMat4::look_at_rh(params.position, params.look_at, params.up);
        let aspect = params.width as f64 / params.height as f64;
        let projection = DMat4::perspective_rh(params.fov_y, aspect, Self::NEAR, Self::FAR);
        Ok(Self {
            view_projection: projection * view,
            params,
        })
    }

    pub fn params(&self) -> &PerspectiveParams {
        &self.params
    }

    fn project(&self, point: DVec3) -> Option<(u32, u32)> {
        let clip: DVec4 = self.view_projection * point.extend(1.0);
        if clip.w <= 0.0 {
            return None;
        }
        let ndc_x = clip.x / clip.w;
        let ndc_y = clip.y / clip.w;
        let u = ((ndc_x + 1.0) * 0.5 * self.params.width as f64).floor();
        let v = ((1.0 - ndc_y) * 0.5 * self.params.height as f64).floor();
        pixel_in_raster(u, v, self.params.width, self.params.height)
    }
}

fn pixel_in_raster(u: f64, v: f64, width: u32, height: u32) -> Option<(u32, u32)> {
    if u.is_finite() && v.is_finite() && u >= 0.0 && v >= 0.0 && u < width as f64 && v < height as f64 {
        Some((u as u32, v as u32))
    } else {
        None
    }
}

/// Geometry of a single measurement view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Projection {
    Orthographic(OrthographicView),
    Perspective(PerspectiveView),
}

impl Projection {
    /// Pixel hit by `point`, or `None` when it falls outside the image or behind the camera.
    pub fn project(&self, point: DVec3) -> Option<(u32, u32)> {
        match self {
            Projection::Orthographic(view) => view.project(point),
            Projection::Perspective(view) => view.project(point),
        }
    }

    /// Raster dimensions (width, height).
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            Projection::Orthographic(view) => (view.width, view.height),
            Projection::Perspective(view) => (view.params.width, view.params.height),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nadir() -> Projection {
        Projection::Orthographic(
            OrthographicView::new(DVec3::new(-0.5, -0.5, 0.0), DVec3::X, DVec3::Y, 1.0, 4, 4).unwrap(),
        )
    }

    #[test]
    fn test_orthographic_projection_hits_cell_pixel() {
        let view = nadir();
        assert_eq!(view.project(DVec3::new(2.0, 1.0, 7.0)), Some((2, 1)));
        assert_eq!(view.project(DVec3::new(0.0, 3.0, 0.0)), Some((0, 3)));
    }

    #[test]
    fn test_orthographic_projection_outside_raster() {
        let view = nadir();
        assert_eq!(view.project(DVec3::new(4.0, 0.0, 0.0)), None);
        assert_eq!(view.project(DVec3::new(-1.0, 0.0, 0.0)), None);
    }

    #[test]
    fn test_orthographic_rejects_skewed_axes() {
        let result = OrthographicView::new(DVec3::ZERO, DVec3::X, DVec3::new(1.0, 1.0, 0.0), 1.0, 4, 4);
        assert!(result.is_err());
    }

    #[test]
    fn test_perspective_center_maps_to_image_center() {
        let view = PerspectiveView::new(PerspectiveParams {
            position: DVec3::new(0.0, 0.0, 10.0),
            look_at: DVec3::ZERO,
            up: DVec3::Y,
            fov_y: std::f64::consts::FRAC_PI_2,
            width: 64,
            height: 64,
        })
        .unwrap();
        let projection = Projection::Perspective(view);
        assert_eq!(projection.project(DVec3::new(0.01, 0.01, 0.0)), Some((32, 31)));
        // Behind the camera.
        assert_eq!(projection.project(DVec3::new(0.0, 0.0, 20.0)), None);
    }

    #[test]
    fn test_projection_serde_tag() {
        let json = serde_json::to_string(&nadir()).unwrap();
        assert!(json.contains("\"type\":\"orthographic\""));
        let back: Projection = serde_json::from_str(&json).unwrap();
        assert_eq!(back, nadir());
    }
}
