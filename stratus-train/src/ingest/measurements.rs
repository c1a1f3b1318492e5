//! Radiance measurements and their binary view masks

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use glam::DVec3;
use image::{ImageBuffer, Luma};
use serde::{Deserialize, Serialize};
use stratus_data::TimeSeries;
use tracing::{debug, info};

use crate::ingest::{IngestError, Projection};

/// Single-channel floating point radiance image.
pub type RadianceImage = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Radiance acquired by one view at one time step.
#[derive(Debug, Clone)]
pub struct ViewMeasurement {
    pub projection: Projection,
    pub radiance: RadianceImage,
}

impl ViewMeasurement {
    pub fn new(projection: Projection, radiance: RadianceImage) -> Self {
        Self {
            projection,
            radiance,
        }
    }
}

/// Radiance level above which a pixel is considered cloudy.
///
/// Either one value for every view or one value per measurement channel
/// (view index).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RadianceThreshold {
    Uniform(f32),
    PerView(Vec<f32>),
}

impl RadianceThreshold {
    /// Build from a command-line style list: one value means uniform.
    pub fn from_values(values: Vec<f32>) -> Self {
        match values.as_slice() {
            [single] => RadianceThreshold::Uniform(*single),
            _ => RadianceThreshold::PerView(values),
        }
    }

    fn validate(&self, views: usize) -> Result<(), IngestError> {
        match self {
            RadianceThreshold::Uniform(t) if !t.is_finite() => Err(IngestError::InvalidThreshold(*t)),
            RadianceThreshold::Uniform(_) => Ok(()),
            RadianceThreshold::PerView(values) => {
                if values.len() != views {
                    return Err(IngestError::ThresholdCount {
                        expected: views,
                        actual: values.len(),
                    });
                }
                match values.iter().find(|t| !t.is_finite()) {
                    Some(t) => Err(IngestError::InvalidThreshold(*t)),
                    None => Ok(()),
                }
            }
        }
    }

    pub fn for_view(&self, view: usize) -> f32 {
        match self {
            RadianceThreshold::Uniform(t) => *t,
            RadianceThreshold::PerView(values) => values[view],
        }
    }
}

impl Default for RadianceThreshold {
    fn default() -> Self {
        RadianceThreshold::Uniform(0.04)
    }
}

/// Binary cloud mask of one view, with the geometry needed to query it.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewMask {
    projection: Projection,
    width: u32,
    height: u32,
    flagged: Vec<bool>,
}

impl ViewMask {
    /// `flagged` is row-major, `width * height` long.
    pub fn new(projection: Projection, flagged: Vec<bool>) -> Result<Self, IngestError> {
        let (width, height) = projection.dimensions();
        let expected = width as usize * height as usize;
        if flagged.len() != expected {
            return Err(IngestError::InvalidView(format!(
                "mask has {} pixels, projection raster has {expected}",
                flagged.len()
            )));
        }
        Ok(Self {
            projection,
            width,
            height,
            flagged,
        })
    }

    /// Flag pixels whose radiance exceeds `threshold`.
    pub fn from_radiance(projection: Projection, radiance: &RadianceImage, threshold: f32) -> Self {
        let (width, height) = radiance.dimensions();
        let flagged = radiance.pixels().map(|p| p.0[0] > threshold).collect();
        Self {
            projection,
            width,
            height,
            flagged,
        }
    }

    pub fn projection(&self) -> &Projection {
        &self.projection
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Flag at pixel `(u, v)`, or `None` outside the raster.
    pub fn pixel(&self, u: u32, v: u32) -> Option<bool> {
        if u >= self.width {
            return None;
        }
        self.flagged.get(v as usize * self.width as usize + u as usize).copied()
    }

    /// Whether `point` projects onto a flagged pixel. Points outside the
    /// raster are never flagged.
    pub fn sees(&self, point: DVec3) -> bool {
        self.projection
            .project(point)
            .is_some_and(|(u, v)| self.pixel(u, v) == Some(true))
    }

    pub fn flagged_count(&self) -> usize {
        self.flagged.iter().filter(|f| **f).count()
    }
}

/// Multi-view radiance measurements over a sequence of acquisition times.
#[derive(Debug, Clone)]
pub struct Measurements {
    wavelength: f64,
    frames: TimeSeries<Vec<ViewMeasurement>>,
}

impl Measurements {
    pub fn new(wavelength: f64, frames: TimeSeries<Vec<ViewMeasurement>>) -> Result<Self, IngestError> {
        for (step, (_, views)) in frames.iter().enumerate() {
            if views.is_empty() {
                return Err(IngestError::InvalidView(format!("time step {step} has no views")));
            }
            for (view, measurement) in views.iter().enumerate() {
                let expected = measurement.projection.dimensions();
                let actual = measurement.radiance.dimensions();
                if expected != actual {
                    return Err(IngestError::DimensionMismatch {
                        step,
                        view,
                        expected,
                        actual,
                    });
                }
            }
        }
        Ok(Self { wavelength, frames })
    }

    pub fn wavelength(&self) -> f64 {
        self.wavelength
    }

    pub fn frames(&self) -> &TimeSeries<Vec<ViewMeasurement>> {
        &self.frames
    }

    pub fn time_list(&self) -> &[f64] {
        self.frames.times()
    }

    /// Threshold every view into a binary mask.
    pub fn masks(&self, threshold: &RadianceThreshold) -> Result<TimeSeries<Vec<ViewMask>>, IngestError> {
        for (_, views) in self.frames.iter() {
            threshold.validate(views.len())?;
        }
        let masks = self.frames.map(|views| {
            views
                .iter()
                .enumerate()
                .map(|(view, m)| {
                    ViewMask::from_radiance(m.projection.clone(), &m.radiance, threshold.for_view(view))
                })
                .collect::<Vec<_>>()
        });
        let flagged: usize = masks.values().iter().flatten().map(ViewMask::flagged_count).sum();
        debug!("Thresholded {} time steps, {} cloudy pixels", masks.len(), flagged);
        Ok(masks)
    }

    /// Load measurements described by a JSON manifest. Image paths are
    /// resolved relative to the manifest's directory.
    #[tracing::instrument(skip_all, fields(path = %path.display()))]
    pub fn load_manifest(path: &Path) -> Result<Self, IngestError> {
        let manifest: MeasurementManifest = serde_json::from_reader(BufReader::new(File::open(path)?))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));

        let mut pairs = Vec::with_capacity(manifest.frames.len());
        for frame in manifest.frames {
            let mut views = Vec::with_capacity(frame.views.len());
            for view in frame.views {
                let image_path = base.join(&view.image);
                debug!("Loading radiance image: {}", image_path.display());
                let radiance = image::open(&image_path)?.to_luma32f();
                views.push(ViewMeasurement::new(view.projection, radiance));
            }
            pairs.push((frame.timestamp, views));
        }
        let frames = TimeSeries::from_pairs(pairs)?;
        info!(
            "Loaded measurements: {} time steps at {} um",
            frames.len(),
            manifest.wavelength
        );
        Self::new(manifest.wavelength, frames)
    }
}

/// On-disk description of a measurement set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementManifest {
    pub wavelength: f64,
    pub frames: Vec<ManifestFrame>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFrame {
    pub timestamp: f64,
    pub views: Vec<ManifestView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestView {
    pub projection: Projection,
    pub image: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::OrthographicView;

    fn nadir(width: u32, height: u32) -> Projection {
        Projection::Orthographic(
            OrthographicView::new(DVec3::new(-0.5, -0.5, 0.0), DVec3::X, DVec3::Y, 1.0, width, height).unwrap(),
        )
    }

    fn measurement(values: [f32; 4]) -> ViewMeasurement {
        let radiance = RadianceImage::from_raw(2, 2, values.to_vec()).unwrap();
        ViewMeasurement::new(nadir(2, 2), radiance)
    }

    #[test]
    fn test_threshold_from_values() {
        assert_eq!(RadianceThreshold::from_values(vec![0.1]), RadianceThreshold::Uniform(0.1));
        assert!(matches!(
            RadianceThreshold::from_values(vec![0.1, 0.2]),
            RadianceThreshold::PerView(_)
        ));
    }

    #[test]
    fn test_masks_uniform_threshold() {
        let frames = TimeSeries::new(vec![0.0], vec![vec![measurement([0.0, 0.05, 0.5, 0.04])]]).unwrap();
        let measurements = Measurements::new(0.672, frames).unwrap();
        let masks = measurements.masks(&RadianceThreshold::Uniform(0.04)).unwrap();
        let mask = &masks.values()[0][0];
        assert_eq!(mask.pixel(0, 0), Some(false));
        assert_eq!(mask.pixel(1, 0), Some(true));
        assert_eq!(mask.pixel(0, 1), Some(true));
        // Equal to the threshold is not cloudy.
        assert_eq!(mask.pixel(1, 1), Some(false));
    }

    #[test]
    fn test_pixel_outside_raster_is_none() {
        let mask = ViewMask::new(nadir(2, 2), vec![true; 4]).unwrap();
        assert_eq!(mask.pixel(2, 0), None);
        assert_eq!(mask.pixel(0, 2), None);
        assert_eq!(mask.pixel(u32::MAX, u32::MAX), None);
        assert_eq!(mask.pixel(1, 1), Some(true));
    }

    #[test]
    fn test_masks_per_view_threshold() {
        let frames = TimeSeries::new(
            vec![0.0],
            vec![vec![measurement([0.3; 4]), measurement([0.3; 4])]],
        )
        .unwrap();
        let measurements = Measurements::new(0.672, frames).unwrap();
        let masks = measurements
            .masks(&RadianceThreshold::PerView(vec![0.1, 0.5]))
            .unwrap();
        assert_eq!(masks.values()[0][0].flagged_count(), 4);
        assert_eq!(masks.values()[0][1].flagged_count(), 0);
    }

    #[test]
    fn test_per_view_threshold_count_mismatch() {
        let frames = TimeSeries::new(vec![0.0], vec![vec![measurement([0.3; 4])]]).unwrap();
        let measurements = Measurements::new(0.672, frames).unwrap();
        let err = measurements
            .masks(&RadianceThreshold::PerView(vec![0.1, 0.5]))
            .unwrap_err();
        assert!(matches!(err, IngestError::ThresholdCount { expected: 1, actual: 2 }));
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let radiance = RadianceImage::from_raw(2, 2, vec![0.0; 4]).unwrap();
        let view = ViewMeasurement::new(nadir(3, 2), radiance);
        let frames = TimeSeries::new(vec![0.0], vec![vec![view]]).unwrap();
        assert!(matches!(
            Measurements::new(0.672, frames),
            Err(IngestError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_view_mask_sees_outside_raster() {
        let mask = ViewMask::new(nadir(2, 2), vec![true; 4]).unwrap();
        assert!(mask.sees(DVec3::new(1.0, 1.0, 3.0)));
        assert!(!mask.sees(DVec3::new(5.0, 1.0, 3.0)));
    }
}
