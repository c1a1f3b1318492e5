//! Synthetic moving-cube scene shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use glam::DVec3;
use stratus_data::{Bounds, FixedOptics, Grid, PhaseFunction, ScalarField, TimeSeries};
use stratus_train::ingest::{Measurements, OrthographicView, Projection, RadianceImage, ViewMeasurement};

pub const CLOUDY: f32 = 0.5;

/// 4x4x4 grid with unit spacing.
pub fn grid() -> Grid {
    Grid::uniform(DVec3::ZERO, DVec3::splat(3.0), [4, 4, 4]).unwrap()
}

/// 2x2x2 cube whose lowest x index is `x0`.
pub fn cube_at(x0: usize) -> impl Fn(usize, usize, usize) -> bool {
    move |x, y, z| (x0..x0 + 2).contains(&x) && (1..3).contains(&y) && (1..3).contains(&z)
}

fn render(projection: OrthographicView, covered: impl Fn(usize, usize) -> bool) -> ViewMeasurement {
    let pixels = (0..4)
        .flat_map(|v| (0..4).map(move |u| (u, v)))
        .map(|(u, v)| if covered(u, v) { CLOUDY } else { 0.0 })
        .collect();
    let radiance = RadianceImage::from_raw(4, 4, pixels).unwrap();
    ViewMeasurement::new(Projection::Orthographic(projection), radiance)
}

/// Radiance seen by three axis-aligned orthographic views.
pub fn views_of(cube: &dyn Fn(usize, usize, usize) -> bool) -> Vec<ViewMeasurement> {
    let origin = DVec3::splat(-0.5);
    let view = |u: DVec3, v: DVec3| OrthographicView::new(origin, u, v, 1.0, 4, 4).unwrap();
    vec![
        render(view(DVec3::X, DVec3::Y), |u, v| (0..4).any(|w| cube(u, v, w))),
        render(view(DVec3::X, DVec3::Z), |u, v| (0..4).any(|w| cube(u, w, v))),
        render(view(DVec3::Y, DVec3::Z), |u, v| (0..4).any(|w| cube(w, u, v))),
    ]
}

/// Two steps one second apart, the cube moving one cell along +x.
pub fn moving_cube_measurements() -> Measurements {
    let frames = TimeSeries::new(vec![0.0, 1.0], vec![views_of(&cube_at(0)), views_of(&cube_at(1))]).unwrap();
    Measurements::new(0.672, frames).unwrap()
}

pub fn optics(grid: &Arc<Grid>) -> Arc<FixedOptics> {
    let albedo = ScalarField::constant(grid.clone(), 0.99, Bounds::new(0.0, 1.0).unwrap());
    Arc::new(FixedOptics::new(0.672, albedo, PhaseFunction::henyey_greenstein(0.85, 8), None).unwrap())
}
