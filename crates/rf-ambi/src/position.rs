//! Directions on the unit sphere
//!
//! Ambisonic convention: azimuth anticlockwise from the front (positive =
//! left), elevation positive up. Cartesian: x front, y left, z up.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// Direction in degrees
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Direction {
    /// Azimuth in degrees (0 = front, positive = left)
    pub azimuth: f32,
    /// Elevation in degrees (-90 to 90, positive = up)
    pub elevation: f32,
}

impl Direction {
    pub fn new(azimuth: f32, elevation: f32) -> Self {
        Self { azimuth, elevation }
    }

    /// Straight ahead
    pub fn front() -> Self {
        Self::new(0.0, 0.0)
    }

    /// Azimuth wrapped to [-180, 180), elevation clamped to [-90, 90]
    pub fn wrapped(&self) -> Self {
        let mut az = (self.azimuth + 180.0).rem_euclid(360.0) - 180.0;
        if !az.is_finite() {
            az = 0.0;
        }
        let el = if self.elevation.is_finite() {
            self.elevation.clamp(-90.0, 90.0)
        } else {
            0.0
        };
        Self::new(az, el)
    }

    /// Unit vector
    pub fn to_vector(&self) -> Vector3<f64> {
        let az = (self.azimuth as f64).to_radians();
        let el = (self.elevation as f64).to_radians();
        let cos_el = el.cos();
        Vector3::new(cos_el * az.cos(), cos_el * az.sin(), el.sin())
    }

    /// Direction of a (not necessarily unit) vector
    pub fn from_vector(v: &Vector3<f64>) -> Self {
        let norm = v.norm();
        if norm < 1e-12 {
            return Self::front();
        }
        let azimuth = v.y.atan2(v.x).to_degrees();
        let elevation = (v.z / norm).clamp(-1.0, 1.0).asin().to_degrees();
        Self::new(azimuth as f32, elevation as f32)
    }

    /// Great-circle angle to another direction in degrees
    pub fn angle_to(&self, other: &Self) -> f32 {
        let dot = self.to_vector().dot(&other.to_vector()).clamp(-1.0, 1.0);
        dot.acos().to_degrees() as f32
    }
}

/// Quasi-uniform points on the sphere (Fibonacci spiral)
pub fn fibonacci_sphere(n: usize) -> Vec<Direction> {
    let golden_ratio = (1.0 + 5.0_f64.sqrt()) / 2.0;

    (0..n)
        .map(|i| {
            let theta = 2.0 * std::f64::consts::PI * i as f64 / golden_ratio;
            let z = 1.0 - 2.0 * (i as f64 + 0.5) / n as f64;
            let r = (1.0 - z * z).max(0.0).sqrt();
            Direction::from_vector(&Vector3::new(r * theta.cos(), r * theta.sin(), z))
        })
        .collect()
}
