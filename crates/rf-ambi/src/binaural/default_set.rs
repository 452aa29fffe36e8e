//! Built-in synthetic HRIR set (spherical-head model)

use std::f32::consts::PI;

use ndarray::Array3;

use super::loader::HrirData;
use crate::position::Direction;

/// Sample rate of the generated set
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;

/// Taps per HRIR
pub const DEFAULT_LENGTH: usize = 128;

/// Head radius in meters
pub const HEAD_RADIUS: f32 = 0.09;

/// Speed of sound in m/s
pub const SPEED_OF_SOUND: f32 = 343.0;

/// Grid spacing in degrees
const GRID_STEP: i32 = 10;

/// Arrival time of the ear between both, in samples
const BASE_DELAY: f32 = 20.0;

/// Width of the direct-path pulse
const PULSE_SIGMA: f32 = 1.5;

/// Directions of the default grid: 10 x 10 degrees, -40..=80 elevation, plus zenith
pub fn default_directions() -> Vec<Direction> {
    let mut dirs = Vec::new();
    for el in (-40..=80).step_by(GRID_STEP as usize) {
        for az in (-180..180).step_by(GRID_STEP as usize) {
            dirs.push(Direction::new(az as f32, el as f32));
        }
    }
    dirs.push(Direction::new(0.0, 90.0));
    dirs
}

/// Woodworth ITD in seconds, right-ear arrival minus left-ear arrival
pub fn woodworth_itd(direction: &Direction) -> f32 {
    let lateral = lateral_angle(direction);
    HEAD_RADIUS / SPEED_OF_SOUND * (lateral + lateral.sin())
}

/// Angle from the median plane, positive to the left
fn lateral_angle(direction: &Direction) -> f32 {
    let az = direction.azimuth.to_radians();
    let el = direction.elevation.to_radians();
    (el.cos() * az.sin()).clamp(-1.0, 1.0).asin()
}

/// Generate the complete default set
pub fn generate() -> HrirData {
    let directions = default_directions();
    let mut hrirs = Array3::<f32>::zeros((directions.len(), 2, DEFAULT_LENGTH));

    for (d, dir) in directions.iter().enumerate() {
        let (left, right) = synthetic_hrir(dir, DEFAULT_SAMPLE_RATE, DEFAULT_LENGTH);
        for t in 0..DEFAULT_LENGTH {
            hrirs[[d, 0, t]] = left[t];
            hrirs[[d, 1, t]] = right[t];
        }
    }

    log::debug!("Generated {} default HRIRs", directions.len());

    HrirData {
        hrirs,
        directions,
        sample_rate: DEFAULT_SAMPLE_RATE,
    }
}

/// Single synthetic HRIR pair
fn synthetic_hrir(direction: &Direction, sample_rate: u32, length: usize) -> (Vec<f32>, Vec<f32>) {
    let mut left = vec![0.0f32; length];
    let mut right = vec![0.0f32; length];

    let lateral = lateral_angle(direction);
    let pan = lateral.sin();
    let el_rad = direction.elevation.to_radians();

    // ITD
    let itd_samples = woodworth_itd(direction) * sample_rate as f32;
    let left_delay = BASE_DELAY - 0.5 * itd_samples;
    let right_delay = BASE_DELAY + 0.5 * itd_samples;

    // ILD
    let left_gain = 1.0 + 0.4 * pan;
    let right_gain = 1.0 - 0.4 * pan;

    // Pinna reflection: shorter and weaker as the source rises
    let pinna_lag = 6.0 + 4.0 * (0.5 - el_rad / PI);
    let pinna_gain = 0.25 * (1.0 - el_rad.abs() / (PI / 2.0)).max(0.0) + 0.05;

    let pulse = |t: f32, centre: f32| {
        let x = t - centre;
        (-x * x / (2.0 * PULSE_SIGMA * PULSE_SIGMA)).exp()
    };

    for i in 0..length {
        let t = i as f32;
        left[i] = left_gain * (pulse(t, left_delay) - pinna_gain * pulse(t, left_delay + pinna_lag));
        right[i] = right_gain * (pulse(t, right_delay) - pinna_gain * pulse(t, right_delay + pinna_lag));
    }

    // Head shadow (lowpass on far ear)
    let shadow = pan.abs();
    let lpf_coeff = 1.0 - 0.7 * shadow;
    let far = if pan > 0.0 { Some(&mut right) } else if pan < 0.0 { Some(&mut left) } else { None };
    if let Some(far) = far {
        let mut state = 0.0f32;
        for s in far.iter_mut() {
            state += lpf_coeff * (*s - state);
            *s = state;
        }
    }

    (left, right)
}
