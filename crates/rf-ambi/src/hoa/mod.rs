//! Higher-Order Ambisonics (HOA) maths
//!
//! Real spherical harmonics up to 7th order (64 channels):
//! - ACN channel ordering
//! - N3D normalization with the 4-pi convention (Y00 = 1)
//! - No Condon-Shortley phase
//!
//! Everything downstream of the input converter works in this convention.

pub mod decoder;
pub mod format;
pub mod transform;

pub use decoder::{
    BinauralDecoder, DecoderDesign, DecodingMethod, DiffuseEq, LoudspeakerDecoder, OrderDecoder,
};
pub use format::{AmbisonicFormat, ChannelOrdering, FormatConverter, Normalization};
pub use transform::{RotationSettings, ShRotation};

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::{AmbiError, AmbiResult};
use crate::position::Direction;

/// Highest supported order
pub const MAX_ORDER: usize = 7;

/// Spherical harmonic channels at [`MAX_ORDER`]
pub const MAX_SH: usize = (MAX_ORDER + 1) * (MAX_ORDER + 1);

/// Ambisonic order (determines spatial resolution)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AmbisonicOrder {
    /// First order (4 channels) - basic 3D
    #[default]
    First = 1,
    /// Second order (9 channels) - good localization
    Second = 2,
    /// Third order (16 channels) - high quality
    Third = 3,
    /// Fourth order (25 channels) - studio quality
    Fourth = 4,
    /// Fifth order (36 channels) - theatrical
    Fifth = 5,
    /// Sixth order (49 channels) - research
    Sixth = 6,
    /// Seventh order (64 channels) - maximum
    Seventh = 7,
}

impl AmbisonicOrder {
    /// Get channel count for this order
    pub fn channel_count(&self) -> usize {
        sh_count(self.as_usize())
    }

    /// Create from order number
    pub fn from_order(order: usize) -> AmbiResult<Self> {
        match order {
            1 => Ok(AmbisonicOrder::First),
            2 => Ok(AmbisonicOrder::Second),
            3 => Ok(AmbisonicOrder::Third),
            4 => Ok(AmbisonicOrder::Fourth),
            5 => Ok(AmbisonicOrder::Fifth),
            6 => Ok(AmbisonicOrder::Sixth),
            7 => Ok(AmbisonicOrder::Seventh),
            _ => Err(AmbiError::InvalidAmbisonicOrder(order)),
        }
    }

    /// Create from order number, clamping into 1..=7
    pub fn clamped(order: usize) -> Self {
        Self::from_order(order.clamp(1, MAX_ORDER)).unwrap_or_default()
    }

    /// Get order number
    pub fn as_usize(&self) -> usize {
        *self as usize
    }
}

/// Number of SH channels for an order
#[inline]
pub const fn sh_count(order: usize) -> usize {
    (order + 1) * (order + 1)
}

/// ACN index to (degree l, index m)
#[inline]
pub fn acn_to_order_degree(acn: usize) -> (usize, i32) {
    let l = (acn as f64).sqrt().floor() as usize;
    let m = acn as i32 - (l * l + l) as i32;
    (l, m)
}

/// (degree l, index m) to ACN index
#[inline]
pub fn acn(l: usize, m: i32) -> usize {
    ((l * l + l) as i32 + m) as usize
}

/// Real N3D spherical harmonics of `order` for one direction, ACN order
///
/// `out` must hold at least `(order + 1)^2` values.
pub fn real_sh(order: usize, direction: &Direction, out: &mut [f64]) {
    let order = order.min(MAX_ORDER);
    debug_assert!(out.len() >= sh_count(order));

    let az = (direction.azimuth as f64).to_radians();
    let el = (direction.elevation as f64).to_radians();
    let x = el.sin();
    let s = el.cos().max(0.0);

    // Associated Legendre P_l^m(x) without Condon-Shortley phase
    let mut p = [[0.0f64; MAX_ORDER + 1]; MAX_ORDER + 1];
    p[0][0] = 1.0;
    for m in 1..=order {
        p[m][m] = (2 * m - 1) as f64 * s * p[m - 1][m - 1];
    }
    for m in 0..order {
        p[m + 1][m] = (2 * m + 1) as f64 * x * p[m][m];
    }
    for m in 0..=order {
        for l in (m + 2)..=order {
            p[l][m] = ((2 * l - 1) as f64 * x * p[l - 1][m] - (l + m - 1) as f64 * p[l - 2][m])
                / (l - m) as f64;
        }
    }

    for l in 0..=order {
        for m in 0..=l {
            let norm = ((2 * l + 1) as f64 * if m == 0 { 1.0 } else { 2.0 } * factorial(l - m)
                / factorial(l + m))
            .sqrt();
            let base = norm * p[l][m];
            if m == 0 {
                out[acn(l, 0)] = base;
            } else {
                let mf = m as f64 * az;
                out[acn(l, m as i32)] = base * mf.cos();
                out[acn(l, -(m as i32))] = base * mf.sin();
            }
        }
    }
}

/// SH matrix `Y` of shape `[(order + 1)^2, directions]`
pub fn sh_matrix(order: usize, directions: &[Direction]) -> DMatrix<f64> {
    let nsh = sh_count(order);
    let mut y = DMatrix::zeros(nsh, directions.len());
    let mut column = [0.0f64; MAX_SH];
    for (j, dir) in directions.iter().enumerate() {
        real_sh(order, dir, &mut column);
        for i in 0..nsh {
            y[(i, j)] = column[i];
        }
    }
    y
}

/// Legendre polynomial P_l(x)
pub fn legendre(l: usize, x: f64) -> f64 {
    let (mut p0, mut p1) = (1.0, x);
    if l == 0 {
        return p0;
    }
    for k in 2..=l {
        let p2 = ((2 * k - 1) as f64 * x * p1 - (k - 1) as f64 * p0) / k as f64;
        p0 = p1;
        p1 = p2;
    }
    p1
}

fn factorial(n: usize) -> f64 {
    (1..=n).fold(1.0, |acc, k| acc * k as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::fibonacci_sphere;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_channel_count() {
        for n in 1..=MAX_ORDER {
            let order = AmbisonicOrder::from_order(n).unwrap();
            assert_eq!(order.channel_count(), (n + 1) * (n + 1));
        }
        assert!(AmbisonicOrder::from_order(8).is_err());
        assert_eq!(AmbisonicOrder::clamped(0), AmbisonicOrder::First);
        assert_eq!(AmbisonicOrder::clamped(12), AmbisonicOrder::Seventh);
    }

    #[test]
    fn test_acn_mapping() {
        for index in 0..MAX_SH {
            let (l, m) = acn_to_order_degree(index);
            assert!(m.unsigned_abs() as usize <= l);
            assert_eq!(acn(l, m), index);
        }
    }

    #[test]
    fn test_first_order_n3d() {
        let dir = Direction::new(30.0, 20.0);
        let v = dir.to_vector();
        let mut y = [0.0; 4];
        real_sh(1, &dir, &mut y);

        let s3 = 3.0f64.sqrt();
        assert_abs_diff_eq!(y[0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(y[1], s3 * v.y, epsilon = 1e-9);
        assert_abs_diff_eq!(y[2], s3 * v.z, epsilon = 1e-9);
        assert_abs_diff_eq!(y[3], s3 * v.x, epsilon = 1e-9);
    }

    #[test]
    fn test_addition_theorem() {
        // Sum over m of Y_lm(d)^2 equals 2l + 1 in N3D
        let mut y = [0.0; MAX_SH];
        real_sh(MAX_ORDER, &Direction::new(-71.0, 48.0), &mut y);
        for l in 0..=MAX_ORDER {
            let sum: f64 = (-(l as i32)..=l as i32).map(|m| y[acn(l, m)].powi(2)).sum();
            assert_abs_diff_eq!(sum, (2 * l + 1) as f64, epsilon = 1e-8);
        }
    }

    #[test]
    fn test_orthonormal_on_dense_grid() {
        let grid = fibonacci_sphere(2000);
        let y = sh_matrix(3, &grid);
        let gram = &y * y.transpose() / grid.len() as f64;
        for i in 0..16 {
            for j in 0..16 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(gram[(i, j)], expected, epsilon = 2e-2);
            }
        }
    }

    #[test]
    fn test_legendre() {
        assert_abs_diff_eq!(legendre(2, 0.5), -0.125, epsilon = 1e-12);
        assert_abs_diff_eq!(legendre(3, 1.0), 1.0, epsilon = 1e-12);
    }
}
