//! Ambisonic transformations - sound-field rotation
//!
//! Real SH rotation matrices built with the Ivanic-Ruedenberg degree
//! recursion. The matrix is block diagonal by degree and orthonormal; it is
//! stored at full `MAX_SH x MAX_SH` size so recomputation never allocates.

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use super::{MAX_ORDER, MAX_SH, acn};

/// Rotation angles and conventions
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationSettings {
    /// Degrees about +z
    pub yaw: f32,
    /// Degrees about +y
    pub pitch: f32,
    /// Degrees about +x
    pub roll: f32,
    pub flip_yaw: bool,
    pub flip_pitch: bool,
    pub flip_roll: bool,
    /// Compose as Rx(roll) Ry(pitch) Rz(yaw) instead of Rz Ry Rx
    pub rpy_order: bool,
}

impl RotationSettings {
    /// Angles from a quaternion (yaw-pitch-roll composition)
    pub fn from_quaternion(q: &UnitQuaternion<f64>) -> Self {
        let (roll, pitch, yaw) = q.euler_angles();
        Self {
            yaw: yaw.to_degrees() as f32,
            pitch: pitch.to_degrees() as f32,
            roll: roll.to_degrees() as f32,
            ..Default::default()
        }
    }

    /// True when the rotation is the identity
    pub fn is_identity(&self) -> bool {
        self.yaw == 0.0 && self.pitch == 0.0 && self.roll == 0.0
    }

    /// Cartesian rotation matrix with flips applied
    pub fn matrix(&self) -> Matrix3<f64> {
        let sign = |flip: bool| if flip { -1.0 } else { 1.0 };
        let yaw = sign(self.flip_yaw) * (self.yaw as f64).to_radians();
        let pitch = sign(self.flip_pitch) * (self.pitch as f64).to_radians();
        let roll = sign(self.flip_roll) * (self.roll as f64).to_radians();

        let rz = Rotation3::from_axis_angle(&Vector3::z_axis(), yaw);
        let ry = Rotation3::from_axis_angle(&Vector3::y_axis(), pitch);
        let rx = Rotation3::from_axis_angle(&Vector3::x_axis(), roll);

        if self.rpy_order {
            (rx * ry * rz).into_inner()
        } else {
            (rz * ry * rx).into_inner()
        }
    }
}

/// Real SH rotation matrix, block diagonal by degree
#[derive(Debug, Clone)]
pub struct ShRotation {
    matrix: Array2<f64>,
    order: usize,
}

impl Default for ShRotation {
    fn default() -> Self {
        Self::new()
    }
}

impl ShRotation {
    /// Create identity rotation at [`MAX_ORDER`]
    pub fn new() -> Self {
        Self {
            matrix: Array2::eye(MAX_SH),
            order: MAX_ORDER,
        }
    }

    /// Rotation for `settings` up to `order`
    pub fn from_settings(settings: &RotationSettings, order: usize) -> Self {
        let mut rotation = Self::new();
        rotation.compute(&settings.matrix(), order);
        rotation
    }

    pub fn order(&self) -> usize {
        self.order
    }

    /// Full `MAX_SH x MAX_SH` matrix; entries above the computed order are identity
    pub fn matrix(&self) -> &Array2<f64> {
        &self.matrix
    }

    /// Recompute in place from a Cartesian rotation
    pub fn compute(&mut self, r: &Matrix3<f64>, order: usize) {
        let order = order.min(MAX_ORDER);
        self.order = order;
        self.matrix.fill(0.0);
        for i in 0..MAX_SH {
            self.matrix[[i, i]] = 1.0;
        }
        if order == 0 {
            return;
        }

        // Degree 1 in ACN (y, z, x) order
        let axis = |m: i32| match m {
            -1 => 1,
            0 => 2,
            _ => 0,
        };
        for m in -1..=1 {
            for n in -1..=1 {
                self.matrix[[acn(1, m), acn(1, n)]] = r[(axis(m), axis(n))];
            }
        }

        for l in 2..=order {
            let li = l as i32;
            for m in -li..=li {
                for n in -li..=li {
                    let value = self.element(l, m, n);
                    self.matrix[[acn(l, m), acn(l, n)]] = value;
                }
            }
        }
    }

    /// Apply to one SH frame: `out = R in`
    pub fn apply(&self, input: &[f64], output: &mut [f64]) {
        let nsh = input.len().min(output.len());
        for (i, out) in output.iter_mut().enumerate().take(nsh) {
            *out = (0..nsh).map(|j| self.matrix[[i, j]] * input[j]).sum();
        }
    }

    fn r1(&self, m: i32, n: i32) -> f64 {
        self.matrix[[acn(1, m), acn(1, n)]]
    }

    fn r_prev(&self, l: usize, a: i32, b: i32) -> f64 {
        self.matrix[[acn(l - 1, a), acn(l - 1, b)]]
    }

    fn element(&self, l: usize, m: i32, n: i32) -> f64 {
        let li = l as i32;
        let delta = if m == 0 { 1.0 } else { 0.0 };
        let abs_m = m.abs() as f64;
        let lf = l as f64;

        let denom = if n.abs() == li {
            (2 * l * (2 * l - 1)) as f64
        } else {
            ((li + n) * (li - n)) as f64
        };

        let u = (((li + m) * (li - m)) as f64 / denom).sqrt();
        let v = 0.5 * ((1.0 + delta) * (lf + abs_m - 1.0) * (lf + abs_m) / denom).sqrt() * (1.0 - 2.0 * delta);
        let w = -0.5 * ((lf - abs_m - 1.0) * (lf - abs_m) / denom).max(0.0).sqrt() * (1.0 - delta);

        let mut value = 0.0;
        if u != 0.0 {
            value += u * self.p(0, l, m, n);
        }
        if v != 0.0 {
            value += v * self.v_term(l, m, n);
        }
        if w != 0.0 {
            value += w * self.w_term(l, m, n);
        }
        value
    }

    fn p(&self, i: i32, l: usize, a: i32, b: i32) -> f64 {
        let li = l as i32;
        if b == -li {
            self.r1(i, 1) * self.r_prev(l, a, -li + 1) + self.r1(i, -1) * self.r_prev(l, a, li - 1)
        } else if b == li {
            self.r1(i, 1) * self.r_prev(l, a, li - 1) - self.r1(i, -1) * self.r_prev(l, a, -li + 1)
        } else {
            self.r1(i, 0) * self.r_prev(l, a, b)
        }
    }

    fn v_term(&self, l: usize, m: i32, n: i32) -> f64 {
        if m == 0 {
            self.p(1, l, 1, n) + self.p(-1, l, -1, n)
        } else if m > 0 {
            let d: f64 = if m == 1 { 1.0 } else { 0.0 };
            self.p(1, l, m - 1, n) * (1.0 + d).sqrt() - self.p(-1, l, -m + 1, n) * (1.0 - d)
        } else {
            let d: f64 = if m == -1 { 1.0 } else { 0.0 };
            self.p(1, l, m + 1, n) * (1.0 - d) + self.p(-1, l, -m - 1, n) * (1.0 + d).sqrt()
        }
    }

    fn w_term(&self, l: usize, m: i32, n: i32) -> f64 {
        if m > 0 {
            self.p(1, l, m + 1, n) + self.p(-1, l, -m - 1, n)
        } else {
            self.p(1, l, m - 1, n) - self.p(-1, l, -m + 1, n)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hoa::{real_sh, sh_count};
    use crate::position::{Direction, fibonacci_sphere};
    use approx::assert_abs_diff_eq;

    fn rotated_sh_matches(settings: RotationSettings, order: usize) {
        let rotation = ShRotation::from_settings(&settings, order);
        let r = settings.matrix();
        let nsh = sh_count(order);

        for dir in fibonacci_sphere(20) {
            let mut y = [0.0; MAX_SH];
            let mut expected = [0.0; MAX_SH];
            let mut actual = [0.0; MAX_SH];
            real_sh(order, &dir, &mut y);
            real_sh(order, &Direction::from_vector(&(r * dir.to_vector())), &mut expected);
            rotation.apply(&y[..nsh], &mut actual[..nsh]);

            for i in 0..nsh {
                assert_abs_diff_eq!(actual[i], expected[i], epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn test_identity() {
        let rotation = ShRotation::from_settings(&RotationSettings::default(), MAX_ORDER);
        let eye = Array2::<f64>::eye(MAX_SH);
        for (a, b) in rotation.matrix().iter().zip(eye.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_yaw_moves_front_to_left() {
        let settings = RotationSettings {
            yaw: 90.0,
            ..Default::default()
        };
        let v = settings.matrix() * Direction::front().to_vector();
        assert_abs_diff_eq!(v.y, 1.0, epsilon = 1e-9);
        rotated_sh_matches(settings, 3);
    }

    #[test]
    fn test_arbitrary_rotation_all_orders() {
        let settings = RotationSettings {
            yaw: 37.0,
            pitch: -22.0,
            roll: 71.0,
            ..Default::default()
        };
        rotated_sh_matches(settings, MAX_ORDER);
        rotated_sh_matches(RotationSettings { rpy_order: true, ..settings }, 4);
    }

    #[test]
    fn test_flips_negate_angles() {
        let flipped = RotationSettings {
            yaw: 30.0,
            pitch: 10.0,
            flip_yaw: true,
            flip_pitch: true,
            ..Default::default()
        };
        let negated = RotationSettings {
            yaw: -30.0,
            pitch: -10.0,
            ..Default::default()
        };
        assert_abs_diff_eq!(flipped.matrix(), negated.matrix(), epsilon = 1e-12);
    }

    #[test]
    fn test_orthonormal() {
        let settings = RotationSettings {
            yaw: -120.0,
            pitch: 45.0,
            roll: 12.0,
            ..Default::default()
        };
        let rotation = ShRotation::from_settings(&settings, 5);
        let m = rotation.matrix();
        let gram = m.t().dot(m);
        for i in 0..MAX_SH {
            for j in 0..MAX_SH {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(gram[[i, j]], expected, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn test_quaternion_round_trip() {
        let settings = RotationSettings {
            yaw: 50.0,
            pitch: 20.0,
            roll: -35.0,
            ..Default::default()
        };
        let q = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(settings.matrix()));
        let back = RotationSettings::from_quaternion(&q);
        assert_abs_diff_eq!(back.yaw, 50.0, epsilon = 1e-3);
        assert_abs_diff_eq!(back.pitch, 20.0, epsilon = 1e-3);
        assert_abs_diff_eq!(back.roll, -35.0, epsilon = 1e-3);
    }
}
