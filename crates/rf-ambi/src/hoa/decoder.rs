//! Ambisonic decoder design - loudspeaker and binaural decoding matrices
//!
//! Loudspeaker decoders are real, frequency independent and designed once
//! at the master order, then truncated per sub-order. Binaural decoders are
//! complex and designed per band by weighted least squares against the HRTF
//! set.

use nalgebra::{DMatrix, DMatrixView, Matrix2};
use num_complex::Complex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use rf_filterbank::NUM_BANDS;

use super::{MAX_ORDER, acn_to_order_degree, legendre, sh_count, sh_matrix};
use crate::binaural::HrtfSet;
use crate::error::{AmbiError, AmbiResult};
use crate::position::{Direction, fibonacci_sphere};
use crate::vbap::{GainNorm, Vbap};

type C64 = Complex<f64>;

/// Directions used to measure diffuse-field amplitude and energy
pub const REFERENCE_GRID_POINTS: usize = 480;

/// Virtual loudspeakers of the AllRAD design
pub const ALLRAD_VIRTUAL_POINTS: usize = 480;

/// Layouts with every loudspeaker closer than this to the horizon are 2-D
const HORIZONTAL_TOLERANCE_DEG: f32 = 5.0;

/// Tikhonov term of the binaural least-squares fit
const BINAURAL_REGULARIZATION: f64 = 1e-3;

/// Decoding method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DecodingMethod {
    /// Sampling decoder (SAD)
    Sampling,
    /// Mode matching (MMD)
    ModeMatching,
    /// Energy preserving (EPAD)
    EnergyPreserving,
    /// All-round Ambisonic decoder (AllRAD)
    #[default]
    AllRAD,
}

impl DecodingMethod {
    /// Design strategy for this method
    pub fn design(&self) -> &'static dyn DecoderDesign {
        match self {
            Self::Sampling => &SamplingDesign,
            Self::ModeMatching => &ModeMatchingDesign,
            Self::EnergyPreserving => &EnergyPreservingDesign,
            Self::AllRAD => &AllRadDesign,
        }
    }
}

/// Diffuse-field normalization of a decoder slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DiffuseEq {
    /// Unit mean amplitude sum
    #[default]
    Amplitude,
    /// Unit mean energy sum
    Energy,
}

// ============ Design Strategies ============

/// One way of turning loudspeaker directions into a decoding matrix
pub trait DecoderDesign: Send + Sync {
    fn method(&self) -> DecodingMethod;

    /// Needs loudspeakers all around the listener (poles added for 2-D layouts)
    fn needs_full_coverage(&self) -> bool {
        false
    }

    /// Decoding matrix `[directions, (order + 1)^2]`
    fn design(&self, directions: &[Direction], order: usize) -> AmbiResult<DMatrix<f64>>;
}

/// D = Y^T / L
pub struct SamplingDesign;

impl DecoderDesign for SamplingDesign {
    fn method(&self) -> DecodingMethod {
        DecodingMethod::Sampling
    }

    fn design(&self, directions: &[Direction], order: usize) -> AmbiResult<DMatrix<f64>> {
        if directions.is_empty() {
            return Err(AmbiError::InvalidLayout("No loudspeakers defined".into()));
        }
        Ok(sh_matrix(order, directions).transpose() / directions.len() as f64)
    }
}

/// D = pinv(Y)
pub struct ModeMatchingDesign;

impl DecoderDesign for ModeMatchingDesign {
    fn method(&self) -> DecodingMethod {
        DecodingMethod::ModeMatching
    }

    fn design(&self, directions: &[Direction], order: usize) -> AmbiResult<DMatrix<f64>> {
        if directions.is_empty() {
            return Err(AmbiError::InvalidLayout("No loudspeakers defined".into()));
        }
        sh_matrix(order, directions)
            .pseudo_inverse(1e-9)
            .map_err(|e| AmbiError::Numerical(e.to_string()))
    }
}

/// D = U V^T / sqrt(L) from the SVD of Y^T
pub struct EnergyPreservingDesign;

impl DecoderDesign for EnergyPreservingDesign {
    fn method(&self) -> DecodingMethod {
        DecodingMethod::EnergyPreserving
    }

    fn needs_full_coverage(&self) -> bool {
        true
    }

    fn design(&self, directions: &[Direction], order: usize) -> AmbiResult<DMatrix<f64>> {
        if directions.is_empty() {
            return Err(AmbiError::InvalidLayout("No loudspeakers defined".into()));
        }
        let svd = sh_matrix(order, directions).transpose().svd(true, true);
        let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
            return Err(AmbiError::Numerical("SVD did not produce singular vectors".into()));
        };
        Ok(u * v_t / (directions.len() as f64).sqrt())
    }
}

/// Sampling decoder onto a dense virtual layout, then VBAP onto the real one
pub struct AllRadDesign;

impl DecoderDesign for AllRadDesign {
    fn method(&self) -> DecodingMethod {
        DecodingMethod::AllRAD
    }

    fn needs_full_coverage(&self) -> bool {
        true
    }

    fn design(&self, directions: &[Direction], order: usize) -> AmbiResult<DMatrix<f64>> {
        let vbap = Vbap::new(directions)?;
        let virtuals = fibonacci_sphere(ALLRAD_VIRTUAL_POINTS);

        let mut gains = DMatrix::<f64>::zeros(directions.len(), virtuals.len());
        for (v, dir) in virtuals.iter().enumerate() {
            let triplet = vbap
                .gains(&dir.to_vector(), GainNorm::L2)
                .ok_or_else(|| AmbiError::Triangulation(format!("no triangle for {:?}", dir)))?;
            for (index, gain) in triplet {
                gains[(index, v)] += gain;
            }
        }

        let virtual_decoder = sh_matrix(order, &virtuals).transpose() / virtuals.len() as f64;
        Ok(gains * virtual_decoder)
    }
}

// ============ Max-rE ============

/// Per-degree max-rE taper a_l = P_l(r_E), r_E the largest root of P_{N+1}
pub fn max_re_weights(order: usize) -> Vec<f64> {
    let n = order + 1;
    let mut x = (2.4068 / (order as f64 + 1.51)).cos();
    for _ in 0..50 {
        let p = legendre(n, x);
        let dp = n as f64 * (x * p - legendre(n - 1, x)) / (x * x - 1.0);
        let step = p / dp;
        x -= step;
        if step.abs() < 1e-14 {
            break;
        }
    }
    (0..=order).map(|l| legendre(l, x)).collect()
}

/// True when the layout has no usable height information
pub fn is_2d_layout(directions: &[Direction]) -> bool {
    directions.len() < 4
        || directions
            .iter()
            .all(|d| d.elevation.abs() < HORIZONTAL_TOLERANCE_DEG)
}

// ============ Loudspeaker Decoder ============

/// Decoding matrices for one sub-order
#[derive(Debug, Clone)]
pub struct OrderDecoder {
    /// `[outputs, (n + 1)^2]`
    pub plain: DMatrix<f64>,
    /// `plain` with the max-rE taper applied
    pub max_re: DMatrix<f64>,
    /// 1 / mean amplitude sum, for [plain, max_re]
    pub amplitude_norm: [f64; 2],
    /// 1 / sqrt(mean energy sum), for [plain, max_re]
    pub energy_norm: [f64; 2],
}

impl OrderDecoder {
    pub fn matrix(&self, max_re: bool) -> &DMatrix<f64> {
        if max_re { &self.max_re } else { &self.plain }
    }

    pub fn norm(&self, max_re: bool, eq: DiffuseEq) -> f64 {
        let variant = max_re as usize;
        match eq {
            DiffuseEq::Amplitude => self.amplitude_norm[variant],
            DiffuseEq::Energy => self.energy_norm[variant],
        }
    }
}

/// Loudspeaker decoder for every sub-order up to the master order
#[derive(Debug, Clone)]
pub struct LoudspeakerDecoder {
    /// Method that produced the matrices (differs from the request after a fallback)
    pub method: DecodingMethod,
    pub num_outputs: usize,
    /// Virtual rows that were used during design and then removed
    pub virtual_outputs: usize,
    /// Index `n - 1` holds sub-order `n`
    pub orders: Vec<OrderDecoder>,
}

impl LoudspeakerDecoder {
    /// Design a decoder, falling back until the result is usable
    ///
    /// Geometry fallbacks, in order: the layout itself (with poles when a
    /// 2-D layout meets a full-coverage method), the layout with both poles,
    /// the layout with poles plus a tetrahedral t-design. A design that still
    /// fails, or yields non-finite values, is replaced by the sampling decoder.
    pub fn build(directions: &[Direction], order: usize, method: DecodingMethod) -> AmbiResult<Self> {
        if directions.is_empty() {
            return Err(AmbiError::InvalidLayout("No loudspeakers defined".into()));
        }

        let order = order.clamp(1, MAX_ORDER);
        let design = method.design();
        let num_outputs = directions.len();

        let mut with_poles = directions.to_vec();
        with_poles.extend([Direction::new(0.0, 90.0), Direction::new(0.0, -90.0)]);
        let mut with_default = with_poles.clone();
        with_default.extend(default_geometry());

        let mut candidates = Vec::with_capacity(3);
        if design.needs_full_coverage() && is_2d_layout(directions) {
            log::debug!("2-D layout of {} loudspeakers, adding virtual poles", num_outputs);
        } else {
            candidates.push(directions.to_vec());
        }
        candidates.push(with_poles);
        candidates.push(with_default);

        let mut designed = None;
        for points in candidates {
            match design.design(&points, order) {
                Ok(matrix) => {
                    designed = Some((matrix, points.len() - num_outputs));
                    break;
                }
                Err(e) => log::warn!("{:?} design with {} points failed: {}", method, points.len(), e),
            }
        }

        let Some((base, virtual_outputs)) = designed else {
            log::warn!("{:?} design failed for every geometry, using sampling decoder", method);
            return Self::build(directions, order, DecodingMethod::Sampling);
        };

        let decoder = Self::from_base(&base, order, num_outputs, virtual_outputs, method);

        if method != DecodingMethod::Sampling && !decoder.is_finite() {
            log::warn!("{:?} decoder is not finite, using sampling decoder", method);
            return Self::build(directions, order, DecodingMethod::Sampling);
        }

        Ok(decoder)
    }

    fn from_base(
        base: &DMatrix<f64>,
        order: usize,
        num_outputs: usize,
        virtual_outputs: usize,
        method: DecodingMethod,
    ) -> Self {
        let grid_y = sh_matrix(order, &fibonacci_sphere(REFERENCE_GRID_POINTS));

        let orders = (1..=order)
            .map(|n| {
                let nsh = sh_count(n);
                let plain = base.columns(0, nsh).into_owned();

                let taper = max_re_weights(n);
                let mut max_re = plain.clone();
                for (c, mut column) in max_re.column_iter_mut().enumerate() {
                    column *= taper[acn_to_order_degree(c).0];
                }

                // Normalizers include the virtual rows
                let y = grid_y.rows(0, nsh);
                let (amp_plain, energy_plain) = diffuse_norms(&plain, &y);
                let (amp_re, energy_re) = diffuse_norms(&max_re, &y);

                OrderDecoder {
                    plain: plain.rows(0, num_outputs).into_owned(),
                    max_re: max_re.rows(0, num_outputs).into_owned(),
                    amplitude_norm: [amp_plain, amp_re],
                    energy_norm: [energy_plain, energy_re],
                }
            })
            .collect();

        Self {
            method,
            num_outputs,
            virtual_outputs,
            orders,
        }
    }

    pub fn order(&self) -> usize {
        self.orders.len()
    }

    /// Matrices for sub-order `n` (clamped to the designed range)
    pub fn sub_order(&self, n: usize) -> &OrderDecoder {
        &self.orders[n.clamp(1, self.orders.len()) - 1]
    }

    pub fn is_finite(&self) -> bool {
        self.orders.iter().all(|o| {
            o.plain.iter().chain(o.max_re.iter()).all(|x| x.is_finite())
                && o.amplitude_norm.iter().chain(&o.energy_norm).all(|x| x.is_finite())
        })
    }
}

/// Regular tetrahedron, the smallest spherical t-design
fn default_geometry() -> [Direction; 4] {
    let el = (1.0f32 / 3.0f32.sqrt()).asin().to_degrees();
    [
        Direction::new(45.0, el),
        Direction::new(-135.0, el),
        Direction::new(135.0, -el),
        Direction::new(-45.0, -el),
    ]
}

/// (1 / mean amplitude, 1 / sqrt(mean energy)) of plane waves from the grid
fn diffuse_norms(matrix: &DMatrix<f64>, grid_y: &DMatrixView<'_, f64>) -> (f64, f64) {
    let gains = matrix * grid_y;
    let count = gains.ncols().max(1) as f64;

    let amplitude = gains.column_iter().map(|c| c.sum()).sum::<f64>() / count;
    let energy = gains.column_iter().map(|c| c.norm_squared()).sum::<f64>() / count;

    let amplitude_norm = if amplitude.abs() > 1e-9 { 1.0 / amplitude } else { 1.0 };
    let energy_norm = if energy > 1e-12 { 1.0 / energy.sqrt() } else { 1.0 };
    (amplitude_norm, energy_norm)
}

// ============ Binaural Decoder ============

/// Per-band binaural matrices for one sub-order
#[derive(Debug, Clone)]
pub struct BinauralOrder {
    /// Per band `[2, (n + 1)^2]`
    pub plain: Vec<DMatrix<C64>>,
    /// Per band, max-rE tapered
    pub max_re: Vec<DMatrix<C64>>,
}

/// Direct SH-to-ears decoder
#[derive(Debug, Clone)]
pub struct BinauralDecoder {
    /// Index `n - 1` holds sub-order `n`
    pub orders: Vec<BinauralOrder>,
    pub diffuse_matching: bool,
}

impl BinauralDecoder {
    /// Weighted least squares fit of the HRTF set per band
    ///
    /// D_b = H_b W Y^T (Y W Y^T + lambda I)^-1, optionally followed by
    /// diffuse-field covariance matching against H_b W H_b^H.
    pub fn build(hrtf: &HrtfSet, order: usize, diffuse_matching: bool) -> AmbiResult<Self> {
        let order = order.clamp(1, MAX_ORDER);
        let directions = hrtf.directions();
        let weights = hrtf.weights();

        let band_hrtfs: Vec<DMatrix<C64>> = (0..NUM_BANDS).map(|b| hrtf.band_matrix(b)).collect();
        let targets: Vec<Matrix2<C64>> = band_hrtfs
            .iter()
            .map(|h| {
                let mut hw = h.clone();
                for (k, mut column) in hw.column_iter_mut().enumerate() {
                    column *= C64::new(weights[k], 0.0);
                }
                let c = hw * h.adjoint();
                Matrix2::new(c[(0, 0)], c[(0, 1)], c[(1, 0)], c[(1, 1)])
            })
            .collect();

        let mut orders = Vec::with_capacity(order);
        for n in 1..=order {
            let nsh = sh_count(n);
            let y = sh_matrix(n, directions);

            let mut yw = y.clone();
            for (k, mut column) in yw.column_iter_mut().enumerate() {
                column *= weights[k];
            }
            let gram = &yw * y.transpose() + DMatrix::<f64>::identity(nsh, nsh) * BINAURAL_REGULARIZATION;
            let inverse = gram
                .try_inverse()
                .ok_or_else(|| AmbiError::Numerical(format!("singular SH Gram matrix at order {}", n)))?;
            let projection = (yw.transpose() * inverse).map(|x| C64::new(x, 0.0));

            let taper = max_re_weights(n);

            let (plain, max_re): (Vec<_>, Vec<_>) = band_hrtfs
                .par_iter()
                .zip(targets.par_iter())
                .map(|(h, target)| {
                    let plain = h * &projection;
                    let mut max_re = plain.clone();
                    for (c, mut column) in max_re.column_iter_mut().enumerate() {
                        column *= C64::new(taper[acn_to_order_degree(c).0], 0.0);
                    }

                    if diffuse_matching {
                        let plain = match_covariance(&plain, target).unwrap_or(plain);
                        let max_re = match_covariance(&max_re, target).unwrap_or(max_re);
                        (plain, max_re)
                    } else {
                        (plain, max_re)
                    }
                })
                .unzip();

            orders.push(BinauralOrder { plain, max_re });
        }

        log::debug!(
            "Binaural decoder: order {}, {} directions, diffuse matching {}",
            order,
            directions.len(),
            diffuse_matching
        );

        Ok(Self {
            orders,
            diffuse_matching,
        })
    }

    pub fn order(&self) -> usize {
        self.orders.len()
    }

    pub fn is_finite(&self) -> bool {
        self.orders.iter().all(|o| {
            o.plain
                .iter()
                .chain(&o.max_re)
                .all(|m| m.iter().all(|x| x.re.is_finite() && x.im.is_finite()))
        })
    }
}

/// Mixing M = X Q X_hat^-1 so that (M D)(M D)^H equals `target`
fn match_covariance(decoder: &DMatrix<C64>, target: &Matrix2<C64>) -> Option<DMatrix<C64>> {
    let current = decoder * decoder.adjoint();
    let current = Matrix2::new(current[(0, 0)], current[(0, 1)], current[(1, 0)], current[(1, 1)]);

    let x = regularized(target).cholesky()?.l();
    let x_hat = regularized(&current).cholesky()?.l();

    let svd = (x_hat.adjoint() * x).svd(true, true);
    let q = svd.v_t?.adjoint() * svd.u?.adjoint();
    let mixing = x * q * x_hat.try_inverse()?;

    let mixing = DMatrix::from_fn(2, 2, |i, j| mixing[(i, j)]);
    Some(mixing * decoder)
}

fn regularized(m: &Matrix2<C64>) -> Matrix2<C64> {
    let eps = 1e-9 * (m[(0, 0)].re + m[(1, 1)].re).max(1e-12);
    let mut out = *m;
    out[(0, 0)] += C64::new(eps, 0.0);
    out[(1, 1)] += C64::new(eps, 0.0);
    out
}
