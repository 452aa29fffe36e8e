//! HRTF set - per-band HRTFs, integration weights and interpolation
//!
//! Pipeline from raw HRIRs:
//! 1. resample to the host rate (linear interpolation)
//! 2. ITD per direction
//! 3. per-band response through the engine's own filterbank
//! 4. spherical integration weights
//! 5. diffuse-field EQ and phase simplification (optional)
//! 6. VBAP interpolation table

use std::f32::consts::PI;

use nalgebra::DMatrix;
use ndarray::{Array3, ArrayViewMut2, s};
use num_complex::{Complex, Complex32};
use rayon::prelude::*;

use rf_filterbank::{
    FILTERBANK_DELAY, FRAME_SIZE, Filterbank, NUM_BANDS, SampleRate, TIME_SLOTS, band_centre_frequencies,
};

use super::default_set;
use super::itd::estimate_itd;
use super::loader::{HrirData, HrirLoader, HrirPreProc};
use crate::error::AmbiResult;
use crate::position::Direction;
use crate::vbap::{GainNorm, Vbap};

/// Above this many directions integration weights are uniform
pub const MAX_WEIGHTED_DIRECTIONS: usize = 2000;

/// Interpolation table resolution in degrees
pub const TABLE_AZ_STEP: f32 = 2.0;
pub const TABLE_EL_STEP: f32 = 5.0;

const TABLE_AZ_CELLS: usize = (360.0 / TABLE_AZ_STEP) as usize;
const TABLE_EL_CELLS: usize = (180.0 / TABLE_EL_STEP) as usize + 1;

/// Interaural phase is fully applied below this frequency
const IPD_FULL_HZ: f32 = 1500.0;

/// ... and faded out completely at this one
const IPD_ZERO_HZ: f32 = 3000.0;

/// Interaural phase difference modelled from an ITD
#[inline]
pub fn ipd(freq: f32, itd: f32) -> f32 {
    let fade = if freq <= IPD_FULL_HZ {
        1.0
    } else if freq >= IPD_ZERO_HZ {
        0.0
    } else {
        (IPD_ZERO_HZ - freq) / (IPD_ZERO_HZ - IPD_FULL_HZ)
    };
    2.0 * PI * freq * itd * fade
}

// ============ Interpolation Table ============

/// Precomputed VBAP triplets on a regular azimuth/elevation grid
#[derive(Debug, Clone)]
pub struct InterpolationTable {
    /// `[elevation cell][azimuth cell]` flattened
    cells: Vec<[(u32, f32); 3]>,
}

impl InterpolationTable {
    /// Build the table for `directions`
    ///
    /// Cells the triangulation cannot serve fall back to the nearest direction.
    pub fn new(directions: &[Direction]) -> Self {
        let vbap = match Vbap::new(directions) {
            Ok(vbap) => Some(vbap),
            Err(e) => {
                log::warn!("HRTF triangulation failed ({}), using nearest neighbour", e);
                None
            }
        };
        let points: Vec<_> = directions.iter().map(|d| d.to_vector()).collect();

        let mut cells = Vec::with_capacity(TABLE_AZ_CELLS * TABLE_EL_CELLS);
        for ei in 0..TABLE_EL_CELLS {
            for ai in 0..TABLE_AZ_CELLS {
                let cell = Direction::new(
                    -180.0 + ai as f32 * TABLE_AZ_STEP,
                    -90.0 + ei as f32 * TABLE_EL_STEP,
                );
                let target = cell.to_vector();

                let entry = vbap
                    .as_ref()
                    .and_then(|v| v.gains(&target, GainNorm::L1))
                    .map(|g| g.map(|(i, w)| (i as u32, w as f32)))
                    .unwrap_or_else(|| {
                        let nearest = (0..points.len())
                            .max_by(|&a, &b| points[a].dot(&target).total_cmp(&points[b].dot(&target)))
                            .unwrap_or(0);
                        [(nearest as u32, 1.0), (nearest as u32, 0.0), (nearest as u32, 0.0)]
                    });
                cells.push(entry);
            }
        }

        Self { cells }
    }

    /// Triplet of the cell nearest to `direction`
    pub fn lookup(&self, direction: &Direction) -> &[(u32, f32); 3] {
        let d = direction.wrapped();
        let ai = ((d.azimuth + 180.0) / TABLE_AZ_STEP).round() as usize % TABLE_AZ_CELLS;
        let ei = (((d.elevation + 90.0) / TABLE_EL_STEP).round() as usize).min(TABLE_EL_CELLS - 1);
        &self.cells[ei * TABLE_AZ_CELLS + ai]
    }
}

// ============ HRTF Set ============

/// Processed HRTFs at the host sample rate
#[derive(Debug, Clone)]
pub struct HrtfSet {
    directions: Vec<Direction>,
    /// Seconds, right minus left arrival
    itds: Vec<f32>,
    /// `[band, ear, direction]`
    bands: Array3<Complex32>,
    weights: Vec<f64>,
    freqs: Vec<f32>,
    table: InterpolationTable,
    fallback: bool,
}

impl HrtfSet {
    /// Load HRIRs and process them, falling back to the default set on any failure
    pub fn load(loader: &dyn HrirLoader, rate: SampleRate, preproc: HrirPreProc) -> AmbiResult<Self> {
        let loaded = loader.load().and_then(|data| {
            data.validate()?;
            Self::from_hrirs(data, rate, preproc)
        });

        match loaded {
            Ok(set) => Ok(set),
            Err(e) => {
                log::warn!("HRIR load failed ({}), using default HRIRs", e);
                let mut set = Self::from_hrirs(default_set::generate(), rate, preproc)?;
                set.fallback = true;
                Ok(set)
            }
        }
    }

    /// Process raw HRIRs
    pub fn from_hrirs(data: HrirData, rate: SampleRate, preproc: HrirPreProc) -> AmbiResult<Self> {
        data.validate()?;

        let hrirs = resample(&data.hrirs, data.sample_rate, rate.hz());
        let num_dirs = data.num_directions();

        let itds: Vec<f32> = (0..num_dirs)
            .into_par_iter()
            .map(|d| {
                let left = hrirs.slice(s![d, 0, ..]).to_vec();
                let right = hrirs.slice(s![d, 1, ..]).to_vec();
                estimate_itd(&left, &right, rate.hz())
            })
            .collect();

        let mut bands = band_responses(&hrirs);

        let weights = if num_dirs <= MAX_WEIGHTED_DIRECTIONS {
            match Vbap::new(&data.directions) {
                Ok(vbap) => vbap.area_weights(),
                Err(e) => {
                    log::warn!("HRTF integration weights unavailable ({}), using uniform", e);
                    vec![1.0 / num_dirs as f64; num_dirs]
                }
            }
        } else {
            vec![1.0 / num_dirs as f64; num_dirs]
        };

        let freqs = band_centre_frequencies(rate);

        if preproc.equalize() {
            diffuse_field_eq(&mut bands, &weights);
        }
        if preproc.simplify_phase() {
            for band in 0..NUM_BANDS {
                for d in 0..num_dirs {
                    let phase = 0.5 * ipd(freqs[band], itds[d]);
                    let left = bands[[band, 0, d]].norm();
                    let right = bands[[band, 1, d]].norm();
                    bands[[band, 0, d]] = Complex32::from_polar(left, phase);
                    bands[[band, 1, d]] = Complex32::from_polar(right, -phase);
                }
            }
        }

        let table = InterpolationTable::new(&data.directions);

        log::info!(
            "HRTF set ready: {} directions, {} taps at {} Hz",
            num_dirs,
            hrirs.dim().2,
            rate.hz()
        );

        Ok(Self {
            directions: data.directions,
            itds,
            bands,
            weights,
            freqs,
            table,
            fallback: false,
        })
    }

    /// True when the default set replaced a source that failed to load
    pub fn is_fallback(&self) -> bool {
        self.fallback
    }

    pub fn num_directions(&self) -> usize {
        self.directions.len()
    }

    pub fn directions(&self) -> &[Direction] {
        &self.directions
    }

    pub fn itds(&self) -> &[f32] {
        &self.itds
    }

    /// Integration weights, summing to 1
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn freqs(&self) -> &[f32] {
        &self.freqs
    }

    /// `[band, ear, direction]`
    pub fn bands(&self) -> &Array3<Complex32> {
        &self.bands
    }

    /// `[2, directions]` HRTFs of one band
    pub fn band_matrix(&self, band: usize) -> DMatrix<Complex<f64>> {
        DMatrix::from_fn(2, self.directions.len(), |ear, d| {
            let h = self.bands[[band, ear, d]];
            Complex::new(h.re as f64, h.im as f64)
        })
    }

    /// Per-band HRTF pair for an arbitrary direction
    ///
    /// Magnitudes and ITDs of the enclosing triplet are blended separately,
    /// then the interaural phase is rebuilt from the blended ITD. `out` is
    /// `[band, ear]`.
    pub fn interpolate(&self, direction: &Direction, mut out: ArrayViewMut2<'_, Complex32>) {
        let cell = self.table.lookup(direction);
        let itd: f32 = cell.iter().map(|&(i, w)| w * self.itds[i as usize]).sum();

        for band in 0..NUM_BANDS.min(out.nrows()) {
            let phase = 0.5 * ipd(self.freqs[band], itd);
            for ear in 0..2 {
                let magnitude: f32 = cell
                    .iter()
                    .map(|&(i, w)| w * self.bands[[band, ear, i as usize]].norm())
                    .sum();
                let sign = if ear == 0 { 1.0 } else { -1.0 };
                out[[band, ear]] = Complex32::from_polar(magnitude, sign * phase);
            }
        }
    }
}

/// Linear-interpolation resampling of every HRIR
fn resample(hrirs: &Array3<f32>, from: u32, to: u32) -> Array3<f32> {
    if from == to {
        return hrirs.clone();
    }
    let (dirs, ears, len) = hrirs.dim();
    let ratio = from as f64 / to as f64;
    let new_len = ((len as f64 / ratio).ceil() as usize).max(1);

    log::debug!("Resampling HRIRs {} -> {} Hz ({} -> {} taps)", from, to, len, new_len);

    let mut out = Array3::<f32>::zeros((dirs, ears, new_len));
    for t in 0..new_len {
        let pos = t as f64 * ratio;
        let i = pos.floor() as usize;
        let frac = (pos - i as f64) as f32;
        for d in 0..dirs {
            for e in 0..ears {
                let a = if i < len { hrirs[[d, e, i]] } else { 0.0 };
                let b = if i + 1 < len { hrirs[[d, e, i + 1]] } else { 0.0 };
                out[[d, e, t]] = a + (b - a) * frac;
            }
        }
    }
    out
}

/// Least-squares complex gain of every band, ear and direction
///
/// Each HRIR and a unit impulse go through the filterbank; the band response
/// is the projection of the HRIR's band signal onto the impulse's.
fn band_responses(hrirs: &Array3<f32>) -> Array3<Complex32> {
    let (num_dirs, _, len) = hrirs.dim();
    let frames = (len + FILTERBANK_DELAY).div_ceil(FRAME_SIZE) + 1;

    let mut impulse = vec![0.0f32; len.max(1)];
    impulse[0] = 1.0;
    let reference = analyse(&mut Filterbank::new(1, 0), &[impulse], frames);

    let energy: Vec<f32> = (0..NUM_BANDS)
        .map(|b| reference.slice(s![b, 0, ..]).iter().map(|x| x.norm_sqr()).sum())
        .collect();

    let per_direction: Vec<[[Complex32; NUM_BANDS]; 2]> = (0..num_dirs)
        .into_par_iter()
        .map_init(
            || Filterbank::new(2, 0),
            |filterbank, d| {
                filterbank.clear_buffers();
                let ears = [hrirs.slice(s![d, 0, ..]).to_vec(), hrirs.slice(s![d, 1, ..]).to_vec()];
                let spectra = analyse(filterbank, &ears, frames);

                let mut out = [[Complex32::new(0.0, 0.0); NUM_BANDS]; 2];
                for (ear, bands) in out.iter_mut().enumerate() {
                    for (b, h) in bands.iter_mut().enumerate() {
                        if energy[b] <= 1e-12 {
                            continue;
                        }
                        let cross: Complex32 = spectra
                            .slice(s![b, ear, ..])
                            .iter()
                            .zip(reference.slice(s![b, 0, ..]))
                            .map(|(x, r)| x * r.conj())
                            .sum();
                        *h = cross / energy[b];
                    }
                }
                out
            },
        )
        .collect();

    let mut bands = Array3::<Complex32>::zeros((NUM_BANDS, 2, num_dirs));
    for (d, ears) in per_direction.iter().enumerate() {
        for ear in 0..2 {
            for b in 0..NUM_BANDS {
                bands[[b, ear, d]] = ears[ear][b];
            }
        }
    }
    bands
}

/// Run `channels` through `filterbank`, zero padded to `frames` frames
fn analyse(filterbank: &mut Filterbank, channels: &[Vec<f32>], frames: usize) -> Array3<Complex32> {
    let mut spectra = Array3::<Complex32>::zeros((NUM_BANDS, channels.len(), frames * TIME_SLOTS));
    let mut frame = vec![vec![0.0f32; FRAME_SIZE]; channels.len()];

    for f in 0..frames {
        let start = f * FRAME_SIZE;
        for (buf, signal) in frame.iter_mut().zip(channels) {
            buf.fill(0.0);
            if start < signal.len() {
                let end = (start + FRAME_SIZE).min(signal.len());
                buf[..end - start].copy_from_slice(&signal[start..end]);
            }
        }
        filterbank.forward(
            &frame,
            spectra.slice_mut(s![.., .., f * TIME_SLOTS..(f + 1) * TIME_SLOTS]),
        );
    }
    spectra
}

/// Divide each band and ear by its weighted RMS magnitude
fn diffuse_field_eq(bands: &mut Array3<Complex32>, weights: &[f64]) {
    for band in 0..NUM_BANDS {
        for ear in 0..2 {
            let power: f64 = weights
                .iter()
                .enumerate()
                .map(|(d, w)| w * bands[[band, ear, d]].norm_sqr() as f64)
                .sum();
            let rms = power.sqrt() as f32;
            if rms > 1e-9 {
                bands.slice_mut(s![band, ear, ..]).mapv_inplace(|h| h / rms);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binaural::loader::DefaultHrirLoader;
    use crate::error::AmbiError;
    use ndarray::Array2;

    struct FailingLoader;

    impl HrirLoader for FailingLoader {
        fn load(&self) -> AmbiResult<HrirData> {
            Err(AmbiError::HrirLoad("unavailable".into()))
        }
    }

    struct MonoLoader;

    impl HrirLoader for MonoLoader {
        fn load(&self) -> AmbiResult<HrirData> {
            let data = default_set::generate();
            Ok(HrirData {
                hrirs: data.hrirs.slice(s![.., 0..1, ..]).to_owned(),
                ..data
            })
        }
    }

    #[test]
    fn test_ipd_fade() {
        assert!((ipd(1000.0, 1e-4) - 2.0 * PI * 1000.0 * 1e-4).abs() < 1e-6);
        assert!((ipd(2250.0, 1e-4) - 0.5 * 2.0 * PI * 2250.0 * 1e-4).abs() < 1e-6);
        assert_eq!(ipd(3000.0, 1e-4), 0.0);
        assert_eq!(ipd(10_000.0, 1e-4), 0.0);
    }

    #[test]
    fn test_default_set_processing() {
        let set = HrtfSet::load(&DefaultHrirLoader, SampleRate::Hz48000, HrirPreProc::All).unwrap();
        assert!(!set.is_fallback());
        assert_eq!(set.bands().dim(), (NUM_BANDS, 2, set.num_directions()));

        let total: f64 = set.weights().iter().sum();
        assert!((total - 1.0).abs() < 1e-9);

        // Diffuse-field EQ: unit weighted RMS per band and ear
        for band in [3, 40, 100] {
            for ear in 0..2 {
                let power: f64 = (0..set.num_directions())
                    .map(|d| set.weights()[d] * set.bands()[[band, ear, d]].norm_sqr() as f64)
                    .sum();
                assert!((power - 1.0).abs() < 1e-3, "band {} ear {}: {}", band, ear, power);
            }
        }

        // Left sources lead at the left ear
        let left = set.directions().iter().position(|d| *d == Direction::new(90.0, 0.0)).unwrap();
        assert!(set.itds()[left] > 0.0);
    }

    #[test]
    fn test_interpolation_at_measured_direction() {
        let set = HrtfSet::load(&DefaultHrirLoader, SampleRate::Hz48000, HrirPreProc::All).unwrap();
        let target = Direction::new(-60.0, 20.0);
        let index = set.directions().iter().position(|d| *d == target).unwrap();

        let mut out = Array2::<Complex32>::zeros((NUM_BANDS, 2));
        set.interpolate(&target, out.view_mut());

        for band in 0..NUM_BANDS {
            for ear in 0..2 {
                let expected = set.bands()[[band, ear, index]];
                assert!((out[[band, ear]].norm() - expected.norm()).abs() < 1e-4);
                assert!((out[[band, ear]] - expected).norm() < 1e-3);
            }
        }
    }

    #[test]
    fn test_interpolation_weights_valid_everywhere() {
        let set = HrtfSet::load(&DefaultHrirLoader, SampleRate::Hz44100, HrirPreProc::Off).unwrap();
        for ei in 0..TABLE_EL_CELLS {
            for ai in 0..TABLE_AZ_CELLS {
                let dir = Direction::new(-180.0 + ai as f32 * TABLE_AZ_STEP, -90.0 + ei as f32 * TABLE_EL_STEP);
                let cell = set.table.lookup(&dir);
                let sum: f32 = cell.iter().map(|(_, w)| w).sum();
                assert!(cell.iter().all(|(_, w)| *w >= 0.0));
                assert!((sum - 1.0).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_failed_load_falls_back() {
        let set = HrtfSet::load(&FailingLoader, SampleRate::Hz48000, HrirPreProc::All).unwrap();
        assert!(set.is_fallback());
        assert_eq!(set.num_directions(), default_set::default_directions().len());

        let set = HrtfSet::load(&MonoLoader, SampleRate::Hz48000, HrirPreProc::All).unwrap();
        assert!(set.is_fallback());
    }

    #[test]
    fn test_resample_length_and_shape() {
        let mut hrirs = Array3::<f32>::zeros((1, 2, 100));
        hrirs[[0, 0, 10]] = 1.0;
        let out = resample(&hrirs, 44_100, 48_000);
        assert_eq!(out.dim(), (1, 2, 109));
        let peak = (0..109).max_by(|&a, &b| out[[0, 0, a]].total_cmp(&out[[0, 0, b]])).unwrap();
        assert!((peak as i32 - 11).abs() <= 1);
    }
}
