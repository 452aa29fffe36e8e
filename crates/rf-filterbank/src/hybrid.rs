//! Hybrid low-frequency band splitting
//!
//! The uniform STFT resolves bins of `fs / (2 * HOP_SIZE)` Hz, which is coarse
//! in the bass. Bin 0 is split into two sub-bands and bin 1 into three by short
//! FIR filters running across time slots. Within one bin the filters of all its
//! sub-bands sum to a pure delay of [`HYBRID_DELAY`] slots, and every unsplit
//! bin is delayed by the same amount, so synthesis is a plain sum.

use std::f32::consts::PI;

use num_complex::Complex32;

use crate::NUM_BINS;

/// Group delay of the sub-band filters, in time slots
pub const HYBRID_DELAY: usize = 3;

/// FIR length of the sub-band filters
pub const HYBRID_TAPS: usize = 2 * HYBRID_DELAY + 1;

/// Lowest bin that is passed through without splitting
pub const FIRST_UNSPLIT_BIN: usize = 2;

/// Sub-bands carved from bin 0
const BIN0_SPLITS: usize = 2;

/// Sub-bands carved from bin 1
const BIN1_SPLITS: usize = 3;

/// Total band count after splitting
pub const NUM_HYBRID_BANDS: usize = NUM_BINS - FIRST_UNSPLIT_BIN + BIN0_SPLITS + BIN1_SPLITS;

/// Centre of each hybrid sub-band, in units of the bin spacing
pub const HYBRID_BAND_OFFSETS: [f32; BIN0_SPLITS + BIN1_SPLITS] =
    [0.125, 0.375, 2.0 / 3.0, 1.0, 4.0 / 3.0];

/// Band index of an unsplit bin
#[inline]
pub fn band_of_bin(bin: usize) -> usize {
    debug_assert!(bin >= FIRST_UNSPLIT_BIN);
    bin - FIRST_UNSPLIT_BIN + BIN0_SPLITS + BIN1_SPLITS
}

/// Sub-band filter coefficients (shared by all channels)
#[derive(Debug, Clone)]
pub struct HybridFilters {
    bin0: [[Complex32; HYBRID_TAPS]; BIN0_SPLITS],
    bin1: [[Complex32; HYBRID_TAPS]; BIN1_SPLITS],
}

impl HybridFilters {
    /// Design the complementary filter sets
    pub fn new() -> Self {
        let zero = Complex32::new(0.0, 0.0);

        // Bin 0: real lowpass + complement. Cut at 1/8 cycle/slot = quarter bin.
        let low0 = lowpass_prototype(1.0 / 8.0);
        let mut bin0 = [[zero; HYBRID_TAPS]; BIN0_SPLITS];
        for tap in 0..HYBRID_TAPS {
            bin0[0][tap] = Complex32::new(low0[tap], 0.0);
            bin0[1][tap] = Complex32::new(delta(tap) - low0[tap], 0.0);
        }

        // Bin 1: centre lowpass, upper band = same prototype shifted by +1/6
        // cycle/slot, lower band = complement of both.
        let proto = lowpass_prototype(1.0 / 12.0);
        let mut bin1 = [[zero; HYBRID_TAPS]; BIN1_SPLITS];
        for tap in 0..HYBRID_TAPS {
            let lag = tap as f32 - HYBRID_DELAY as f32;
            let mid = Complex32::new(proto[tap], 0.0);
            let high = Complex32::from_polar(proto[tap], 2.0 * PI * lag / 6.0);
            let low = Complex32::new(delta(tap), 0.0) - mid - high;

            // Bin 1 rotates by half a cycle per slot; move the prototypes there.
            let sign = if (tap + HYBRID_DELAY) % 2 == 0 { 1.0 } else { -1.0 };
            bin1[0][tap] = low * sign;
            bin1[1][tap] = mid * sign;
            bin1[2][tap] = high * sign;
        }

        Self { bin0, bin1 }
    }

    /// Split the most recent slot held in `history` into hybrid bands
    pub fn analyse(&self, history: &HybridHistory, bands: &mut [Complex32]) {
        debug_assert_eq!(bands.len(), NUM_HYBRID_BANDS);

        for (split, taps) in self.bin0.iter().enumerate() {
            bands[split] = taps
                .iter()
                .enumerate()
                .map(|(lag, &h)| h * history.lagged(lag)[0])
                .sum();
        }
        for (split, taps) in self.bin1.iter().enumerate() {
            bands[BIN0_SPLITS + split] = taps
                .iter()
                .enumerate()
                .map(|(lag, &h)| h * history.lagged(lag)[1])
                .sum();
        }

        let delayed = history.lagged(HYBRID_DELAY);
        for bin in FIRST_UNSPLIT_BIN..NUM_BINS {
            bands[band_of_bin(bin)] = delayed[bin];
        }
    }

    /// Merge hybrid bands back into uniform bins
    pub fn synthesise(&self, bands: &[Complex32], bins: &mut [Complex32]) {
        debug_assert_eq!(bands.len(), NUM_HYBRID_BANDS);
        debug_assert_eq!(bins.len(), NUM_BINS);

        bins[0] = bands[..BIN0_SPLITS].iter().sum();
        bins[1] = bands[BIN0_SPLITS..BIN0_SPLITS + BIN1_SPLITS].iter().sum();
        for bin in FIRST_UNSPLIT_BIN..NUM_BINS {
            bins[bin] = bands[band_of_bin(bin)];
        }
    }
}

impl Default for HybridFilters {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-channel history of the last [`HYBRID_TAPS`] STFT slots
#[derive(Debug, Clone)]
pub struct HybridHistory {
    slots: Vec<Complex32>,
    /// Row that receives the next slot
    head: usize,
}

impl HybridHistory {
    pub fn new() -> Self {
        Self {
            slots: vec![Complex32::new(0.0, 0.0); HYBRID_TAPS * NUM_BINS],
            head: 0,
        }
    }

    /// Store a new slot of uniform bins
    pub fn push(&mut self, bins: &[Complex32]) {
        let row = self.head * NUM_BINS;
        self.slots[row..row + NUM_BINS].copy_from_slice(&bins[..NUM_BINS]);
        self.head = (self.head + 1) % HYBRID_TAPS;
    }

    /// Bins of the slot `lag` slots before the most recent one
    #[inline]
    pub fn lagged(&self, lag: usize) -> &[Complex32] {
        let row = (self.head + HYBRID_TAPS - 1 - lag) % HYBRID_TAPS;
        &self.slots[row * NUM_BINS..(row + 1) * NUM_BINS]
    }

    pub fn clear(&mut self) {
        self.slots.fill(Complex32::new(0.0, 0.0));
        self.head = 0;
    }
}

impl Default for HybridHistory {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn delta(tap: usize) -> f32 {
    if tap == HYBRID_DELAY { 1.0 } else { 0.0 }
}

/// Hann-windowed sinc lowpass centred on `HYBRID_DELAY`, unit DC gain
fn lowpass_prototype(cutoff: f32) -> [f32; HYBRID_TAPS] {
    let mut taps = [0.0f32; HYBRID_TAPS];
    for (i, tap) in taps.iter_mut().enumerate() {
        let lag = i as f32 - HYBRID_DELAY as f32;
        let window = 0.5 - 0.5 * (2.0 * PI * (i + 1) as f32 / (HYBRID_TAPS + 1) as f32).cos();
        let x = 2.0 * cutoff * lag;
        let sinc = if x.abs() < 1e-9 { 1.0 } else { (PI * x).sin() / (PI * x) };
        *tap = window * 2.0 * cutoff * sinc;
    }

    let dc: f32 = taps.iter().sum();
    for tap in &mut taps {
        *tap /= dc;
    }
    taps
}
