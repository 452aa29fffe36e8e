//! rf-filterbank: block adaptation and hybrid time-frequency transform
//!
//! Front end of the ReelForge Ambisonic engine:
//! - `adapter` - host block size to fixed internal frame size (per-channel FIFOs)
//! - `stft` - sine-windowed real STFT, 50% overlap, perfect reconstruction
//! - `hybrid` - extra low-frequency bands carved out of the two lowest bins
//! - `filterbank` - combined multichannel analysis/synthesis
//!
//! The band layout depends only on [`HOP_SIZE`]; the band centre frequencies
//! depend only on the selected [`SampleRate`].

pub mod adapter;
pub mod filterbank;
pub mod hybrid;
pub mod stft;

pub use adapter::FrameAdapter;
pub use filterbank::Filterbank;
pub use num_complex::Complex32;

/// STFT hop size in samples (one time slot)
pub const HOP_SIZE: usize = 128;

/// Internal processing frame in samples
pub const FRAME_SIZE: usize = 256;

/// Time slots per internal frame
pub const TIME_SLOTS: usize = FRAME_SIZE / HOP_SIZE;

/// Uniform STFT bins (DC to Nyquist)
pub const NUM_BINS: usize = HOP_SIZE + 1;

/// Hybrid bands produced per time slot
pub const NUM_BANDS: usize = hybrid::NUM_HYBRID_BANDS;

/// Analysis + synthesis latency of the filterbank in samples
pub const FILTERBANK_DELAY: usize = HOP_SIZE * (1 + hybrid::HYBRID_DELAY);

/// Supported host sample rates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleRate {
    /// 44.1 kHz
    Hz44100,
    /// 48 kHz
    #[default]
    Hz48000,
}

impl SampleRate {
    /// Pick the supported rate nearest to `hz`
    pub fn nearest(hz: u32) -> Self {
        if hz.abs_diff(44_100) < hz.abs_diff(48_000) {
            Self::Hz44100
        } else {
            Self::Hz48000
        }
    }

    /// Rate in Hz
    pub fn hz(&self) -> u32 {
        match self {
            Self::Hz44100 => 44_100,
            Self::Hz48000 => 48_000,
        }
    }
}

/// Centre frequency of every hybrid band, monotonically increasing
pub fn band_centre_frequencies(rate: SampleRate) -> Vec<f32> {
    let bin_spacing = rate.hz() as f32 / (2 * HOP_SIZE) as f32;
    let mut freqs = Vec::with_capacity(NUM_BANDS);

    for offset in hybrid::HYBRID_BAND_OFFSETS {
        freqs.push(offset * bin_spacing);
    }
    for bin in hybrid::FIRST_UNSPLIT_BIN..NUM_BINS {
        freqs.push(bin as f32 * bin_spacing);
    }

    freqs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nearest_rate() {
        assert_eq!(SampleRate::nearest(44_100), SampleRate::Hz44100);
        assert_eq!(SampleRate::nearest(22_050), SampleRate::Hz44100);
        assert_eq!(SampleRate::nearest(48_000), SampleRate::Hz48000);
        assert_eq!(SampleRate::nearest(96_000), SampleRate::Hz48000);
        assert_eq!(SampleRate::default(), SampleRate::Hz48000);
    }

    #[test]
    fn test_frequency_vector_monotonic() {
        for rate in [SampleRate::Hz44100, SampleRate::Hz48000] {
            let freqs = band_centre_frequencies(rate);
            assert_eq!(freqs.len(), NUM_BANDS);
            assert!(freqs.windows(2).all(|w| w[0] < w[1]), "{:?}", freqs);
            assert!((freqs[NUM_BANDS - 1] - rate.hz() as f32 / 2.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_band_count_exceeds_uniform() {
        assert!(NUM_BANDS > NUM_BINS);
        assert_eq!(NUM_BANDS - NUM_BINS, 3);
    }
}
