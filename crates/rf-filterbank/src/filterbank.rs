//! Multichannel hybrid analysis/synthesis filterbank
//!
//! `forward` turns `FRAME_SIZE` samples per channel into `TIME_SLOTS` slots of
//! `NUM_BANDS` complex bands, laid out `[band][channel][slot]`. `inverse` is
//! the exact reverse, with a total delay of [`FILTERBANK_DELAY`] samples.

use ndarray::{ArrayView3, ArrayViewMut3};
use num_complex::Complex32;

use crate::hybrid::{HybridFilters, HybridHistory};
use crate::stft::{Stft, StftChannel};
use crate::{FILTERBANK_DELAY, FRAME_SIZE, HOP_SIZE, NUM_BANDS, NUM_BINS, TIME_SLOTS};

/// Analysis delay lines of one input channel
#[derive(Debug, Clone, Default)]
struct AnalysisChannel {
    stft: StftChannel,
    history: HybridHistory,
}

/// Hybrid filterbank over a variable number of input and output channels
pub struct Filterbank {
    stft: Stft,
    hybrid: HybridFilters,
    analysis: Vec<AnalysisChannel>,
    synthesis: Vec<StftChannel>,
    bins: Vec<Complex32>,
    bands: Vec<Complex32>,
    silence: Vec<f32>,
}

impl Filterbank {
    /// Create a filterbank for `num_inputs` analysis and `num_outputs` synthesis channels
    pub fn new(num_inputs: usize, num_outputs: usize) -> Self {
        Self {
            stft: Stft::new(),
            hybrid: HybridFilters::new(),
            analysis: vec![AnalysisChannel::default(); num_inputs],
            synthesis: vec![StftChannel::new(); num_outputs],
            bins: vec![Complex32::new(0.0, 0.0); NUM_BINS],
            bands: vec![Complex32::new(0.0, 0.0); NUM_BANDS],
            silence: vec![0.0; HOP_SIZE],
        }
    }

    pub fn num_inputs(&self) -> usize {
        self.analysis.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.synthesis.len()
    }

    /// Resize channel counts; channels that persist keep their delay lines
    pub fn channel_change(&mut self, num_inputs: usize, num_outputs: usize) {
        if num_inputs != self.analysis.len() || num_outputs != self.synthesis.len() {
            log::debug!(
                "Filterbank channels {}x{} -> {}x{}",
                self.analysis.len(),
                self.synthesis.len(),
                num_inputs,
                num_outputs
            );
        }
        self.analysis.resize_with(num_inputs, AnalysisChannel::default);
        self.synthesis.resize_with(num_outputs, StftChannel::new);
    }

    /// Zero every delay line
    pub fn clear_buffers(&mut self) {
        for channel in &mut self.analysis {
            channel.stft.clear();
            channel.history.clear();
        }
        for channel in &mut self.synthesis {
            channel.clear();
        }
    }

    /// Analysis latency plus synthesis latency in samples
    pub fn latency(&self) -> usize {
        FILTERBANK_DELAY
    }

    /// Time frame to hybrid bands
    ///
    /// `time` may hold fewer channels than the filterbank (missing ones are
    /// silent) or more (ignored). `spectra` must be at least
    /// `[NUM_BANDS][num_inputs][TIME_SLOTS]`.
    pub fn forward<T: AsRef<[f32]>>(&mut self, time: &[T], mut spectra: ArrayViewMut3<'_, Complex32>) {
        debug_assert!(spectra.dim().0 >= NUM_BANDS);
        debug_assert!(spectra.dim().1 >= self.analysis.len());
        debug_assert!(spectra.dim().2 >= TIME_SLOTS);

        for (ch, channel) in self.analysis.iter_mut().enumerate() {
            let samples = time.get(ch).map(|t| t.as_ref());
            for slot in 0..TIME_SLOTS {
                let range = slot * HOP_SIZE..(slot + 1) * HOP_SIZE;
                let hop = match samples {
                    Some(s) if s.len() >= FRAME_SIZE => &s[range],
                    _ => &self.silence[..],
                };

                self.stft.analyse(&mut channel.stft, hop, &mut self.bins);
                channel.history.push(&self.bins);
                self.hybrid.analyse(&channel.history, &mut self.bands);

                for (band, &value) in self.bands.iter().enumerate() {
                    spectra[[band, ch, slot]] = value;
                }
            }
        }
    }

    /// Hybrid bands to time frame
    ///
    /// Writes `min(num_outputs, time.len())` channels; extra entries of `time`
    /// are left untouched.
    pub fn inverse<T: AsMut<[f32]>>(&mut self, spectra: ArrayView3<'_, Complex32>, time: &mut [T]) {
        debug_assert!(spectra.dim().1 >= self.synthesis.len());

        for (ch, (channel, out)) in self.synthesis.iter_mut().zip(time.iter_mut()).enumerate() {
            let out = out.as_mut();
            for slot in 0..TIME_SLOTS {
                for (band, value) in self.bands.iter_mut().enumerate() {
                    *value = spectra[[band, ch, slot]];
                }
                self.hybrid.synthesise(&self.bands, &mut self.bins);

                let range = slot * HOP_SIZE..(slot + 1) * HOP_SIZE;
                if out.len() >= FRAME_SIZE {
                    self.stft.synthesise(channel, &self.bins, &mut out[range]);
                }
            }
        }
    }
}
