//! Sine-windowed short-time Fourier transform
//!
//! FFT length is `2 * HOP_SIZE`, with 50% overlap. The same sine window
//! `w[n] = sin(pi * n / N)` is used for analysis and synthesis, so
//! `w^2[n] + w^2[n + HOP]` is 1 and overlap-add reconstructs exactly after
//! one hop of delay.

use std::f32::consts::PI;
use std::sync::Arc;

use num_complex::Complex32;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};

use crate::{HOP_SIZE, NUM_BINS};

/// FFT length
pub const FFT_SIZE: usize = 2 * HOP_SIZE;

// ============ Channel State ============

/// Delay lines of one channel (analysis input or synthesis overlap-add)
#[derive(Debug, Clone)]
pub struct StftChannel {
    buffer: Vec<f32>,
}

impl StftChannel {
    pub fn new() -> Self {
        Self {
            buffer: vec![0.0; FFT_SIZE],
        }
    }

    pub fn clear(&mut self) {
        self.buffer.fill(0.0);
    }
}

impl Default for StftChannel {
    fn default() -> Self {
        Self::new()
    }
}

// ============ STFT Processor ============

/// FFT plans, window and scratch shared by every channel
pub struct Stft {
    fft_forward: Arc<dyn RealToComplex<f32>>,
    fft_inverse: Arc<dyn ComplexToReal<f32>>,
    window: Vec<f32>,
    /// Windowed time frame
    frame: Vec<f32>,
    /// Spectrum copy consumed by the inverse FFT
    spectrum: Vec<Complex32>,
    forward_scratch: Vec<Complex32>,
    inverse_scratch: Vec<Complex32>,
}

impl Stft {
    pub fn new() -> Self {
        let mut planner = RealFftPlanner::<f32>::new();
        let fft_forward = planner.plan_fft_forward(FFT_SIZE);
        let fft_inverse = planner.plan_fft_inverse(FFT_SIZE);

        let window = (0..FFT_SIZE)
            .map(|n| (PI * n as f32 / FFT_SIZE as f32).sin())
            .collect();

        let forward_scratch = fft_forward.make_scratch_vec();
        let inverse_scratch = fft_inverse.make_scratch_vec();

        Self {
            fft_forward,
            fft_inverse,
            window,
            frame: vec![0.0; FFT_SIZE],
            spectrum: vec![Complex32::new(0.0, 0.0); NUM_BINS],
            forward_scratch,
            inverse_scratch,
        }
    }

    /// Analysis: shift in one hop of samples and produce `NUM_BINS` bins
    pub fn analyse(&mut self, channel: &mut StftChannel, hop: &[f32], bins: &mut [Complex32]) {
        debug_assert_eq!(hop.len(), HOP_SIZE);
        debug_assert_eq!(bins.len(), NUM_BINS);

        let buffer = &mut channel.buffer;
        buffer.copy_within(HOP_SIZE.., 0);
        buffer[HOP_SIZE..].copy_from_slice(hop);

        for ((dst, &src), &win) in self.frame.iter_mut().zip(buffer.iter()).zip(&self.window) {
            *dst = src * win;
        }

        if self
            .fft_forward
            .process_with_scratch(&mut self.frame, bins, &mut self.forward_scratch)
            .is_err()
        {
            bins.fill(Complex32::new(0.0, 0.0));
        }
    }

    /// Synthesis: inverse transform `bins`, overlap-add and emit one hop
    pub fn synthesise(&mut self, channel: &mut StftChannel, bins: &[Complex32], hop: &mut [f32]) {
        debug_assert_eq!(hop.len(), HOP_SIZE);
        debug_assert_eq!(bins.len(), NUM_BINS);

        self.spectrum.copy_from_slice(bins);
        // Real signal: DC and Nyquist carry no imaginary part
        self.spectrum[0].im = 0.0;
        self.spectrum[NUM_BINS - 1].im = 0.0;

        if self
            .fft_inverse
            .process_with_scratch(&mut self.spectrum, &mut self.frame, &mut self.inverse_scratch)
            .is_err()
        {
            self.frame.fill(0.0);
        }

        let norm = 1.0 / FFT_SIZE as f32;
        let ola = &mut channel.buffer;
        for ((acc, &sample), &win) in ola.iter_mut().zip(&self.frame).zip(&self.window) {
            *acc += sample * norm * win;
        }

        hop.copy_from_slice(&ola[..HOP_SIZE]);
        ola.copy_within(HOP_SIZE.., 0);
        ola[HOP_SIZE..].fill(0.0);
    }
}

impl Default for Stft {
    fn default() -> Self {
        Self::new()
    }
}
