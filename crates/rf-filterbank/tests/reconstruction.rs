//! Filterbank Integration Tests
//!
//! Verifies:
//! - Perfect reconstruction at the reported latency
//! - Adapter + filterbank chain at odd host block sizes
//! - Multichannel independence

use ndarray::Array3;
use rf_filterbank::{
    Complex32, FILTERBANK_DELAY, FRAME_SIZE, Filterbank, FrameAdapter, NUM_BANDS, TIME_SLOTS,
};

const SAMPLE_RATE: f32 = 48000.0;

/// Generate test sine wave
fn generate_sine(samples: usize, freq: f32) -> Vec<f32> {
    (0..samples)
        .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / SAMPLE_RATE).sin())
        .collect()
}

/// Deterministic pseudo-noise
fn generate_noise(samples: usize, seed: u32) -> Vec<f32> {
    let mut state = seed.wrapping_mul(747_796_405).wrapping_add(2_891_336_453);
    (0..samples)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state as f32 / u32::MAX as f32) * 2.0 - 1.0
        })
        .collect()
}

/// Run whole frames of `signals` through forward + inverse
fn round_trip(signals: &[Vec<f32>]) -> Vec<Vec<f32>> {
    let channels = signals.len();
    let len = signals[0].len();
    let mut fb = Filterbank::new(channels, channels);
    let mut spectra = Array3::<Complex32>::zeros((NUM_BANDS, channels, TIME_SLOTS));
    let mut output = vec![Vec::with_capacity(len); channels];

    for start in (0..len).step_by(FRAME_SIZE) {
        let frame: Vec<&[f32]> = signals.iter().map(|s| &s[start..start + FRAME_SIZE]).collect();
        let mut out = vec![vec![0.0f32; FRAME_SIZE]; channels];
        fb.forward(&frame, spectra.view_mut());
        fb.inverse(spectra.view(), &mut out);
        for (dst, src) in output.iter_mut().zip(&out) {
            dst.extend_from_slice(src);
        }
    }

    output
}

#[test]
fn test_perfect_reconstruction_noise() {
    let input = generate_noise(FRAME_SIZE * 16, 1);
    let output = round_trip(std::slice::from_ref(&input));

    let mut max_err = 0.0f32;
    for i in FILTERBANK_DELAY..input.len() {
        max_err = max_err.max((output[0][i] - input[i - FILTERBANK_DELAY]).abs());
    }
    assert!(max_err < 1e-4, "max reconstruction error {}", max_err);
}

#[test]
fn test_perfect_reconstruction_low_sine() {
    // 40 Hz sits inside the split low bins
    let input = generate_sine(FRAME_SIZE * 32, 40.0);
    let output = round_trip(std::slice::from_ref(&input));

    for i in FILTERBANK_DELAY..input.len() {
        assert!(
            (output[0][i] - input[i - FILTERBANK_DELAY]).abs() < 1e-4,
            "sample {}",
            i
        );
    }
}

#[test]
fn test_channels_are_independent() {
    let a = generate_sine(FRAME_SIZE * 8, 1000.0);
    let b = vec![0.0f32; FRAME_SIZE * 8];
    let output = round_trip(&[a, b]);
    assert!(output[1].iter().all(|&s| s.abs() < 1e-9));
}

#[test]
fn test_adapter_plus_filterbank_latency() {
    let input = generate_noise(FRAME_SIZE * 12, 7);
    let mut adapter = FrameAdapter::new(1, 1);
    let mut fb = Filterbank::new(1, 1);
    let mut spectra = Array3::<Complex32>::zeros((NUM_BANDS, 1, TIME_SLOTS));
    let mut output = Vec::new();

    for block in input.chunks(67) {
        let mut out = vec![vec![0.0f32; block.len()]];
        adapter.process_block(&[block], &mut out, block.len(), |inp, outp| {
            fb.forward(inp, spectra.view_mut());
            fb.inverse(spectra.view(), outp);
            true
        });
        output.extend_from_slice(&out[0]);
    }

    let delay = adapter.latency() + fb.latency();
    assert_eq!(delay, FRAME_SIZE + FILTERBANK_DELAY);
    for i in delay..input.len() {
        assert!((output[i] - input[i - delay]).abs() < 1e-4, "sample {}", i);
    }
}
