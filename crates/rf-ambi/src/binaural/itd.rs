//! Interaural time difference (ITD) estimation

use std::f32::consts::{FRAC_PI_2, PI};

use super::default_set::{HEAD_RADIUS, SPEED_OF_SOUND};

/// Largest ITD a spherical head can produce, in seconds
pub const MAX_ITD: f32 = HEAD_RADIUS / SPEED_OF_SOUND * (FRAC_PI_2 + 1.0);

/// Lowpass cutoff applied before correlating
const ITD_LOWPASS_HZ: f32 = 1500.0;

/// Zero-phase one-pole lowpass (forward then backward pass)
pub fn zero_phase_lowpass(signal: &[f32], cutoff_hz: f32, sample_rate: u32) -> Vec<f32> {
    let a = (-2.0 * PI * cutoff_hz / sample_rate as f32).exp();
    let b = 1.0 - a;

    let mut out = signal.to_vec();
    let mut state = 0.0f32;
    for s in out.iter_mut() {
        state = b * *s + a * state;
        *s = state;
    }
    state = 0.0;
    for s in out.iter_mut().rev() {
        state = b * *s + a * state;
        *s = state;
    }
    out
}

/// ITD in seconds: right-ear arrival minus left-ear arrival
///
/// Positive for sources on the left. The cross-correlation peak is searched
/// within +/- [`MAX_ITD`] and refined by a parabola through its neighbours.
pub fn estimate_itd(left: &[f32], right: &[f32], sample_rate: u32) -> f32 {
    let left = zero_phase_lowpass(left, ITD_LOWPASS_HZ, sample_rate);
    let right = zero_phase_lowpass(right, ITD_LOWPASS_HZ, sample_rate);

    let max_lag = ((MAX_ITD * sample_rate as f32).ceil() as i32).max(1);
    let xcorr = |lag: i32| -> f32 {
        left.iter()
            .enumerate()
            .filter_map(|(n, &l)| {
                let m = n as i32 + lag;
                (m >= 0 && (m as usize) < right.len()).then(|| l * right[m as usize])
            })
            .sum()
    };

    let values: Vec<f32> = (-max_lag..=max_lag).map(xcorr).collect();
    let Some((peak, &peak_value)) = values.iter().enumerate().max_by(|a, b| a.1.total_cmp(b.1)) else {
        return 0.0;
    };
    if peak_value <= 0.0 {
        return 0.0;
    }

    let mut lag = peak as f32 - max_lag as f32;
    if peak > 0 && peak + 1 < values.len() {
        let (y0, y1, y2) = (values[peak - 1], values[peak], values[peak + 1]);
        let denom = y0 - 2.0 * y1 + y2;
        if denom.abs() > 1e-12 {
            lag += (0.5 * (y0 - y2) / denom).clamp(-0.5, 0.5);
        }
    }

    (lag / sample_rate as f32).clamp(-MAX_ITD, MAX_ITD)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pulse(len: usize, centre: f32) -> Vec<f32> {
        (0..len)
            .map(|i| {
                let x = i as f32 - centre;
                (-x * x / 4.0).exp()
            })
            .collect()
    }

    #[test]
    fn test_integer_delay() {
        let left = pulse(128, 20.0);
        let right = pulse(128, 30.0);
        let itd = estimate_itd(&left, &right, 48_000);
        assert!((itd * 48_000.0 - 10.0).abs() < 0.2, "itd {}", itd * 48_000.0);
        assert!(estimate_itd(&right, &left, 48_000) < 0.0);
    }

    #[test]
    fn test_fractional_delay_refined() {
        let left = pulse(128, 40.0);
        let right = pulse(128, 35.5);
        let samples = estimate_itd(&left, &right, 48_000) * 48_000.0;
        assert!((samples + 4.5).abs() < 0.25, "itd {}", samples);
    }

    #[test]
    fn test_bounded_by_head_size() {
        let left = pulse(256, 10.0);
        let right = pulse(256, 200.0);
        assert!(estimate_itd(&left, &right, 48_000) <= MAX_ITD + 1e-9);
    }

    #[test]
    fn test_silence_is_zero() {
        let zeros = vec![0.0f32; 64];
        assert_eq!(estimate_itd(&zeros, &zeros, 44_100), 0.0);
    }

    #[test]
    fn test_lowpass_is_zero_phase() {
        let input = pulse(128, 64.0);
        let out = zero_phase_lowpass(&input, 2000.0, 48_000);
        let peak = out
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(peak, 64);
    }
}
