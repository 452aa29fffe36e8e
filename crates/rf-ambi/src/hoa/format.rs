//! Ambisonic format conversion - normalization and channel ordering
//!
//! Inputs may arrive as ACN/FuMa ordered and N3D/SN3D/FuMa normalized.
//! They are converted to ACN + N3D before any matrix maths.

use serde::{Deserialize, Serialize};

use super::{MAX_SH, acn_to_order_degree, sh_count};

/// Normalization scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Normalization {
    /// N3D (fully normalized)
    N3D,
    /// SN3D (Schmidt semi-normalized) - AmbiX standard
    #[default]
    SN3D,
    /// FuMa (Furse-Malham) - first order only
    FuMa,
}

/// Channel ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChannelOrdering {
    /// ACN (Ambisonic Channel Number) - AmbiX standard
    #[default]
    ACN,
    /// FuMa ordering (W, X, Y, Z) - first order only
    FuMa,
}

/// FuMa channel of each first-order ACN channel (W, Y, Z, X <- W, X, Y, Z)
const FUMA_SOURCE_OF_ACN: [usize; 4] = [0, 2, 3, 1];

/// Channel ordering plus normalization of an Ambisonic stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AmbisonicFormat {
    /// Channel ordering
    pub ordering: ChannelOrdering,
    /// Normalization scheme
    pub normalization: Normalization,
}

impl AmbisonicFormat {
    /// AmbiX format (ACN + SN3D) - modern standard
    pub fn ambix() -> Self {
        Self {
            ordering: ChannelOrdering::ACN,
            normalization: Normalization::SN3D,
        }
    }

    /// FuMa format (legacy B-format)
    pub fn fuma() -> Self {
        Self {
            ordering: ChannelOrdering::FuMa,
            normalization: Normalization::FuMa,
        }
    }

    /// N3D + ACN (internal convention)
    pub fn n3d_acn() -> Self {
        Self {
            ordering: ChannelOrdering::ACN,
            normalization: Normalization::N3D,
        }
    }

    /// Format actually usable at `order`
    ///
    /// FuMa conventions only exist at first order: above it FuMa ordering
    /// falls back to ACN and FuMa normalization to SN3D.
    pub fn effective(&self, order: usize) -> Self {
        if order <= 1 {
            return *self;
        }
        Self {
            ordering: match self.ordering {
                ChannelOrdering::FuMa => ChannelOrdering::ACN,
                other => other,
            },
            normalization: match self.normalization {
                Normalization::FuMa => Normalization::SN3D,
                other => other,
            },
        }
    }

    /// True when no conversion is needed
    pub fn is_canonical(&self) -> bool {
        *self == Self::n3d_acn()
    }
}

/// Per-channel conversion into ACN/N3D
///
/// Fixed-size tables, so building one per frame does not allocate.
#[derive(Debug, Clone)]
pub struct FormatConverter {
    format: AmbisonicFormat,
    num_channels: usize,
    /// Input channel feeding each ACN channel
    source_of: [usize; MAX_SH],
    /// Gain to N3D for each ACN channel
    gains: [f32; MAX_SH],
}

impl FormatConverter {
    /// Create converter from `format` (clamped via [`AmbisonicFormat::effective`])
    pub fn new(format: AmbisonicFormat, order: usize) -> Self {
        let format = format.effective(order);
        let num_channels = sh_count(order).min(MAX_SH);

        let mut source_of = [0usize; MAX_SH];
        let mut gains = [1.0f32; MAX_SH];

        for ch in 0..num_channels {
            source_of[ch] = match format.ordering {
                ChannelOrdering::FuMa if ch < 4 => FUMA_SOURCE_OF_ACN[ch],
                _ => ch,
            };

            let (l, _) = acn_to_order_degree(ch);
            gains[ch] = match format.normalization {
                Normalization::N3D => 1.0,
                Normalization::SN3D => ((2 * l + 1) as f32).sqrt(),
                Normalization::FuMa => {
                    if l == 0 {
                        std::f32::consts::SQRT_2
                    } else {
                        3.0f32.sqrt()
                    }
                }
            };
        }

        Self {
            format,
            num_channels,
            source_of,
            gains,
        }
    }

    pub fn format(&self) -> AmbisonicFormat {
        self.format
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    /// Convert input channels into ACN/N3D
    ///
    /// Missing input channels produce silence; extra ones are ignored.
    pub fn to_n3d<I, O>(&self, input: &[I], output: &mut [O])
    where
        I: AsRef<[f32]>,
        O: AsMut<[f32]>,
    {
        for (ch, out) in output.iter_mut().enumerate().take(self.num_channels) {
            let out = out.as_mut();
            match input.get(self.source_of[ch]) {
                Some(src) => {
                    let gain = self.gains[ch];
                    for (o, &s) in out.iter_mut().zip(src.as_ref()) {
                        *o = s * gain;
                    }
                }
                None => out.fill(0.0),
            }
        }
    }

    /// Convert ACN/N3D channels back into this format
    pub fn from_n3d<I, O>(&self, input: &[I], output: &mut [O])
    where
        I: AsRef<[f32]>,
        O: AsMut<[f32]>,
    {
        for (ch, src) in input.iter().enumerate().take(self.num_channels) {
            let Some(out) = output.get_mut(self.source_of[ch]) else {
                continue;
            };
            let gain = 1.0 / self.gains[ch];
            for (o, &s) in out.as_mut().iter_mut().zip(src.as_ref()) {
                *o = s * gain;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_signal(channels: usize) -> Vec<Vec<f32>> {
        (0..channels)
            .map(|ch| (0..8).map(|i| (ch * 8 + i) as f32 * 0.1 - 1.0).collect())
            .collect()
    }

    #[test]
    fn test_identity_conversion() {
        let converter = FormatConverter::new(AmbisonicFormat::n3d_acn(), 3);
        assert!(converter.format().is_canonical());

        let input = test_signal(16);
        let mut output = vec![vec![0.0f32; 8]; 16];
        converter.to_n3d(&input, &mut output);
        assert_eq!(output, input);
    }

    #[test]
    fn test_sn3d_n3d_round_trip() {
        let converter = FormatConverter::new(AmbisonicFormat::ambix(), 7);
        let input = test_signal(64);
        let mut n3d = vec![vec![0.0f32; 8]; 64];
        let mut back = vec![vec![0.0f32; 8]; 64];

        converter.to_n3d(&input, &mut n3d);
        converter.from_n3d(&n3d, &mut back);

        for ch in 0..64 {
            for s in 0..8 {
                assert!((back[ch][s] - input[ch][s]).abs() < 1e-5);
            }
        }
        // Degree 2 gain is sqrt(5)
        assert!((n3d[6][0] - input[6][0] * 5.0f32.sqrt()).abs() < 1e-5);
    }

    #[test]
    fn test_fuma_first_order() {
        let converter = FormatConverter::new(AmbisonicFormat::fuma(), 1);
        // FuMa W, X, Y, Z
        let input = vec![vec![1.0f32], vec![2.0], vec![3.0], vec![4.0]];
        let mut output = vec![vec![0.0f32]; 4];
        converter.to_n3d(&input, &mut output);

        let s3 = 3.0f32.sqrt();
        assert!((output[0][0] - std::f32::consts::SQRT_2).abs() < 1e-6);
        assert!((output[1][0] - 3.0 * s3).abs() < 1e-5); // Y
        assert!((output[2][0] - 4.0 * s3).abs() < 1e-5); // Z
        assert!((output[3][0] - 2.0 * s3).abs() < 1e-5); // X
    }

    #[test]
    fn test_fuma_clamped_above_first_order() {
        let effective = AmbisonicFormat::fuma().effective(3);
        assert_eq!(effective, AmbisonicFormat::ambix());
        assert_eq!(AmbisonicFormat::fuma().effective(1), AmbisonicFormat::fuma());
    }

    #[test]
    fn test_missing_channels_are_silent() {
        let converter = FormatConverter::new(AmbisonicFormat::ambix(), 2);
        let input = test_signal(4);
        let mut output = vec![vec![7.0f32; 8]; 9];
        converter.to_n3d(&input, &mut output);
        assert!(output[4..].iter().all(|ch| ch.iter().all(|&s| s == 0.0)));
    }
}
