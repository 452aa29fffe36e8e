//! ReelForge Ambi - frequency-domain Ambisonic decoding engine
//!
//! Decodes Ambisonic signals up to 7th order to loudspeakers or headphones:
//!
//! ## Decoding
//! - SAD, MMD, EPAD and AllRAD loudspeaker decoders
//! - max-rE weighting, amplitude or energy preserving diffuse-field EQ
//! - Two decoders blended at a crossover frequency
//! - Per-band orders for mixed-order decoding
//!
//! ## Binaural
//! - Direct SH-to-ears least-squares decoding per band
//! - Optional diffuse-field covariance matching
//! - Loudspeaker binauralisation through interpolated HRTFs
//!
//! ## Transformation
//! - Sound-field rotation (yaw/pitch/roll or quaternion)
//! - ACN/FuMa ordering, N3D/SN3D/FuMa normalization
//!
//! ## Runtime
//! - [`AmbiEngine`]: allocation-free render path, reconfiguration on the control path

pub mod binaural;
pub mod config;
pub mod engine;
pub mod hoa;
pub mod render;
pub mod state;
pub mod vbap;

mod error;
mod position;

pub use config::{Configuration, DecoderSlot, FrameMode, OutputLayout};
pub use engine::AmbiEngine;
pub use error::{AmbiError, AmbiResult};
pub use position::{Direction, fibonacci_sphere};
pub use rf_filterbank::{FILTERBANK_DELAY, FRAME_SIZE, NUM_BANDS, SampleRate};
pub use state::{CodecStatus, ProcStatus};

use serde::{Deserialize, Serialize};

/// Maximum loudspeakers in one layout
pub const MAX_LOUDSPEAKERS: usize = 64;

/// Built-in loudspeaker layouts (no LFE; azimuth positive to the left)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LoudspeakerPreset {
    /// Stereo (2.0)
    #[default]
    Stereo,
    /// 5.0 Surround
    Surround5_0,
    /// 7.0 Surround
    Surround7_0,
    /// 7.0.4 (7.1.4 without LFE)
    Atmos7_0_4,
    /// 9.0.6 (9.1.6 without LFE)
    Atmos9_0_6,
    /// Horizontal octagon
    Octagon,
    /// Cube, 8 corners at +/-35.26 degrees elevation
    Cube,
}

impl LoudspeakerPreset {
    /// Layout name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Stereo => "Stereo",
            Self::Surround5_0 => "5.0",
            Self::Surround7_0 => "7.0",
            Self::Atmos7_0_4 => "7.0.4",
            Self::Atmos9_0_6 => "9.0.6",
            Self::Octagon => "Octagon",
            Self::Cube => "Cube",
        }
    }

    /// Loudspeaker directions in output channel order
    pub fn directions(&self) -> Vec<Direction> {
        let d = |az: f32, el: f32| Direction::new(az, el);
        match self {
            Self::Stereo => vec![d(30.0, 0.0), d(-30.0, 0.0)],
            Self::Surround5_0 => vec![d(30.0, 0.0), d(-30.0, 0.0), d(0.0, 0.0), d(110.0, 0.0), d(-110.0, 0.0)],
            Self::Surround7_0 => vec![
                d(30.0, 0.0),
                d(-30.0, 0.0),
                d(0.0, 0.0),
                d(90.0, 0.0),
                d(-90.0, 0.0),
                d(135.0, 0.0),
                d(-135.0, 0.0),
            ],
            Self::Atmos7_0_4 => vec![
                // Bed layer
                d(30.0, 0.0),
                d(-30.0, 0.0),
                d(0.0, 0.0),
                d(90.0, 0.0),
                d(-90.0, 0.0),
                d(135.0, 0.0),
                d(-135.0, 0.0),
                // Height layer
                d(45.0, 45.0),
                d(-45.0, 45.0),
                d(135.0, 45.0),
                d(-135.0, 45.0),
            ],
            Self::Atmos9_0_6 => vec![
                // Bed layer
                d(30.0, 0.0),
                d(-30.0, 0.0),
                d(0.0, 0.0),
                d(60.0, 0.0),
                d(-60.0, 0.0),
                d(90.0, 0.0),
                d(-90.0, 0.0),
                d(135.0, 0.0),
                d(-135.0, 0.0),
                // Height layer
                d(45.0, 45.0),
                d(-45.0, 45.0),
                d(90.0, 45.0),
                d(-90.0, 45.0),
                d(135.0, 45.0),
                d(-135.0, 45.0),
            ],
            Self::Octagon => (0..8).map(|i| d(i as f32 * 45.0, 0.0).wrapped()).collect(),
            Self::Cube => {
                let el = (1.0f32 / 3.0f32.sqrt()).asin().to_degrees();
                [45.0, 135.0, -135.0, -45.0]
                    .iter()
                    .flat_map(|&az| [d(az, el), d(az, -el)])
                    .collect()
            }
        }
    }

    pub fn channel_count(&self) -> usize {
        self.directions().len()
    }
}
