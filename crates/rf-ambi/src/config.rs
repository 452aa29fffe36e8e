//! Engine configuration - serializable snapshot of every user parameter

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::binaural::{HrirPreProc, HrirSource};
use crate::error::AmbiResult;
use crate::hoa::{AmbisonicFormat, DecodingMethod, DiffuseEq, MAX_ORDER, RotationSettings};
use crate::position::Direction;
use crate::{LoudspeakerPreset, MAX_LOUDSPEAKERS};

/// Crossover frequency range in Hz
pub const CROSSOVER_MIN_HZ: f32 = 500.0;
pub const CROSSOVER_MAX_HZ: f32 = 2000.0;

/// Default crossover in Hz
pub const DEFAULT_CROSSOVER_HZ: f32 = 800.0;

/// Decoder slot below the crossover
pub const LOW_SLOT: usize = 0;
/// Decoder slot above the crossover
pub const HIGH_SLOT: usize = 1;

/// One of the two decoders blended at the crossover
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecoderSlot {
    pub method: DecodingMethod,
    pub max_re: bool,
    pub diffuse_eq: DiffuseEq,
}

impl DecoderSlot {
    /// AllRAD, max-rE, amplitude preserving
    pub fn low_default() -> Self {
        Self {
            method: DecodingMethod::AllRAD,
            max_re: true,
            diffuse_eq: DiffuseEq::Amplitude,
        }
    }

    /// AllRAD, max-rE, energy preserving
    pub fn high_default() -> Self {
        Self {
            method: DecodingMethod::AllRAD,
            max_re: true,
            diffuse_eq: DiffuseEq::Energy,
        }
    }
}

/// Where the decoded signal goes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OutputLayout {
    /// Built-in loudspeaker layout
    Preset(LoudspeakerPreset),
    /// Explicit loudspeaker directions
    Custom(Vec<Direction>),
    /// Headphones, direct SH-to-ears decoding
    Binaural,
}

impl Default for OutputLayout {
    fn default() -> Self {
        Self::Preset(LoudspeakerPreset::default())
    }
}

impl OutputLayout {
    /// Loudspeaker directions, or `None` for binaural output
    pub fn loudspeakers(&self) -> Option<Vec<Direction>> {
        match self {
            Self::Preset(preset) => Some(preset.directions()),
            Self::Custom(dirs) => Some(dirs.clone()),
            Self::Binaural => None,
        }
    }

    pub fn is_binaural(&self) -> bool {
        matches!(self, Self::Binaural)
    }
}

/// Block handling of the render entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FrameMode {
    /// Any host block size, through the frame adapter (adds `FRAME_SIZE` latency)
    #[default]
    Adaptive,
    /// Only exact `FRAME_SIZE` blocks; anything else renders silence
    Exact,
}

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Master Ambisonic order (1-7)
    pub order: usize,
    /// Optional per-band order, clamped to the master order
    pub band_orders: Option<Vec<usize>>,
    pub format: AmbisonicFormat,
    /// `[low, high]`
    pub decoders: [DecoderSlot; 2],
    pub diffuse_matching: bool,
    pub crossover_hz: f32,
    pub rotation: RotationSettings,
    pub output: OutputLayout,
    /// Render loudspeaker feeds to headphones through their HRTFs
    pub binauralise_loudspeakers: bool,
    pub hrir_source: HrirSource,
    pub hrir_preproc: HrirPreProc,
    pub frame_mode: FrameMode,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            order: 1,
            band_orders: None,
            format: AmbisonicFormat::ambix(),
            decoders: [DecoderSlot::low_default(), DecoderSlot::high_default()],
            diffuse_matching: false,
            crossover_hz: DEFAULT_CROSSOVER_HZ,
            rotation: RotationSettings::default(),
            output: OutputLayout::default(),
            binauralise_loudspeakers: false,
            hrir_source: HrirSource::Default,
            hrir_preproc: HrirPreProc::default(),
            frame_mode: FrameMode::default(),
        }
    }
}

impl Configuration {
    /// Parse JSON; missing fields take their defaults
    pub fn from_json_str(json: &str) -> AmbiResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        Ok(config.sanitised())
    }

    pub fn to_json_string(&self) -> AmbiResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Load from a JSON file
    pub fn load(path: impl AsRef<Path>) -> AmbiResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Save as a JSON file
    pub fn save(&self, path: impl AsRef<Path>) -> AmbiResult<()> {
        std::fs::write(path, self.to_json_string()?)?;
        Ok(())
    }

    /// Copy with every range clamped
    pub fn sanitised(&self) -> Self {
        let mut config = self.clone();
        config.order = config.order.clamp(1, MAX_ORDER);
        if let Some(orders) = config.band_orders.as_mut() {
            for o in orders.iter_mut() {
                *o = (*o).clamp(1, MAX_ORDER);
            }
        }
        config.crossover_hz = clamp_crossover(config.crossover_hz);
        if let OutputLayout::Custom(dirs) = &mut config.output {
            if dirs.is_empty() {
                config.output = OutputLayout::default();
            } else {
                dirs.truncate(MAX_LOUDSPEAKERS);
                for d in dirs.iter_mut() {
                    *d = d.wrapped();
                }
            }
        }
        config
    }
}

/// Clamp into [`CROSSOVER_MIN_HZ`, `CROSSOVER_MAX_HZ`]; non-finite becomes the default
pub fn clamp_crossover(hz: f32) -> f32 {
    if hz.is_finite() {
        hz.clamp(CROSSOVER_MIN_HZ, CROSSOVER_MAX_HZ)
    } else {
        DEFAULT_CROSSOVER_HZ
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hoa::{ChannelOrdering, Normalization};
    use std::path::PathBuf;

    #[test]
    fn test_defaults() {
        let config = Configuration::default();
        assert_eq!(config.decoders[LOW_SLOT].diffuse_eq, DiffuseEq::Amplitude);
        assert_eq!(config.decoders[HIGH_SLOT].diffuse_eq, DiffuseEq::Energy);
        assert!(config.decoders.iter().all(|d| d.max_re && d.method == DecodingMethod::AllRAD));
        assert_eq!(config.output, OutputLayout::Preset(LoudspeakerPreset::Stereo));
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config = Configuration::from_json_str(r#"{ "order": 3, "crossover_hz": 5000.0 }"#).unwrap();
        assert_eq!(config.order, 3);
        assert_eq!(config.crossover_hz, CROSSOVER_MAX_HZ);
        assert_eq!(config.format, AmbisonicFormat::ambix());
    }

    #[test]
    fn test_sanitised_clamps() {
        let config = Configuration {
            order: 12,
            band_orders: Some(vec![0, 4, 9]),
            crossover_hz: f32::NAN,
            output: OutputLayout::Custom(vec![]),
            ..Default::default()
        }
        .sanitised();
        assert_eq!(config.order, MAX_ORDER);
        assert_eq!(config.band_orders, Some(vec![1, 4, 7]));
        assert_eq!(config.crossover_hz, DEFAULT_CROSSOVER_HZ);
        assert_eq!(config.output, OutputLayout::default());
    }

    #[test]
    fn test_file_round_trip() {
        let config = Configuration {
            order: 4,
            format: AmbisonicFormat {
                ordering: ChannelOrdering::ACN,
                normalization: Normalization::N3D,
            },
            decoders: [
                DecoderSlot {
                    method: DecodingMethod::EnergyPreserving,
                    max_re: false,
                    diffuse_eq: DiffuseEq::Energy,
                },
                DecoderSlot::high_default(),
            ],
            rotation: RotationSettings {
                yaw: 45.0,
                flip_roll: true,
                ..Default::default()
            },
            output: OutputLayout::Custom(vec![Direction::new(30.0, 0.0), Direction::new(-30.0, 10.0)]),
            hrir_source: HrirSource::Json {
                path: PathBuf::from("/data/subject_003.json"),
            },
            hrir_preproc: HrirPreProc::Eq,
            frame_mode: FrameMode::Exact,
            ..Default::default()
        };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        config.save(&path).unwrap();
        let loaded = Configuration::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_invalid_json_is_error() {
        assert!(Configuration::from_json_str("{ order: ").is_err());
    }
}
