//! HRIR acquisition - loader trait, JSON container and source selection

use std::path::{Path, PathBuf};

use ndarray::Array3;
use serde::{Deserialize, Serialize};

use super::default_set;
use crate::error::{AmbiError, AmbiResult};
use crate::position::Direction;

/// Raw measured head-related impulse responses
#[derive(Debug, Clone)]
pub struct HrirData {
    /// `[direction, receiver, tap]`
    pub hrirs: Array3<f32>,
    pub directions: Vec<Direction>,
    pub sample_rate: u32,
}

impl HrirData {
    pub fn num_directions(&self) -> usize {
        self.hrirs.dim().0
    }

    pub fn num_receivers(&self) -> usize {
        self.hrirs.dim().1
    }

    pub fn length(&self) -> usize {
        self.hrirs.dim().2
    }

    /// Check the shape the HRTF pipeline relies on
    pub fn validate(&self) -> AmbiResult<()> {
        if self.num_directions() == 0 || self.length() == 0 {
            return Err(AmbiError::InvalidHrir("empty HRIR set".into()));
        }
        if self.num_receivers() != 2 {
            return Err(AmbiError::InvalidHrir(format!(
                "expected 2 receivers, found {}",
                self.num_receivers()
            )));
        }
        if self.directions.len() != self.num_directions() {
            return Err(AmbiError::InvalidHrir(format!(
                "{} directions for {} HRIRs",
                self.directions.len(),
                self.num_directions()
            )));
        }
        if self.sample_rate == 0 {
            return Err(AmbiError::InvalidHrir("sample rate is zero".into()));
        }
        if self.hrirs.iter().any(|x| !x.is_finite()) {
            return Err(AmbiError::InvalidHrir("non-finite HRIR samples".into()));
        }
        Ok(())
    }
}

/// Something that can produce an HRIR set
pub trait HrirLoader: Send + Sync {
    fn load(&self) -> AmbiResult<HrirData>;
}

/// Built-in synthetic spherical-head set
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHrirLoader;

impl HrirLoader for DefaultHrirLoader {
    fn load(&self) -> AmbiResult<HrirData> {
        Ok(default_set::generate())
    }
}

/// On-disk JSON layout
#[derive(Debug, Serialize, Deserialize)]
struct HrirFile {
    sample_rate: u32,
    /// [azimuth, elevation] in degrees
    directions: Vec<[f32; 2]>,
    /// [direction][receiver][tap]
    hrirs: Vec<Vec<Vec<f32>>>,
}

/// HRIRs stored as a JSON container
#[derive(Debug, Clone)]
pub struct JsonHrirLoader {
    path: PathBuf,
}

impl JsonHrirLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse a JSON document
    pub fn parse(json: &str) -> AmbiResult<HrirData> {
        let file: HrirFile = serde_json::from_str(json)?;
        Self::convert(file)
    }

    /// Serialize `data` in the layout [`JsonHrirLoader`] reads
    pub fn to_json_string(data: &HrirData) -> AmbiResult<String> {
        let file = HrirFile {
            sample_rate: data.sample_rate,
            directions: data.directions.iter().map(|d| [d.azimuth, d.elevation]).collect(),
            hrirs: data
                .hrirs
                .outer_iter()
                .map(|dir| dir.outer_iter().map(|ear| ear.to_vec()).collect())
                .collect(),
        };
        Ok(serde_json::to_string(&file)?)
    }

    fn convert(file: HrirFile) -> AmbiResult<HrirData> {
        let num_dirs = file.hrirs.len();
        let receivers = file.hrirs.first().map_or(0, |d| d.len());
        let length = file
            .hrirs
            .iter()
            .flat_map(|d| d.iter().map(|ear| ear.len()))
            .max()
            .unwrap_or(0);

        let mut hrirs = Array3::<f32>::zeros((num_dirs, receivers, length));
        for (d, dir) in file.hrirs.iter().enumerate() {
            if dir.len() != receivers {
                return Err(AmbiError::InvalidHrir(format!(
                    "direction {} has {} receivers, expected {}",
                    d,
                    dir.len(),
                    receivers
                )));
            }
            for (r, ear) in dir.iter().enumerate() {
                for (t, &x) in ear.iter().enumerate() {
                    hrirs[[d, r, t]] = x;
                }
            }
        }

        Ok(HrirData {
            hrirs,
            directions: file
                .directions
                .iter()
                .map(|&[az, el]| Direction::new(az, el))
                .collect(),
            sample_rate: file.sample_rate,
        })
    }
}

impl HrirLoader for JsonHrirLoader {
    fn load(&self) -> AmbiResult<HrirData> {
        let json = std::fs::read_to_string(&self.path)
            .map_err(|e| AmbiError::HrirLoad(format!("{}: {}", self.path.display(), e)))?;
        Self::parse(&json)
    }
}

/// Where HRIRs come from
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HrirSource {
    /// Built-in synthetic set
    #[default]
    Default,
    /// JSON container on disk
    Json { path: PathBuf },
}

impl HrirSource {
    pub fn loader(&self) -> Box<dyn HrirLoader> {
        match self {
            Self::Default => Box::new(DefaultHrirLoader),
            Self::Json { path } => Box::new(JsonHrirLoader::new(path.clone())),
        }
    }
}

/// HRIR pre-processing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HrirPreProc {
    /// Use the per-band responses as measured
    Off,
    /// Diffuse-field equalization only
    Eq,
    /// Phase simplification only
    Phase,
    /// Equalization and phase simplification
    #[default]
    All,
}

impl HrirPreProc {
    pub fn equalize(&self) -> bool {
        matches!(self, Self::Eq | Self::All)
    }

    pub fn simplify_phase(&self) -> bool {
        matches!(self, Self::Phase | Self::All)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_container() {
        let json = r#"{
            "sample_rate": 48000,
            "directions": [[0.0, 0.0], [90.0, 0.0]],
            "hrirs": [[[1.0, 0.5], [0.5]], [[0.2], [1.0, 0.1, 0.0]]]
        }"#;
        let data = JsonHrirLoader::parse(json).unwrap();
        assert_eq!(data.num_directions(), 2);
        assert_eq!(data.num_receivers(), 2);
        assert_eq!(data.length(), 3);
        assert_eq!(data.hrirs[[0, 0, 1]], 0.5);
        assert_eq!(data.hrirs[[0, 1, 1]], 0.0);
        assert_eq!(data.directions[1], Direction::new(90.0, 0.0));
        assert!(data.validate().is_ok());
    }

    #[test]
    fn test_wrong_receiver_count_is_invalid() {
        let json = r#"{
            "sample_rate": 48000,
            "directions": [[0.0, 0.0]],
            "hrirs": [[[1.0], [0.5], [0.25]]]
        }"#;
        let data = JsonHrirLoader::parse(json).unwrap();
        assert!(matches!(data.validate(), Err(AmbiError::InvalidHrir(_))));
    }

    #[test]
    fn test_missing_file_is_load_error() {
        let loader = JsonHrirLoader::new("/nonexistent/hrirs.json");
        assert!(matches!(loader.load(), Err(AmbiError::HrirLoad(_))));
    }

    #[test]
    fn test_json_round_trip_through_file() {
        let data = DefaultHrirLoader.load().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("set.json");
        std::fs::write(&path, JsonHrirLoader::to_json_string(&data).unwrap()).unwrap();

        let back = JsonHrirLoader::new(&path).load().unwrap();
        assert_eq!(back.hrirs.dim(), data.hrirs.dim());
        assert_eq!(back.directions.len(), data.directions.len());
        assert_eq!(back.sample_rate, data.sample_rate);
    }

    #[test]
    fn test_preproc_flags() {
        assert!(HrirPreProc::All.equalize() && HrirPreProc::All.simplify_phase());
        assert!(!HrirPreProc::Off.equalize() && !HrirPreProc::Off.simplify_phase());
        assert!(HrirPreProc::Eq.equalize() && !HrirPreProc::Eq.simplify_phase());
    }
}
