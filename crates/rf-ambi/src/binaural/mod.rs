//! Binaural rendering support - HRIR acquisition and HRTF processing
//!
//! - `loader` - [`HrirLoader`] collaborator, JSON container, source selection
//! - `default_set` - built-in synthetic spherical-head HRIRs
//! - `itd` - interaural time difference estimation
//! - `hrtf` - per-band HRTF set with VBAP interpolation

pub mod default_set;
pub mod hrtf;
pub mod itd;
pub mod loader;

pub use hrtf::{HrtfSet, InterpolationTable};
pub use itd::{MAX_ITD, estimate_itd};
pub use loader::{DefaultHrirLoader, HrirData, HrirLoader, HrirPreProc, HrirSource, JsonHrirLoader};
