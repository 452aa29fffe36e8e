//! Error types for Ambisonic decoder design and data loading

use thiserror::Error;

/// Ambisonic engine error types
///
/// Only produced on the control path; the engine turns every one of these
/// into a fallback before anything reaches the render path.
#[derive(Error, Debug)]
pub enum AmbiError {
    /// Invalid Ambisonic order
    #[error("Invalid Ambisonic order: {0} (max supported: 7)")]
    InvalidAmbisonicOrder(usize),

    /// Invalid loudspeaker layout
    #[error("Invalid loudspeaker layout: {0}")]
    InvalidLayout(String),

    /// Convex hull / triangulation failed
    #[error("Triangulation failed: {0}")]
    Triangulation(String),

    /// Linear algebra failure (singular matrix, SVD did not converge)
    #[error("Numerical error: {0}")]
    Numerical(String),

    /// HRIR data could not be loaded
    #[error("HRIR load error: {0}")]
    HrirLoad(String),

    /// HRIR data loaded but unusable
    #[error("Invalid HRIR data: {0}")]
    InvalidHrir(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for Ambisonic operations
pub type AmbiResult<T> = Result<T, AmbiError>;
