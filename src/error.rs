//! Error taxonomy for the stabilization pipeline.
//!
//! Only configuration and input problems are surfaced as errors. Numerical
//! non-convergence in the fixed-point solve and sqrt-domain violations in the
//! transform are absorbed (best-effort value / clamp) and never reach here.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StabilizeError {
    /// An unrecognized noise-estimation or smoothing method name.
    #[error("method '{0}' is not recognized")]
    UnknownMethod(String),

    /// sh_smooth selected without bvals/bvecs files.
    #[error("sh_smooth requires both bvals and bvecs files")]
    MissingGradients,

    /// Input arrays disagree on shape.
    #[error("shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    /// Rejected configuration (validated before any computation).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Malformed or insufficient gradient table.
    #[error("gradient table error: {0}")]
    Gradient(String),

    /// NIfTI read/write failure.
    #[error("NIfTI error: {0}")]
    Nifti(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
