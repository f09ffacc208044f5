//! Non-central chi / Rician noise stabilization for 4-D MRI volumes.
//!
//! Implements the Koay/Basser (2009) scheme: recover the underlying signal
//! magnitude per voxel by a maximum-likelihood fixed point on the modified
//! Bessel function ratio, then standardize the observed magnitude onto a
//! Gaussian with that mean. Noise sigma comes from a corrected local
//! standard deviation or from PIESNO background statistics; the seed
//! estimate comes from a pluggable smoothing strategy.

pub mod error;
pub mod float_trait;
pub mod nifti_io;
pub mod noise_estimate;
pub mod pipeline;
pub mod sh;
pub mod smoothing;
pub mod special;
pub mod stabilize;
pub mod stabilizer;

pub use error::StabilizeError;
pub use float_trait::StabFloat;
pub use noise_estimate::NoiseMethod;
pub use pipeline::{run_stabilization_pipeline, StabilizationConfig, StabilizationOutputs};
pub use smoothing::SmoothingMethod;
pub use stabilize::{stabilize_volume, PassthroughPolicy};
pub use stabilizer::{chi_to_gauss, fixed_point_finder};
