//! Float trait abstraction for f32/f64 volume data.
//!
//! Volumes are stored in either precision; the per-voxel numerics (Bessel
//! ratios, fixed-point solve, moment transforms) always run in f64, so the
//! trait carries lossless conversions in both directions.

use num_traits::{Float, FromPrimitive, NumAssign};
use std::fmt::Debug;
use std::iter::Sum;

/// Trait alias for floating point types supported by the stabilizer.
pub trait StabFloat:
    Float + FromPrimitive + NumAssign + Sum + Debug + Send + Sync + 'static
{
    /// Create a value from an f64 constant.
    fn from_f64_c(val: f64) -> Self;

    /// Widen to f64 for scalar numerics.
    fn to_f64_c(self) -> f64;
}

impl StabFloat for f32 {
    #[inline]
    fn from_f64_c(val: f64) -> Self {
        val as f32
    }

    #[inline]
    fn to_f64_c(self) -> f64 {
        self as f64
    }
}

impl StabFloat for f64 {
    #[inline]
    fn from_f64_c(val: f64) -> Self {
        val
    }

    #[inline]
    fn to_f64_c(self) -> f64 {
        self
    }
}
