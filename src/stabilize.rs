//! Voxel-parallel stabilization over 4-D volumes.
//!
//! One work unit per channel: each worker gets read-only views of its channel
//! slices, builds a fresh output volume, and the units are reassembled by
//! index. The result is bit-identical for any worker count because no unit
//! reads another unit's output and the reassembly order is the dispatch
//! order.

use crate::float_trait::StabFloat;
use crate::stabilizer::{chi_to_gauss, fixed_point_finder};
use crate::StabilizeError;
use ndarray::{Array3, Array4, ArrayView4, Axis};
use rayon::prelude::*;

/// What to write for voxels the transform skips (sigma == 0 or outside the
/// mask).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PassthroughPolicy {
    /// Write 0. This mirrors the historical batch-script behavior.
    #[default]
    ZeroFill,
    /// Copy the raw input value through unchanged.
    CopyInput,
}

/// Stabilize a 4-D volume: per in-mask voxel with positive sigma, recover
/// eta from the smoothed seed and standardize the raw observation onto a
/// Gaussian; skipped voxels follow `passthrough`.
pub fn stabilize_volume<F: StabFloat>(
    data: ArrayView4<F>,
    m_hat: ArrayView4<F>,
    mask: &Array3<bool>,
    sigma: ArrayView4<F>,
    n_coils: u32,
    passthrough: PassthroughPolicy,
) -> Result<Array4<F>, StabilizeError> {
    let dim = data.dim();
    let (nx, ny, nz, nc) = dim;
    for (other_dim, found) in [(m_hat.dim(), m_hat.shape()), (sigma.dim(), sigma.shape())] {
        if other_dim != dim {
            return Err(StabilizeError::ShapeMismatch {
                expected: data.shape().to_vec(),
                found: found.to_vec(),
            });
        }
    }
    if mask.dim() != (nx, ny, nz) {
        return Err(StabilizeError::ShapeMismatch {
            expected: vec![nx, ny, nz],
            found: mask.shape().to_vec(),
        });
    }

    let channels: Vec<Array3<F>> = (0..nc)
        .into_par_iter()
        .map(|c| {
            let raw = data.index_axis(Axis(3), c);
            let seed = m_hat.index_axis(Axis(3), c);
            let sig = sigma.index_axis(Axis(3), c);
            let mut out = Array3::<F>::zeros((nx, ny, nz));
            for x in 0..nx {
                for y in 0..ny {
                    for z in 0..nz {
                        let s = sig[[x, y, z]].to_f64_c();
                        if s > 0.0 && mask[[x, y, z]] {
                            let m = raw[[x, y, z]].to_f64_c();
                            let eta = fixed_point_finder(seed[[x, y, z]].to_f64_c(), s, n_coils);
                            out[[x, y, z]] = F::from_f64_c(chi_to_gauss(m, eta, s, n_coils));
                        } else if passthrough == PassthroughPolicy::CopyInput {
                            out[[x, y, z]] = raw[[x, y, z]];
                        }
                    }
                }
            }
            out
        })
        .collect();

    let mut out = Array4::<F>::zeros(dim);
    for (c, ch) in channels.into_iter().enumerate() {
        out.index_axis_mut(Axis(3), c).assign(&ch);
    }
    Ok(out)
}

// =============================================================================
// Tests
// =============================================================================
