//! Signal smoothing strategies producing the seed estimate for the
//! fixed-point solve.
//!
//! The strategy is a closed enum picked once at configuration time; unknown
//! names fail at parse time, before any volume is touched.

use crate::float_trait::StabFloat;
use crate::noise_estimate::median_of_slice;
use crate::sh::{sh_smooth, GradientTable};
use crate::StabilizeError;
use ndarray::{Array3, Array4, ArrayView3, ArrayView4, Axis};
use rayon::prelude::*;
use std::str::FromStr;

/// Patch radius for non-local means (3x3x3 patches).
const NLM_PATCH_RADIUS: isize = 1;

/// Search window radius for non-local means (5x5x5 windows).
const NLM_SEARCH_RADIUS: isize = 2;

/// MAD-to-sigma scale for a Gaussian distribution.
const MAD_SCALE: f64 = 1.4826;

/// Smoothing strategy for the signal seed estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmoothingMethod {
    /// 3x3x3 normalized box convolution per channel.
    LocalMean,
    /// Basic 3-D non-local means per channel.
    NonLocalMeans,
    /// Spherical-harmonics fit over gradient directions (needs bvals/bvecs).
    ShSmooth,
    /// Pass the input through unchanged.
    NoSmoothing,
}

impl FromStr for SmoothingMethod {
    type Err = StabilizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "local_mean" => Ok(SmoothingMethod::LocalMean),
            "non_local_means" => Ok(SmoothingMethod::NonLocalMeans),
            "sh_smooth" => Ok(SmoothingMethod::ShSmooth),
            "no_smoothing" => Ok(SmoothingMethod::NoSmoothing),
            _ => Err(StabilizeError::UnknownMethod(s.to_string())),
        }
    }
}

/// Produce the smoothed seed volume m_hat for the given strategy.
///
/// `gradients` is consulted only by [`SmoothingMethod::ShSmooth`]; selecting
/// that strategy without a table is a [`StabilizeError::MissingGradients`]
/// error.
pub fn smooth_volume<F: StabFloat>(
    data: ArrayView4<F>,
    method: SmoothingMethod,
    gradients: Option<&GradientTable>,
) -> Result<Array4<F>, StabilizeError> {
    match method {
        SmoothingMethod::NoSmoothing => Ok(data.to_owned()),
        SmoothingMethod::LocalMean => Ok(per_channel(data, local_mean_channel)),
        SmoothingMethod::NonLocalMeans => Ok(per_channel(data, nlm_channel)),
        SmoothingMethod::ShSmooth => {
            let table = gradients.ok_or(StabilizeError::MissingGradients)?;
            sh_smooth(data, table)
        }
    }
}

fn per_channel<F: StabFloat>(
    data: ArrayView4<F>,
    f: fn(ArrayView3<F>) -> Array3<F>,
) -> Array4<F> {
    let (nx, ny, nz, nc) = data.dim();
    let channels: Vec<Array3<F>> = (0..nc)
        .into_par_iter()
        .map(|c| f(data.index_axis(Axis(3), c)))
        .collect();
    let mut out = Array4::<F>::zeros((nx, ny, nz, nc));
    for (c, ch) in channels.into_iter().enumerate() {
        out.index_axis_mut(Axis(3), c).assign(&ch);
    }
    out
}

/// 3x3x3 normalized box mean, edges clamped.
fn local_mean_channel<F: StabFloat>(vol: ArrayView3<F>) -> Array3<F> {
    let (nx, ny, nz) = vol.dim();
    let mut out = Array3::<F>::zeros((nx, ny, nz));
    for x in 0..nx {
        for y in 0..ny {
            for z in 0..nz {
                let mut sum = 0.0;
                for dx in -1isize..=1 {
                    for dy in -1isize..=1 {
                        for dz in -1isize..=1 {
                            let sx = (x as isize + dx).clamp(0, nx as isize - 1) as usize;
                            let sy = (y as isize + dy).clamp(0, ny as isize - 1) as usize;
                            let sz = (z as isize + dz).clamp(0, nz as isize - 1) as usize;
                            sum += vol[[sx, sy, sz]].to_f64_c();
                        }
                    }
                }
                out[[x, y, z]] = F::from_f64_c(sum / 27.0);
            }
        }
    }
    out
}

/// Basic 3-D non-local means with 3x3x3 patches and a 5x5x5 search window.
///
/// The bandwidth comes from a MAD estimate of the residual against the local
/// mean; a near-zero bandwidth (noiseless input) degenerates to a copy.
fn nlm_channel<F: StabFloat>(vol: ArrayView3<F>) -> Array3<F> {
    let (nx, ny, nz) = vol.dim();
    let smoothed = local_mean_channel(vol);

    let mut residuals: Vec<f64> = vol
        .iter()
        .zip(smoothed.iter())
        .map(|(&v, &s)| (v.to_f64_c() - s.to_f64_c()).abs())
        .collect();
    let sigma = MAD_SCALE * median_of_slice(&mut residuals);
    if sigma <= 0.0 {
        return vol.to_owned();
    }

    let patch_len = {
        let w = 2 * NLM_PATCH_RADIUS + 1;
        (w * w * w) as f64
    };
    let h2 = 2.0 * sigma * sigma * patch_len;

    let mut out = Array3::<F>::zeros((nx, ny, nz));
    let clamp = |v: isize, hi: usize| v.clamp(0, hi as isize - 1) as usize;

    for x in 0..nx {
        for y in 0..ny {
            for z in 0..nz {
                let mut wsum = 0.0;
                let mut acc = 0.0;
                for sx in -NLM_SEARCH_RADIUS..=NLM_SEARCH_RADIUS {
                    for sy in -NLM_SEARCH_RADIUS..=NLM_SEARCH_RADIUS {
                        for sz in -NLM_SEARCH_RADIUS..=NLM_SEARCH_RADIUS {
                            let cx = clamp(x as isize + sx, nx);
                            let cy = clamp(y as isize + sy, ny);
                            let cz = clamp(z as isize + sz, nz);

                            let mut dist2 = 0.0;
                            for px in -NLM_PATCH_RADIUS..=NLM_PATCH_RADIUS {
                                for py in -NLM_PATCH_RADIUS..=NLM_PATCH_RADIUS {
                                    for pz in -NLM_PATCH_RADIUS..=NLM_PATCH_RADIUS {
                                        let a = vol[[
                                            clamp(x as isize + px, nx),
                                            clamp(y as isize + py, ny),
                                            clamp(z as isize + pz, nz),
                                        ]]
                                        .to_f64_c();
                                        let b = vol[[
                                            clamp(cx as isize + px, nx),
                                            clamp(cy as isize + py, ny),
                                            clamp(cz as isize + pz, nz),
                                        ]]
                                        .to_f64_c();
                                        dist2 += (a - b) * (a - b);
                                    }
                                }
                            }

                            let w = (-dist2 / h2).exp();
                            wsum += w;
                            acc += w * vol[[cx, cy, cz]].to_f64_c();
                        }
                    }
                }
                out[[x, y, z]] = F::from_f64_c(acc / wsum);
            }
        }
    }
    out
}

// =============================================================================
// Tests
// =============================================================================
