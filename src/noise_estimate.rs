//! Noise standard deviation estimation for non-central chi data.
//!
//! Two estimators are provided. The local one measures a 3x3x3 standard
//! deviation per channel, takes the voxelwise median across channels and
//! corrects the result for the non-central chi variance deflation. PIESNO
//! identifies pure-noise background voxels per coronal slab from the
//! distribution of their squared-sum statistic and reads sigma off the
//! background median.

use crate::float_trait::StabFloat;
use crate::special::chi_xi;
use crate::StabilizeError;
use ndarray::{Array2, Array3, Array4, ArrayView3, ArrayView4, Axis};
use rayon::prelude::*;
use statrs::distribution::{ContinuousCDF, Gamma};
use std::str::FromStr;

/// Probability of misclassifying a background voxel in PIESNO.
pub const PIESNO_ALPHA: f64 = 0.01;

/// Number of initial sigma candidates PIESNO draws from the slab median.
pub const PIESNO_CANDIDATES: usize = 100;

/// Iteration cap for the PIESNO background refinement loop.
pub const PIESNO_MAX_ITER: usize = 100;

/// Relative convergence tolerance for the PIESNO sigma refinement.
pub const PIESNO_TOL: f64 = 1e-5;

/// Iteration cap for the local-std chi bias correction.
const CORRECTION_MAX_ITER: usize = 20;

/// Absolute tolerance for the chi bias correction iteration.
const CORRECTION_TOL: f64 = 1e-6;

/// Noise estimation strategy, fixed at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseMethod {
    /// Corrected local standard deviation over 3x3x3 neighborhoods.
    LocalStd,
    /// Background-based estimation per coronal slab.
    Piesno,
}

impl FromStr for NoiseMethod {
    type Err = StabilizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "local_std" => Ok(NoiseMethod::LocalStd),
            "piesno" => Ok(NoiseMethod::Piesno),
            _ => Err(StabilizeError::UnknownMethod(s.to_string())),
        }
    }
}

/// Median of a scratch buffer, averaging the two middle elements for even
/// lengths. Empty input yields 0.
pub(crate) fn median_of_slice(data: &mut [f64]) -> f64 {
    let len = data.len();
    if len == 0 {
        return 0.0;
    }
    let mid = len / 2;
    let (_, &mut median, _) = data.select_nth_unstable_by(mid, f64::total_cmp);
    if len % 2 == 1 {
        median
    } else {
        // select_nth_unstable left everything <= median before mid.
        let prev = data[..mid]
            .iter()
            .fold(f64::NEG_INFINITY, |a, &b| a.max(b));
        0.5 * (prev + median)
    }
}

/// Per-voxel standard deviation over an edge-clamped 3x3x3 neighborhood,
/// computed per channel in parallel, then reduced by the voxelwise median
/// across channels.
pub fn local_standard_deviation<F: StabFloat>(data: ArrayView4<F>) -> Array3<f64> {
    let (nx, ny, nz, nc) = data.dim();

    let per_channel: Vec<Array3<f64>> = (0..nc)
        .into_par_iter()
        .map(|c| {
            let vol = data.index_axis(Axis(3), c);
            box_std(vol)
        })
        .collect();

    let mut out = Array3::<f64>::zeros((nx, ny, nz));
    let mut scratch = vec![0.0f64; nc];
    for x in 0..nx {
        for y in 0..ny {
            for z in 0..nz {
                for (c, ch) in per_channel.iter().enumerate() {
                    scratch[c] = ch[[x, y, z]];
                }
                out[[x, y, z]] = median_of_slice(&mut scratch);
            }
        }
    }
    out
}

/// 3x3x3 box-filter standard deviation of a single volume, edges clamped.
fn box_std<F: StabFloat>(vol: ArrayView3<F>) -> Array3<f64> {
    let (nx, ny, nz) = vol.dim();
    let mut out = Array3::<f64>::zeros((nx, ny, nz));
    for x in 0..nx {
        for y in 0..ny {
            for z in 0..nz {
                let mut sum = 0.0;
                let mut sum2 = 0.0;
                for dx in -1isize..=1 {
                    for dy in -1isize..=1 {
                        for dz in -1isize..=1 {
                            let sx = (x as isize + dx).clamp(0, nx as isize - 1) as usize;
                            let sy = (y as isize + dy).clamp(0, ny as isize - 1) as usize;
                            let sz = (z as isize + dz).clamp(0, nz as isize - 1) as usize;
                            let v = vol[[sx, sy, sz]].to_f64_c();
                            sum += v;
                            sum2 += v * v;
                        }
                    }
                }
                let mean = sum / 27.0;
                out[[x, y, z]] = (sum2 / 27.0 - mean * mean).max(0.0).sqrt();
            }
        }
    }
    out
}

/// Correct a raw local standard deviation field for the non-central chi
/// variance deflation, per channel.
///
/// Inside the mask each voxel solves sigma = raw / sqrt(xi(eta, sigma, n))
/// by damped iteration, with eta taken from the smoothed volume for that
/// channel. Out-of-mask voxels stay 0. Returns the per-channel corrected
/// field stacked back into a 4-D array.
pub fn corrected_sigma<F: StabFloat>(
    m_hat: ArrayView4<F>,
    raw_std: &Array3<f64>,
    mask: &Array3<bool>,
    n: u32,
) -> Result<Array4<F>, StabilizeError> {
    let (nx, ny, nz, nc) = m_hat.dim();
    if raw_std.dim() != (nx, ny, nz) || mask.dim() != (nx, ny, nz) {
        return Err(StabilizeError::ShapeMismatch {
            expected: vec![nx, ny, nz],
            found: raw_std.shape().to_vec(),
        });
    }

    let per_channel: Vec<Array3<F>> = (0..nc)
        .into_par_iter()
        .map(|c| {
            let eta_vol = m_hat.index_axis(Axis(3), c);
            let mut out = Array3::<F>::zeros((nx, ny, nz));
            for x in 0..nx {
                for y in 0..ny {
                    for z in 0..nz {
                        if !mask[[x, y, z]] {
                            continue;
                        }
                        let raw = raw_std[[x, y, z]];
                        let eta = eta_vol[[x, y, z]].to_f64_c();
                        out[[x, y, z]] = F::from_f64_c(correct_voxel(raw, eta, n));
                    }
                }
            }
            out
        })
        .collect();

    let mut out = Array4::<F>::zeros((nx, ny, nz, nc));
    for (c, ch) in per_channel.into_iter().enumerate() {
        out.index_axis_mut(Axis(3), c).assign(&ch);
    }
    Ok(out)
}

fn correct_voxel(raw: f64, eta: f64, n: u32) -> f64 {
    if raw <= 0.0 {
        return 0.0;
    }
    let mut sigma = raw;
    for _ in 0..CORRECTION_MAX_ITER {
        let xi = chi_xi(eta.max(0.0), sigma, n);
        let next = raw / xi.sqrt();
        if (next - sigma).abs() < CORRECTION_TOL {
            return next;
        }
        sigma = next;
    }
    sigma
}

/// Quantile of the sum-of-squares background statistic: the p-quantile of
/// Gamma(n*k, 1) scaled by 1/k.
fn inv_nchi_cdf(n: u32, k: usize, p: f64) -> Option<f64> {
    let shape = n as f64 * k as f64;
    match Gamma::new(shape, 1.0) {
        Ok(g) => Some(g.inverse_cdf(p) / k as f64),
        Err(_) => None,
    }
}

/// PIESNO estimation on a single slab (x, z, channel).
///
/// Candidate sigmas are scaled medians of the slab. For each candidate the
/// background set is refined by thresholding the per-voxel squared-sum
/// statistic between the Gamma quantile bounds at [`PIESNO_ALPHA`] and
/// re-reading sigma from the background median, until sigma settles. The
/// candidate that retains the most background voxels wins. An all-zero slab
/// yields sigma 0 and an empty mask.
pub fn piesno<F: StabFloat>(slab: ArrayView3<F>, n: u32) -> (f64, Array2<bool>) {
    let (nx, nz, nc) = slab.dim();
    let empty = Array2::from_elem((nx, nz), false);
    if nc == 0 {
        return (0.0, empty);
    }

    let mut values: Vec<f64> = slab.iter().map(|v| v.to_f64_c()).collect();
    let med = median_of_slice(&mut values);
    if med <= 0.0 {
        return (0.0, empty);
    }

    // Quantile bounds and median scale for the sum-of-squares statistic.
    let (lambda_minus, lambda_plus, q) = match (
        inv_nchi_cdf(n, nc, PIESNO_ALPHA / 2.0),
        inv_nchi_cdf(n, nc, 1.0 - PIESNO_ALPHA / 2.0),
        inv_nchi_cdf(n, nc, 0.5),
    ) {
        (Some(a), Some(b), Some(c)) => (a, b, c),
        _ => return (0.0, empty),
    };

    // Per-voxel mean of squares over channels, scaled so that a pure-noise
    // voxel has statistic ~ sigma^2 * Gamma(n*nc, 1)/nc.
    let mut sum_m2 = Array2::<f64>::zeros((nx, nz));
    for x in 0..nx {
        for z in 0..nz {
            let mut s = 0.0;
            for c in 0..nc {
                let v = slab[[x, z, c]].to_f64_c();
                s += v * v;
            }
            sum_m2[[x, z]] = s / (2.0 * nc as f64);
        }
    }

    let mut best_sigma = 0.0;
    let mut best_count = 0usize;
    let mut best_mask = empty.clone();

    for i in 1..=PIESNO_CANDIDATES {
        let mut sigma = i as f64 * med / PIESNO_CANDIDATES as f64;
        let mut prev = 0.0;
        let mut mask = Array2::from_elem((nx, nz), false);
        let mut count = 0usize;

        for _ in 0..PIESNO_MAX_ITER {
            if (sigma - prev).abs() < PIESNO_TOL * sigma {
                break;
            }
            prev = sigma;
            let s2 = sigma * sigma;
            let mut omega = Vec::new();
            count = 0;
            for x in 0..nx {
                for z in 0..nz {
                    let inside =
                        sum_m2[[x, z]] >= lambda_minus * s2 && sum_m2[[x, z]] <= lambda_plus * s2;
                    mask[[x, z]] = inside;
                    if inside {
                        omega.push(sum_m2[[x, z]]);
                        count += 1;
                    }
                }
            }
            if omega.is_empty() {
                count = 0;
                break;
            }
            sigma = (median_of_slice(&mut omega) / q).sqrt();
        }

        if count > best_count {
            best_count = count;
            best_sigma = sigma;
            best_mask = mask.clone();
        }
    }

    if best_count == 0 {
        return (0.0, empty);
    }
    (best_sigma, best_mask)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, Array4};
    use rand::prelude::*;
    use rand_distr::{Distribution, Normal};

    fn noncentral_chi_volume(
        shape: (usize, usize, usize, usize),
        eta: f64,
        sigma: f64,
        n: u32,
        seed: u64,
    ) -> Array4<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, sigma).unwrap();
        let mut out = Array4::<f64>::zeros(shape);
        for v in out.iter_mut() {
            let mut s = 0.0;
            for k in 0..(2 * n) {
                let center = if k == 0 { eta } else { 0.0 };
                let g: f64 = center + normal.sample(&mut rng);
                s += g * g;
            }
            *v = s.sqrt();
        }
        out
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!("local_std".parse::<NoiseMethod>().unwrap(), NoiseMethod::LocalStd);
        assert_eq!("local-std".parse::<NoiseMethod>().unwrap(), NoiseMethod::LocalStd);
        assert_eq!("PIESNO".parse::<NoiseMethod>().unwrap(), NoiseMethod::Piesno);
        assert!(matches!(
            "wavelet".parse::<NoiseMethod>(),
            Err(StabilizeError::UnknownMethod(_))
        ));
    }

    #[test]
    fn test_median_helper() {
        let mut odd = [3.0, 1.0, 2.0];
        assert_eq!(median_of_slice(&mut odd), 2.0);
        let mut even = [4.0, 1.0, 3.0, 2.0];
        assert_eq!(median_of_slice(&mut even), 2.5);
        assert_eq!(median_of_slice(&mut []), 0.0);
    }

    #[test]
    fn test_local_std_recovers_gaussian_sigma() {
        let sigma_true = 5.0;
        let mut rng = StdRng::seed_from_u64(7);
        let normal = Normal::new(100.0, sigma_true).unwrap();
        let mut data = Array4::<f64>::zeros((12, 12, 12, 4));
        for v in data.iter_mut() {
            *v = normal.sample(&mut rng);
        }

        let field = local_standard_deviation(data.view());
        // Interior voxels see a full 27-sample window; allow small-sample bias.
        let center = field[[6, 6, 6]];
        assert!(
            (center - sigma_true).abs() / sigma_true < 0.5,
            "center estimate {} too far from {}",
            center,
            sigma_true
        );
        let mut all: Vec<f64> = field.iter().cloned().collect();
        let med = median_of_slice(&mut all);
        assert!((med - sigma_true).abs() / sigma_true < 0.2, "median {}", med);
    }

    #[test]
    fn test_local_std_constant_volume_is_zero() {
        let data = Array4::<f32>::from_elem((6, 6, 6, 2), 3.0);
        let field = local_standard_deviation(data.view());
        assert!(field.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_corrected_sigma_inflates_background_estimate() {
        // At SNR 0 the chi std is sqrt(2n - beta_n^2) * sigma < sigma, so the
        // correction must inflate the raw value.
        let (nx, ny, nz, nc) = (4, 4, 4, 2);
        let m_hat = Array4::<f64>::zeros((nx, ny, nz, nc));
        let raw = Array3::from_elem((nx, ny, nz), 3.0);
        let mask = Array3::from_elem((nx, ny, nz), true);
        let out = corrected_sigma(m_hat.view(), &raw, &mask, 1).unwrap();
        let corrected = out[[2, 2, 2, 0]];
        let expected = 3.0 / (2.0 - std::f64::consts::PI / 2.0f64).sqrt();
        assert!((corrected - expected).abs() < 1e-3, "got {}", corrected);
    }

    #[test]
    fn test_corrected_sigma_high_snr_no_change() {
        let (nx, ny, nz, nc) = (4, 4, 4, 2);
        let m_hat = Array4::<f64>::from_elem((nx, ny, nz, nc), 1000.0);
        let raw = Array3::from_elem((nx, ny, nz), 3.0);
        let mask = Array3::from_elem((nx, ny, nz), true);
        let out = corrected_sigma(m_hat.view(), &raw, &mask, 1).unwrap();
        assert!((out[[1, 1, 1, 1]] - 3.0).abs() < 1e-2);
    }

    #[test]
    fn test_corrected_sigma_respects_mask() {
        let (nx, ny, nz, nc) = (4, 4, 4, 2);
        let m_hat = Array4::<f64>::zeros((nx, ny, nz, nc));
        let raw = Array3::from_elem((nx, ny, nz), 3.0);
        let mut mask = Array3::from_elem((nx, ny, nz), true);
        mask[[0, 0, 0]] = false;
        let out = corrected_sigma(m_hat.view(), &raw, &mask, 1).unwrap();
        assert_eq!(out[[0, 0, 0, 0]], 0.0);
        assert!(out[[1, 1, 1, 0]] > 0.0);
    }

    #[test]
    fn test_corrected_sigma_shape_mismatch() {
        let m_hat = Array4::<f64>::zeros((4, 4, 4, 2));
        let raw = Array3::zeros((3, 4, 4));
        let mask = Array3::from_elem((4, 4, 4), true);
        assert!(matches!(
            corrected_sigma(m_hat.view(), &raw, &mask, 1),
            Err(StabilizeError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_piesno_pure_noise_slab() {
        let sigma_true = 10.0;
        let data = noncentral_chi_volume((30, 1, 30, 32), 0.0, sigma_true, 1, 42);
        let slab = data.index_axis(Axis(1), 0);
        let (sigma_est, mask) = piesno(slab, 1);
        assert!(
            (sigma_est - sigma_true).abs() / sigma_true < 0.1,
            "estimated {} vs true {}",
            sigma_est,
            sigma_true
        );
        let count = mask.iter().filter(|&&b| b).count();
        // Nearly all voxels are background in a pure-noise slab.
        assert!(count > 30 * 30 / 2, "only {} background voxels", count);
    }

    #[test]
    fn test_piesno_ignores_signal_voxels() {
        let sigma_true = 10.0;
        let mut data = noncentral_chi_volume((30, 1, 30, 32), 0.0, sigma_true, 1, 43);
        // Paint a signal block; those voxels must not be selected.
        for x in 0..10 {
            for z in 0..10 {
                for c in 0..32 {
                    data[[x, 0, z, c]] = 500.0 + (c as f64);
                }
            }
        }
        let slab = data.index_axis(Axis(1), 0);
        let (sigma_est, mask) = piesno(slab, 1);
        assert!((sigma_est - sigma_true).abs() / sigma_true < 0.1, "estimated {}", sigma_est);
        for x in 0..10 {
            for z in 0..10 {
                assert!(!mask[[x, z]], "signal voxel ({}, {}) selected", x, z);
            }
        }
    }

    #[test]
    fn test_piesno_all_zero_slab() {
        let data = Array4::<f32>::zeros((8, 1, 8, 4));
        let slab = data.index_axis(Axis(1), 0);
        let (sigma, mask) = piesno(slab, 1);
        assert_eq!(sigma, 0.0);
        assert!(mask.iter().all(|&b| !b));
    }
}
