//! Spherical-harmonics smoothing over diffusion gradient directions.
//!
//! Fits each voxel's per-direction signal with an even real SH basis of
//! order 4 using Laplace-Beltrami regularized least squares, and reads the
//! fit back at the same directions. b0 channels are excluded from the fit
//! and replaced by their per-voxel mean. Also owns the FSL-style bvals/bvecs
//! table parsing.

use crate::float_trait::StabFloat;
use crate::StabilizeError;
use ndarray::{Array2, Array4, ArrayView4};
use rayon::prelude::*;
use std::path::Path;

/// Maximum even SH order of the fit; order 4 gives 15 coefficients.
const SH_ORDER: u32 = 4;

/// Laplace-Beltrami regularization weight.
const SH_SMOOTH: f64 = 0.006;

/// b-values below this count as b0 acquisitions.
const B0_THRESHOLD: f64 = 50.0;

/// Diffusion gradient table: one b-value and unit direction per channel.
#[derive(Debug, Clone)]
pub struct GradientTable {
    pub bvals: Vec<f64>,
    pub bvecs: Vec<[f64; 3]>,
}

impl GradientTable {
    pub fn new(bvals: Vec<f64>, bvecs: Vec<[f64; 3]>) -> Result<Self, StabilizeError> {
        if bvals.len() != bvecs.len() {
            return Err(StabilizeError::Gradient(format!(
                "{} b-values but {} directions",
                bvals.len(),
                bvecs.len()
            )));
        }
        if bvals.is_empty() {
            return Err(StabilizeError::Gradient("empty gradient table".to_string()));
        }
        Ok(GradientTable { bvals, bvecs })
    }

    pub fn len(&self) -> usize {
        self.bvals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bvals.is_empty()
    }

    /// Channel indices with b below the b0 threshold.
    pub fn b0_indices(&self) -> Vec<usize> {
        self.bvals
            .iter()
            .enumerate()
            .filter(|(_, &b)| b < B0_THRESHOLD)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Read FSL-style bvals/bvecs text files.
///
/// bvals is a single whitespace-separated row of N values; bvecs is either
/// three rows of N components or N rows of three components. A 3x3 bvecs
/// table matches both layouts and is read as row-major (three rows of
/// components, the FSL convention).
pub fn read_bvals_bvecs(
    bvals_path: &Path,
    bvecs_path: &Path,
) -> Result<GradientTable, StabilizeError> {
    let bvals = parse_table(bvals_path)?;
    if bvals.len() != 1 {
        return Err(StabilizeError::Gradient(format!(
            "expected one row of b-values in {}, found {} rows",
            bvals_path.display(),
            bvals.len()
        )));
    }
    let bvals = bvals.into_iter().next().unwrap_or_default();

    let rows = parse_table(bvecs_path)?;
    let n = bvals.len();
    let bvecs: Vec<[f64; 3]> = if rows.len() == 3 && rows.iter().all(|r| r.len() == n) {
        (0..n).map(|i| [rows[0][i], rows[1][i], rows[2][i]]).collect()
    } else if rows.len() == n && rows.iter().all(|r| r.len() == 3) {
        rows.iter().map(|r| [r[0], r[1], r[2]]).collect()
    } else {
        return Err(StabilizeError::Gradient(format!(
            "bvecs in {} are neither 3x{} nor {}x3",
            bvecs_path.display(),
            n,
            n
        )));
    };

    GradientTable::new(bvals, bvecs)
}

fn parse_table(path: &Path) -> Result<Vec<Vec<f64>>, StabilizeError> {
    let text = std::fs::read_to_string(path)?;
    let mut rows = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut row = Vec::new();
        for tok in line.split_whitespace() {
            let v: f64 = tok.parse().map_err(|_| {
                StabilizeError::Gradient(format!(
                    "non-numeric value '{}' in {}",
                    tok,
                    path.display()
                ))
            })?;
            row.push(v);
        }
        rows.push(row);
    }
    Ok(rows)
}

/// Smooth a 4-D volume over its gradient directions with a regularized SH
/// fit; b0 channels become the per-voxel b0 mean.
pub fn sh_smooth<F: StabFloat>(
    data: ArrayView4<F>,
    table: &GradientTable,
) -> Result<Array4<F>, StabilizeError> {
    let (nx, ny, nz, nc) = data.dim();
    if table.len() != nc {
        return Err(StabilizeError::ShapeMismatch {
            expected: vec![nc],
            found: vec![table.len()],
        });
    }

    let b0: Vec<usize> = table.b0_indices();
    let dwi: Vec<usize> = (0..nc).filter(|i| !b0.contains(i)).collect();
    let n_coef = sh_coefficient_count();
    if dwi.len() < n_coef {
        return Err(StabilizeError::Gradient(format!(
            "{} diffusion directions cannot support an order-{} fit ({} coefficients)",
            dwi.len(),
            SH_ORDER,
            n_coef
        )));
    }

    // Smoother matrix H = B (B'B + lambda L)^-1 B', precomputed once.
    let basis = sh_basis(&dwi.iter().map(|&i| table.bvecs[i]).collect::<Vec<_>>());
    let smoother = smoother_matrix(&basis)?;

    let slabs: Vec<Array2<F>> = (0..nx)
        .into_par_iter()
        .map(|x| {
            let mut slab = Array2::<F>::zeros((ny * nz, nc));
            let mut signal = vec![0.0f64; dwi.len()];
            for y in 0..ny {
                for z in 0..nz {
                    let row = y * nz + z;

                    // b0 channels: per-voxel mean of all b0 acquisitions.
                    if !b0.is_empty() {
                        let mean = b0
                            .iter()
                            .map(|&c| data[[x, y, z, c]].to_f64_c())
                            .sum::<f64>()
                            / b0.len() as f64;
                        for &c in &b0 {
                            slab[[row, c]] = F::from_f64_c(mean);
                        }
                    }

                    for (k, &c) in dwi.iter().enumerate() {
                        signal[k] = data[[x, y, z, c]].to_f64_c();
                    }
                    for (k, &c) in dwi.iter().enumerate() {
                        let mut acc = 0.0;
                        for (j, &s) in signal.iter().enumerate() {
                            acc += smoother[[k, j]] * s;
                        }
                        slab[[row, c]] = F::from_f64_c(acc);
                    }
                }
            }
            slab
        })
        .collect();

    let mut out = Array4::<F>::zeros((nx, ny, nz, nc));
    for (x, slab) in slabs.into_iter().enumerate() {
        for y in 0..ny {
            for z in 0..nz {
                let row = y * nz + z;
                for c in 0..nc {
                    out[[x, y, z, c]] = slab[[row, c]];
                }
            }
        }
    }
    Ok(out)
}

fn sh_coefficient_count() -> usize {
    // Even orders 0..=SH_ORDER: sum of (2l + 1).
    (0..=SH_ORDER)
        .step_by(2)
        .map(|l| 2 * l as usize + 1)
        .sum()
}

/// Real symmetric SH basis sampled at the given unit directions, one row per
/// direction, columns in (l, m) order with l even and m in -l..=l.
fn sh_basis(dirs: &[[f64; 3]]) -> Array2<f64> {
    let n_coef = sh_coefficient_count();
    let mut basis = Array2::<f64>::zeros((dirs.len(), n_coef));
    for (i, d) in dirs.iter().enumerate() {
        let norm = (d[0] * d[0] + d[1] * d[1] + d[2] * d[2]).sqrt();
        let (x, y, z) = if norm > 0.0 {
            (d[0] / norm, d[1] / norm, d[2] / norm)
        } else {
            (0.0, 0.0, 1.0)
        };
        let theta = z.clamp(-1.0, 1.0).acos();
        let phi = y.atan2(x);

        let mut col = 0;
        for l in (0..=SH_ORDER).step_by(2) {
            for m in -(l as i32)..=(l as i32) {
                basis[[i, col]] = real_sh(l, m, theta, phi);
                col += 1;
            }
        }
    }
    basis
}

/// Real spherical harmonic of degree l and order m at (theta, phi).
fn real_sh(l: u32, m: i32, theta: f64, phi: f64) -> f64 {
    let am = m.unsigned_abs();
    let norm = sh_norm(l, am);
    let p = assoc_legendre(l, am, theta.cos());
    if m < 0 {
        std::f64::consts::SQRT_2 * norm * p * (am as f64 * phi).sin()
    } else if m == 0 {
        norm * p
    } else {
        std::f64::consts::SQRT_2 * norm * p * (am as f64 * phi).cos()
    }
}

/// sqrt((2l+1)/(4 pi) * (l-m)!/(l+m)!)
fn sh_norm(l: u32, m: u32) -> f64 {
    let mut ratio = 1.0;
    for k in (l - m + 1)..=(l + m) {
        ratio /= k as f64;
    }
    ((2 * l + 1) as f64 / (4.0 * std::f64::consts::PI) * ratio).sqrt()
}

/// Associated Legendre P_l^m(x) (no Condon-Shortley phase removed; the phase
/// cancels in the smoother because it appears in both B and B').
fn assoc_legendre(l: u32, m: u32, x: f64) -> f64 {
    // P_m^m by the diagonal recurrence, then raise l.
    let somx2 = ((1.0 - x) * (1.0 + x)).max(0.0).sqrt();
    let mut pmm = 1.0;
    let mut fact = 1.0;
    for _ in 0..m {
        pmm *= -fact * somx2;
        fact += 2.0;
    }
    if l == m {
        return pmm;
    }
    let mut pmmp1 = x * (2.0 * m as f64 + 1.0) * pmm;
    if l == m + 1 {
        return pmmp1;
    }
    let mut pll = 0.0;
    for ll in (m + 2)..=l {
        let llf = ll as f64;
        let mf = m as f64;
        pll = ((2.0 * llf - 1.0) * x * pmmp1 - (llf + mf - 1.0) * pmm) / (llf - mf);
        pmm = pmmp1;
        pmmp1 = pll;
    }
    pll
}

/// H = B (B'B + lambda L)^-1 B' with L the Laplace-Beltrami diagonal
/// l^2 (l+1)^2.
fn smoother_matrix(basis: &Array2<f64>) -> Result<Array2<f64>, StabilizeError> {
    let (ndir, n_coef) = basis.dim();

    let mut gram = Array2::<f64>::zeros((n_coef, n_coef));
    for i in 0..n_coef {
        for j in 0..n_coef {
            let mut s = 0.0;
            for d in 0..ndir {
                s += basis[[d, i]] * basis[[d, j]];
            }
            gram[[i, j]] = s;
        }
    }

    let mut col = 0;
    for l in (0..=SH_ORDER).step_by(2) {
        let lb = (l * l * (l + 1) * (l + 1)) as f64;
        for _ in -(l as i32)..=(l as i32) {
            gram[[col, col]] += SH_SMOOTH * lb;
            col += 1;
        }
    }

    let inv = invert(&gram)?;

    // H = B inv B'
    let mut bt_rows = Array2::<f64>::zeros((n_coef, ndir));
    for i in 0..n_coef {
        for d in 0..ndir {
            let mut s = 0.0;
            for j in 0..n_coef {
                s += inv[[i, j]] * basis[[d, j]];
            }
            bt_rows[[i, d]] = s;
        }
    }
    let mut h = Array2::<f64>::zeros((ndir, ndir));
    for a in 0..ndir {
        for b in 0..ndir {
            let mut s = 0.0;
            for i in 0..n_coef {
                s += basis[[a, i]] * bt_rows[[i, b]];
            }
            h[[a, b]] = s;
        }
    }
    Ok(h)
}

/// Gauss-Jordan inversion with partial pivoting.
fn invert(mat: &Array2<f64>) -> Result<Array2<f64>, StabilizeError> {
    let n = mat.nrows();
    let mut a = mat.clone();
    let mut inv = Array2::<f64>::eye(n);

    for col in 0..n {
        let mut pivot = col;
        for row in (col + 1)..n {
            if a[[row, col]].abs() > a[[pivot, col]].abs() {
                pivot = row;
            }
        }
        if a[[pivot, col]].abs() < 1e-12 {
            return Err(StabilizeError::Gradient(
                "degenerate gradient directions: singular spherical harmonics system".to_string(),
            ));
        }
        if pivot != col {
            for j in 0..n {
                a.swap([col, j], [pivot, j]);
                inv.swap([col, j], [pivot, j]);
            }
        }
        let d = a[[col, col]];
        for j in 0..n {
            a[[col, j]] /= d;
            inv[[col, j]] /= d;
        }
        for row in 0..n {
            if row == col {
                continue;
            }
            let f = a[[row, col]];
            if f == 0.0 {
                continue;
            }
            for j in 0..n {
                a[[row, j]] -= f * a[[col, j]];
                inv[[row, j]] -= f * inv[[col, j]];
            }
        }
    }
    Ok(inv)
}

// =============================================================================
// Tests
// =============================================================================
