//! End-to-end stabilization pipeline: smoothing, noise estimation, voxel
//! transform, in that order, all honoring a common spatial mask.

use crate::float_trait::StabFloat;
use crate::noise_estimate::{corrected_sigma, local_standard_deviation, piesno, NoiseMethod};
use crate::sh::GradientTable;
use crate::smoothing::{smooth_volume, SmoothingMethod};
use crate::stabilize::{stabilize_volume, PassthroughPolicy};
use crate::StabilizeError;
use log::{debug, info};
use ndarray::{Array3, Array4, ArrayView4, Axis, Zip};

/// Pipeline configuration, validated before any computation starts.
#[derive(Debug, Clone)]
pub struct StabilizationConfig {
    /// Number of receiver coils (1 for Rician data).
    pub n_coils: u32,
    /// Noise sigma estimator.
    pub noise_method: NoiseMethod,
    /// Seed smoothing strategy.
    pub smoothing: SmoothingMethod,
    /// Policy for voxels the transform skips.
    pub passthrough: PassthroughPolicy,
    /// Worker count override; `None` uses the ambient rayon pool.
    pub workers: Option<usize>,
}

impl StabilizationConfig {
    pub fn new(n_coils: u32) -> Self {
        StabilizationConfig {
            n_coils,
            noise_method: NoiseMethod::Piesno,
            smoothing: SmoothingMethod::NoSmoothing,
            passthrough: PassthroughPolicy::ZeroFill,
            workers: None,
        }
    }

    pub fn validate(&self) -> Result<(), StabilizeError> {
        if self.n_coils == 0 {
            return Err(StabilizeError::InvalidConfig(
                "coil count must be at least 1".to_string(),
            ));
        }
        if let Some(w) = self.workers {
            if w == 0 {
                return Err(StabilizeError::InvalidConfig(
                    "worker count override must be at least 1".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Everything the pipeline produces; each field maps to one output file.
#[derive(Debug)]
pub struct StabilizationOutputs<F> {
    /// Smoothed seed volume.
    pub m_hat: Array4<F>,
    /// Absolute difference between input and seed.
    pub abs_diff: Array4<F>,
    /// Per-channel sigma field, zero outside the mask.
    pub sigma: Array4<F>,
    /// PIESNO background mask, when that estimator ran.
    pub noise_mask: Option<Array3<bool>>,
    /// Stabilized volume.
    pub stabilized: Array4<F>,
}

/// Run the full pipeline on a 4-D magnitude volume.
///
/// `mask` defaults to all-true; `gradients` is required only for
/// [`SmoothingMethod::ShSmooth`]. When a worker override is configured, the
/// parallel stages run inside a dedicated scoped pool; PIESNO itself walks
/// the y axis sequentially either way.
pub fn run_stabilization_pipeline<F: StabFloat>(
    data: ArrayView4<F>,
    mask: Option<&Array3<bool>>,
    gradients: Option<&GradientTable>,
    config: &StabilizationConfig,
) -> Result<StabilizationOutputs<F>, StabilizeError> {
    config.validate()?;
    if config.smoothing == SmoothingMethod::ShSmooth && gradients.is_none() {
        return Err(StabilizeError::MissingGradients);
    }

    let (nx, ny, nz, _nc) = data.dim();
    let default_mask;
    let mask = match mask {
        Some(m) => {
            if m.dim() != (nx, ny, nz) {
                return Err(StabilizeError::ShapeMismatch {
                    expected: vec![nx, ny, nz],
                    found: m.shape().to_vec(),
                });
            }
            m
        }
        None => {
            default_mask = Array3::from_elem((nx, ny, nz), true);
            &default_mask
        }
    };

    match config.workers {
        Some(w) => {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(w)
                .build()
                .map_err(|e| StabilizeError::InvalidConfig(e.to_string()))?;
            pool.install(|| run_stages(data, mask, gradients, config))
        }
        None => run_stages(data, mask, gradients, config),
    }
}

fn run_stages<F: StabFloat>(
    data: ArrayView4<F>,
    mask: &Array3<bool>,
    gradients: Option<&GradientTable>,
    config: &StabilizationConfig,
) -> Result<StabilizationOutputs<F>, StabilizeError> {
    let (nx, ny, nz, nc) = data.dim();

    info!("smoothing with {:?}", config.smoothing);
    let m_hat = smooth_volume(data, config.smoothing, gradients)?;

    let mut abs_diff = Array4::<F>::zeros((nx, ny, nz, nc));
    Zip::from(&mut abs_diff)
        .and(&data)
        .and(&m_hat)
        .for_each(|d, &a, &b| *d = (a - b).abs());

    info!("estimating noise with {:?}", config.noise_method);
    let (mut sigma, noise_mask) = match config.noise_method {
        NoiseMethod::LocalStd => {
            let raw = local_standard_deviation(data);
            let corrected = corrected_sigma(m_hat.view(), &raw, mask, config.n_coils)?;
            (corrected, None)
        }
        NoiseMethod::Piesno => {
            let mut sigma = Array4::<F>::zeros((nx, ny, nz, nc));
            let mut background = Array3::from_elem((nx, ny, nz), false);
            for y in 0..ny {
                let slab = data.index_axis(Axis(1), y);
                let (slab_sigma, slab_mask) = piesno(slab, config.n_coils);
                debug!("piesno slice {}/{}: sigma {:.4}", y + 1, ny, slab_sigma);
                let s = F::from_f64_c(slab_sigma);
                for x in 0..nx {
                    for z in 0..nz {
                        background[[x, y, z]] = slab_mask[[x, z]];
                        for c in 0..nc {
                            sigma[[x, y, z, c]] = s;
                        }
                    }
                }
            }
            (sigma, Some(background))
        }
    };

    // The sigma field never leaks outside the mask.
    for x in 0..nx {
        for y in 0..ny {
            for z in 0..nz {
                if !mask[[x, y, z]] {
                    for c in 0..nc {
                        sigma[[x, y, z, c]] = F::zero();
                    }
                }
            }
        }
    }

    info!("stabilizing {} channels", nc);
    let stabilized = stabilize_volume(
        data,
        m_hat.view(),
        mask,
        sigma.view(),
        config.n_coils,
        config.passthrough,
    )?;

    Ok(StabilizationOutputs {
        m_hat,
        abs_diff,
        sigma,
        noise_mask,
        stabilized,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        assert!(StabilizationConfig::new(1).validate().is_ok());
        assert!(StabilizationConfig::new(0).validate().is_err());
        let mut cfg = StabilizationConfig::new(2);
        cfg.workers = Some(0);
        assert!(cfg.validate().is_err());
        cfg.workers = Some(4);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_sh_smooth_without_gradients_rejected() {
        let data = Array4::<f32>::zeros((4, 4, 4, 6));
        let mut cfg = StabilizationConfig::new(1);
        cfg.smoothing = SmoothingMethod::ShSmooth;
        assert!(matches!(
            run_stabilization_pipeline(data.view(), None, None, &cfg),
            Err(StabilizeError::MissingGradients)
        ));
    }

    #[test]
    fn test_mask_shape_mismatch_rejected() {
        let data = Array4::<f32>::zeros((4, 4, 4, 2));
        let mask = Array3::from_elem((3, 4, 4), true);
        let cfg = StabilizationConfig::new(1);
        assert!(matches!(
            run_stabilization_pipeline(data.view(), Some(&mask), None, &cfg),
            Err(StabilizeError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_all_zero_volume_passes_through() {
        let data = Array4::<f32>::zeros((6, 4, 6, 3));
        let cfg = StabilizationConfig::new(1);
        let out = run_stabilization_pipeline(data.view(), None, None, &cfg).unwrap();
        assert!(out.stabilized.iter().all(|&v| v == 0.0));
        assert!(out.sigma.iter().all(|&v| v == 0.0));
        let noise_mask = out.noise_mask.unwrap();
        assert!(noise_mask.iter().all(|&b| !b));
    }

    #[test]
    fn test_sigma_zero_outside_mask() {
        let mut data = Array4::<f64>::from_elem((6, 2, 6, 8), 0.0);
        for (i, v) in data.iter_mut().enumerate() {
            *v = (i % 13) as f64;
        }
        let mut mask = Array3::from_elem((6, 2, 6), true);
        mask[[0, 0, 0]] = false;
        let mut cfg = StabilizationConfig::new(1);
        cfg.noise_method = NoiseMethod::LocalStd;
        let out = run_stabilization_pipeline(data.view(), Some(&mask), None, &cfg).unwrap();
        for c in 0..8 {
            assert_eq!(out.sigma[[0, 0, 0, c]], 0.0);
        }
        assert!(out.sigma[[3, 1, 3, 0]] > 0.0);
    }

    #[test]
    fn test_abs_diff_matches_definition() {
        let mut data = Array4::<f64>::from_elem((5, 5, 5, 2), 10.0);
        data[[2, 2, 2, 0]] = 37.0;
        let mut cfg = StabilizationConfig::new(1);
        cfg.smoothing = SmoothingMethod::LocalMean;
        cfg.noise_method = NoiseMethod::LocalStd;
        let out = run_stabilization_pipeline(data.view(), None, None, &cfg).unwrap();
        let expected = (data[[2, 2, 2, 0]] - out.m_hat[[2, 2, 2, 0]]).abs();
        assert!((out.abs_diff[[2, 2, 2, 0]] - expected).abs() < 1e-12);
    }

    #[test]
    fn test_worker_override_deterministic() {
        let mut data = Array4::<f32>::zeros((6, 3, 6, 4));
        for (i, v) in data.iter_mut().enumerate() {
            *v = 20.0 + (i % 17) as f32;
        }
        let mut cfg1 = StabilizationConfig::new(2);
        cfg1.noise_method = NoiseMethod::LocalStd;
        cfg1.workers = Some(1);
        let mut cfg4 = cfg1.clone();
        cfg4.workers = Some(4);

        let a = run_stabilization_pipeline(data.view(), None, None, &cfg1).unwrap();
        let b = run_stabilization_pipeline(data.view(), None, None, &cfg4).unwrap();
        assert_eq!(a.stabilized, b.stabilized);
        assert_eq!(a.sigma, b.sigma);
    }
}
