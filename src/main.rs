use std::path::{Path, PathBuf};

use clap::{Parser, ValueEnum};
use log::info;

use nc_stabilize::nifti_io::{load_mask, load_volume, save_mask, save_volume, OutputDtype};
use nc_stabilize::sh::read_bvals_bvecs;
use nc_stabilize::{
    run_stabilization_pipeline, NoiseMethod, PassthroughPolicy, SmoothingMethod,
    StabilizationConfig, StabilizeError,
};

#[derive(Parser, Debug)]
#[command(
    name = "nc_stabilize",
    about = "Transform non-central chi / Rician noise in 4D MRI volumes into Gaussian noise"
)]
struct Cli {
    /// Input magnitude volume (.nii or .nii.gz)
    input: PathBuf,
    /// Number of receiver coils (1 for Rician data)
    #[arg(short = 'N', long = "coils")]
    n_coils: u32,
    /// Output prefix (defaults to the input path minus its extension)
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Worker thread count (defaults to all cores)
    #[arg(long)]
    cores: Option<usize>,
    /// Spatial mask volume; non-zero voxels are processed
    #[arg(long)]
    mask: Option<PathBuf>,
    /// Noise estimation method
    #[arg(long = "noise-est", value_enum, default_value_t = NoiseArg::Piesno)]
    noise_est: NoiseArg,
    /// Smoothing method for the signal seed estimate
    #[arg(long = "smooth", value_enum, default_value_t = SmoothArg::NoSmoothing)]
    smooth: SmoothArg,
    /// FSL-style b-values file (required for sh-smooth)
    #[arg(long)]
    bvals: Option<PathBuf>,
    /// FSL-style b-vectors file (required for sh-smooth)
    #[arg(long)]
    bvecs: Option<PathBuf>,
    /// What to write for skipped voxels (sigma 0 or outside the mask)
    #[arg(long, value_enum, default_value_t = PassthroughArg::ZeroFill)]
    passthrough: PassthroughArg,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum NoiseArg {
    LocalStd,
    Piesno,
}

impl From<NoiseArg> for NoiseMethod {
    fn from(value: NoiseArg) -> Self {
        match value {
            NoiseArg::LocalStd => NoiseMethod::LocalStd,
            NoiseArg::Piesno => NoiseMethod::Piesno,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SmoothArg {
    LocalMean,
    NonLocalMeans,
    ShSmooth,
    NoSmoothing,
}

impl From<SmoothArg> for SmoothingMethod {
    fn from(value: SmoothArg) -> Self {
        match value {
            SmoothArg::LocalMean => SmoothingMethod::LocalMean,
            SmoothArg::NonLocalMeans => SmoothingMethod::NonLocalMeans,
            SmoothArg::ShSmooth => SmoothingMethod::ShSmooth,
            SmoothArg::NoSmoothing => SmoothingMethod::NoSmoothing,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PassthroughArg {
    ZeroFill,
    CopyInput,
}

impl From<PassthroughArg> for PassthroughPolicy {
    fn from(value: PassthroughArg) -> Self {
        match value {
            PassthroughArg::ZeroFill => PassthroughPolicy::ZeroFill,
            PassthroughArg::CopyInput => PassthroughPolicy::CopyInput,
        }
    }
}

/// Strip a trailing .nii or .nii.gz to derive the default output prefix.
fn default_prefix(input: &Path) -> PathBuf {
    let name = input.to_string_lossy();
    let stripped = name
        .strip_suffix(".nii.gz")
        .or_else(|| name.strip_suffix(".nii"))
        .unwrap_or(&name);
    PathBuf::from(stripped.to_string())
}

fn output_path(prefix: &Path, suffix: &str) -> PathBuf {
    let mut name = prefix.as_os_str().to_os_string();
    name.push(suffix);
    name.push(".nii.gz");
    PathBuf::from(name)
}

fn run(cli: Cli) -> Result<(), StabilizeError> {
    let volume = load_volume(&cli.input)?;
    let (nx, ny, nz, nc) = volume.data.dim();
    info!(
        "loaded {} ({}x{}x{}x{})",
        cli.input.display(),
        nx,
        ny,
        nz,
        nc
    );

    let mask = match &cli.mask {
        Some(path) => Some(load_mask(path, (nx, ny, nz))?),
        None => None,
    };

    let gradients = match (&cli.bvals, &cli.bvecs) {
        (Some(bvals), Some(bvecs)) => Some(read_bvals_bvecs(bvals, bvecs)?),
        (None, None) => None,
        _ => return Err(StabilizeError::MissingGradients),
    };

    let config = StabilizationConfig {
        n_coils: cli.n_coils,
        noise_method: cli.noise_est.into(),
        smoothing: cli.smooth.into(),
        passthrough: cli.passthrough.into(),
        workers: cli.cores,
    };

    let outputs =
        run_stabilization_pipeline(volume.data.view(), mask.as_ref(), gradients.as_ref(), &config)?;

    let prefix = cli.output.unwrap_or_else(|| default_prefix(&cli.input));
    let vs = volume.voxel_size;
    let affine = &volume.affine;

    for (suffix, data) in [
        ("_m_hat", &outputs.m_hat),
        ("_diff", &outputs.abs_diff),
        ("_sigma", &outputs.sigma),
    ] {
        let path = output_path(&prefix, suffix);
        save_volume(&path, data.view(), vs, affine, OutputDtype::F32)?;
        info!("wrote {}", path.display());
    }

    if let Some(noise_mask) = &outputs.noise_mask {
        let path = output_path(&prefix, "_mask_noise");
        save_mask(&path, noise_mask, vs, affine)?;
        info!("wrote {}", path.display());
    }

    let path = output_path(&prefix, "_stabilized");
    save_volume(&path, outputs.stabilized.view(), vs, affine, volume.dtype)?;
    info!("wrote {}", path.display());

    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
