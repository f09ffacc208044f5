//! NIfTI volume I/O.
//!
//! Reads .nii and .nii.gz (gzip auto-detected) into 4-D f32 arrays, carrying
//! the affine and the input dtype class along. Outputs are written as
//! NIfTI-1 single files; the stabilized volume keeps the input's dtype class
//! with unsigned integer types widened to the next signed type that holds
//! their range.

use crate::StabilizeError;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::{Array3, Array4, ArrayView4, Axis, IxDyn};
use nifti::volume::ndarray::IntoNdArray;
use nifti::{InMemNiftiObject, NiftiHeader, NiftiObject};
use std::io::{Cursor, Write};
use std::path::Path;

/// On-disk element type for written volumes.
///
/// Derived from the input header with unsigned integer types widened to the
/// next signed type that holds their full range, so transformed values near
/// the type boundary never wrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputDtype {
    I16,
    I32,
    F32,
    F64,
}

impl OutputDtype {
    /// Widening map from a NIfTI-1 datatype code; unknown codes fall back to
    /// f32.
    pub fn from_input_code(code: i16) -> OutputDtype {
        match code {
            2 | 256 | 4 => OutputDtype::I16,  // u8, i8, i16
            512 | 8 => OutputDtype::I32,      // u16, i32
            768 | 1024 | 1280 => OutputDtype::F64, // u32, i64, u64
            64 => OutputDtype::F64,
            _ => OutputDtype::F32,
        }
    }

    fn nifti_code(self) -> i16 {
        match self {
            OutputDtype::I16 => 4,
            OutputDtype::I32 => 8,
            OutputDtype::F32 => 16,
            OutputDtype::F64 => 64,
        }
    }

    fn bitpix(self) -> i16 {
        match self {
            OutputDtype::I16 => 16,
            OutputDtype::I32 => 32,
            OutputDtype::F32 => 32,
            OutputDtype::F64 => 64,
        }
    }

    fn write_value(self, v: f32, out: &mut Vec<u8>) {
        match self {
            OutputDtype::I16 => {
                let c = v.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
                out.extend_from_slice(&c.to_le_bytes());
            }
            OutputDtype::I32 => {
                let c = v.round().clamp(i32::MIN as f32, i32::MAX as f32) as i32;
                out.extend_from_slice(&c.to_le_bytes());
            }
            OutputDtype::F32 => out.extend_from_slice(&v.to_le_bytes()),
            OutputDtype::F64 => out.extend_from_slice(&(v as f64).to_le_bytes()),
        }
    }
}

/// A loaded volume with the header fields the pipeline needs to write its
/// outputs back out.
#[derive(Debug)]
pub struct VolumeData {
    /// Volume values, (x, y, z, channel); 3-D inputs get a unit channel axis.
    pub data: Array4<f32>,
    /// 4x4 row-major affine (sform preferred, pixdim fallback).
    pub affine: [f64; 16],
    /// Voxel sizes in mm.
    pub voxel_size: (f32, f32, f32),
    /// Output dtype class derived from the input datatype.
    pub dtype: OutputDtype,
}

fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b
}

fn read_object(path: &Path) -> Result<InMemNiftiObject, StabilizeError> {
    let bytes = std::fs::read(path)?;
    let obj = if is_gzip(&bytes) {
        InMemNiftiObject::from_reader(GzDecoder::new(Cursor::new(bytes)))
    } else {
        InMemNiftiObject::from_reader(Cursor::new(bytes))
    };
    obj.map_err(|e| StabilizeError::Nifti(format!("{}: {}", path.display(), e)))
}

fn get_affine(header: &NiftiHeader) -> [f64; 16] {
    if header.sform_code > 0 {
        let sx = &header.srow_x;
        let sy = &header.srow_y;
        let sz = &header.srow_z;
        [
            sx[0] as f64, sx[1] as f64, sx[2] as f64, sx[3] as f64,
            sy[0] as f64, sy[1] as f64, sy[2] as f64, sy[3] as f64,
            sz[0] as f64, sz[1] as f64, sz[2] as f64, sz[3] as f64,
            0.0, 0.0, 0.0, 1.0,
        ]
    } else {
        let (vx, vy, vz) = (
            header.pixdim[1] as f64,
            header.pixdim[2] as f64,
            header.pixdim[3] as f64,
        );
        [
            vx, 0.0, 0.0, 0.0,
            0.0, vy, 0.0, 0.0,
            0.0, 0.0, vz, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ]
    }
}

/// Load a 3-D or 4-D magnitude volume; 3-D inputs gain a unit channel axis.
pub fn load_volume(path: &Path) -> Result<VolumeData, StabilizeError> {
    let obj = read_object(path)?;
    let header = obj.header();
    let affine = get_affine(header);
    let voxel_size = (header.pixdim[1], header.pixdim[2], header.pixdim[3]);
    let dtype = OutputDtype::from_input_code(header.datatype);

    let array = obj
        .into_volume()
        .into_ndarray::<f32>()
        .map_err(|e| StabilizeError::Nifti(format!("{}: {}", path.display(), e)))?;

    let data = to_4d(array, path)?;
    Ok(VolumeData {
        data,
        affine,
        voxel_size,
        dtype,
    })
}

fn to_4d(
    array: ndarray::Array<f32, IxDyn>,
    path: &Path,
) -> Result<Array4<f32>, StabilizeError> {
    let array = match array.ndim() {
        3 => array.insert_axis(Axis(3)),
        4 => array,
        d => {
            return Err(StabilizeError::Nifti(format!(
                "{}: expected a 3-D or 4-D volume, found {}-D",
                path.display(),
                d
            )))
        }
    };
    array
        .into_dimensionality()
        .map_err(|e| StabilizeError::Nifti(format!("{}: {}", path.display(), e)))
}

/// Load a spatial mask; any non-zero voxel is included.
pub fn load_mask(
    path: &Path,
    expected: (usize, usize, usize),
) -> Result<Array3<bool>, StabilizeError> {
    let vol = load_volume(path)?;
    let (nx, ny, nz, nc) = vol.data.dim();
    if (nx, ny, nz) != expected || nc != 1 {
        return Err(StabilizeError::ShapeMismatch {
            expected: vec![expected.0, expected.1, expected.2],
            found: vol.data.shape().to_vec(),
        });
    }
    Ok(vol.data.index_axis(Axis(3), 0).map(|&v| v != 0.0))
}

/// NIfTI-1 stores dimensions as i16; larger extents would silently wrap.
fn check_dims(dims: &[usize]) -> Result<(), StabilizeError> {
    for &d in dims {
        if d > i16::MAX as usize {
            return Err(StabilizeError::Nifti(format!(
                "dimension {} exceeds the NIfTI-1 limit of {}",
                d,
                i16::MAX
            )));
        }
    }
    Ok(())
}

fn build_header(
    dims: (usize, usize, usize, usize),
    voxel_size: (f32, f32, f32),
    affine: &[f64; 16],
    dtype: OutputDtype,
) -> [u8; 348] {
    let (nx, ny, nz, nc) = dims;
    let mut header = [0u8; 348];

    header[0..4].copy_from_slice(&348i32.to_le_bytes());

    let ndim: i16 = if nc > 1 { 4 } else { 3 };
    let dim: [i16; 8] = [ndim, nx as i16, ny as i16, nz as i16, nc as i16, 1, 1, 1];
    for (i, &d) in dim.iter().enumerate() {
        header[40 + i * 2..42 + i * 2].copy_from_slice(&d.to_le_bytes());
    }

    header[70..72].copy_from_slice(&dtype.nifti_code().to_le_bytes());
    header[72..74].copy_from_slice(&dtype.bitpix().to_le_bytes());

    let pixdim: [f32; 8] = [1.0, voxel_size.0, voxel_size.1, voxel_size.2, 1.0, 1.0, 1.0, 1.0];
    for (i, &p) in pixdim.iter().enumerate() {
        header[76 + i * 4..80 + i * 4].copy_from_slice(&p.to_le_bytes());
    }

    // Data follows the header and a 4-byte empty extension marker.
    header[108..112].copy_from_slice(&352.0f32.to_le_bytes());
    header[112..116].copy_from_slice(&1.0f32.to_le_bytes());
    header[116..120].copy_from_slice(&0.0f32.to_le_bytes());

    // sform_code = 1 (scanner anatomical)
    header[254..256].copy_from_slice(&1i16.to_le_bytes());
    for i in 0..4 {
        header[280 + i * 4..284 + i * 4].copy_from_slice(&(affine[i] as f32).to_le_bytes());
        header[296 + i * 4..300 + i * 4].copy_from_slice(&(affine[4 + i] as f32).to_le_bytes());
        header[312 + i * 4..316 + i * 4].copy_from_slice(&(affine[8 + i] as f32).to_le_bytes());
    }

    header[344..348].copy_from_slice(b"n+1\0");
    header
}

fn write_bytes(path: &Path, uncompressed: &[u8]) -> Result<(), StabilizeError> {
    let gz = path
        .extension()
        .map(|e| e.eq_ignore_ascii_case("gz"))
        .unwrap_or(false);
    if gz {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(uncompressed)?;
        let compressed = encoder.finish()?;
        std::fs::write(path, compressed)?;
    } else {
        std::fs::write(path, uncompressed)?;
    }
    Ok(())
}

/// Write a 4-D volume as a NIfTI-1 file, gzip-compressed when the path ends
/// in .gz. Data is written in Fortran order with x varying fastest.
pub fn save_volume(
    path: &Path,
    data: ArrayView4<f32>,
    voxel_size: (f32, f32, f32),
    affine: &[f64; 16],
    dtype: OutputDtype,
) -> Result<(), StabilizeError> {
    let (nx, ny, nz, nc) = data.dim();
    check_dims(&[nx, ny, nz, nc])?;
    let header = build_header((nx, ny, nz, nc), voxel_size, affine, dtype);

    let elem = (dtype.bitpix() / 8) as usize;
    let mut buffer = Vec::with_capacity(352 + nx * ny * nz * nc * elem);
    buffer.extend_from_slice(&header);
    buffer.extend_from_slice(&[0u8; 4]);
    for c in 0..nc {
        for z in 0..nz {
            for y in 0..ny {
                for x in 0..nx {
                    dtype.write_value(data[[x, y, z, c]], &mut buffer);
                }
            }
        }
    }
    write_bytes(path, &buffer)
}

/// Write a boolean mask as a u8 NIfTI-1 volume (1 inside, 0 outside).
pub fn save_mask(
    path: &Path,
    mask: &Array3<bool>,
    voxel_size: (f32, f32, f32),
    affine: &[f64; 16],
) -> Result<(), StabilizeError> {
    let (nx, ny, nz) = mask.dim();
    check_dims(&[nx, ny, nz])?;
    let mut header = build_header((nx, ny, nz, 1), voxel_size, affine, OutputDtype::I16);
    // datatype 2 (u8), bitpix 8
    header[70..72].copy_from_slice(&2i16.to_le_bytes());
    header[72..74].copy_from_slice(&8i16.to_le_bytes());

    let mut buffer = Vec::with_capacity(352 + nx * ny * nz);
    buffer.extend_from_slice(&header);
    buffer.extend_from_slice(&[0u8; 4]);
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                buffer.push(u8::from(mask[[x, y, z]]));
            }
        }
    }
    write_bytes(path, &buffer)
}

// =============================================================================
// Tests
// =============================================================================
