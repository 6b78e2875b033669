//! NIfTI-1 volumes on disk.
//!
//! Voxel buffers are flat with `x` varying fastest, the same order
//! NIfTI stores them in; ndarray's Fortran-layout views bridge the two.
//!
//! The world frame is taken from the sform when `sform_code > 0`, else
//! from the qform quaternion when `qform_code > 0`, else identity at the
//! origin. Headers built by [`header_for`] carry an sform only.

use std::path::Path;

use ndarray::{Array3, ShapeBuilder};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use tracing::debug;
use vesselfuse_pipeline::{BinaryMask, PipelineError, ReferenceGeometry, Shape, SpatialHeader, Volume};

use crate::error::IoError;

/// `xyzt_units` value for millimetres.
const UNITS_MM: u8 = 2;
/// `sform_code` for scanner-anatomical coordinates.
const XFORM_SCANNER_ANAT: i16 = 1;

/// Geometry of a case's reference image plus its raw header, which is
/// the template for every mask written for that case.
#[derive(Debug, Clone)]
pub struct ReferenceImage {
    geometry: ReferenceGeometry,
    header: NiftiHeader,
}

impl ReferenceImage {
    /// Reference image for an in-memory geometry.
    ///
    /// # Errors
    ///
    /// See [`header_for`].
    pub fn from_geometry(geometry: ReferenceGeometry) -> Result<Self, PipelineError> {
        Ok(Self {
            header: header_for(&geometry)?,
            geometry,
        })
    }

    /// Grid and spatial header.
    #[must_use]
    pub const fn geometry(&self) -> &ReferenceGeometry {
        &self.geometry
    }

    /// Header used as the template for written masks.
    #[must_use]
    pub const fn nifti_header(&self) -> &NiftiHeader {
        &self.header
    }
}

/// Read only the header of the reference image at `path`.
///
/// # Errors
///
/// Returns [`IoError::Input`] when the header cannot be read and
/// [`IoError::UnsupportedLayout`] for non-3D grids or unusable spacing.
pub fn read_reference(path: &Path) -> Result<ReferenceImage, IoError> {
    let header = NiftiHeader::from_file(path).map_err(|e| IoError::input(path, e))?;
    let shape = grid_shape(path, &header)?;
    let spatial = spatial_header(path, &header)?;
    debug!(
        path = %path.display(),
        ?shape,
        spacing = ?spatial.spacing,
        origin = ?spatial.origin,
        sform = header.sform_code,
        qform = header.qform_code,
        "reference header"
    );
    Ok(ReferenceImage {
        geometry: ReferenceGeometry {
            shape,
            header: spatial,
        },
        header,
    })
}

/// Read a label volume as `f32`, with intensity scaling applied.
///
/// # Errors
///
/// Returns [`IoError::Input`] when the file cannot be read or decoded
/// and [`IoError::UnsupportedLayout`] for non-3D data.
pub fn read_volume(path: &Path) -> Result<Volume<f32>, IoError> {
    let object = ReaderOptions::new()
        .read_file(path)
        .map_err(|e| IoError::input(path, e))?;
    let header = object.header().clone();
    let shape = grid_shape(path, &header)?;
    let spatial = spatial_header(path, &header)?;

    let array = object
        .into_volume()
        .into_ndarray::<f32>()
        .map_err(|e| IoError::input(path, e))?;
    // Reversing the axes makes logical iteration visit x fastest.
    let data: Vec<f32> = array.t().iter().copied().collect();
    debug!(path = %path.display(), ?shape, "volume read");
    Volume::new(shape, spatial, data).map_err(|e| IoError::from_pipeline(path, &e))
}

/// Write `mask` as an unsigned 8-bit volume with `template`'s header.
///
/// # Errors
///
/// Returns [`IoError::Persistence`] when encoding or writing fails.
pub fn write_mask(path: &Path, mask: &BinaryMask, template: &NiftiHeader) -> Result<(), IoError> {
    let array = fortran_array(path, mask.shape(), mask.data().to_vec())?;
    WriterOptions::new(path)
        .reference_header(&unscaled(template))
        .write_nifti(&array)
        .map_err(|e| IoError::persistence(path, e))?;
    debug!(path = %path.display(), foreground = mask.count_foreground(), "mask written");
    Ok(())
}

/// Write a label volume as 32-bit floats with `template`'s header.
///
/// # Errors
///
/// Returns [`IoError::Persistence`] when encoding or writing fails.
pub fn write_labels(path: &Path, labels: &Volume<f32>, template: &NiftiHeader) -> Result<(), IoError> {
    let array = fortran_array(path, labels.shape(), labels.data().to_vec())?;
    WriterOptions::new(path)
        .reference_header(&unscaled(template))
        .write_nifti(&array)
        .map_err(|e| IoError::persistence(path, e))
}

/// NIfTI-1 header describing `geometry`, with an sform and millimetre
/// units.
///
/// # Errors
///
/// Returns [`PipelineError::InvalidVolume`] when a dimension exceeds the
/// 16-bit limit of the format.
#[allow(clippy::cast_possible_truncation)]
pub fn header_for(geometry: &ReferenceGeometry) -> Result<NiftiHeader, PipelineError> {
    let dim = |n: usize| {
        u16::try_from(n).map_err(|_| {
            PipelineError::InvalidVolume(format!(
                "dimension {n} exceeds the NIfTI-1 limit of {}",
                u16::MAX
            ))
        })
    };
    let [nx, ny, nz] = geometry.shape.as_array();
    let SpatialHeader {
        spacing: s,
        origin: o,
        direction: d,
    } = geometry.header;
    let row = |r: usize| {
        [
            (d[r * 3] * s[0]) as f32,
            (d[r * 3 + 1] * s[1]) as f32,
            (d[r * 3 + 2] * s[2]) as f32,
            o[r] as f32,
        ]
    };

    Ok(NiftiHeader {
        dim: [3, dim(nx)?, dim(ny)?, dim(nz)?, 1, 1, 1, 1],
        pixdim: [1.0, s[0] as f32, s[1] as f32, s[2] as f32, 0.0, 0.0, 0.0, 0.0],
        xyzt_units: UNITS_MM,
        qform_code: 0,
        sform_code: XFORM_SCANNER_ANAT,
        srow_x: row(0),
        srow_y: row(1),
        srow_z: row(2),
        scl_slope: 1.0,
        scl_inter: 0.0,
        ..NiftiHeader::default()
    })
}

/// Voxel grid of `header`. Lower-dimensional images get unit trailing
/// axes; extra axes must have length 1.
fn grid_shape(path: &Path, header: &NiftiHeader) -> Result<Shape, IoError> {
    let ndim = usize::from(header.dim[0]);
    if !(1..=7).contains(&ndim) {
        return Err(IoError::layout(path, format!("invalid dim[0] = {ndim}")));
    }
    let extent = |axis: usize| {
        if axis <= ndim {
            usize::from(header.dim[axis])
        } else {
            1
        }
    };
    if let Some(axis) = (4..=ndim).find(|&a| extent(a) != 1) {
        return Err(IoError::layout(
            path,
            format!("axis {axis} has length {}, expected a 3D volume", extent(axis)),
        ));
    }
    Ok(Shape::new(extent(1), extent(2), extent(3)))
}

fn spatial_header(path: &Path, header: &NiftiHeader) -> Result<SpatialHeader, IoError> {
    let spacing = [1, 2, 3].map(|i| f64::from(header.pixdim[i]).abs());
    if spacing.iter().any(|s| !s.is_finite() || *s <= 0.0) {
        return Err(IoError::layout(path, format!("unusable voxel spacing {spacing:?}")));
    }
    let (origin, direction) = if header.sform_code > 0 {
        sform_frame(header)
    } else if header.qform_code > 0 {
        qform_frame(header)
    } else {
        ([0.0; 3], SpatialHeader::IDENTITY_DIRECTION)
    };
    Ok(SpatialHeader {
        spacing,
        origin,
        direction,
    })
}

/// Origin and unit axis directions from the affine rows.
fn sform_frame(header: &NiftiHeader) -> ([f64; 3], [f64; 9]) {
    let rows = [header.srow_x, header.srow_y, header.srow_z].map(|r| r.map(f64::from));
    let mut direction = SpatialHeader::IDENTITY_DIRECTION;
    for col in 0..3 {
        let norm = rows.iter().map(|r| r[col] * r[col]).sum::<f64>().sqrt();
        if norm > 0.0 {
            for (row, r) in rows.iter().enumerate() {
                direction[row * 3 + col] = r[col] / norm;
            }
        }
    }
    (rows.map(|r| r[3]), direction)
}

/// Origin and rotation from the quaternion fields; `pixdim[0] < 0`
/// flips the third axis.
fn qform_frame(header: &NiftiHeader) -> ([f64; 3], [f64; 9]) {
    let [b, c, d] = [header.quatern_b, header.quatern_c, header.quatern_d].map(f64::from);
    let a = (1.0 - (b * b + c * c + d * d)).max(0.0).sqrt();
    let qfac = if header.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
    let direction = [
        a * a + b * b - c * c - d * d,
        2.0 * (b * c - a * d),
        qfac * 2.0 * (b * d + a * c),
        2.0 * (b * c + a * d),
        a * a + c * c - b * b - d * d,
        qfac * 2.0 * (c * d - a * b),
        2.0 * (b * d - a * c),
        2.0 * (c * d + a * b),
        qfac * (a * a + d * d - b * b - c * c),
    ];
    let origin = [header.quatern_x, header.quatern_y, header.quatern_z].map(f64::from);
    (origin, direction)
}

fn unscaled(template: &NiftiHeader) -> NiftiHeader {
    NiftiHeader {
        scl_slope: 1.0,
        scl_inter: 0.0,
        ..template.clone()
    }
}

fn fortran_array<T>(path: &Path, shape: Shape, data: Vec<T>) -> Result<Array3<T>, IoError> {
    let [nx, ny, nz] = shape.as_array();
    Array3::from_shape_vec((nx, ny, nz).f(), data).map_err(|e| IoError::persistence(path, e))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn assert_close(a: &[f64], b: &[f64], tol: f64) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() < tol, "{a:?} vs {b:?}");
        }
    }

    #[test]
    fn header_for_encodes_affine() {
        let geometry = ReferenceGeometry {
            shape: Shape::new(4, 5, 6),
            header: SpatialHeader {
                spacing: [0.5, 0.75, 2.0],
                origin: [-10.0, 4.0, 1.5],
                direction: [-1.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0, 1.0],
            },
        };
        let h = header_for(&geometry).unwrap();
        assert_eq!(h.dim[..4], [3, 4, 5, 6]);
        assert_eq!(h.srow_x, [-0.5, 0.0, 0.0, -10.0]);
        assert_eq!(h.srow_y, [0.0, -0.75, 0.0, 4.0]);
        assert_eq!(h.srow_z, [0.0, 0.0, 2.0, 1.5]);

        let back = spatial_header(Path::new("x.nii"), &h).unwrap();
        assert_close(&back.spacing, &geometry.header.spacing, 1e-6);
        assert_close(&back.origin, &geometry.header.origin, 1e-6);
        assert_close(&back.direction, &geometry.header.direction, 1e-6);
        assert_eq!(grid_shape(Path::new("x.nii"), &h).unwrap(), geometry.shape);
    }

    #[test]
    fn header_for_rejects_huge_dimension() {
        let geometry = ReferenceGeometry {
            shape: Shape::new(70_000, 1, 1),
            header: SpatialHeader::default(),
        };
        assert!(matches!(
            header_for(&geometry),
            Err(PipelineError::InvalidVolume(_))
        ));
    }

    #[test]
    fn identity_quaternion() {
        let h = NiftiHeader {
            pixdim: [1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0],
            qform_code: 1,
            sform_code: 0,
            quatern_x: 3.0,
            ..NiftiHeader::default()
        };
        let (origin, direction) = qform_frame(&h);
        assert_close(&origin, &[3.0, 0.0, 0.0], 1e-12);
        assert_close(&direction, &SpatialHeader::IDENTITY_DIRECTION, 1e-12);
    }

    #[test]
    fn quaternion_half_turn_about_z() {
        let h = NiftiHeader {
            quatern_d: 1.0,
            pixdim: [-1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0],
            ..NiftiHeader::default()
        };
        let (_, direction) = qform_frame(&h);
        assert_close(
            &direction,
            &[-1.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0, -1.0],
            1e-12,
        );
    }

    #[test]
    fn extra_axes_must_be_singleton() {
        let mut h = NiftiHeader {
            dim: [4, 3, 3, 3, 1, 1, 1, 1],
            ..NiftiHeader::default()
        };
        assert_eq!(grid_shape(Path::new("a.nii"), &h).unwrap(), Shape::new(3, 3, 3));
        h.dim[4] = 2;
        assert!(matches!(
            grid_shape(Path::new("a.nii"), &h),
            Err(IoError::UnsupportedLayout { .. })
        ));
        h.dim = [2, 8, 9, 1, 1, 1, 1, 1];
        assert_eq!(grid_shape(Path::new("a.nii"), &h).unwrap(), Shape::new(8, 9, 1));
    }

    #[test]
    fn zero_spacing_is_unsupported() {
        let h = NiftiHeader {
            pixdim: [1.0, 1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0],
            ..NiftiHeader::default()
        };
        assert!(matches!(
            spatial_header(Path::new("z.nii"), &h),
            Err(IoError::UnsupportedLayout { .. })
        ));
    }
}
