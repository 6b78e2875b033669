//! Dense 3D voxel volumes stored as a flat buffer plus a shape descriptor.
//!
//! Voxels are laid out with `x` varying fastest, then `y`, then `z`
//! (the same order NIfTI stores them on disk). Every per-voxel loop in
//! the pipeline walks the flat buffer directly; [`Shape::index`] and
//! [`Shape::coords`] convert between linear indices and `(x, y, z)`.

use serde::{Deserialize, Serialize};

use crate::types::PipelineError;

/// Voxel grid dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    /// Voxels along the first (fastest-varying) axis.
    pub nx: usize,
    /// Voxels along the second axis.
    pub ny: usize,
    /// Voxels along the third (slowest-varying) axis.
    pub nz: usize,
}

impl Shape {
    /// Create a new shape.
    #[must_use]
    pub const fn new(nx: usize, ny: usize, nz: usize) -> Self {
        Self { nx, ny, nz }
    }

    /// Total number of voxels.
    #[must_use]
    pub const fn len(self) -> usize {
        self.nx * self.ny * self.nz
    }

    /// Returns `true` if any axis has zero extent.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.len() == 0
    }

    /// Linear index of voxel `(x, y, z)`.
    #[must_use]
    pub const fn index(self, x: usize, y: usize, z: usize) -> usize {
        (z * self.ny + y) * self.nx + x
    }

    /// `(x, y, z)` coordinates of a linear index.
    #[must_use]
    pub const fn coords(self, index: usize) -> [usize; 3] {
        let x = index % self.nx;
        let y = (index / self.nx) % self.ny;
        let z = index / (self.nx * self.ny);
        [x, y, z]
    }

    /// Linear index of `(x, y, z)` shifted by `offset`, or `None` when the
    /// shifted position falls outside the grid.
    #[must_use]
    pub fn offset_index(self, [x, y, z]: [usize; 3], offset: [isize; 3]) -> Option<usize> {
        let px = x.checked_add_signed(offset[0]).filter(|&v| v < self.nx)?;
        let py = y.checked_add_signed(offset[1]).filter(|&v| v < self.ny)?;
        let pz = z.checked_add_signed(offset[2]).filter(|&v| v < self.nz)?;
        Some(self.index(px, py, pz))
    }

    /// Extents as an array, `[nx, ny, nz]`.
    #[must_use]
    pub const fn as_array(self) -> [usize; 3] {
        [self.nx, self.ny, self.nz]
    }
}

/// Physical placement of a voxel grid: spacing, origin and orientation.
///
/// `direction` is a row-major 3×3 matrix whose columns are the unit
/// vectors of the voxel axes in world space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpatialHeader {
    /// Physical voxel size along each axis (millimetres).
    pub spacing: [f64; 3],
    /// World coordinates of the centre of voxel `(0, 0, 0)`.
    pub origin: [f64; 3],
    /// Direction cosines, row-major.
    pub direction: [f64; 9],
}

impl SpatialHeader {
    /// Identity orientation.
    pub const IDENTITY_DIRECTION: [f64; 9] = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];

    /// Header with the given spacing, zero origin and identity orientation.
    #[must_use]
    pub const fn with_spacing(spacing: [f64; 3]) -> Self {
        Self {
            spacing,
            origin: [0.0; 3],
            direction: Self::IDENTITY_DIRECTION,
        }
    }

    /// Volume of one voxel in cubic millimetres.
    #[must_use]
    pub fn voxel_volume(&self) -> f64 {
        self.spacing.iter().product()
    }

    /// Smallest spacing across the three axes.
    #[must_use]
    pub fn min_spacing(&self) -> f64 {
        self.spacing.iter().copied().fold(f64::INFINITY, f64::min)
    }
}

impl Default for SpatialHeader {
    fn default() -> Self {
        Self::with_spacing([1.0; 3])
    }
}

/// A dense 3D array of voxels with its spatial header.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume<T> {
    shape: Shape,
    header: SpatialHeader,
    data: Vec<T>,
}

/// Binary mask: every voxel is `0` or `1`.
pub type BinaryMask = Volume<u8>;

/// Voxelwise foreground probability, every value in `[0, 1]`.
pub type ProbabilityMap = Volume<f64>;

impl<T> Volume<T> {
    /// Wrap an existing buffer.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidVolume`] if `data.len()` does not
    /// match `shape.len()`.
    pub fn new(shape: Shape, header: SpatialHeader, data: Vec<T>) -> Result<Self, PipelineError> {
        if data.len() != shape.len() {
            return Err(PipelineError::InvalidVolume(format!(
                "buffer holds {} voxels but shape {}x{}x{} needs {}",
                data.len(),
                shape.nx,
                shape.ny,
                shape.nz,
                shape.len(),
            )));
        }
        Ok(Self {
            shape,
            header,
            data,
        })
    }

    /// Build a volume by evaluating `f(x, y, z)` for every voxel.
    pub fn from_fn(
        shape: Shape,
        header: SpatialHeader,
        mut f: impl FnMut(usize, usize, usize) -> T,
    ) -> Self {
        let data = (0..shape.len())
            .map(|i| {
                let [x, y, z] = shape.coords(i);
                f(x, y, z)
            })
            .collect();
        Self {
            shape,
            header,
            data,
        }
    }

    /// Grid dimensions.
    #[must_use]
    pub const fn shape(&self) -> Shape {
        self.shape
    }

    /// Spatial header.
    #[must_use]
    pub const fn header(&self) -> &SpatialHeader {
        &self.header
    }

    /// Voxel values in `x`-fastest order.
    #[must_use]
    pub fn data(&self) -> &[T] {
        &self.data
    }

    /// Mutable voxel values in `x`-fastest order.
    #[must_use]
    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Value at `(x, y, z)`, or `None` when out of bounds.
    #[must_use]
    pub fn get(&self, x: usize, y: usize, z: usize) -> Option<&T> {
        if x >= self.shape.nx || y >= self.shape.ny || z >= self.shape.nz {
            return None;
        }
        self.data.get(self.shape.index(x, y, z))
    }

    /// Replace the spatial header, keeping the voxel data.
    #[must_use]
    pub fn with_header(mut self, header: SpatialHeader) -> Self {
        self.header = header;
        self
    }

    /// Apply `f` to every voxel, keeping shape and header.
    #[must_use]
    pub fn map<U>(&self, f: impl FnMut(&T) -> U) -> Volume<U> {
        Volume {
            shape: self.shape,
            header: self.header,
            data: self.data.iter().map(f).collect(),
        }
    }
}

impl<T: Clone> Volume<T> {
    /// A volume with every voxel set to `value`.
    #[must_use]
    pub fn filled(shape: Shape, header: SpatialHeader, value: T) -> Self {
        Self {
            shape,
            header,
            data: vec![value; shape.len()],
        }
    }
}

impl BinaryMask {
    /// Number of foreground voxels.
    #[must_use]
    pub fn count_foreground(&self) -> usize {
        self.data.iter().filter(|&&v| v != 0).count()
    }

    /// Returns `true` if the voxel at linear index `i` is foreground.
    #[must_use]
    pub fn is_foreground(&self, i: usize) -> bool {
        self.data.get(i).is_some_and(|&v| v != 0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn index_and_coords_roundtrip() {
        let shape = Shape::new(4, 3, 2);
        for i in 0..shape.len() {
            let [x, y, z] = shape.coords(i);
            assert_eq!(shape.index(x, y, z), i);
        }
        assert_eq!(shape.index(1, 0, 0), 1);
        assert_eq!(shape.index(0, 1, 0), 4);
        assert_eq!(shape.index(0, 0, 1), 12);
    }

    #[test]
    fn offset_index_rejects_out_of_bounds() {
        let shape = Shape::new(3, 3, 3);
        assert_eq!(shape.offset_index([0, 0, 0], [-1, 0, 0]), None);
        assert_eq!(shape.offset_index([2, 1, 1], [1, 0, 0]), None);
        assert_eq!(
            shape.offset_index([1, 1, 1], [1, -1, 1]),
            Some(shape.index(2, 0, 2))
        );
    }

    #[test]
    fn new_rejects_mismatched_buffer() {
        let result = Volume::new(Shape::new(2, 2, 2), SpatialHeader::default(), vec![0u8; 7]);
        assert!(matches!(result, Err(PipelineError::InvalidVolume(_))));
    }

    #[test]
    fn from_fn_places_values() {
        let v = Volume::from_fn(Shape::new(3, 2, 2), SpatialHeader::default(), |x, y, z| {
            x + 10 * y + 100 * z
        });
        assert_eq!(*v.get(2, 1, 1).unwrap(), 112);
        assert_eq!(v.get(3, 0, 0), None);
    }

    #[test]
    fn header_derived_quantities() {
        let h = SpatialHeader::with_spacing([0.5, 2.0, 1.0]);
        assert!((h.voxel_volume() - 1.0).abs() < 1e-12);
        assert!((h.min_spacing() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn count_foreground_counts_nonzero() {
        let mut m = BinaryMask::filled(Shape::new(2, 2, 2), SpatialHeader::default(), 0);
        m.data_mut()[3] = 1;
        m.data_mut()[5] = 1;
        assert_eq!(m.count_foreground(), 2);
        assert!(m.is_foreground(3));
        assert!(!m.is_foreground(4));
    }
}
