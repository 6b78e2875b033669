//! Spatial consistency checks between the reference image and raters.
//!
//! Every rater mask must have exactly the reference's voxel dimensions
//! and a spacing within [`SPACING_RTOL`] relative tolerance. Origin and
//! orientation are not compared: rater masks inherit the reference
//! header once they pass, so small header drift between tools is
//! harmless.

use tracing::debug;

use crate::types::PipelineError;
use crate::volume::{BinaryMask, Shape, SpatialHeader};

/// Relative tolerance for spacing comparisons.
pub const SPACING_RTOL: f64 = 1e-3;

/// Absolute floor added to the spacing tolerance.
const SPACING_ATOL: f64 = 1e-8;

/// Grid and header of the reference image, which every rater and the
/// consensus output must share.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReferenceGeometry {
    /// Voxel dimensions.
    pub shape: Shape,
    /// Spacing, origin and orientation.
    pub header: SpatialHeader,
}

/// An ordered, validated set of at least two congruent binary masks.
///
/// Raters are addressed purely by index. Every mask carries the
/// reference header.
#[derive(Debug, Clone, PartialEq)]
pub struct RaterSet {
    geometry: ReferenceGeometry,
    masks: Vec<BinaryMask>,
}

impl RaterSet {
    /// Validate `masks` against `geometry` and adopt the reference header.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InsufficientRaters`] for fewer than two
    /// masks and [`PipelineError::SpatialMismatch`] when a mask's
    /// dimensions or spacing disagree with the reference.
    pub fn new(geometry: ReferenceGeometry, masks: Vec<BinaryMask>) -> Result<Self, PipelineError> {
        verify_spatial_consistency(&geometry, &masks)?;
        let masks = masks
            .into_iter()
            .map(|m| m.with_header(geometry.header))
            .collect();
        Ok(Self { geometry, masks })
    }

    /// Replace the masks of an already-validated set, e.g. after
    /// preprocessing. The new masks must keep the reference shape.
    pub(crate) fn with_masks(&self, masks: Vec<BinaryMask>) -> Self {
        debug_assert!(masks.iter().all(|m| m.shape() == self.geometry.shape));
        Self {
            geometry: self.geometry,
            masks,
        }
    }

    /// Reference geometry shared by all masks.
    #[must_use]
    pub const fn geometry(&self) -> &ReferenceGeometry {
        &self.geometry
    }

    /// The rater masks, in input order.
    #[must_use]
    pub fn masks(&self) -> &[BinaryMask] {
        &self.masks
    }

    /// Number of raters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.masks.len()
    }

    /// Always `false`: a rater set holds at least two masks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.masks.is_empty()
    }

    /// Logical OR of all masks.
    #[must_use]
    pub fn union(&self) -> BinaryMask {
        let mut union = BinaryMask::filled(self.geometry.shape, self.geometry.header, 0);
        for mask in &self.masks {
            for (u, &v) in union.data_mut().iter_mut().zip(mask.data()) {
                *u |= v;
            }
        }
        union
    }
}

/// Check that every mask matches the reference voxel grid and spacing.
///
/// # Errors
///
/// See [`RaterSet::new`].
pub fn verify_spatial_consistency(
    geometry: &ReferenceGeometry,
    masks: &[BinaryMask],
) -> Result<(), PipelineError> {
    if masks.len() < 2 {
        return Err(PipelineError::InsufficientRaters { found: masks.len() });
    }

    debug!(
        shape = ?geometry.shape,
        spacing = ?geometry.header.spacing,
        origin = ?geometry.header.origin,
        direction = ?geometry.header.direction,
        "reference geometry"
    );

    for (rater, mask) in masks.iter().enumerate() {
        debug!(
            rater,
            shape = ?mask.shape(),
            spacing = ?mask.header().spacing,
            origin = ?mask.header().origin,
            "rater geometry"
        );

        if mask.shape() != geometry.shape {
            let s = mask.shape();
            let r = geometry.shape;
            return Err(PipelineError::SpatialMismatch {
                rater,
                reason: format!(
                    "dimensions {}x{}x{} vs reference {}x{}x{}",
                    s.nx, s.ny, s.nz, r.nx, r.ny, r.nz
                ),
            });
        }

        if !spacing_close(&mask.header().spacing, &geometry.header.spacing) {
            return Err(PipelineError::SpatialMismatch {
                rater,
                reason: format!(
                    "spacing {:?} vs reference {:?}",
                    mask.header().spacing,
                    geometry.header.spacing
                ),
            });
        }
    }
    Ok(())
}

/// Element-wise `|a - b| <= atol + rtol * |b|`.
fn spacing_close(a: &[f64; 3], b: &[f64; 3]) -> bool {
    a.iter()
        .zip(b)
        .all(|(&x, &y)| (x - y).abs() <= SPACING_RTOL.mul_add(y.abs(), SPACING_ATOL))
}
