//! PNG previews of the middle axial slice of a case.
//!
//! A preview is a horizontal strip of grayscale panels separated by a
//! thin black gutter: one per rater, then the STAPLE probability map,
//! then each consensus mask. Masks render as 0/255, probabilities
//! linearly.

use std::path::Path;

use image::{GrayImage, ImageEncoder, Luma};
use vesselfuse_pipeline::{CaseOutputs, ProbabilityMap, Volume};

use crate::error::IoError;

/// Gutter width between panels, in pixels.
const GUTTER: u32 = 2;

/// Index of the middle axial slice.
#[must_use]
pub const fn middle_slice<T>(volume: &Volume<T>) -> usize {
    volume.shape().nz / 2
}

/// Axial slice `z` of `volume`, converting each voxel with `gray`.
///
/// Returns `None` when `z` is out of range or the slice does not fit
/// into image dimensions.
pub fn axial_slice<T>(volume: &Volume<T>, z: usize, gray: impl Fn(&T) -> u8) -> Option<GrayImage> {
    let shape = volume.shape();
    if z >= shape.nz {
        return None;
    }
    let width = u32::try_from(shape.nx).ok()?;
    let height = u32::try_from(shape.ny).ok()?;
    let start = shape.index(0, 0, z);
    let pixels = volume.data()[start..start + shape.nx * shape.ny]
        .iter()
        .map(gray)
        .collect();
    GrayImage::from_raw(width, height, pixels)
}

/// Panels laid out left to right with a gutter between them.
///
/// Panels shorter than the tallest are top-aligned.
#[must_use]
pub fn montage(panels: &[GrayImage]) -> GrayImage {
    let gutters = u32::try_from(panels.len().saturating_sub(1)).unwrap_or(0) * GUTTER;
    let width = panels.iter().map(GrayImage::width).sum::<u32>() + gutters;
    let height = panels.iter().map(GrayImage::height).max().unwrap_or(0);

    let mut canvas = GrayImage::from_pixel(width, height, Luma([0]));
    let mut left = 0i64;
    for panel in panels {
        image::imageops::replace(&mut canvas, panel, left, 0);
        left += i64::from(panel.width() + GUTTER);
    }
    canvas
}

/// Middle-slice montage of one processed case.
///
/// Rater panels show the normalised rater masks of the enhanced run,
/// followed by its probability map, the enhanced consensus and the base
/// consensus. Returns `None` for grids too large to render.
#[must_use]
pub fn case_preview(case: &CaseOutputs) -> Option<GrayImage> {
    let enhanced = &case.enhanced.result;
    let probabilities: &ProbabilityMap = &enhanced.estimate.probabilities;
    let z = middle_slice(probabilities);

    let mut panels = enhanced
        .raters
        .masks()
        .iter()
        .map(|m| axial_slice(m, z, mask_gray))
        .collect::<Option<Vec<_>>>()?;
    panels.push(axial_slice(probabilities, z, probability_gray)?);
    panels.push(axial_slice(&enhanced.consensus.mask, z, mask_gray)?);
    panels.push(axial_slice(&case.base.result.consensus.mask, z, mask_gray)?);
    Some(montage(&panels))
}

/// Encode `image` as PNG bytes.
///
/// # Errors
///
/// Returns [`IoError::Image`] if PNG encoding fails.
pub fn encode_png(image: &GrayImage) -> Result<Vec<u8>, IoError> {
    let mut png = Vec::new();
    image::codecs::png::PngEncoder::new(&mut png).write_image(
        image.as_raw(),
        image.width(),
        image.height(),
        image::ExtendedColorType::L8,
    )?;
    Ok(png)
}

/// Encode `image` and write it to `path`.
///
/// # Errors
///
/// Returns [`IoError::Image`] if encoding fails and
/// [`IoError::Persistence`] if the file cannot be written.
pub fn write_png(path: &Path, image: &GrayImage) -> Result<(), IoError> {
    let png = encode_png(image)?;
    std::fs::write(path, png).map_err(|e| IoError::persistence(path, e))
}

const fn mask_gray(v: &u8) -> u8 {
    if *v == 0 { 0 } else { u8::MAX }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn probability_gray(p: &f64) -> u8 {
    (p.clamp(0.0, 1.0) * 255.0).round() as u8
}
