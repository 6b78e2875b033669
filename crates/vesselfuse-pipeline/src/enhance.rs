//! Vessel connectivity enhancement.
//!
//! Vessel size statistics are measured on the rater masks and used to
//! repair the consensus: a closing with a kernel matched to the typical
//! vessel radius reconnects fragments, and components smaller than a
//! cylinder of that radius and the shortest observed vessel length are
//! dropped as noise.
//!
//! Statistics are aggregated with medians across raters so one noisy
//! rater cannot dominate:
//!
//! ```text
//! radius_mm      = median_i( median_components(minor_i) / 2 )
//! min_length_mm  = median_i( min_components(major_i) )
//! min_volume_mm3 = median_i( min_components(volume_i) )
//! ```
//!
//! When a statistic is undefined the enhancement is skipped and the
//! unenhanced consensus is kept ([`EnhancementOutcome::Skipped`]).

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::components::{component_stats, remove_small_components};
use crate::morphology::{Element, close};
use crate::stats::{median, sorted};
use crate::validate::RaterSet;
use crate::volume::BinaryMask;

/// Component statistics of one rater mask.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RaterVesselSummary {
    /// Number of 26-connected components.
    pub component_count: usize,
    /// Median component volume.
    pub median_volume_mm3: f64,
    /// Median minor-axis extent.
    pub median_diameter_mm: f64,
    /// Median major-axis extent.
    pub median_length_mm: f64,
    /// Smallest component volume.
    pub min_volume_mm3: f64,
    /// Smallest minor-axis extent.
    pub min_diameter_mm: f64,
    /// Smallest major-axis extent.
    pub min_length_mm: f64,
}

/// Per-rater vessel statistics and the parameters recommended from them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VesselCharacteristics {
    /// One summary per rater, in rater order.
    pub raters: Vec<RaterVesselSummary>,
    /// Typical vessel radius.
    pub recommended_radius_mm: f64,
    /// Shortest plausible vessel fragment.
    pub recommended_min_length_mm: f64,
    /// Smallest plausible vessel volume. Reported only.
    pub recommended_min_volume_mm3: f64,
}

/// Why vessel statistics could not be derived.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DegenerateStatistics {
    /// A rater mask has no foreground component.
    #[error("rater {rater} has no connected components")]
    NoComponents {
        /// Index of the empty rater.
        rater: usize,
    },
    /// An aggregated statistic is NaN or infinite.
    #[error("{statistic} is not finite")]
    NonFinite {
        /// Name of the statistic.
        statistic: &'static str,
    },
}

/// Kernel and size cut derived from vessel statistics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnhancementParameters {
    /// Vessel radius the kernel was derived from.
    pub radius_mm: f64,
    /// Minimum vessel length used for the size cut.
    pub min_length_mm: f64,
    /// Closing radius in voxels: `round(radius_mm / min(spacing))`.
    pub kernel_radius_voxels: usize,
    /// Components with fewer voxels are removed.
    pub min_object_size: usize,
}

/// What the enhancer did to the consensus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EnhancementOutcome {
    /// Closing and pruning were applied.
    Applied {
        /// Statistics the parameters came from.
        characteristics: VesselCharacteristics,
        /// Parameters used.
        parameters: EnhancementParameters,
        /// Components removed by the size cut.
        components_removed: usize,
    },
    /// Statistics were undefined; the consensus is unchanged.
    Skipped {
        /// Human-readable cause.
        reason: String,
    },
}

/// Enhanced consensus mask and how it was obtained.
#[derive(Debug, Clone, PartialEq)]
pub struct EnhancementResult {
    /// The consensus after enhancement (or unchanged when skipped).
    pub mask: BinaryMask,
    /// What happened.
    pub outcome: EnhancementOutcome,
}

/// Measure vessel components of every rater and aggregate them.
///
/// # Errors
///
/// Returns [`DegenerateStatistics`] when a rater has no components or
/// an aggregate is not finite.
pub fn analyze_vessel_characteristics(
    raters: &RaterSet,
) -> Result<VesselCharacteristics, DegenerateStatistics> {
    let summaries = raters
        .masks()
        .iter()
        .enumerate()
        .map(|(rater, mask)| summarize(mask).ok_or(DegenerateStatistics::NoComponents { rater }))
        .collect::<Result<Vec<_>, _>>()?;

    let aggregate = |statistic: &'static str, f: fn(&RaterVesselSummary) -> f64| {
        median(&sorted(summaries.iter().map(f).collect()))
            .filter(|v| v.is_finite())
            .ok_or(DegenerateStatistics::NonFinite { statistic })
    };

    let characteristics = VesselCharacteristics {
        recommended_radius_mm: aggregate("recommended radius", |s| s.median_diameter_mm / 2.0)?,
        recommended_min_length_mm: aggregate("recommended minimum length", |s| s.min_length_mm)?,
        recommended_min_volume_mm3: aggregate("recommended minimum volume", |s| s.min_volume_mm3)?,
        raters: summaries,
    };
    debug!(
        radius_mm = characteristics.recommended_radius_mm,
        min_length_mm = characteristics.recommended_min_length_mm,
        min_volume_mm3 = characteristics.recommended_min_volume_mm3,
        "vessel characteristics"
    );
    Ok(characteristics)
}

/// Summarise one mask, or `None` if it has no components.
fn summarize(mask: &BinaryMask) -> Option<RaterVesselSummary> {
    let stats = component_stats(mask);
    let volumes = sorted(stats.iter().map(|s| s.volume_mm3).collect());
    let diameters = sorted(stats.iter().map(|s| s.minor_axis_mm).collect());
    let lengths = sorted(stats.iter().map(|s| s.major_axis_mm).collect());
    Some(RaterVesselSummary {
        component_count: stats.len(),
        median_volume_mm3: median(&volumes)?,
        median_diameter_mm: median(&diameters)?,
        median_length_mm: median(&lengths)?,
        min_volume_mm3: *volumes.first()?,
        min_diameter_mm: *diameters.first()?,
        min_length_mm: *lengths.first()?,
    })
}

/// Derive the closing kernel and size cut for a grid.
///
/// Rounding is half-to-even.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn enhancement_parameters(
    radius_mm: f64,
    min_length_mm: f64,
    min_spacing: f64,
    voxel_volume: f64,
) -> EnhancementParameters {
    let kernel = (radius_mm / min_spacing).round_ties_even().max(0.0);
    let min_volume_mm3 = PI * radius_mm * radius_mm * min_length_mm;
    let size = (min_volume_mm3 / voxel_volume).round_ties_even().max(0.0);
    EnhancementParameters {
        radius_mm,
        min_length_mm,
        kernel_radius_voxels: kernel as usize,
        min_object_size: size as usize,
    }
}

/// Close `mask` with a cube matched to `radius_mm`, then remove
/// components smaller than a cylinder of that radius and
/// `min_length_mm`.
///
/// Returns the enhanced mask, the parameters used, and the number of
/// components removed.
#[must_use]
pub fn enhance_vessel_connectivity(
    mask: &BinaryMask,
    radius_mm: f64,
    min_length_mm: f64,
) -> (BinaryMask, EnhancementParameters, usize) {
    let header = mask.header();
    let parameters =
        enhancement_parameters(radius_mm, min_length_mm, header.min_spacing(), header.voxel_volume());
    debug!(
        kernel_radius = parameters.kernel_radius_voxels,
        min_object_size = parameters.min_object_size,
        "enhancing vessel connectivity"
    );

    let closed = close(mask, parameters.kernel_radius_voxels, Element::Cube);
    let (pruned, removed) = remove_small_components(&closed, parameters.min_object_size);
    (pruned, parameters, removed)
}

/// Analyse `raters` and enhance `consensus`, keeping it unchanged when
/// the statistics are degenerate.
#[must_use]
pub fn enhance(consensus: &BinaryMask, raters: &RaterSet) -> EnhancementResult {
    match analyze_vessel_characteristics(raters) {
        Ok(characteristics) => {
            let (mask, parameters, components_removed) = enhance_vessel_connectivity(
                consensus,
                characteristics.recommended_radius_mm,
                characteristics.recommended_min_length_mm,
            );
            EnhancementResult {
                mask,
                outcome: EnhancementOutcome::Applied {
                    characteristics,
                    parameters,
                    components_removed,
                },
            }
        }
        Err(e) => {
            warn!(error = %e, "vessel enhancement skipped, keeping unenhanced consensus");
            EnhancementResult {
                mask: consensus.clone(),
                outcome: EnhancementOutcome::Skipped {
                    reason: e.to_string(),
                },
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::components::label_components;
    use crate::validate::ReferenceGeometry;
    use crate::volume::{Shape, SpatialHeader};

    fn mask_with(shape: Shape, voxels: &[[usize; 3]]) -> BinaryMask {
        let mut m = BinaryMask::filled(shape, SpatialHeader::default(), 0);
        for &[x, y, z] in voxels {
            let i = shape.index(x, y, z);
            m.data_mut()[i] = 1;
        }
        m
    }

    fn tube(x0: usize, x1: usize, y: usize, z: usize) -> Vec<[usize; 3]> {
        (x0..x1).map(|x| [x, y, z]).collect()
    }

    #[test]
    fn parameters_follow_cylinder_heuristic() {
        let p = enhancement_parameters(1.0, 5.0, 0.5, 0.25);
        assert_eq!(p.kernel_radius_voxels, 2);
        // pi * 1 * 5 / 0.25 = 62.83
        assert_eq!(p.min_object_size, 63);
    }

    #[test]
    fn kernel_rounds_half_to_even() {
        assert_eq!(enhancement_parameters(0.5, 1.0, 1.0, 1.0).kernel_radius_voxels, 0);
        assert_eq!(enhancement_parameters(1.5, 1.0, 1.0, 1.0).kernel_radius_voxels, 2);
    }

    #[test]
    fn closing_merges_voxels_two_millimetres_apart() {
        let shape = Shape::new(9, 11, 11);
        let m = mask_with(shape, &[[3, 5, 5], [5, 5, 5]]);
        assert_eq!(label_components(&m).count(), 2);

        let (out, params, removed) = enhance_vessel_connectivity(&m, 2.0, 0.1);
        assert_eq!(params.kernel_radius_voxels, 2);
        assert_eq!(removed, 0);
        assert_eq!(label_components(&out).count(), 1);
        assert_eq!(*out.get(4, 5, 5).unwrap(), 1);
    }

    #[test]
    fn one_millimetre_radius_merges_voxels_two_millimetres_apart() {
        let shape = Shape::new(9, 9, 9);
        for (a, b) in [([3, 4, 4], [5, 4, 4]), ([4, 3, 4], [4, 5, 4]), ([4, 4, 3], [4, 4, 5])] {
            let m = mask_with(shape, &[a, b]);
            for radius_mm in [1.0, 1.2, 1.49] {
                let (out, params, removed) = enhance_vessel_connectivity(&m, radius_mm, 0.1);
                assert_eq!(params.kernel_radius_voxels, 1);
                assert_eq!(removed, 0);
                assert_eq!(label_components(&out).count(), 1, "radius {radius_mm}");
            }
        }
    }

    #[test]
    fn small_isolated_component_is_removed() {
        let shape = Shape::new(16, 8, 8);
        let mut voxels = tube(0, 12, 2, 2);
        voxels.push([14, 6, 6]);
        let m = mask_with(shape, &voxels);

        let (out, params, removed) = enhance_vessel_connectivity(&m, 0.4, 20.0);
        assert_eq!(params.kernel_radius_voxels, 0);
        assert_eq!(params.min_object_size, 10);
        assert_eq!(removed, 1);
        assert_eq!(out.count_foreground(), 12);
        assert_eq!(*out.get(14, 6, 6).unwrap(), 0);
    }

    #[test]
    fn characteristics_aggregate_with_medians() {
        let shape = Shape::new(20, 8, 8);
        let g = ReferenceGeometry {
            shape,
            header: SpatialHeader::default(),
        };
        let a = mask_with(shape, &tube(0, 10, 2, 2));
        let mut b_voxels = tube(0, 10, 2, 2);
        b_voxels.extend(tube(12, 16, 6, 6));
        let b = mask_with(shape, &b_voxels);
        let c = mask_with(shape, &tube(0, 18, 4, 4));
        let set = RaterSet::new(g, vec![a, b, c]).unwrap();

        let ch = analyze_vessel_characteristics(&set).unwrap();
        assert_eq!(ch.raters.len(), 3);
        assert_eq!(ch.raters[1].component_count, 2);
        // Min lengths are 10, 4 and 18 voxels long tubes; the median is rater a's.
        assert!((ch.recommended_min_length_mm - 10.0).abs() < 1e-6);
        assert!((ch.recommended_min_volume_mm3 - 10.0).abs() < 1e-9);
        assert!(ch.recommended_radius_mm >= 0.5 - 1e-9);
        assert!(ch.recommended_radius_mm < 1.0);
    }

    #[test]
    fn empty_rater_skips_enhancement() {
        let shape = Shape::new(8, 8, 8);
        let g = ReferenceGeometry {
            shape,
            header: SpatialHeader::default(),
        };
        let a = mask_with(shape, &tube(0, 6, 3, 3));
        let b = mask_with(shape, &[]);
        let set = RaterSet::new(g, vec![a.clone(), b]).unwrap();

        let consensus = mask_with(shape, &[[1, 1, 1]]);
        let enhanced = enhance(&consensus, &set);
        assert_eq!(enhanced.mask, consensus);
        assert!(matches!(
            enhanced.outcome,
            EnhancementOutcome::Skipped { ref reason } if reason.contains("rater 1")
        ));
    }

    #[test]
    fn enhance_applies_with_valid_raters() {
        let shape = Shape::new(16, 8, 8);
        let g = ReferenceGeometry {
            shape,
            header: SpatialHeader::default(),
        };
        // Short rater tubes keep the size cut well below the consensus line.
        let short = tube(1, 5, 3, 3);
        let set = RaterSet::new(g, vec![mask_with(shape, &short), mask_with(shape, &short)]).unwrap();

        let line = tube(1, 13, 3, 3);
        let mut consensus_voxels = line.clone();
        consensus_voxels.push([14, 7, 7]);
        let consensus = mask_with(shape, &consensus_voxels);

        let enhanced = enhance(&consensus, &set);
        let EnhancementOutcome::Applied {
            components_removed, ..
        } = enhanced.outcome
        else {
            unreachable!("enhancement should apply");
        };
        assert_eq!(components_removed, 1);
        assert_eq!(*enhanced.mask.get(14, 7, 7).unwrap(), 0);
        for &[x, y, z] in &line {
            assert_eq!(*enhanced.mask.get(x, y, z).unwrap(), 1);
        }
    }
}
