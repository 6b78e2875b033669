//! Gap analysis: how far background voxels lie from the nearest vessel.
//!
//! For each rater the physical Euclidean distance from every background
//! voxel to the nearest foreground voxel is measured, and the
//! distribution summarised. Pooled over all raters, the 25th percentile
//! is a conservative dilation radius and the median a moderate closing
//! radius. Purely diagnostic: nothing here feeds back into the
//! consensus.

use serde::{Deserialize, Serialize};

use crate::distance::squared_distance;
use crate::stats::{median, percentile, sorted};
use crate::validate::RaterSet;
use crate::volume::BinaryMask;

/// Gap distribution of one rater, in millimetres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RaterGapSummary {
    /// Median background-to-vessel distance.
    pub median_gap_mm: f64,
    /// Smallest distance.
    pub min_gap_mm: f64,
    /// Largest distance.
    pub max_gap_mm: f64,
    /// 25th percentile.
    pub p25_gap_mm: f64,
    /// 75th percentile.
    pub p75_gap_mm: f64,
}

/// Gap statistics of every rater plus pooled recommendations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapAnalysis {
    /// Per rater; `None` when the rater has no foreground or no
    /// background.
    pub raters: Vec<Option<RaterGapSummary>>,
    /// 25th percentile of all gaps.
    pub recommended_dilation_radius_mm: Option<f64>,
    /// Median of all gaps.
    pub recommended_closing_radius_mm: Option<f64>,
}

/// Analyse gaps of every rater in `raters`.
#[must_use]
pub fn analyze_gap_sizes(raters: &RaterSet) -> GapAnalysis {
    let per_rater: Vec<Vec<f64>> = raters.masks().iter().map(gap_distances).collect();

    let summaries = per_rater.iter().map(|gaps| summarize(gaps)).collect();
    let pooled = sorted(per_rater.into_iter().flatten().collect());

    GapAnalysis {
        raters: summaries,
        recommended_dilation_radius_mm: percentile(&pooled, 25.0),
        recommended_closing_radius_mm: median(&pooled),
    }
}

/// Sorted distances (mm) from each background voxel to the nearest
/// foreground voxel. Empty when the mask has no foreground.
#[must_use]
pub fn gap_distances(mask: &BinaryMask) -> Vec<f64> {
    let weights = mask.header().spacing.map(|s| s * s);
    let dist = squared_distance(mask.shape(), weights, |i| mask.is_foreground(i));
    sorted(
        dist.into_iter()
            .filter(|d| *d > 0.0 && d.is_finite())
            .map(f64::sqrt)
            .collect(),
    )
}

fn summarize(sorted_gaps: &[f64]) -> Option<RaterGapSummary> {
    Some(RaterGapSummary {
        median_gap_mm: median(sorted_gaps)?,
        min_gap_mm: *sorted_gaps.first()?,
        max_gap_mm: *sorted_gaps.last()?,
        p25_gap_mm: percentile(sorted_gaps, 25.0)?,
        p75_gap_mm: percentile(sorted_gaps, 75.0)?,
    })
}
