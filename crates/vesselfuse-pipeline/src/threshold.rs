//! Thresholding: turn a probability map into a binary consensus.
//!
//! This module defines the [`Thresholder`] trait and the
//! [`ThresholdKind`] enum selecting fixed or adaptive thresholding.
//!
//! Adaptive mode splits the volume into a *candidate* region (voxels
//! marked by at least one rater) and its complement, and derives one
//! threshold per region from the probability distribution inside it:
//!
//! ```text
//! lower  = mean(P | candidate)  - std(P | candidate)
//! higher = mean(P | background) + std(P | background)
//! ```
//!
//! A candidate voxel is foreground when `P > lower`; a background voxel
//! when `P > higher`. Standard deviations are population (divide by `n`).

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::volume::{BinaryMask, ProbabilityMap};

/// Selects which thresholding rule to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ThresholdKind {
    /// `P > confidence_threshold` everywhere.
    Fixed,
    /// Region-aware thresholds; falls back to [`Fixed`](Self::Fixed)
    /// when either region is empty.
    #[default]
    Adaptive,
}

impl ThresholdKind {
    /// Kind selected by the `do_adaptive_thresholding` flag.
    #[must_use]
    pub const fn from_flag(adaptive: bool) -> Self {
        if adaptive { Self::Adaptive } else { Self::Fixed }
    }
}

/// Thresholds actually applied to produce a mask.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum AppliedThreshold {
    /// A single global threshold.
    Fixed {
        /// The threshold.
        threshold: f64,
    },
    /// Per-region thresholds.
    Adaptive(AdaptiveThresholds),
}

/// Region statistics and the thresholds derived from them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveThresholds {
    /// Threshold inside the candidate region.
    pub lower: f64,
    /// Threshold in the background region.
    pub higher: f64,
    /// Mean probability over candidate voxels.
    pub candidate_mean: f64,
    /// Population standard deviation over candidate voxels.
    pub candidate_std: f64,
    /// Mean probability over background voxels.
    pub background_mean: f64,
    /// Population standard deviation over background voxels.
    pub background_std: f64,
}

/// A thresholded consensus mask with the thresholds that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdResult {
    /// Binary consensus mask.
    pub mask: BinaryMask,
    /// Thresholds used.
    pub applied: AppliedThreshold,
}

/// Trait for thresholding strategies.
pub trait Thresholder {
    /// Binarise `probabilities`.
    ///
    /// `candidate` is the union of the rater masks that fed the
    /// estimator. `confidence` is the fixed threshold, also used as the
    /// adaptive fallback.
    fn threshold(
        &self,
        probabilities: &ProbabilityMap,
        candidate: &BinaryMask,
        confidence: f64,
    ) -> ThresholdResult;
}

impl Thresholder for ThresholdKind {
    fn threshold(
        &self,
        probabilities: &ProbabilityMap,
        candidate: &BinaryMask,
        confidence: f64,
    ) -> ThresholdResult {
        match *self {
            Self::Fixed => fixed(probabilities, confidence),
            Self::Adaptive => match adaptive_thresholds(probabilities, candidate) {
                Some(t) => ThresholdResult {
                    mask: apply_adaptive(probabilities, candidate, &t),
                    applied: AppliedThreshold::Adaptive(t),
                },
                None => {
                    debug!(confidence, "candidate or background region empty, using fixed threshold");
                    fixed(probabilities, confidence)
                }
            },
        }
    }
}

fn fixed(probabilities: &ProbabilityMap, threshold: f64) -> ThresholdResult {
    debug!(threshold, "fixed threshold");
    ThresholdResult {
        mask: probabilities.map(|&p| u8::from(p > threshold)),
        applied: AppliedThreshold::Fixed { threshold },
    }
}

/// Region thresholds for `probabilities`, or `None` when the candidate
/// region or its complement is empty.
#[must_use]
pub fn adaptive_thresholds(
    probabilities: &ProbabilityMap,
    candidate: &BinaryMask,
) -> Option<AdaptiveThresholds> {
    let inside = RegionStats::collect(probabilities, candidate, true)?;
    let outside = RegionStats::collect(probabilities, candidate, false)?;
    let thresholds = AdaptiveThresholds {
        lower: inside.mean - inside.std,
        higher: outside.mean + outside.std,
        candidate_mean: inside.mean,
        candidate_std: inside.std,
        background_mean: outside.mean,
        background_std: outside.std,
    };
    debug!(
        lower = thresholds.lower,
        higher = thresholds.higher,
        "adaptive thresholds"
    );
    Some(thresholds)
}

fn apply_adaptive(
    probabilities: &ProbabilityMap,
    candidate: &BinaryMask,
    t: &AdaptiveThresholds,
) -> BinaryMask {
    let mut mask = candidate.map(|_| 0u8);
    for ((m, &p), &c) in mask
        .data_mut()
        .iter_mut()
        .zip(probabilities.data())
        .zip(candidate.data())
    {
        let cut = if c != 0 { t.lower } else { t.higher };
        *m = u8::from(p > cut);
    }
    mask
}

struct RegionStats {
    mean: f64,
    std: f64,
}

impl RegionStats {
    /// Mean and population std of `P` where `candidate == inside`.
    #[allow(clippy::cast_precision_loss)]
    fn collect(probabilities: &ProbabilityMap, candidate: &BinaryMask, inside: bool) -> Option<Self> {
        let region = || {
            probabilities
                .data()
                .iter()
                .zip(candidate.data())
                .filter(move |&(_, &c)| (c != 0) == inside)
                .map(|(&p, _)| p)
        };
        let n = region().count();
        if n == 0 {
            return None;
        }
        let mean = region().sum::<f64>() / n as f64;
        let variance = region().map(|p| (p - mean) * (p - mean)).sum::<f64>() / n as f64;
        Some(Self {
            mean,
            std: variance.sqrt(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::volume::{Shape, SpatialHeader};

    fn line<T: Clone>(values: &[T]) -> crate::volume::Volume<T> {
        crate::volume::Volume::new(
            Shape::new(values.len(), 1, 1),
            SpatialHeader::default(),
            values.to_vec(),
        )
        .unwrap()
    }

    #[test]
    fn from_flag_selects_kind() {
        assert_eq!(ThresholdKind::from_flag(true), ThresholdKind::Adaptive);
        assert_eq!(ThresholdKind::from_flag(false), ThresholdKind::Fixed);
    }

    #[test]
    fn fixed_is_strictly_greater() {
        let p = line(&[0.2, 0.5, 0.51, 1.0]);
        let c = line(&[1u8, 1, 1, 1]);
        let out = ThresholdKind::Fixed.threshold(&p, &c, 0.5);
        assert_eq!(out.mask.data(), &[0, 0, 1, 1]);
        assert_eq!(out.applied, AppliedThreshold::Fixed { threshold: 0.5 });
    }

    #[test]
    fn population_statistics() {
        let p = line(&[0.2, 0.4, 0.0, 0.0]);
        let c = line(&[1u8, 1, 0, 0]);
        let t = adaptive_thresholds(&p, &c).unwrap();
        assert!((t.candidate_mean - 0.3).abs() < 1e-12);
        assert!((t.candidate_std - 0.1).abs() < 1e-12);
        assert!((t.lower - 0.2).abs() < 1e-12);
        assert!(t.background_mean.abs() < 1e-12);
        assert!(t.higher.abs() < 1e-12);
    }

    #[test]
    fn empty_region_falls_back_to_fixed() {
        let p = line(&[0.2, 0.7, 0.9]);
        let everywhere = line(&[1u8, 1, 1]);
        let out = ThresholdKind::Adaptive.threshold(&p, &everywhere, 0.5);
        assert_eq!(out.applied, AppliedThreshold::Fixed { threshold: 0.5 });
        assert_eq!(out.mask.data(), &[0, 1, 1]);

        let nowhere = line(&[0u8, 0, 0]);
        let out = ThresholdKind::Adaptive.threshold(&p, &nowhere, 0.8);
        assert_eq!(out.applied, AppliedThreshold::Fixed { threshold: 0.8 });
        assert_eq!(out.mask.data(), &[0, 0, 1]);
    }

    #[test]
    fn adaptive_orders_against_fixed() {
        let p = line(&[0.9, 0.45, 0.3, 0.8, 0.6, 0.0, 0.0, 0.0, 0.0, 0.6, 0.9]);
        let c = line(&[1u8, 1, 1, 1, 1, 0, 0, 0, 0, 0, 0]);

        let adaptive = ThresholdKind::Adaptive.threshold(&p, &c, 0.5);
        let t = adaptive_thresholds(&p, &c).unwrap();
        assert_eq!(adaptive.applied, AppliedThreshold::Adaptive(t));
        assert!(t.lower < 0.5 && 0.5 < t.higher, "{t:?}");

        let fixed = ThresholdKind::Fixed.threshold(&p, &c, 0.5);
        for i in 0..p.data().len() {
            let (a, f) = (adaptive.mask.data()[i], fixed.mask.data()[i]);
            if c.data()[i] != 0 {
                assert!(a >= f, "candidate voxel {i} lost by adaptive");
            } else {
                assert!(a <= f, "background voxel {i} gained by adaptive");
            }
        }
        // The 0.45 candidate voxel is recovered; the 0.6 background voxel is not.
        assert_eq!(adaptive.mask.data()[1], 1);
        assert_eq!(adaptive.mask.data()[9], 0);
    }
}
