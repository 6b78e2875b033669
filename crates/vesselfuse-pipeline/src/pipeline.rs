//! Incremental pipeline: advance stage-by-stage, inspecting each
//! intermediate result before continuing.
//!
//! Unlike [`crate::process`] which runs the whole fusion in one call,
//! [`Pipeline`] lets the caller drive execution one step at a time:
//!
//! ```rust
//! # use vesselfuse_pipeline::{Pipeline, PipelineConfig, PipelineError, ReferenceGeometry, Volume};
//! # fn run(geometry: ReferenceGeometry, raw: Vec<Volume<f32>>) -> Result<(), PipelineError> {
//! let staged = Pipeline::new(geometry, raw, PipelineConfig::default())
//!     .validate()?
//!     .preprocess()
//!     .estimate()
//!     .threshold()
//!     .enhance()
//!     .into_result();
//! # Ok(())
//! # }
//! ```
//!
//! Each stage method consumes `self` and returns the next state,
//! carrying every earlier intermediate. Only validation can fail; the
//! remaining stages recover from degenerate input internally.
//!
//! # Memory
//!
//! From [`Preprocessed`] onward both the validated and the preprocessed
//! rater sets are retained, and from [`Estimated`] onward the `f64`
//! probability map as well. [`StagedResult`] keeps all of them so
//! callers can render previews; use [`crate::process`] when only the
//! consensus is needed.

use tracing::debug;

use crate::enhance::{EnhancementOutcome, enhance};
use crate::morphology::bridge_gaps;
use crate::normalize::normalize_labels;
use crate::staple::{StapleEstimate, estimate};
use crate::threshold::{ThresholdKind, ThresholdResult, Thresholder};
use crate::types::{ConsensusResult, PipelineConfig, PipelineError};
use crate::validate::{RaterSet, ReferenceGeometry};
use crate::volume::{BinaryMask, Volume};

/// Entry point for the staged API.
pub struct Pipeline;

impl Pipeline {
    /// Start a pipeline on raw rater label volumes.
    ///
    /// Nothing is computed until [`Pending::validate`] is called.
    #[allow(clippy::new_ret_no_self)]
    pub const fn new(geometry: ReferenceGeometry, raw: Vec<Volume<f32>>, config: PipelineConfig) -> Pending {
        Pending {
            config,
            geometry,
            raw,
        }
    }
}

// ───────────────────────── Stage 0: Pending ──────────────────────────

/// Pipeline state before any processing.
///
/// Call [`validate`](Self::validate) to advance.
#[must_use = "pipeline stages are consumed by advancing; call .validate() to continue"]
pub struct Pending {
    config: PipelineConfig,
    geometry: ReferenceGeometry,
    raw: Vec<Volume<f32>>,
}

impl Pending {
    /// The raw rater volumes, in input order.
    #[must_use]
    pub fn raw(&self) -> &[Volume<f32>] {
        &self.raw
    }

    /// Check the configuration, normalise every rater to `{0, 1}` and
    /// verify spatial consistency with the reference.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] for an unusable config,
    /// [`PipelineError::InsufficientRaters`] for fewer than two raters
    /// (checked before any label is read),
    /// [`PipelineError::InvalidMask`] for labels that cannot be
    /// normalised, and the errors of [`RaterSet::new`].
    pub fn validate(self) -> Result<Validated, PipelineError> {
        self.config.validate()?;
        if self.raw.len() < 2 {
            return Err(PipelineError::InsufficientRaters {
                found: self.raw.len(),
            });
        }
        let masks = self
            .raw
            .iter()
            .enumerate()
            .map(|(rater, raw)| normalize_labels(raw, rater))
            .collect::<Result<Vec<_>, _>>()?;
        let raters = RaterSet::new(self.geometry, masks)?;
        debug!(raters = raters.len(), "raters validated");
        Ok(Validated {
            config: self.config,
            raters,
        })
    }
}

// ───────────────────────── Stage 1: Validated ────────────────────────

/// Pipeline state after normalisation and validation.
#[must_use = "pipeline stages are consumed by advancing; call .preprocess() to continue"]
pub struct Validated {
    config: PipelineConfig,
    raters: RaterSet,
}

impl Validated {
    /// The normalised, validated raters.
    #[must_use]
    pub const fn raters(&self) -> &RaterSet {
        &self.raters
    }

    /// Bridge small gaps in every rater when `do_preprocessing` is set;
    /// otherwise pass the raters through unchanged.
    pub fn preprocess(self) -> Preprocessed {
        let preprocessed = if self.config.do_preprocessing {
            let radius = self.config.preprocess_radius;
            debug!(radius, "preprocessing raters");
            self.raters.with_masks(
                self.raters
                    .masks()
                    .iter()
                    .map(|m| bridge_gaps(m, radius))
                    .collect(),
            )
        } else {
            self.raters.clone()
        };
        Preprocessed {
            config: self.config,
            raters: self.raters,
            preprocessed,
        }
    }
}

// ───────────────────────── Stage 2: Preprocessed ─────────────────────

/// Pipeline state after the optional gap-bridging pass.
#[must_use = "pipeline stages are consumed by advancing; call .estimate() to continue"]
pub struct Preprocessed {
    config: PipelineConfig,
    raters: RaterSet,
    preprocessed: RaterSet,
}

impl Preprocessed {
    /// The raters fed to the estimator.
    #[must_use]
    pub const fn preprocessed(&self) -> &RaterSet {
        &self.preprocessed
    }

    /// Run STAPLE on the preprocessed raters.
    pub fn estimate(self) -> Estimated {
        let estimate = estimate(&self.preprocessed, &self.config.staple);
        Estimated {
            config: self.config,
            raters: self.raters,
            preprocessed: self.preprocessed,
            estimate,
        }
    }
}

// ───────────────────────── Stage 3: Estimated ────────────────────────

/// Pipeline state after STAPLE.
#[must_use = "pipeline stages are consumed by advancing; call .threshold() to continue"]
pub struct Estimated {
    config: PipelineConfig,
    raters: RaterSet,
    preprocessed: RaterSet,
    estimate: StapleEstimate,
}

impl Estimated {
    /// The probability map and rater performance.
    #[must_use]
    pub const fn estimate(&self) -> &StapleEstimate {
        &self.estimate
    }

    /// Binarise the probability map with the configured rule.
    pub fn threshold(self) -> Thresholded {
        let kind = ThresholdKind::from_flag(self.config.do_adaptive_thresholding);
        let candidate = self.preprocessed.union();
        let threshold = kind.threshold(
            &self.estimate.probabilities,
            &candidate,
            self.config.confidence_threshold,
        );
        Thresholded {
            config: self.config,
            raters: self.raters,
            preprocessed: self.preprocessed,
            estimate: self.estimate,
            threshold,
        }
    }
}

// ───────────────────────── Stage 4: Thresholded ──────────────────────

/// Pipeline state after thresholding.
#[must_use = "pipeline stages are consumed by advancing; call .enhance() to continue"]
pub struct Thresholded {
    config: PipelineConfig,
    raters: RaterSet,
    preprocessed: RaterSet,
    estimate: StapleEstimate,
    threshold: ThresholdResult,
}

impl Thresholded {
    /// The thresholded mask and thresholds used.
    #[must_use]
    pub const fn threshold(&self) -> &ThresholdResult {
        &self.threshold
    }

    /// Enhance vessel connectivity when `do_vessel_enhancement` is set.
    pub fn enhance(self) -> Enhanced {
        let (consensus, enhancement) = if self.config.do_vessel_enhancement {
            let result = enhance(&self.threshold.mask, &self.preprocessed);
            (result.mask, Some(result.outcome))
        } else {
            (self.threshold.mask.clone(), None)
        };
        Enhanced {
            raters: self.raters,
            preprocessed: self.preprocessed,
            estimate: self.estimate,
            threshold: self.threshold,
            enhancement,
            consensus,
        }
    }
}

// ───────────────────────── Stage 5: Enhanced ─────────────────────────

/// Final pipeline state.
#[must_use = "call .into_result() to obtain the consensus"]
pub struct Enhanced {
    raters: RaterSet,
    preprocessed: RaterSet,
    estimate: StapleEstimate,
    threshold: ThresholdResult,
    enhancement: Option<EnhancementOutcome>,
    consensus: BinaryMask,
}

impl Enhanced {
    /// The final consensus mask.
    #[must_use]
    pub const fn consensus(&self) -> &BinaryMask {
        &self.consensus
    }

    /// What the enhancer did, or `None` when disabled.
    #[must_use]
    pub const fn enhancement(&self) -> Option<&EnhancementOutcome> {
        self.enhancement.as_ref()
    }

    /// Consume the pipeline into its full set of intermediates.
    #[must_use]
    pub fn into_result(self) -> StagedResult {
        StagedResult {
            consensus: ConsensusResult {
                mask: self.consensus,
                performance: self.estimate.performance.clone(),
            },
            raters: self.raters,
            preprocessed: self.preprocessed,
            estimate: self.estimate,
            threshold: self.threshold,
            enhancement: self.enhancement,
        }
    }
}

/// Every intermediate of one pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedResult {
    /// Normalised, validated raters.
    pub raters: RaterSet,
    /// Raters after the optional preprocessing pass.
    pub preprocessed: RaterSet,
    /// STAPLE output.
    pub estimate: StapleEstimate,
    /// Thresholding output (the consensus before enhancement).
    pub threshold: ThresholdResult,
    /// Enhancement outcome, `None` when disabled.
    pub enhancement: Option<EnhancementOutcome>,
    /// The final consensus.
    pub consensus: ConsensusResult,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::threshold::AppliedThreshold;
    use crate::volume::{Shape, SpatialHeader};

    fn geometry() -> ReferenceGeometry {
        ReferenceGeometry {
            shape: Shape::new(12, 8, 8),
            header: SpatialHeader::with_spacing([0.5, 0.5, 0.5]),
        }
    }

    fn raw_tube(g: &ReferenceGeometry, x0: usize, x1: usize, label: f32) -> Volume<f32> {
        Volume::from_fn(g.shape, g.header, |x, y, z| {
            if (x0..x1).contains(&x) && (3..5).contains(&y) && (3..5).contains(&z) {
                label
            } else {
                0.0
            }
        })
    }

    #[test]
    fn stages_expose_intermediates() {
        let g = geometry();
        let raw = vec![raw_tube(&g, 1, 10, 1.0), raw_tube(&g, 2, 11, 255.0)];

        let validated = Pipeline::new(g, raw, PipelineConfig::default()).validate().unwrap();
        assert_eq!(validated.raters().len(), 2);
        assert!(validated.raters().masks().iter().all(|m| m.data().iter().all(|&v| v <= 1)));

        let preprocessed = validated.preprocess();
        let before = preprocessed.preprocessed().masks()[0].count_foreground();
        assert!(before >= 9 * 4);

        let estimated = preprocessed.estimate();
        assert!(estimated.estimate().converged);

        let thresholded = estimated.threshold();
        assert!(matches!(
            thresholded.threshold().applied,
            AppliedThreshold::Adaptive(_)
        ));

        let enhanced = thresholded.enhance();
        assert!(enhanced.enhancement().is_some());
        let result = enhanced.into_result();
        assert_eq!(result.consensus.header(), &g.header);
        assert_eq!(result.consensus.performance.len(), 2);
    }

    #[test]
    fn base_config_skips_optional_stages() {
        let g = geometry();
        let raw = vec![raw_tube(&g, 1, 10, 1.0), raw_tube(&g, 1, 10, 1.0)];
        let config = PipelineConfig::default().base();

        let result = Pipeline::new(g, raw, config)
            .validate()
            .unwrap()
            .preprocess()
            .estimate()
            .threshold()
            .enhance()
            .into_result();

        assert_eq!(result.preprocessed, result.raters);
        assert_eq!(result.threshold.applied, AppliedThreshold::Fixed { threshold: 0.5 });
        assert_eq!(result.enhancement, None);
        assert_eq!(result.consensus.mask, result.raters.masks()[0]);
    }

    #[test]
    fn invalid_config_fails_validation() {
        let g = geometry();
        let raw = vec![raw_tube(&g, 1, 10, 1.0), raw_tube(&g, 1, 10, 1.0)];
        let config = PipelineConfig {
            confidence_threshold: -0.1,
            ..PipelineConfig::default()
        };
        let err = Pipeline::new(g, raw, config).validate().err().unwrap();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));
    }

    #[test]
    fn non_finite_labels_fail_validation() {
        let g = geometry();
        let mut bad = raw_tube(&g, 1, 10, 1.0);
        bad.data_mut()[0] = f32::NAN;
        let raw = vec![raw_tube(&g, 1, 10, 1.0), bad];
        let err = Pipeline::new(g, raw, PipelineConfig::default())
            .validate()
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::InvalidMask { rater: 1, .. }));
    }

    #[test]
    fn lone_rater_is_insufficient_even_with_bad_labels() {
        let g = geometry();
        let mut bad = raw_tube(&g, 1, 10, 1.0);
        bad.data_mut()[0] = f32::NAN;
        let err = Pipeline::new(g, vec![bad], PipelineConfig::default())
            .validate()
            .err()
            .unwrap();
        assert_eq!(err, PipelineError::InsufficientRaters { found: 1 });
    }
}
