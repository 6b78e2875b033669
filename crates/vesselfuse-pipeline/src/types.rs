//! Shared types for the vesselfuse consensus pipeline.

use serde::{Deserialize, Serialize};

use crate::volume::{BinaryMask, SpatialHeader};

/// How the STAPLE foreground prior `π` is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ForegroundPrior {
    /// Fixed at the mean foreground fraction across all raters.
    #[default]
    RaterMean,
    /// Fixed at 0.5.
    Uniform,
    /// Starts at the rater mean and is re-estimated as `mean(W)` after
    /// every E-step.
    Reestimate,
}

/// How the posterior weights `W` are initialised before the first M-step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InitialWeights {
    /// Fraction of raters marking each voxel as foreground.
    #[default]
    VoteFraction,
    /// 0.5 everywhere.
    Uniform,
}

/// Parameters of the STAPLE expectation-maximisation loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StapleConfig {
    /// Iteration cap. Reaching it without convergence is logged, not
    /// treated as an error.
    pub max_iterations: usize,
    /// Convergence tolerance on the largest change of any `p_i` or `q_i`.
    pub tolerance: f64,
    /// Foreground prior strategy.
    pub foreground_prior: ForegroundPrior,
    /// Initial posterior weights.
    pub initial_weights: InitialWeights,
}

impl StapleConfig {
    /// Default iteration cap.
    pub const DEFAULT_MAX_ITERATIONS: usize = 100;
    /// Default convergence tolerance.
    pub const DEFAULT_TOLERANCE: f64 = 1e-4;
    /// Sensitivity and specificity assumed before the first M-step.
    pub const INITIAL_PERFORMANCE: f64 = 0.999_99;
}

impl Default for StapleConfig {
    fn default() -> Self {
        Self {
            max_iterations: Self::DEFAULT_MAX_ITERATIONS,
            tolerance: Self::DEFAULT_TOLERANCE,
            foreground_prior: ForegroundPrior::default(),
            initial_weights: InitialWeights::default(),
        }
    }
}

/// Configuration for one consensus pipeline run.
///
/// The default is the "enhanced" configuration: preprocessing,
/// adaptive thresholding and vessel enhancement all enabled.
/// [`PipelineConfig::base`] derives the flat-threshold "base" variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Probability threshold for fixed-mode thresholding, and the
    /// fallback when adaptive thresholding has an empty region.
    pub confidence_threshold: f64,

    /// Dilate then close every rater mask before estimation.
    pub do_preprocessing: bool,

    /// Use region-aware thresholds derived from the probability map.
    pub do_adaptive_thresholding: bool,

    /// Reconnect fragments and prune small components using vessel
    /// statistics measured on the rater masks.
    pub do_vessel_enhancement: bool,

    /// Structuring element radius (voxels) for preprocessing.
    pub preprocess_radius: usize,

    /// STAPLE estimator parameters.
    pub staple: StapleConfig,
}

impl PipelineConfig {
    /// Default fixed probability threshold.
    pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.5;
    /// Default preprocessing structuring element radius.
    pub const DEFAULT_PREPROCESS_RADIUS: usize = 1;

    /// The "base" variant of this configuration: no preprocessing, no
    /// adaptive thresholding, no enhancement, flat 0.5 threshold.
    #[must_use]
    pub fn base(&self) -> Self {
        Self {
            confidence_threshold: Self::DEFAULT_CONFIDENCE_THRESHOLD,
            do_preprocessing: false,
            do_adaptive_thresholding: false,
            do_vessel_enhancement: false,
            ..self.clone()
        }
    }

    /// Check the configuration for values the pipeline cannot use.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] when the confidence
    /// threshold is outside `[0, 1]`, the tolerance is not a positive
    /// finite number, or the iteration cap is zero.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(PipelineError::InvalidConfig(format!(
                "confidence_threshold must be in [0, 1], got {}",
                self.confidence_threshold
            )));
        }
        if !(self.staple.tolerance.is_finite() && self.staple.tolerance > 0.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "staple.tolerance must be positive, got {}",
                self.staple.tolerance
            )));
        }
        if self.staple.max_iterations == 0 {
            return Err(PipelineError::InvalidConfig(
                "staple.max_iterations must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: Self::DEFAULT_CONFIDENCE_THRESHOLD,
            do_preprocessing: true,
            do_adaptive_thresholding: true,
            do_vessel_enhancement: true,
            preprocess_radius: Self::DEFAULT_PREPROCESS_RADIUS,
            staple: StapleConfig::default(),
        }
    }
}

/// Estimated reliability of one rater relative to the consensus.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceParameters {
    /// True-positive rate `p`.
    pub sensitivity: f64,
    /// True-negative rate `q`.
    pub specificity: f64,
}

/// Shape measurements of one connected component.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VesselComponentStats {
    /// Number of voxels in the component.
    pub voxel_count: usize,
    /// Physical volume in cubic millimetres.
    pub volume_mm3: f64,
    /// Extent along the principal axis of largest variance (length proxy).
    pub major_axis_mm: f64,
    /// Smallest principal-axis extent (diameter proxy).
    pub minor_axis_mm: f64,
}

/// Final fused mask of one pipeline run, carrying the reference header.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusResult {
    /// Binary consensus mask.
    pub mask: BinaryMask,
    /// Per-rater `(p, q)` from the estimator, indexed like the raters.
    pub performance: Vec<PerformanceParameters>,
}

impl ConsensusResult {
    /// Spatial header of the consensus (copied from the reference image).
    #[must_use]
    pub const fn header(&self) -> &SpatialHeader {
        self.mask.header()
    }
}

/// Errors that can occur during pipeline processing.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
pub enum PipelineError {
    /// Fewer than two usable rater masks.
    #[error("consensus needs at least 2 rater masks, got {found}")]
    InsufficientRaters {
        /// Number of raters supplied.
        found: usize,
    },

    /// A rater mask does not line up with the reference image.
    #[error("rater {rater} is not congruent with the reference: {reason}")]
    SpatialMismatch {
        /// Index of the offending rater.
        rater: usize,
        /// What differs.
        reason: String,
    },

    /// A rater mask is not binary after normalisation.
    #[error("rater {rater} is not a binary mask: {reason}")]
    InvalidMask {
        /// Index of the offending rater.
        rater: usize,
        /// What was found.
        reason: String,
    },

    /// A volume buffer does not match its declared shape.
    #[error("invalid volume: {0}")]
    InvalidVolume(String),

    /// Pipeline configuration is invalid.
    #[error("invalid pipeline configuration: {0}")]
    InvalidConfig(String),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_enhanced() {
        let config = PipelineConfig::default();
        assert!(config.do_preprocessing);
        assert!(config.do_adaptive_thresholding);
        assert!(config.do_vessel_enhancement);
        assert!((config.confidence_threshold - 0.5).abs() < f64::EPSILON);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn base_disables_all_improvements() {
        let enhanced = PipelineConfig {
            confidence_threshold: 0.8,
            ..PipelineConfig::default()
        };
        let base = enhanced.base();
        assert!(!base.do_preprocessing);
        assert!(!base.do_adaptive_thresholding);
        assert!(!base.do_vessel_enhancement);
        assert!((base.confidence_threshold - 0.5).abs() < f64::EPSILON);
        assert_eq!(base.staple, enhanced.staple);
    }

    #[test]
    fn validate_rejects_out_of_range_threshold() {
        let config = PipelineConfig {
            confidence_threshold: 1.5,
            ..PipelineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(PipelineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn validate_rejects_zero_iterations() {
        let config = PipelineConfig {
            staple: StapleConfig {
                max_iterations: 0,
                ..StapleConfig::default()
            },
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_serde_fills_missing_fields() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"do_vessel_enhancement": false}"#).unwrap();
        assert!(!config.do_vessel_enhancement);
        assert!(config.do_preprocessing);
        assert_eq!(config.staple, StapleConfig::default());
    }

    #[test]
    fn error_serde_roundtrip() {
        let err = PipelineError::SpatialMismatch {
            rater: 2,
            reason: "size differs".to_string(),
        };
        let json = serde_json::to_string(&err).unwrap();
        let back: PipelineError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, back);
        assert!(back.to_string().contains("rater 2"));
    }
}
