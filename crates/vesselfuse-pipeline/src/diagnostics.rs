//! Pipeline diagnostics: timing, counts, and estimator metrics per stage.
//!
//! [`process_with_diagnostics`] drives the staged pipeline and records
//! what every stage did. Timing goes through the [`Clock`] trait so the
//! crate itself never reads the system clock; binaries supply an
//! implementation backed by [`std::time::Instant`].
//!
//! Durations are serialized as fractional seconds (`f64`) for JSON
//! compatibility, since `std::time::Duration` does not implement serde
//! traits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::enhance::EnhancementOutcome;
use crate::pipeline::{Pipeline, StagedResult};
use crate::threshold::AppliedThreshold;
use crate::types::{PerformanceParameters, PipelineConfig, PipelineError};
use crate::validate::{RaterSet, ReferenceGeometry};
use crate::volume::{BinaryMask, Volume};

/// Source of monotonic time for stage timing.
pub trait Clock {
    /// A point in time.
    type Instant;

    /// The current instant.
    fn now(&self) -> Self::Instant;

    /// Time elapsed since `since`.
    fn elapsed(&self, since: &Self::Instant) -> Duration;
}

/// Serde support for `std::time::Duration` as fractional seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize a `Duration` as fractional seconds (`f64`).
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    /// Deserialize a `Duration` from fractional seconds (`f64`).
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// Diagnostics collected from a single pipeline run.
///
/// Optional stages are `None` when disabled by the configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDiagnostics {
    /// Normalisation and spatial validation.
    pub validate: StageDiagnostics,
    /// Gap bridging (only when `do_preprocessing`).
    pub preprocess: Option<StageDiagnostics>,
    /// STAPLE estimation.
    pub estimate: StageDiagnostics,
    /// Thresholding.
    pub threshold: StageDiagnostics,
    /// Vessel enhancement (only when `do_vessel_enhancement`).
    pub enhance: Option<StageDiagnostics>,
    /// Total wall-clock duration (seconds).
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
    /// Summary counts.
    pub summary: PipelineSummary,
}

/// Diagnostics for a single pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDiagnostics {
    /// Wall-clock duration of this stage (seconds).
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// Stage-specific metrics.
    pub metrics: StageMetrics,
}

/// Stage-specific metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StageMetrics {
    /// Validation metrics.
    Validate {
        /// Number of raters.
        raters: usize,
        /// Foreground voxels per rater.
        foreground_per_rater: Vec<usize>,
    },
    /// Preprocessing metrics.
    Preprocess {
        /// Structuring element radius in voxels.
        radius: usize,
        /// Foreground voxels per rater after preprocessing.
        foreground_per_rater: Vec<usize>,
    },
    /// STAPLE metrics.
    Estimate {
        /// EM iterations.
        iterations: usize,
        /// Whether the tolerance was reached.
        converged: bool,
        /// Final foreground prior.
        prior: f64,
        /// Per-rater `(p, q)`.
        performance: Vec<PerformanceParameters>,
    },
    /// Thresholding metrics.
    Threshold {
        /// Thresholds applied.
        applied: AppliedThreshold,
        /// Foreground voxels after thresholding.
        foreground: usize,
    },
    /// Enhancement metrics.
    Enhance {
        /// What the enhancer did.
        outcome: EnhancementOutcome,
        /// Foreground voxels after enhancement.
        foreground: usize,
    },
}

/// High-level summary counts for the entire run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PipelineSummary {
    /// Grid dimensions.
    pub dimensions: [usize; 3],
    /// Total voxels.
    pub voxel_count: usize,
    /// Number of raters.
    pub raters: usize,
    /// Foreground voxels in the final consensus.
    pub consensus_foreground: usize,
}

/// Run the staged pipeline and time every stage.
///
/// # Errors
///
/// Same as [`crate::process`].
pub fn process_with_diagnostics<C: Clock>(
    geometry: ReferenceGeometry,
    raw: Vec<Volume<f32>>,
    config: &PipelineConfig,
    clock: &C,
) -> Result<(StagedResult, PipelineDiagnostics), PipelineError> {
    let total_start = clock.now();

    let start = clock.now();
    let validated = Pipeline::new(geometry, raw, config.clone()).validate()?;
    let validate = StageDiagnostics {
        duration: clock.elapsed(&start),
        metrics: StageMetrics::Validate {
            raters: validated.raters().len(),
            foreground_per_rater: foreground_counts(validated.raters()),
        },
    };

    let start = clock.now();
    let preprocessed = validated.preprocess();
    let preprocess = config.do_preprocessing.then(|| StageDiagnostics {
        duration: clock.elapsed(&start),
        metrics: StageMetrics::Preprocess {
            radius: config.preprocess_radius,
            foreground_per_rater: foreground_counts(preprocessed.preprocessed()),
        },
    });

    let start = clock.now();
    let estimated = preprocessed.estimate();
    let est = estimated.estimate();
    let estimate = StageDiagnostics {
        duration: clock.elapsed(&start),
        metrics: StageMetrics::Estimate {
            iterations: est.iterations,
            converged: est.converged,
            prior: est.prior,
            performance: est.performance.clone(),
        },
    };

    let start = clock.now();
    let thresholded = estimated.threshold();
    let threshold = StageDiagnostics {
        duration: clock.elapsed(&start),
        metrics: StageMetrics::Threshold {
            applied: thresholded.threshold().applied,
            foreground: thresholded.threshold().mask.count_foreground(),
        },
    };

    let start = clock.now();
    let enhanced = thresholded.enhance();
    let enhance_duration = clock.elapsed(&start);
    let enhance = enhanced.enhancement().map(|outcome| StageDiagnostics {
        duration: enhance_duration,
        metrics: StageMetrics::Enhance {
            outcome: outcome.clone(),
            foreground: enhanced.consensus().count_foreground(),
        },
    });

    let result = enhanced.into_result();
    let shape = result.raters.geometry().shape;
    let summary = PipelineSummary {
        dimensions: shape.as_array(),
        voxel_count: shape.len(),
        raters: result.raters.len(),
        consensus_foreground: result.consensus.mask.count_foreground(),
    };

    let diagnostics = PipelineDiagnostics {
        validate,
        preprocess,
        estimate,
        threshold,
        enhance,
        total_duration: clock.elapsed(&total_start),
        summary,
    };
    Ok((result, diagnostics))
}

fn foreground_counts(raters: &RaterSet) -> Vec<usize> {
    raters.masks().iter().map(BinaryMask::count_foreground).collect()
}

impl PipelineDiagnostics {
    /// Format diagnostics as a human-readable report.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Pipeline Diagnostics Report\n{}", "=".repeat(60)));
        let [nx, ny, nz] = self.summary.dimensions;
        lines.push(format!(
            "Volume: {nx}x{ny}x{nz} ({} voxels), {} raters",
            self.summary.voxel_count, self.summary.raters,
        ));
        lines.push(format!(
            "Total duration: {:.3}ms",
            duration_ms(self.total_duration),
        ));
        lines.push(String::new());

        lines.push(format!(
            "{:<16} {:>10} {:>10}  {}",
            "Stage", "Duration", "% Total", "Details"
        ));
        lines.push("-".repeat(80));

        let total_ms = duration_ms(self.total_duration);
        let mut stages = vec![("Validate", &self.validate)];
        if let Some(ref p) = self.preprocess {
            stages.push(("Preprocess", p));
        }
        stages.push(("Estimate", &self.estimate));
        stages.push(("Threshold", &self.threshold));
        if let Some(ref e) = self.enhance {
            stages.push(("Enhance", e));
        }

        for (name, diag) in &stages {
            let ms = duration_ms(diag.duration);
            let pct = if total_ms > 0.0 {
                ms / total_ms * 100.0
            } else {
                0.0
            };
            let details = format_metrics(&diag.metrics);
            lines.push(format!("{name:<16} {ms:>8.3}ms {pct:>9.1}%  {details}"));
        }

        lines.push(String::new());
        lines.push(format!(
            "Consensus foreground voxels: {}",
            self.summary.consensus_foreground
        ));

        lines.join("\n")
    }
}

fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

fn format_metrics(metrics: &StageMetrics) -> String {
    match metrics {
        StageMetrics::Validate {
            raters,
            foreground_per_rater,
        } => format!("{raters} raters, foreground {foreground_per_rater:?}"),
        StageMetrics::Preprocess {
            radius,
            foreground_per_rater,
        } => format!("r={radius} foreground {foreground_per_rater:?}"),
        StageMetrics::Estimate {
            iterations,
            converged,
            prior,
            performance,
        } => {
            let pq: Vec<String> = performance
                .iter()
                .map(|p| format!("({:.3}, {:.3})", p.sensitivity, p.specificity))
                .collect();
            let state = if *converged { "converged" } else { "capped" };
            format!("{iterations} iters {state}, prior={prior:.4} p/q={}", pq.join(" "))
        }
        StageMetrics::Threshold {
            applied,
            foreground,
        } => match applied {
            AppliedThreshold::Fixed { threshold } => {
                format!("fixed {threshold:.3}, {foreground} voxels")
            }
            AppliedThreshold::Adaptive(t) => format!(
                "adaptive lower={:.3} higher={:.3}, {foreground} voxels",
                t.lower, t.higher
            ),
        },
        StageMetrics::Enhance {
            outcome,
            foreground,
        } => match outcome {
            EnhancementOutcome::Applied {
                parameters,
                components_removed,
                ..
            } => format!(
                "r={}vox min_size={} removed={components_removed}, {foreground} voxels",
                parameters.kernel_radius_voxels, parameters.min_object_size
            ),
            EnhancementOutcome::Skipped { reason } => format!("skipped: {reason}"),
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::volume::{Shape, SpatialHeader};

    /// Advances one millisecond per reading.
    struct TickClock(Cell<u64>);

    impl Clock for TickClock {
        type Instant = u64;

        fn now(&self) -> u64 {
            let t = self.0.get();
            self.0.set(t + 1);
            t
        }

        fn elapsed(&self, since: &u64) -> Duration {
            Duration::from_millis(self.now() - since)
        }
    }

    fn inputs() -> (ReferenceGeometry, Vec<Volume<f32>>) {
        let g = ReferenceGeometry {
            shape: Shape::new(10, 6, 6),
            header: SpatialHeader::default(),
        };
        let tube = |x0: usize| {
            Volume::from_fn(g.shape, g.header, move |x, y, z| {
                f32::from(u8::from(x >= x0 && x < 9 && y == 3 && z == 3))
            })
        };
        (g, vec![tube(1), tube(2), tube(1)])
    }

    #[test]
    fn duration_ms_converts_correctly() {
        let ms = duration_ms(Duration::from_millis(1234));
        assert!((ms - 1234.0).abs() < 0.01);
    }

    #[test]
    fn enhanced_run_records_every_stage() {
        let (g, raw) = inputs();
        let clock = TickClock(Cell::new(0));
        let (result, diag) =
            process_with_diagnostics(g, raw, &PipelineConfig::default(), &clock).unwrap();

        assert!(diag.preprocess.is_some());
        assert!(diag.enhance.is_some());
        assert!(diag.total_duration > diag.estimate.duration);
        assert_eq!(diag.summary.raters, 3);
        assert_eq!(
            diag.summary.consensus_foreground,
            result.consensus.mask.count_foreground()
        );
        assert!(matches!(
            diag.estimate.metrics,
            StageMetrics::Estimate { ref performance, .. } if performance.len() == 3
        ));
    }

    #[test]
    fn base_run_omits_optional_stages() {
        let (g, raw) = inputs();
        let clock = TickClock(Cell::new(0));
        let (_, diag) =
            process_with_diagnostics(g, raw, &PipelineConfig::default().base(), &clock).unwrap();
        assert!(diag.preprocess.is_none());
        assert!(diag.enhance.is_none());

        let report = diag.report();
        assert!(report.contains("Pipeline Diagnostics Report"));
        assert!(report.contains("fixed 0.500"));
        assert!(!report.contains("Enhance"));
    }

    #[test]
    fn diagnostics_serde_roundtrip() {
        let (g, raw) = inputs();
        let clock = TickClock(Cell::new(0));
        let (_, diag) =
            process_with_diagnostics(g, raw, &PipelineConfig::default(), &clock).unwrap();
        let json = serde_json::to_string(&diag).unwrap();
        let back: PipelineDiagnostics = serde_json::from_str(&json).unwrap();
        assert_eq!(back.summary, diag.summary);
        assert_eq!(back.enhance.is_some(), diag.enhance.is_some());
    }
}
