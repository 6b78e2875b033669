//! Per-case orchestration: the "enhanced" and "base" consensus runs.
//!
//! Every case is fused twice. The enhanced run uses the caller's
//! configuration (normally preprocessing, adaptive thresholding and
//! enhancement all on); the base run uses [`PipelineConfig::base`].
//! Preprocessing changes what the estimator sees, so each run performs
//! its own STAPLE estimate.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::diagnostics::{Clock, PipelineDiagnostics, process_with_diagnostics};
use crate::pipeline::StagedResult;
use crate::types::{PipelineConfig, PipelineError};
use crate::validate::ReferenceGeometry;
use crate::volume::Volume;

/// Which of the two per-case runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    /// Caller's configuration.
    Enhanced,
    /// All improvements off, flat 0.5 threshold.
    Base,
}

impl Variant {
    /// Both variants, in execution order.
    pub const ALL: [Self; 2] = [Self::Enhanced, Self::Base];

    /// Lowercase name for logs and file naming.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Enhanced => "enhanced",
            Self::Base => "base",
        }
    }

    /// Configuration of this variant derived from the enhanced one.
    #[must_use]
    pub fn config(self, enhanced: &PipelineConfig) -> PipelineConfig {
        match self {
            Self::Enhanced => enhanced.clone(),
            Self::Base => enhanced.base(),
        }
    }
}

/// Loaded inputs of one case.
#[derive(Debug, Clone, PartialEq)]
pub struct CaseInputs {
    /// Grid and header of the reference image.
    pub geometry: ReferenceGeometry,
    /// Raw rater label volumes, in rater order.
    pub raters: Vec<Volume<f32>>,
}

/// Output of one variant run.
#[derive(Debug, Clone, PartialEq)]
pub struct VariantRun {
    /// Which run this is.
    pub variant: Variant,
    /// Every intermediate, including the consensus.
    pub result: StagedResult,
    /// Per-stage timing and metrics.
    pub diagnostics: PipelineDiagnostics,
}

/// Both runs of one case.
#[derive(Debug, Clone, PartialEq)]
pub struct CaseOutputs {
    /// The enhanced run.
    pub enhanced: VariantRun,
    /// The base run.
    pub base: VariantRun,
}

/// Run the enhanced and the base pipeline on one case.
///
/// # Errors
///
/// Returns the first [`PipelineError`] from either run. Both runs see
/// the same inputs, so validation errors surface from the first.
pub fn run_case<C: Clock>(
    inputs: CaseInputs,
    config: &PipelineConfig,
    clock: &C,
) -> Result<CaseOutputs, PipelineError> {
    let CaseInputs { geometry, raters } = inputs;

    let enhanced = run_variant(Variant::Enhanced, geometry, raters.clone(), config, clock)?;
    let base = run_variant(Variant::Base, geometry, raters, config, clock)?;
    Ok(CaseOutputs { enhanced, base })
}

fn run_variant<C: Clock>(
    variant: Variant,
    geometry: ReferenceGeometry,
    raters: Vec<Volume<f32>>,
    config: &PipelineConfig,
    clock: &C,
) -> Result<VariantRun, PipelineError> {
    let (result, diagnostics) =
        process_with_diagnostics(geometry, raters, &variant.config(config), clock)?;
    info!(
        variant = variant.name(),
        foreground = diagnostics.summary.consensus_foreground,
        iterations = result.estimate.iterations,
        "consensus computed"
    );
    Ok(VariantRun {
        variant,
        result,
        diagnostics,
    })
}

/// Outcome of one case, as reported to the batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CaseStatus {
    /// Both consensus masks were produced.
    Succeeded,
    /// Fewer than two usable raters.
    SkippedInsufficientRaters,
    /// Any other failure.
    Failed {
        /// Human-readable cause.
        reason: String,
    },
}

impl CaseStatus {
    /// Status for a case that stopped with `error`.
    #[must_use]
    pub fn from_error(error: &PipelineError) -> Self {
        match error {
            PipelineError::InsufficientRaters { .. } => Self::SkippedInsufficientRaters,
            other => Self::Failed {
                reason: other.to_string(),
            },
        }
    }
}

/// Succeeded / skipped / failed counts over a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    /// Cases with both outputs written.
    pub succeeded: usize,
    /// Cases skipped for lack of raters.
    pub skipped: usize,
    /// Cases that failed.
    pub failed: usize,
}

impl BatchSummary {
    /// Count one case.
    pub const fn record(&mut self, status: &CaseStatus) {
        match status {
            CaseStatus::Succeeded => self.succeeded += 1,
            CaseStatus::SkippedInsufficientRaters => self.skipped += 1,
            CaseStatus::Failed { .. } => self.failed += 1,
        }
    }

    /// Cases counted so far.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.succeeded + self.skipped + self.failed
    }

    /// Percentage of counted cases that succeeded; `0` for an empty batch.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            n => self.succeeded as f64 / n as f64 * 100.0,
        }
    }
}

impl<'a> FromIterator<&'a CaseStatus> for BatchSummary {
    fn from_iter<I: IntoIterator<Item = &'a CaseStatus>>(iter: I) -> Self {
        let mut summary = Self::default();
        for status in iter {
            summary.record(status);
        }
        summary
    }
}
