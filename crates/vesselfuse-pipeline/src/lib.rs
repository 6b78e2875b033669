//! vesselfuse-pipeline: Pure STAPLE consensus pipeline (sans-IO).
//!
//! Fuses several binary vessel segmentations of one 3D image into a
//! single consensus mask through:
//! normalize -> validate -> optional gap bridging -> STAPLE estimate ->
//! fixed or adaptive threshold -> optional vessel enhancement.
//!
//! This crate has **no I/O dependencies** -- it operates on in-memory
//! [`Volume`]s and returns structured data. Reading and writing image
//! files lives in `vesselfuse-io`; batch orchestration over many cases
//! lives in `vesselfuse-batch`.

pub mod components;
pub mod diagnostics;
pub mod distance;
pub mod enhance;
pub mod gaps;
pub mod morphology;
pub mod normalize;
pub mod orchestrator;
pub mod pipeline;
pub mod staple;
pub mod threshold;
pub mod types;
pub mod validate;
pub mod volume;

mod stats;

pub use diagnostics::{Clock, PipelineDiagnostics, process_with_diagnostics};
pub use enhance::{EnhancementOutcome, VesselCharacteristics};
pub use gaps::{GapAnalysis, analyze_gap_sizes};
pub use orchestrator::{BatchSummary, CaseInputs, CaseOutputs, CaseStatus, Variant, run_case};
pub use pipeline::{Pipeline, StagedResult};
pub use staple::StapleEstimate;
pub use threshold::{ThresholdKind, Thresholder};
pub use types::{
    ConsensusResult, ForegroundPrior, InitialWeights, PerformanceParameters,
    PipelineConfig, PipelineError, StapleConfig, VesselComponentStats,
};
pub use validate::{RaterSet, ReferenceGeometry};
pub use volume::{BinaryMask, ProbabilityMap, Shape, SpatialHeader, Volume};

/// Run the full consensus pipeline on one set of rater volumes.
///
/// `raw` holds one label volume per rater, each on the grid described
/// by `geometry`. The result carries the consensus mask (with the
/// reference header) and the per-rater sensitivity and specificity
/// estimated by STAPLE.
///
/// # Pipeline steps
///
/// 1. Normalise labels to `{0, 1}` and verify rater geometry
/// 2. Optional gap bridging of every rater (dilate, then close)
/// 3. STAPLE expectation-maximisation
/// 4. Fixed or adaptive thresholding of the probability map
/// 5. Optional vessel connectivity enhancement
///
/// # Errors
///
/// Returns [`PipelineError::InvalidConfig`] for an unusable `config`,
/// [`PipelineError::InsufficientRaters`] for fewer than two raters, and
/// [`PipelineError::SpatialMismatch`] or [`PipelineError::InvalidMask`]
/// when a rater volume cannot be used.
pub fn process(
    geometry: ReferenceGeometry,
    raw: Vec<Volume<f32>>,
    config: &PipelineConfig,
) -> Result<ConsensusResult, PipelineError> {
    Ok(Pipeline::new(geometry, raw, config.clone())
        .validate()?
        .preprocess()
        .estimate()
        .threshold()
        .enhance()
        .into_result()
        .consensus)
}
