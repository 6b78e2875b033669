//! Running the pipeline over every case of a manifest.
//!
//! Cases are independent and run on a bounded rayon pool. A case whose
//! outputs already exist is skipped unless recomputation is forced.
//! Missing rater files are left out; a rater file that exists but cannot
//! be read fails its case. A failure in one case is recorded in its
//! [`CaseReport`] and never stops the batch.

use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, info_span, warn};
use vesselfuse_io::preview::{case_preview, write_png};
use vesselfuse_io::{IoError, ReferenceImage, read_reference, read_volume, write_mask};
use vesselfuse_pipeline::{
    CaseInputs, CaseOutputs, CaseStatus, Clock, GapAnalysis, PipelineConfig, PipelineDiagnostics,
    Volume, analyze_gap_sizes, run_case,
};

use crate::error::BatchError;
use crate::manifest::CaseEntry;

/// How a batch is run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Configuration of the enhanced run; the base run derives from it.
    pub config: PipelineConfig,
    /// Recompute cases whose outputs already exist.
    pub force_recompute: bool,
    /// Write a middle-slice PNG per case into this directory.
    pub preview_dir: Option<PathBuf>,
    /// Report the gap distribution of every rater.
    pub analyze_gaps: bool,
}

/// Result of one case.
#[derive(Debug, Clone, Serialize)]
pub struct CaseReport {
    /// Case identifier.
    pub id: String,
    /// Outcome.
    #[serde(flatten)]
    pub status: CaseStatus,
    /// `false` when existing outputs were kept.
    pub recomputed: bool,
    /// Rater files that do not exist and were left out.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dropped_raters: Vec<PathBuf>,
    /// Diagnostics of the enhanced run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enhanced: Option<PipelineDiagnostics>,
    /// Diagnostics of the base run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base: Option<PipelineDiagnostics>,
    /// Gap distribution of the raters, when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gaps: Option<GapAnalysis>,
}

impl CaseReport {
    fn new(id: &str, status: CaseStatus) -> Self {
        Self {
            id: id.to_string(),
            status,
            recomputed: true,
            dropped_raters: Vec::new(),
            enhanced: None,
            base: None,
            gaps: None,
        }
    }

    fn up_to_date(id: &str) -> Self {
        Self {
            recomputed: false,
            ..Self::new(id, CaseStatus::Succeeded)
        }
    }

    fn failed(id: &str, reason: impl ToString) -> Self {
        Self::new(
            id,
            CaseStatus::Failed {
                reason: reason.to_string(),
            },
        )
    }
}

/// Run every case on a pool of `jobs` threads, returning one report per
/// case in manifest order.
///
/// # Errors
///
/// Returns [`BatchError::ThreadPool`] if the pool cannot be built.
/// Per-case failures are reported, not returned.
pub fn run_batch<C: Clock + Sync>(
    cases: &[CaseEntry],
    options: &RunOptions,
    clock: &C,
    jobs: usize,
) -> Result<Vec<CaseReport>, BatchError> {
    let pool = rayon::ThreadPoolBuilder::new().num_threads(jobs).build()?;
    info!(cases = cases.len(), jobs, "starting batch");
    Ok(pool.install(|| {
        cases
            .par_iter()
            .map(|case| run_one(case, options, clock))
            .collect()
    }))
}

/// Process one case: load, fuse twice, write both masks.
pub fn run_one<C: Clock>(case: &CaseEntry, options: &RunOptions, clock: &C) -> CaseReport {
    let span = info_span!("case", id = %case.id);
    let _enter = span.enter();

    if !options.force_recompute && case.outputs_exist() {
        info!("outputs present, skipping");
        return CaseReport::up_to_date(&case.id);
    }

    let reference = match read_reference(&case.reference) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "reference unreadable");
            return CaseReport::failed(&case.id, e);
        }
    };
    let (raters, dropped_raters) = match load_raters(&case.raters) {
        Ok(loaded) => loaded,
        Err(e) => {
            warn!(error = %e, "rater unreadable");
            return CaseReport::failed(&case.id, e);
        }
    };
    let inputs = CaseInputs {
        geometry: *reference.geometry(),
        raters,
    };

    let outputs = match run_case(inputs, &options.config, clock) {
        Ok(outputs) => outputs,
        Err(e) => {
            let status = CaseStatus::from_error(&e);
            match status {
                CaseStatus::SkippedInsufficientRaters => info!(error = %e, "skipped"),
                _ => warn!(error = %e, "pipeline failed"),
            }
            return CaseReport {
                dropped_raters,
                ..CaseReport::new(&case.id, status)
            };
        }
    };

    if let Err(e) = write_outputs(case, &reference, &outputs) {
        warn!(error = %e, "cannot write outputs");
        return CaseReport {
            dropped_raters,
            ..CaseReport::failed(&case.id, e)
        };
    }
    if let Some(dir) = &options.preview_dir {
        write_preview(dir, &case.id, &outputs);
    }

    let gaps = options
        .analyze_gaps
        .then(|| analyze_gap_sizes(&outputs.base.result.raters));
    info!(
        enhanced = outputs.enhanced.diagnostics.summary.consensus_foreground,
        base = outputs.base.diagnostics.summary.consensus_foreground,
        "case done"
    );
    CaseReport {
        dropped_raters,
        enhanced: Some(outputs.enhanced.diagnostics),
        base: Some(outputs.base.diagnostics),
        gaps,
        ..CaseReport::new(&case.id, CaseStatus::Succeeded)
    }
}

/// Read every rater, leaving out files that do not exist.
///
/// A file that exists but cannot be decoded fails the whole case.
fn load_raters(paths: &[PathBuf]) -> Result<(Vec<Volume<f32>>, Vec<PathBuf>), IoError> {
    let mut raters = Vec::with_capacity(paths.len());
    let mut dropped = Vec::new();
    for path in paths {
        if path.exists() {
            raters.push(read_volume(path)?);
        } else {
            warn!(path = %path.display(), "dropping missing rater");
            dropped.push(path.clone());
        }
    }
    Ok((raters, dropped))
}

fn write_outputs(
    case: &CaseEntry,
    reference: &ReferenceImage,
    outputs: &CaseOutputs,
) -> Result<(), BatchError> {
    let template = reference.nifti_header();
    for (path, run) in [
        (&case.enhanced_output, &outputs.enhanced),
        (&case.base_output, &outputs.base),
    ] {
        create_parent(path)?;
        write_mask(path, &run.result.consensus.mask, template)?;
    }
    Ok(())
}

fn create_parent(path: &Path) -> Result<(), BatchError> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => {
            std::fs::create_dir_all(dir).map_err(|source| BatchError::File {
                path: dir.to_path_buf(),
                source,
            })
        }
        _ => Ok(()),
    }
}

/// Previews are best effort; failures are logged only.
fn write_preview(dir: &Path, id: &str, outputs: &CaseOutputs) {
    let Some(image) = case_preview(outputs) else {
        warn!("volume too large for a preview");
        return;
    };
    let path = dir.join(format!("{id}.png"));
    let written = create_parent(&path)
        .map_err(|e| e.to_string())
        .and_then(|()| write_png(&path, &image).map_err(|e| e.to_string()));
    if let Err(e) = written {
        warn!(error = %e, "cannot write preview");
    }
}
