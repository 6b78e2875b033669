//! Batch metrics file.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use vesselfuse_pipeline::{BatchSummary, PipelineConfig};

use crate::error::BatchError;
use crate::runner::CaseReport;

/// Everything recorded about one batch run.
#[derive(Debug, Clone, Serialize)]
pub struct BatchMetrics {
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Cases in the manifest.
    pub total_cases: usize,
    /// Cases with both outputs present, fresh or reused.
    pub succeeded: usize,
    /// Cases skipped for lack of raters.
    pub skipped: usize,
    /// Cases that failed.
    pub failed: usize,
    /// Cases without outputs (skipped plus failed).
    pub missing_cases: usize,
    /// `succeeded / total_cases` in percent.
    pub success_rate: f64,
    /// Configuration of the enhanced run.
    pub parameters: PipelineConfig,
    /// Per-case reports, in manifest order.
    pub cases: Vec<CaseReport>,
}

impl BatchMetrics {
    /// Summarise `cases`.
    #[must_use]
    pub fn new(cases: Vec<CaseReport>, parameters: PipelineConfig, timestamp: DateTime<Utc>) -> Self {
        let summary: BatchSummary = cases.iter().map(|c| &c.status).collect();
        Self {
            timestamp,
            total_cases: summary.total(),
            succeeded: summary.succeeded,
            skipped: summary.skipped,
            failed: summary.failed,
            missing_cases: summary.skipped + summary.failed,
            success_rate: summary.success_rate(),
            parameters,
            cases,
        }
    }

    /// Write as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::Metrics`] if serialisation fails and
    /// [`BatchError::File`] if the file cannot be written.
    pub fn write(&self, path: &Path) -> Result<(), BatchError> {
        let json = serde_json::to_string_pretty(self).map_err(BatchError::Metrics)?;
        std::fs::write(path, json).map_err(|source| BatchError::File {
            path: path.to_path_buf(),
            source,
        })
    }
}
