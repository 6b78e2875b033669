//! Case manifests: which images to fuse and where to put the results.
//!
//! A manifest is a JSON document:
//!
//! ```json
//! {
//!   "cases": [
//!     {
//!       "id": "case_001",
//!       "reference": "images/case_001.nii.gz",
//!       "raters": ["labels/a/case_001.nii.gz", "labels/b/case_001.nii.gz"],
//!       "enhanced_output": "staple/case_001.nii.gz",
//!       "base_output": "staple_base/case_001.nii.gz"
//!     }
//!   ]
//! }
//! ```
//!
//! Relative paths are resolved against the manifest's directory.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::BatchError;

/// One case: a reference image, its rater masks and two destinations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseEntry {
    /// Unique case identifier, used in logs, metrics and preview names.
    pub id: String,
    /// Image whose grid and header every rater and output must share.
    pub reference: PathBuf,
    /// Rater label volumes, in rater order.
    pub raters: Vec<PathBuf>,
    /// Destination of the enhanced consensus.
    pub enhanced_output: PathBuf,
    /// Destination of the base consensus.
    pub base_output: PathBuf,
}

impl CaseEntry {
    /// Both outputs already exist on disk.
    #[must_use]
    pub fn outputs_exist(&self) -> bool {
        self.enhanced_output.exists() && self.base_output.exists()
    }

    fn resolve(mut self, base: &Path) -> Self {
        let join = |p: PathBuf| if p.is_relative() { base.join(p) } else { p };
        self.reference = join(self.reference);
        self.raters = self.raters.into_iter().map(join).collect();
        self.enhanced_output = join(self.enhanced_output);
        self.base_output = join(self.base_output);
        self
    }
}

/// All cases of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Manifest {
    /// Cases in processing order.
    pub cases: Vec<CaseEntry>,
}

impl Manifest {
    /// Parse a manifest, resolving relative paths against `base`.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::Manifest`] for malformed JSON and
    /// [`BatchError::DuplicateCase`] when two cases share an id.
    pub fn from_json(text: &str, base: &Path) -> Result<Self, BatchError> {
        let manifest: Self = serde_json::from_str(text)?;
        let mut seen = HashSet::new();
        if let Some(dup) = manifest.cases.iter().find(|c| !seen.insert(c.id.as_str())) {
            return Err(BatchError::DuplicateCase(dup.id.clone()));
        }
        Ok(Self {
            cases: manifest
                .cases
                .into_iter()
                .map(|c| c.resolve(base))
                .collect(),
        })
    }

    /// Read and parse the manifest at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::File`] when the file cannot be read, plus the
    /// errors of [`Manifest::from_json`].
    pub fn load(path: &Path) -> Result<Self, BatchError> {
        let text = std::fs::read_to_string(path).map_err(|source| BatchError::File {
            path: path.to_path_buf(),
            source,
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_json(&text, base)
    }

    /// Cases whose enhanced output is missing.
    #[must_use]
    pub fn missing_enhanced_outputs(&self) -> Vec<&CaseEntry> {
        self.cases
            .iter()
            .filter(|c| !c.enhanced_output.exists())
            .collect()
    }
}
