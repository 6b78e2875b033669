use std::path::{Path, PathBuf};

use vesselfuse_pipeline::PipelineError;

/// Errors from reading or writing case files.
#[derive(Debug, thiserror::Error)]
pub enum IoError {
    /// A volume file could not be opened or decoded.
    #[error("cannot read {}: {reason}", .path.display())]
    Input {
        /// Offending file.
        path: PathBuf,
        /// Decoder message.
        reason: String,
    },

    /// An output file could not be written.
    #[error("cannot write {}: {reason}", .path.display())]
    Persistence {
        /// Destination file.
        path: PathBuf,
        /// Encoder or filesystem message.
        reason: String,
    },

    /// The file decoded, but its layout is not a 3D scalar volume.
    #[error("{}: unsupported volume layout: {reason}", .path.display())]
    UnsupportedLayout {
        /// Offending file.
        path: PathBuf,
        /// What is unsupported.
        reason: String,
    },

    /// PNG preview encoding failed.
    #[error("PNG encoding failed: {0}")]
    Image(String),
}

impl IoError {
    pub(crate) fn input(path: &Path, reason: impl ToString) -> Self {
        Self::Input {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn persistence(path: &Path, reason: impl ToString) -> Self {
        Self::Persistence {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn layout(path: &Path, reason: impl ToString) -> Self {
        Self::UnsupportedLayout {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }

    /// Attach `path` to a volume construction error.
    pub(crate) fn from_pipeline(path: &Path, err: &PipelineError) -> Self {
        Self::layout(path, err)
    }
}

impl From<image::ImageError> for IoError {
    fn from(err: image::ImageError) -> Self {
        Self::Image(err.to_string())
    }
}
