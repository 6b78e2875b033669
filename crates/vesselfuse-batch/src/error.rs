use std::path::PathBuf;

use vesselfuse_io::IoError;

/// Errors that stop a batch run, or a single case's output step.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    /// The manifest or metrics file could not be accessed.
    #[error("{}: {source}", .path.display())]
    File {
        /// Offending file or directory.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The manifest is not valid JSON of the expected shape.
    #[error("invalid manifest: {0}")]
    Manifest(#[from] serde_json::Error),

    /// The batch metrics could not be serialised.
    #[error("cannot serialise metrics: {0}")]
    Metrics(#[source] serde_json::Error),

    /// Two cases share an id.
    #[error("duplicate case id {0:?} in manifest")]
    DuplicateCase(String),

    /// Reading or writing a volume failed.
    #[error(transparent)]
    Io(#[from] IoError),

    /// The worker pool could not be started.
    #[error("cannot start worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
