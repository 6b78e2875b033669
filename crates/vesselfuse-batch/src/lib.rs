//! vesselfuse-batch: run the consensus pipeline over a case manifest.
//!
//! Loads each case with `vesselfuse-io`, fuses it twice (enhanced and
//! base) with `vesselfuse-pipeline`, writes both masks and collects a
//! per-case report. The `vesselfuse-batch` binary wraps this library.

pub mod clock;
pub mod error;
pub mod manifest;
pub mod metrics;
pub mod runner;

pub use clock::StdClock;
pub use error::BatchError;
pub use manifest::{CaseEntry, Manifest};
pub use metrics::BatchMetrics;
pub use runner::{CaseReport, RunOptions, run_batch, run_one};
