//! Label normalisation: canonicalise arbitrary mask encodings to `{0, 1}`.
//!
//! Segmentation tools disagree on how they store a vessel mask: some
//! write `{0, 1}`, some `{0, 255}`, some multi-level label maps where
//! `1` marks a secondary class. The rule applied here:
//!
//! ```text
//! more than two distinct values -> foreground = value > 1.1
//! otherwise                     -> foreground = value > 0
//! ```

use std::collections::BTreeSet;

use tracing::debug;

use crate::types::PipelineError;
use crate::volume::{BinaryMask, Volume};

/// Cut applied to multi-level label encodings.
pub const MULTI_LEVEL_CUT: f32 = 1.1;

/// Convert a raw label volume to a binary mask.
///
/// `rater` is only used to label errors.
///
/// # Errors
///
/// Returns [`PipelineError::InvalidMask`] if the volume contains
/// non-finite values, or if the result is not binary.
pub fn normalize_labels(raw: &Volume<f32>, rater: usize) -> Result<BinaryMask, PipelineError> {
    if let Some(bad) = raw.data().iter().find(|v| !v.is_finite()) {
        return Err(PipelineError::InvalidMask {
            rater,
            reason: format!("non-finite label value {bad}"),
        });
    }

    let distinct = count_distinct(raw.data(), 3);
    let mask = if distinct > 2 {
        debug!(rater, "multi-level labels, cutting at {MULTI_LEVEL_CUT}");
        raw.map(|&v| u8::from(v > MULTI_LEVEL_CUT))
    } else {
        raw.map(|&v| u8::from(v > 0.0))
    };

    verify_binary(&mask, rater)?;
    Ok(mask)
}

/// Check that a mask holds at most the values `0` and `1`.
///
/// # Errors
///
/// Returns [`PipelineError::InvalidMask`] listing the offending values.
pub fn verify_binary(mask: &BinaryMask, rater: usize) -> Result<(), PipelineError> {
    let offending: BTreeSet<u8> = mask.data().iter().copied().filter(|&v| v > 1).collect();
    if offending.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::InvalidMask {
            rater,
            reason: format!("non-binary values {offending:?}"),
        })
    }
}

/// Count distinct values, stopping early once `limit` is reached.
fn count_distinct(values: &[f32], limit: usize) -> usize {
    let mut seen = BTreeSet::new();
    for v in values {
        // +0.0 and -0.0 are the same label.
        let key = if *v == 0.0 { 0 } else { v.to_bits() };
        seen.insert(key);
        if seen.len() >= limit {
            break;
        }
    }
    seen.len()
}
