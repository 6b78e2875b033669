//! Order statistics over `f64` samples.

/// Sort samples ascending. NaNs are dropped.
pub(crate) fn sorted(mut values: Vec<f64>) -> Vec<f64> {
    values.retain(|v| !v.is_nan());
    values.sort_by(f64::total_cmp);
    values
}

/// Median of ascending samples, averaging the two middle values for
/// even counts. `None` when empty.
pub(crate) fn median(sorted: &[f64]) -> Option<f64> {
    percentile(sorted, 50.0)
}

/// Percentile `q` (0–100) of ascending samples with linear
/// interpolation between closest ranks. `None` when empty.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub(crate) fn percentile(sorted: &[f64], q: f64) -> Option<f64> {
    let last = sorted.len().checked_sub(1)?;
    let rank = (q / 100.0).clamp(0.0, 1.0) * last as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - rank.floor();
    Some((sorted[hi] - sorted[lo]).mul_add(frac, sorted[lo]))
}
