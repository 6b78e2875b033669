//! STAPLE: Simultaneous Truth and Performance Level Estimation.
//!
//! Expectation-maximisation over the latent true label of every voxel.
//! Each rater `i` is modelled by a sensitivity `p_i` and specificity
//! `q_i`; the posterior foreground probability `W(v)` and the rater
//! parameters are refined alternately until the parameters settle.
//!
//! # Pattern histogram
//!
//! Both EM steps depend on a voxel only through the set of raters that
//! mark it. The decisions at each voxel are packed into `ceil(N / 64)`
//! `u64` words (bit `i % 64` of word `i / 64` set when rater `i` marks
//! foreground), and the loop runs over the distinct patterns weighted by
//! their voxel counts. For vessel masks
//! the number of distinct patterns is tiny compared to the voxel count,
//! so each iteration is effectively `O(patterns × raters)` while still
//! computing exactly the dense whole-volume sums.
//!
//! # Numerics
//!
//! The E-step evaluates `a·π / (a·π + b·(1−π))` in log space so that
//! products over many raters do not underflow. Zero denominators never
//! surface as errors: in the M-step the affected parameter keeps its
//! previous value, in the E-step `W` falls back to `π`.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::types::{ForegroundPrior, InitialWeights, PerformanceParameters, StapleConfig};
use crate::validate::RaterSet;
use crate::volume::ProbabilityMap;

/// Output of one STAPLE run.
#[derive(Debug, Clone, PartialEq)]
pub struct StapleEstimate {
    /// Posterior foreground probability per voxel, on the reference grid.
    pub probabilities: ProbabilityMap,
    /// Final `(p_i, q_i)` per rater.
    pub performance: Vec<PerformanceParameters>,
    /// Foreground prior in effect at the end of the run.
    pub prior: f64,
    /// EM iterations performed.
    pub iterations: usize,
    /// Whether the parameter change dropped below the tolerance.
    pub converged: bool,
}

/// A distinct rater decision pattern and how many voxels show it.
#[derive(Debug, Clone)]
struct PatternBin {
    words: Box<[u64]>,
    votes: u32,
    voxel_count: f64,
}

impl PatternBin {
    fn marked_by(&self, rater: usize) -> bool {
        self.words[rater / 64] & (1 << (rater % 64)) != 0
    }
}

/// Rater decisions compressed to distinct patterns plus a per-voxel
/// index into them.
struct PatternTable {
    bins: Vec<PatternBin>,
    voxel_bin: Vec<u32>,
}

impl PatternTable {
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    fn build(raters: &RaterSet) -> Self {
        let n = raters.geometry().shape.len();
        let words = raters.len().div_ceil(64).max(1);
        let mut patterns = vec![0u64; n * words];
        for (rater, mask) in raters.masks().iter().enumerate() {
            let (word, bit) = (rater / 64, 1u64 << (rater % 64));
            for (p, &v) in patterns.chunks_exact_mut(words).zip(mask.data()) {
                if v != 0 {
                    p[word] |= bit;
                }
            }
        }

        let mut histogram: BTreeMap<&[u64], usize> = BTreeMap::new();
        for p in patterns.chunks_exact(words) {
            *histogram.entry(p).or_default() += 1;
        }

        let slot: BTreeMap<&[u64], u32> = histogram
            .keys()
            .enumerate()
            .map(|(k, &bits)| (bits, k as u32))
            .collect();
        let voxel_bin = patterns
            .chunks_exact(words)
            .map(|p| slot.get(p).copied().unwrap_or(0))
            .collect();
        let bins = histogram
            .into_iter()
            .map(|(bits, count)| PatternBin {
                words: bits.into(),
                votes: bits.iter().map(|w| w.count_ones()).sum(),
                voxel_count: count as f64,
            })
            .collect();

        Self { bins, voxel_bin }
    }

    /// Foreground votes summed over every rater and voxel.
    fn total_votes(&self) -> f64 {
        self.bins
            .iter()
            .map(|b| f64::from(b.votes) * b.voxel_count)
            .sum()
    }
}

/// Run STAPLE over a validated rater set.
///
/// Starts from `p_i = q_i =` [`StapleConfig::INITIAL_PERFORMANCE`] and
/// the configured initial `W`, then alternates M-step and E-step. Stops
/// once the largest change of any `p_i` or `q_i` falls below
/// `config.tolerance`, or after `config.max_iterations` iterations; the
/// latter only logs a warning.
///
/// If no rater marks any voxel, returns an all-zero probability map
/// without iterating.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn estimate(raters: &RaterSet, config: &StapleConfig) -> StapleEstimate {
    let geometry = *raters.geometry();
    let n_raters = raters.len();
    let n_voxels = geometry.shape.len() as f64;
    let initial = PerformanceParameters {
        sensitivity: StapleConfig::INITIAL_PERFORMANCE,
        specificity: StapleConfig::INITIAL_PERFORMANCE,
    };

    let table = PatternTable::build(raters);
    let rater_mean = table.total_votes() / (n_voxels * n_raters as f64);

    if !rater_mean.is_finite() || rater_mean <= 0.0 {
        debug!("every rater is empty, skipping estimation");
        return StapleEstimate {
            probabilities: ProbabilityMap::filled(geometry.shape, geometry.header, 0.0),
            performance: vec![initial; n_raters],
            prior: 0.0,
            iterations: 0,
            converged: true,
        };
    }

    let mut prior = match config.foreground_prior {
        ForegroundPrior::RaterMean | ForegroundPrior::Reestimate => rater_mean,
        ForegroundPrior::Uniform => 0.5,
    };

    let mut weights: Vec<f64> = table
        .bins
        .iter()
        .map(|b| match config.initial_weights {
            InitialWeights::VoteFraction => f64::from(b.votes) / n_raters as f64,
            InitialWeights::Uniform => 0.5,
        })
        .collect();

    let mut performance = vec![initial; n_raters];
    let mut iterations = 0;
    let mut converged = false;

    debug!(
        raters = n_raters,
        patterns = table.bins.len(),
        prior,
        "starting STAPLE"
    );

    while iterations < config.max_iterations {
        iterations += 1;

        let previous = performance.clone();
        m_step(&table.bins, &weights, &mut performance);
        e_step(&table.bins, &performance, prior, &mut weights);

        if config.foreground_prior == ForegroundPrior::Reestimate {
            prior = table
                .bins
                .iter()
                .zip(&weights)
                .map(|(b, w)| b.voxel_count * w)
                .sum::<f64>()
                / n_voxels;
        }

        let delta = max_change(&previous, &performance);
        debug!(iteration = iterations, delta, "STAPLE iteration");
        if delta < config.tolerance {
            converged = true;
            break;
        }
    }

    if converged {
        debug!(iterations, prior, "STAPLE converged");
    } else {
        warn!(
            iterations,
            tolerance = config.tolerance,
            "STAPLE reached the iteration cap without converging"
        );
    }

    let shape = geometry.shape;
    let probabilities = ProbabilityMap::from_fn(shape, geometry.header, |x, y, z| {
        weights[table.voxel_bin[shape.index(x, y, z)] as usize]
    });

    StapleEstimate {
        probabilities,
        performance,
        prior,
        iterations,
        converged,
    }
}

/// M-step: re-estimate every rater's `(p, q)` from the current `W`.
fn m_step(bins: &[PatternBin], weights: &[f64], performance: &mut [PerformanceParameters]) {
    let (fg_total, bg_total) = bins.iter().zip(weights).fold((0.0, 0.0), |(fg, bg), (b, &w)| {
        (b.voxel_count.mul_add(w, fg), b.voxel_count.mul_add(1.0 - w, bg))
    });

    for (rater, params) in performance.iter_mut().enumerate() {
        let (hit, reject) = bins.iter().zip(weights).fold((0.0, 0.0), |(hit, reject), (b, &w)| {
            if b.marked_by(rater) {
                (b.voxel_count.mul_add(w, hit), reject)
            } else {
                (hit, b.voxel_count.mul_add(1.0 - w, reject))
            }
        });
        if fg_total > 0.0 {
            params.sensitivity = (hit / fg_total).clamp(0.0, 1.0);
        }
        if bg_total > 0.0 {
            params.specificity = (reject / bg_total).clamp(0.0, 1.0);
        }
    }
}

/// E-step: posterior foreground probability of every pattern.
fn e_step(bins: &[PatternBin], performance: &[PerformanceParameters], prior: f64, weights: &mut [f64]) {
    let log_prior = prior.ln();
    let log_complement = (1.0 - prior).ln();

    for (bin, w) in bins.iter().zip(weights.iter_mut()) {
        let (log_a, log_b) = performance.iter().enumerate().fold(
            (log_prior, log_complement),
            |(la, lb), (rater, pq)| {
                if bin.marked_by(rater) {
                    (la + pq.sensitivity.ln(), lb + (1.0 - pq.specificity).ln())
                } else {
                    (la + (1.0 - pq.sensitivity).ln(), lb + pq.specificity.ln())
                }
            },
        );
        *w = posterior(log_a, log_b, prior);
    }
}

/// `a / (a + b)` from `ln a` and `ln b`, or `fallback` when both are zero.
fn posterior(log_a: f64, log_b: f64, fallback: f64) -> f64 {
    if log_a == f64::NEG_INFINITY && log_b == f64::NEG_INFINITY {
        return fallback;
    }
    let w = 1.0 / (1.0 + (log_b - log_a).exp());
    if w.is_finite() { w.clamp(0.0, 1.0) } else { fallback }
}

fn max_change(previous: &[PerformanceParameters], current: &[PerformanceParameters]) -> f64 {
    previous
        .iter()
        .zip(current)
        .flat_map(|(a, b)| {
            [
                (a.sensitivity - b.sensitivity).abs(),
                (a.specificity - b.specificity).abs(),
            ]
        })
        .fold(0.0, f64::max)
}
