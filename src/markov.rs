//! Transition matrix model over percentile bins.
//!
//! For a horizon `h`, row `i` of the matrix is the empirical distribution of
//! the bin occupied at `t + h` given the bin occupied at `t`. Forecasts weight
//! each destination bin's mean forward return by its transition probability.

use crate::bins::PercentileBins;
use crate::empirical::EmpiricalModel;
use crate::types::HorizonSample;
use serde::{Deserialize, Serialize};
use tracing::debug;

const POWER_ITERATIONS: usize = 1000;
const POWER_TOLERANCE: f64 = 1e-12;

/// Raw transition counts and their row-normalized probabilities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionMatrix {
    pub horizon: usize,
    pub labels: Vec<String>,
    pub counts: Vec<Vec<usize>>,
    /// `None` for source bins that were never observed with a defined
    /// forward percentile.
    pub probabilities: Vec<Option<Vec<f64>>>,
}

impl TransitionMatrix {
    /// Count bin-to-bin transitions. Samples whose percentile at `t + h` is
    /// undefined are skipped.
    pub fn fit(horizon: usize, bins: &PercentileBins, samples: &[HorizonSample]) -> Self {
        let k = bins.len();
        let mut counts = vec![vec![0usize; k]; k];

        for sample in samples {
            let Some(next) = sample.forward_percentile else {
                continue;
            };
            if let (Some(from), Some(to)) = (bins.index_of(sample.percentile), bins.index_of(next)) {
                counts[from][to] += 1;
            }
        }

        let probabilities: Vec<Option<Vec<f64>>> = counts
            .iter()
            .map(|row| {
                let total: usize = row.iter().sum();
                (total > 0).then(|| {
                    row.iter()
                        .map(|&c| c as f64 / total as f64)
                        .collect::<Vec<f64>>()
                })
            })
            .collect();

        Self {
            horizon,
            labels: bins.labels(),
            counts,
            probabilities,
        }
    }

    pub fn size(&self) -> usize {
        self.labels.len()
    }

    /// Number of transitions observed out of bin `from`.
    pub fn row_total(&self, from: usize) -> usize {
        self.counts.get(from).map(|r| r.iter().sum()).unwrap_or(0)
    }

    /// Probability row for bin `from`, if any transition was observed.
    pub fn row(&self, from: usize) -> Option<&[f64]> {
        self.probabilities.get(from)?.as_deref()
    }

    pub fn probability(&self, from: usize, to: usize) -> Option<f64> {
        self.row(from).and_then(|r| r.get(to).copied())
    }

    /// Most likely destination bin from `from`; ties go to the lower bin.
    pub fn expected_next_bin(&self, from: usize) -> Option<usize> {
        let row = self.row(from)?;
        let mut best = 0;
        for (j, &p) in row.iter().enumerate() {
            if p > row[best] {
                best = j;
            }
        }
        Some(best)
    }

    /// Long-run bin occupancy by power iteration.
    ///
    /// Undefined rows are treated as absorbing. Returns `None` when no row is
    /// defined.
    pub fn stationary_distribution(&self) -> Option<Vec<f64>> {
        let k = self.size();
        if k == 0 || self.probabilities.iter().all(Option::is_none) {
            return None;
        }

        let mut dist = vec![1.0 / k as f64; k];
        for _ in 0..POWER_ITERATIONS {
            let mut next = vec![0.0; k];
            for (i, mass) in dist.iter().enumerate() {
                match self.row(i) {
                    Some(row) => {
                        for (j, p) in row.iter().enumerate() {
                            next[j] += mass * p;
                        }
                    }
                    None => next[i] += mass,
                }
            }

            let total: f64 = next.iter().sum();
            if total > 0.0 {
                next.iter_mut().for_each(|v| *v /= total);
            }
            let delta: f64 = next.iter().zip(&dist).map(|(a, b)| (a - b).abs()).sum();
            dist = next;
            if delta < POWER_TOLERANCE {
                break;
            }
        }
        Some(dist)
    }
}

/// Markov forecaster for a single horizon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkovModel {
    pub matrix: TransitionMatrix,
    bins: PercentileBins,
    /// Mean forward return per destination bin.
    destination_means: Vec<Option<f64>>,
}

impl MarkovModel {
    /// Fit the transition matrix; destination means come from the empirical
    /// model of the same horizon and training set.
    pub fn fit(horizon: usize, empirical: &EmpiricalModel, samples: &[HorizonSample]) -> Self {
        let bins = empirical.bins().clone();
        let matrix = TransitionMatrix::fit(horizon, &bins, samples);
        let destination_means = (0..bins.len()).map(|j| empirical.bin_mean(j)).collect();

        let undefined_rows = matrix.probabilities.iter().filter(|r| r.is_none()).count();
        if undefined_rows > 0 {
            debug!(
                "Transition matrix at horizon {} has {} undefined rows",
                horizon, undefined_rows
            );
        }

        Self {
            matrix,
            bins,
            destination_means,
        }
    }

    /// Probability-weighted mean of destination bin returns.
    ///
    /// Destinations without a defined mean are skipped and the remaining
    /// weights renormalized. Undefined when the source row is undefined or no
    /// reachable destination has a defined mean.
    pub fn forecast(&self, percentile: f64) -> Option<f64> {
        let from = self.bins.index_of(percentile)?;
        let row = self.matrix.row(from)?;

        let mut weighted = 0.0;
        let mut weight = 0.0;
        for (p, mean) in row.iter().zip(&self.destination_means) {
            if let Some(m) = mean {
                if *p > 0.0 {
                    weighted += p * m;
                    weight += p;
                }
            }
        }

        (weight > 0.0).then(|| weighted / weight)
    }
}
