//! Empirical bin model: forward return statistics per percentile bin.

use crate::bins::PercentileBins;
use crate::error::{FitWarning, ForecastError};
use crate::stats;
use crate::types::HorizonSample;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Forward return statistics for one (bin, horizon) pair.
///
/// Statistics that need more samples than the bin holds are `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinStatistics {
    pub label: String,
    pub lower: f64,
    pub upper: f64,
    pub horizon: usize,
    pub count: usize,
    pub mean: Option<f64>,
    pub median: Option<f64>,
    /// Sample (n - 1) standard deviation.
    pub std: Option<f64>,
    pub pct5: Option<f64>,
    pub pct95: Option<f64>,
    /// Mean of the strictly positive returns.
    pub upside_mean: Option<f64>,
    /// Sample standard deviation of the strictly negative returns.
    pub downside_std: Option<f64>,
    /// Fewer than `min_samples_per_bin` samples, or zero variance.
    pub low_confidence: bool,
}

impl BinStatistics {
    fn compute(
        label: &str,
        lower: f64,
        upper: f64,
        horizon: usize,
        returns: &[f64],
        min_samples: usize,
    ) -> Self {
        let sorted = stats::sorted(returns);
        let upside: Vec<f64> = returns.iter().copied().filter(|r| *r > 0.0).collect();
        let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
        let std = stats::sample_std(returns);
        let zero_variance = matches!(std, Some(s) if s <= f64::EPSILON);

        Self {
            label: label.to_string(),
            lower,
            upper,
            horizon,
            count: returns.len(),
            mean: stats::mean(returns),
            median: stats::quantile_sorted(&sorted, 0.5),
            std,
            pct5: stats::quantile_sorted(&sorted, 0.05),
            pct95: stats::quantile_sorted(&sorted, 0.95),
            upside_mean: stats::mean(&upside),
            downside_std: stats::sample_std(&downside),
            low_confidence: returns.len() < min_samples || zero_variance,
        }
    }

    /// A bin with no samples has no defined statistics.
    pub fn is_degenerate(&self) -> bool {
        self.count == 0
    }
}

/// Mean forecast of the bin holding the queried percentile.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmpiricalForecast {
    pub mean: f64,
    pub count: usize,
    pub low_confidence: bool,
}

/// Per-bin statistics for a single horizon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmpiricalModel {
    pub horizon: usize,
    bins: PercentileBins,
    pub statistics: Vec<BinStatistics>,
    pub warnings: Vec<FitWarning>,
}

impl EmpiricalModel {
    /// Group samples by bin and compute statistics for each.
    ///
    /// Bins are validated when the [`PercentileBins`] is built, so fitting
    /// itself cannot fail. Empty bins and zero-variance bins are recorded as
    /// degenerate-bin warnings.
    pub fn fit(
        horizon: usize,
        bins: &PercentileBins,
        min_samples_per_bin: usize,
        samples: &[HorizonSample],
    ) -> Self {
        let mut grouped: Vec<Vec<f64>> = vec![Vec::new(); bins.len()];
        for sample in samples {
            if let Some(idx) = bins.index_of(sample.percentile) {
                grouped[idx].push(sample.forward_return);
            }
        }

        let mut warnings = Vec::new();
        let statistics: Vec<BinStatistics> = bins
            .iter()
            .zip(&grouped)
            .map(|(bin, returns)| {
                let stats = BinStatistics::compute(
                    &bin.label,
                    bin.lower,
                    bin.upper,
                    horizon,
                    returns,
                    min_samples_per_bin,
                );

                let degenerate = if stats.is_degenerate() {
                    Some("no samples")
                } else if stats.low_confidence && stats.count >= min_samples_per_bin {
                    Some("zero variance")
                } else {
                    None
                };
                if let Some(reason) = degenerate {
                    let err = ForecastError::DegenerateBin {
                        bin: bin.label.clone(),
                        horizon,
                        reason: reason.to_string(),
                    };
                    warn!("{}", err);
                    warnings.extend(FitWarning::from_error(&err));
                } else if stats.low_confidence {
                    debug!(
                        "Bin '{}' at horizon {} has only {} samples",
                        bin.label, horizon, stats.count
                    );
                }
                stats
            })
            .collect();

        Self {
            horizon,
            bins: bins.clone(),
            statistics,
            warnings,
        }
    }

    pub fn bins(&self) -> &PercentileBins {
        &self.bins
    }

    /// Statistics of the bin at `index`.
    pub fn bin_statistics(&self, index: usize) -> Option<&BinStatistics> {
        self.statistics.get(index)
    }

    /// Mean forward return of the bin at `index`, if defined.
    pub fn bin_mean(&self, index: usize) -> Option<f64> {
        self.statistics.get(index).and_then(|s| s.mean)
    }

    /// Forecast for a percentile: the mean of its bin.
    ///
    /// Undefined when the bin has no samples. A thin or constant bin still
    /// forecasts but is flagged low-confidence.
    pub fn forecast(&self, percentile: f64) -> Option<EmpiricalForecast> {
        let idx = self.bins.index_of(percentile)?;
        let stats = &self.statistics[idx];
        stats.mean.map(|mean| EmpiricalForecast {
            mean,
            count: stats.count,
            low_confidence: stats.low_confidence,
        })
    }
}
