//! Accuracy metrics for backtest forecasts.
//!
//! Every metric is computed per horizon over the records with a defined
//! prediction. Records without one are counted as coverage gaps and excluded
//! from all metrics.

use crate::backtest::BacktestRecord;
use crate::config::ForecastConfig;
use crate::stats;
use crate::types::ModelKind;
use serde::{Deserialize, Serialize};

/// Forecast accuracy for one horizon.
///
/// A metric whose denominator is zero (no samples, zero standard deviation)
/// is `None` rather than zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccuracyMetrics {
    pub horizon: usize,
    pub mae: Option<f64>,
    pub rmse: Option<f64>,
    /// Percentage of directional forecasts whose sign matched the outcome.
    pub hit_rate: Option<f64>,
    /// Annualized Sharpe ratio of trading the forecast's sign.
    pub sharpe: Option<f64>,
    /// Per-period excess of the directional strategy over buy-and-hold,
    /// divided by the tracking error.
    pub information_ratio: Option<f64>,
    pub correlation: Option<f64>,
    /// Records with a defined prediction.
    pub sample_size: usize,
    /// Records whose prediction was undefined.
    pub coverage_gaps: usize,
    /// Records with a defined, nonzero predicted direction.
    pub directional_count: usize,
    pub annualization_factor: f64,
}

impl AccuracyMetrics {
    /// Compute metrics from `(predicted, actual)` pairs.
    pub fn from_pairs(horizon: usize, pairs: &[(Option<f64>, f64)], annualization_factor: f64) -> Self {
        let defined: Vec<(f64, f64)> = pairs
            .iter()
            .filter_map(|(p, a)| p.map(|p| (p, *a)))
            .collect();
        let coverage_gaps = pairs.len() - defined.len();
        let n = defined.len();

        let predicted: Vec<f64> = defined.iter().map(|(p, _)| *p).collect();
        let actual: Vec<f64> = defined.iter().map(|(_, a)| *a).collect();

        let (mae, rmse) = if n == 0 {
            (None, None)
        } else {
            let abs_sum: f64 = defined.iter().map(|(p, a)| (p - a).abs()).sum();
            let sq_sum: f64 = defined.iter().map(|(p, a)| (p - a).powi(2)).sum();
            (Some(abs_sum / n as f64), Some((sq_sum / n as f64).sqrt()))
        };

        let directional: Vec<&(f64, f64)> = defined.iter().filter(|(p, _)| direction(*p) != 0.0).collect();
        let hits = directional
            .iter()
            .filter(|(p, a)| direction(*p) == direction(*a))
            .count();
        let hit_rate = (!directional.is_empty()).then(|| 100.0 * hits as f64 / directional.len() as f64);

        // Directional strategy: long on a positive forecast, short on a
        // negative one, flat on zero.
        let strategy: Vec<f64> = defined.iter().map(|(p, a)| a * direction(*p)).collect();
        let sharpe = match (stats::mean(&strategy), stats::sample_std(&strategy)) {
            (Some(m), Some(s)) => stats::ratio(m, s).map(|r| r * annualization_factor.sqrt()),
            _ => None,
        };

        let active: Vec<f64> = strategy.iter().zip(&actual).map(|(s, a)| s - a).collect();
        let information_ratio = match (stats::mean(&active), stats::sample_std(&active)) {
            (Some(m), Some(s)) => stats::ratio(m, s),
            _ => None,
        };

        Self {
            horizon,
            mae,
            rmse,
            hit_rate,
            sharpe,
            information_ratio,
            correlation: stats::pearson(&predicted, &actual),
            sample_size: n,
            coverage_gaps,
            directional_count: directional.len(),
            annualization_factor,
        }
    }
}

fn direction(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// Scores backtest records per configured horizon.
#[derive(Debug, Clone)]
pub struct AccuracyEvaluator {
    horizons: Vec<(usize, f64)>,
}

impl AccuracyEvaluator {
    pub fn new(config: &ForecastConfig) -> Self {
        Self {
            horizons: config
                .horizons
                .iter()
                .map(|&h| (h, config.annualization_factor(h)))
                .collect(),
        }
    }

    /// Metrics of the ensemble forecast, one entry per horizon.
    pub fn evaluate(&self, records: &[BacktestRecord]) -> Vec<AccuracyMetrics> {
        self.score(records, |r| r.predicted_return)
    }

    /// Metrics of a single model family's forecasts.
    pub fn evaluate_component(&self, records: &[BacktestRecord], kind: ModelKind) -> Vec<AccuracyMetrics> {
        self.score(records, |r| r.components.get(kind))
    }

    fn score<F>(&self, records: &[BacktestRecord], prediction: F) -> Vec<AccuracyMetrics>
    where
        F: Fn(&BacktestRecord) -> Option<f64>,
    {
        self.horizons
            .iter()
            .map(|&(horizon, factor)| {
                let pairs: Vec<(Option<f64>, f64)> = records
                    .iter()
                    .filter(|r| r.horizon == horizon)
                    .map(|r| (prediction(r), r.actual_return))
                    .collect();
                AccuracyMetrics::from_pairs(horizon, &pairs, factor)
            })
            .collect()
    }
}
