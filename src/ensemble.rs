//! Ensemble aggregation and single-shot forward mapping reports.
//!
//! [`HorizonModels`] bundles every model family fitted on one training set
//! for one horizon. [`ForwardMapper`] fits them fresh on each call and turns
//! them into a [`PredictionReport`] for the current percentile.

use crate::accuracy::AccuracyMetrics;
use crate::config::ForecastConfig;
use crate::dataset::Dataset;
use crate::empirical::{BinStatistics, EmpiricalModel};
use crate::error::{FitWarning, ForecastError, Result};
use crate::kernel::KernelModel;
use crate::markov::{MarkovModel, TransitionMatrix};
use crate::regression::RegressionSuite;
use crate::types::{BarDuration, HorizonSample, ModelKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// z-score of the two-sided 95% linear prediction interval.
pub const PREDICTION_INTERVAL_Z: f64 = 1.96;

/// One forecast per ensemble component; `None` means undefined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentForecasts {
    pub empirical: Option<f64>,
    pub markov: Option<f64>,
    pub linear: Option<f64>,
    pub polynomial: Option<f64>,
    pub quantile_median: Option<f64>,
    pub kernel: Option<f64>,
}

impl ComponentForecasts {
    pub fn get(&self, kind: ModelKind) -> Option<f64> {
        match kind {
            ModelKind::Empirical => self.empirical,
            ModelKind::Markov => self.markov,
            ModelKind::Linear => self.linear,
            ModelKind::Polynomial => self.polynomial,
            ModelKind::QuantileMedian => self.quantile_median,
            ModelKind::Kernel => self.kernel,
        }
    }

    pub fn defined(&self) -> Vec<ModelKind> {
        ModelKind::ALL
            .into_iter()
            .filter(|k| self.get(*k).is_some())
            .collect()
    }

    pub fn undefined(&self) -> Vec<ModelKind> {
        ModelKind::ALL
            .into_iter()
            .filter(|k| self.get(*k).is_none())
            .collect()
    }

    /// Arithmetic mean of the defined components. Undefined components are
    /// left out, never counted as zero.
    pub fn ensemble(&self) -> Option<f64> {
        let values: Vec<f64> = ModelKind::ALL
            .into_iter()
            .filter_map(|k| self.get(k))
            .collect();
        if values.is_empty() {
            return None;
        }
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Conditional quantile of the forward return.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantileForecast {
    pub level: f64,
    pub value: f64,
}

/// Closed prediction interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub lower: f64,
    pub upper: f64,
}

/// Forecast of the forward return for one horizon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardPrediction {
    pub horizon: usize,
    pub percentile: f64,
    pub bin_label: Option<String>,
    pub components: ComponentForecasts,
    pub quantiles: Vec<QuantileForecast>,
    pub ensemble: Option<f64>,
    pub defined: Vec<ModelKind>,
    pub undefined: Vec<ModelKind>,
    /// `None` when the empirical component itself is undefined.
    pub empirical_low_confidence: Option<bool>,
    pub linear_interval: Option<Interval>,
    pub kernel_bandwidth: f64,
}

/// Every model family fitted on one training set for one horizon.
#[derive(Debug, Clone)]
pub struct HorizonModels {
    pub horizon: usize,
    pub empirical: EmpiricalModel,
    pub markov: MarkovModel,
    pub regression: RegressionSuite,
    pub kernel: KernelModel,
    pub warnings: Vec<FitWarning>,
}

impl HorizonModels {
    /// Fit all models from `samples` only.
    pub fn fit(config: &ForecastConfig, horizon: usize, samples: &[HorizonSample]) -> Self {
        let empirical = EmpiricalModel::fit(
            horizon,
            &config.percentile_bins,
            config.min_samples_per_bin,
            samples,
        );
        let markov = MarkovModel::fit(horizon, &empirical, samples);
        let regression = RegressionSuite::fit(
            horizon,
            config.polynomial_degree,
            &config.quantile_levels,
            samples,
        );
        let kernel = KernelModel::fit(horizon, samples, config.kernel_bandwidth);

        let mut warnings = empirical.warnings.clone();
        warnings.extend(regression.warnings.iter().cloned());
        debug!(
            "Fitted horizon {} on {} samples with {} warnings",
            horizon,
            samples.len(),
            warnings.len()
        );

        Self {
            horizon,
            empirical,
            markov,
            regression,
            kernel,
            warnings,
        }
    }

    /// Component forecasts for a percentile.
    pub fn components(&self, percentile: f64) -> ComponentForecasts {
        ComponentForecasts {
            empirical: self.empirical.forecast(percentile).map(|f| f.mean),
            markov: self.markov.forecast(percentile),
            linear: self.regression.linear.as_ref().map(|m| m.predict(percentile)),
            polynomial: self
                .regression
                .polynomial
                .as_ref()
                .map(|m| m.predict(percentile)),
            quantile_median: self.regression.median().map(|m| m.predict(percentile)),
            kernel: self.kernel.forecast(percentile),
        }
    }

    /// Full forecast for a percentile.
    pub fn predict(&self, percentile: f64) -> ForwardPrediction {
        let components = self.components(percentile);
        let empirical = self.empirical.forecast(percentile);

        ForwardPrediction {
            horizon: self.horizon,
            percentile,
            bin_label: self
                .empirical
                .bins()
                .bin_of(percentile)
                .map(|b| b.label.clone()),
            components,
            quantiles: self
                .regression
                .quantiles
                .iter()
                .map(|q| QuantileForecast {
                    level: q.level,
                    value: q.predict(percentile),
                })
                .collect(),
            ensemble: components.ensemble(),
            defined: components.defined(),
            undefined: components.undefined(),
            empirical_low_confidence: empirical.map(|f| f.low_confidence),
            linear_interval: self
                .regression
                .linear
                .as_ref()
                .and_then(|m| m.prediction_interval(percentile, PREDICTION_INTERVAL_Z))
                .map(|(lower, upper)| Interval { lower, upper }),
            kernel_bandwidth: self.kernel.bandwidth,
        }
    }
}

/// Bin statistics of one horizon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinTable {
    pub horizon: usize,
    pub bins: Vec<BinStatistics>,
}

/// Serializable output of a single-shot analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionReport {
    pub instrument: String,
    pub data_hash: String,
    pub sample_size: usize,
    pub current_timestamp: DateTime<Utc>,
    pub current_percentile: f64,
    pub current_bin: Option<String>,
    /// Bar length of the input series; horizons count these bars.
    pub bar_duration: BarDuration,
    pub predictions: Vec<ForwardPrediction>,
    pub bin_statistics: Vec<BinTable>,
    pub transition_matrices: Vec<TransitionMatrix>,
    pub regressions: Vec<RegressionSuite>,
    /// Accuracy of the most recent backtest, when one was attached.
    pub accuracy: Option<Vec<AccuracyMetrics>>,
    pub warnings: Vec<FitWarning>,
}

impl PredictionReport {
    pub fn with_accuracy(mut self, accuracy: Vec<AccuracyMetrics>) -> Self {
        self.accuracy = Some(accuracy);
        self
    }

    pub fn prediction(&self, horizon: usize) -> Option<&ForwardPrediction> {
        self.predictions.iter().find(|p| p.horizon == horizon)
    }
}

/// Fits the full model ensemble and produces forward mapping reports.
#[derive(Debug, Clone)]
pub struct ForwardMapper {
    config: ForecastConfig,
}

impl ForwardMapper {
    pub fn new(config: ForecastConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ForecastConfig {
        &self.config
    }

    fn check_horizons(&self, dataset: &Dataset) -> Result<()> {
        if dataset.horizons != self.config.horizons {
            return Err(ForecastError::InvalidConfiguration(format!(
                "Dataset horizons {:?} do not match configured horizons {:?}",
                dataset.horizons, self.config.horizons
            )));
        }
        Ok(())
    }

    /// Fit every horizon on the whole dataset.
    pub fn fit(&self, dataset: &Dataset) -> Result<Vec<HorizonModels>> {
        self.check_horizons(dataset)?;
        Ok(self
            .config
            .horizons
            .iter()
            .enumerate()
            .map(|(i, &h)| HorizonModels::fit(&self.config, h, &dataset.samples(i)))
            .collect())
    }

    /// Forecast every horizon for an arbitrary percentile.
    pub fn forecast(&self, dataset: &Dataset, percentile: f64) -> Result<Vec<ForwardPrediction>> {
        if !percentile.is_finite() || !(0.0..=100.0).contains(&percentile) {
            return Err(ForecastError::InvalidInput(format!(
                "Percentile must lie in [0, 100], got {}",
                percentile
            )));
        }
        Ok(self
            .fit(dataset)?
            .iter()
            .map(|m| m.predict(percentile))
            .collect())
    }

    /// Analyze the dataset's current percentile.
    pub fn analyze(&self, instrument: &str, dataset: &Dataset) -> Result<PredictionReport> {
        let current = dataset.current.ok_or_else(|| {
            ForecastError::DataError("No defined percentile in the input series".to_string())
        })?;
        let models = self.fit(dataset)?;

        info!(
            "Analyzing {} at percentile {:.2} ({} observations)",
            instrument,
            current.percentile,
            dataset.len()
        );

        let report = PredictionReport {
            instrument: instrument.to_string(),
            data_hash: dataset.fingerprint.clone(),
            sample_size: dataset.len(),
            current_timestamp: current.timestamp,
            current_percentile: current.percentile,
            current_bin: self
                .config
                .percentile_bins
                .bin_of(current.percentile)
                .map(|b| b.label.clone()),
            bar_duration: self.config.bar_duration,
            predictions: models.iter().map(|m| m.predict(current.percentile)).collect(),
            bin_statistics: models
                .iter()
                .map(|m| BinTable {
                    horizon: m.horizon,
                    bins: m.empirical.statistics.clone(),
                })
                .collect(),
            transition_matrices: models.iter().map(|m| m.markov.matrix.clone()).collect(),
            regressions: models.iter().map(|m| m.regression.clone()).collect(),
            accuracy: None,
            warnings: models.iter().flat_map(|m| m.warnings.iter().cloned()).collect(),
        };
        Ok(report)
    }
}
