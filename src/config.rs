//! Configuration for forward mapping analyses and backtests.
//!
//! [`ForecastConfig`] is the validated in-memory configuration every model and
//! the backtest engine consume. [`ForecastFileConfig`] is its TOML file form,
//! used by the CLI for reproducible runs.

use crate::bins::{PercentileBin, PercentileBins};
use crate::error::{ForecastError, Result};
use crate::kernel::KernelBandwidth;
use crate::types::BarDuration;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Highest polynomial degree accepted for the polynomial regression.
pub const MAX_POLYNOMIAL_DEGREE: usize = 5;

/// Validated configuration for one instrument's forward mapping pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastConfig {
    /// Forward horizons in bars, strictly increasing.
    pub horizons: Vec<usize>,
    /// Percentile bins partitioning [0, 100].
    pub percentile_bins: PercentileBins,
    /// Bins with fewer samples are flagged low-confidence.
    pub min_samples_per_bin: usize,
    /// Kernel smoothing bandwidth, fixed or `auto`.
    pub kernel_bandwidth: KernelBandwidth,
    /// Quantile regression levels, each in (0, 1).
    pub quantile_levels: Vec<f64>,
    /// Degree of the polynomial regression.
    pub polynomial_degree: usize,
    /// Bar duration of the input series.
    pub bar_duration: BarDuration,
    /// Replaces the bar-duration based annualization factor when set.
    pub annualization_override: Option<f64>,
    /// Observations per training window.
    pub train_window_length: usize,
    /// Observations per test window.
    pub test_window_length: usize,
    /// Window advance; defaults to `test_window_length`.
    pub step: Option<usize>,
    /// Drop training rows whose label horizon reaches into the test window.
    pub purge_overlapping: bool,
    /// Show a progress bar during backtests.
    pub show_progress: bool,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            horizons: vec![1, 5, 10, 20],
            percentile_bins: PercentileBins::default(),
            min_samples_per_bin: 5,
            kernel_bandwidth: KernelBandwidth::Auto,
            quantile_levels: vec![0.05, 0.5, 0.95],
            polynomial_degree: 2,
            bar_duration: BarDuration::Day,
            annualization_override: None,
            train_window_length: 252,
            test_window_length: 21,
            step: None,
            purge_overlapping: true,
            show_progress: false,
        }
    }
}

impl ForecastConfig {
    /// Create a config for the given horizons with default settings otherwise.
    pub fn with_horizons(horizons: Vec<usize>) -> Self {
        Self {
            horizons,
            ..Default::default()
        }
    }

    /// Set the rolling window lengths.
    pub fn with_windows(mut self, train: usize, test: usize) -> Self {
        self.train_window_length = train;
        self.test_window_length = test;
        self
    }

    /// Set the window step.
    pub fn with_step(mut self, step: usize) -> Self {
        self.step = Some(step);
        self
    }

    /// Effective window step.
    pub fn effective_step(&self) -> usize {
        self.step.unwrap_or(self.test_window_length)
    }

    /// Annualization factor for a horizon.
    pub fn annualization_factor(&self, horizon: usize) -> f64 {
        self.annualization_override
            .unwrap_or_else(|| self.bar_duration.annualization_factor(horizon))
    }

    /// Largest configured horizon.
    pub fn max_horizon(&self) -> usize {
        self.horizons.iter().copied().max().unwrap_or(0)
    }

    /// Check every option; any problem is an `InvalidConfiguration`.
    pub fn validate(&self) -> Result<()> {
        validate_horizons(&self.horizons)?;

        if self.min_samples_per_bin == 0 {
            return Err(ForecastError::InvalidConfiguration(
                "min_samples_per_bin must be at least 1".to_string(),
            ));
        }

        if let KernelBandwidth::Fixed(bw) = self.kernel_bandwidth {
            if !bw.is_finite() || bw <= 0.0 {
                return Err(ForecastError::InvalidConfiguration(format!(
                    "kernel_bandwidth must be positive, got {}",
                    bw
                )));
            }
        }

        validate_quantile_levels(&self.quantile_levels)?;

        if self.polynomial_degree == 0 || self.polynomial_degree > MAX_POLYNOMIAL_DEGREE {
            return Err(ForecastError::InvalidConfiguration(format!(
                "polynomial_degree must be between 1 and {}, got {}",
                MAX_POLYNOMIAL_DEGREE, self.polynomial_degree
            )));
        }

        if let Some(factor) = self.annualization_override {
            if !factor.is_finite() || factor <= 0.0 {
                return Err(ForecastError::InvalidConfiguration(format!(
                    "annualization_override must be positive, got {}",
                    factor
                )));
            }
        }

        if self.train_window_length == 0 || self.test_window_length == 0 {
            return Err(ForecastError::InvalidConfiguration(
                "train_window_length and test_window_length must be positive".to_string(),
            ));
        }
        if self.step == Some(0) {
            return Err(ForecastError::InvalidConfiguration(
                "step must be positive".to_string(),
            ));
        }

        if self.purge_overlapping && self.train_window_length <= self.max_horizon() {
            warn!(
                "Training window of {} bars is not longer than the largest horizon {}; \
                 purged training sets will be empty",
                self.train_window_length,
                self.max_horizon()
            );
        }

        Ok(())
    }
}

fn validate_horizons(horizons: &[usize]) -> Result<()> {
    if horizons.is_empty() {
        return Err(ForecastError::InvalidConfiguration(
            "At least one horizon is required".to_string(),
        ));
    }
    if horizons.contains(&0) {
        return Err(ForecastError::InvalidConfiguration(
            "Horizons must be positive bar counts".to_string(),
        ));
    }
    if horizons.windows(2).any(|w| w[0] >= w[1]) {
        return Err(ForecastError::InvalidConfiguration(format!(
            "Horizons must be strictly increasing, got {:?}",
            horizons
        )));
    }
    Ok(())
}

fn validate_quantile_levels(levels: &[f64]) -> Result<()> {
    for &level in levels {
        if !level.is_finite() || level <= 0.0 || level >= 1.0 {
            return Err(ForecastError::InvalidConfiguration(format!(
                "Quantile levels must lie in (0, 1), got {}",
                level
            )));
        }
    }
    let mut sorted = levels.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    if sorted.windows(2).any(|w| (w[1] - w[0]).abs() < 1e-12) {
        return Err(ForecastError::InvalidConfiguration(
            "Quantile levels must be unique".to_string(),
        ));
    }
    Ok(())
}

/// Complete configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForecastFileConfig {
    /// Input data settings.
    #[serde(default)]
    pub data: DataSettings,
    /// Model settings.
    #[serde(default)]
    pub analysis: AnalysisSettings,
    /// Rolling backtest settings.
    #[serde(default)]
    pub backtest: BacktestSettings,
    /// Percentile bins; the default partition is used when empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bins: Vec<PercentileBin>,
}

/// Input data settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSettings {
    /// Path to the CSV file with timestamp, price and percentile columns.
    pub path: Option<String>,
    /// Instrument name used in reports and cache keys.
    #[serde(default = "default_instrument")]
    pub instrument: String,
    /// Date format in the CSV.
    pub date_format: Option<String>,
}

fn default_instrument() -> String { "INSTRUMENT".to_string() }

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            path: None,
            instrument: default_instrument(),
            date_format: None,
        }
    }
}

/// Model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisSettings {
    #[serde(default = "default_horizons")]
    pub horizons: Vec<usize>,
    #[serde(default = "default_min_samples")]
    pub min_samples_per_bin: usize,
    #[serde(default)]
    pub kernel_bandwidth: KernelBandwidth,
    #[serde(default = "default_quantile_levels")]
    pub quantile_levels: Vec<f64>,
    #[serde(default = "default_polynomial_degree")]
    pub polynomial_degree: usize,
    #[serde(default)]
    pub bar_duration: BarDuration,
    #[serde(default)]
    pub annualization_override: Option<f64>,
}

fn default_horizons() -> Vec<usize> { vec![1, 5, 10, 20] }
fn default_min_samples() -> usize { 5 }
fn default_quantile_levels() -> Vec<f64> { vec![0.05, 0.5, 0.95] }
fn default_polynomial_degree() -> usize { 2 }

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            horizons: default_horizons(),
            min_samples_per_bin: default_min_samples(),
            kernel_bandwidth: KernelBandwidth::Auto,
            quantile_levels: default_quantile_levels(),
            polynomial_degree: default_polynomial_degree(),
            bar_duration: BarDuration::Day,
            annualization_override: None,
        }
    }
}

/// Rolling backtest settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestSettings {
    #[serde(default = "default_train_window")]
    pub train_window_length: usize,
    #[serde(default = "default_test_window")]
    pub test_window_length: usize,
    #[serde(default)]
    pub step: Option<usize>,
    #[serde(default = "default_true")]
    pub purge_overlapping: bool,
}

fn default_train_window() -> usize { 252 }
fn default_test_window() -> usize { 21 }
fn default_true() -> bool { true }

impl Default for BacktestSettings {
    fn default() -> Self {
        Self {
            train_window_length: default_train_window(),
            test_window_length: default_test_window(),
            step: None,
            purge_overlapping: true,
        }
    }
}

impl ForecastFileConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        let content = fs::read_to_string(path)?;
        let config: ForecastFileConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ForecastError::InvalidConfiguration(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Convert to a validated [`ForecastConfig`].
    pub fn to_forecast_config(&self) -> Result<ForecastConfig> {
        let percentile_bins = if self.bins.is_empty() {
            PercentileBins::default()
        } else {
            PercentileBins::new(self.bins.clone())?
        };

        let config = ForecastConfig {
            horizons: self.analysis.horizons.clone(),
            percentile_bins,
            min_samples_per_bin: self.analysis.min_samples_per_bin,
            kernel_bandwidth: self.analysis.kernel_bandwidth,
            quantile_levels: self.analysis.quantile_levels.clone(),
            polynomial_degree: self.analysis.polynomial_degree,
            bar_duration: self.analysis.bar_duration,
            annualization_override: self.analysis.annualization_override,
            train_window_length: self.backtest.train_window_length,
            test_window_length: self.backtest.test_window_length,
            step: self.backtest.step,
            purge_overlapping: self.backtest.purge_overlapping,
            show_progress: true,
        };
        config.validate()?;
        Ok(config)
    }

    /// Generate an example configuration file content.
    pub fn example() -> String {
        r#"# Percentile forward mapping configuration

[data]
path = "data/sample.csv"
instrument = "BTCUSDT"
# date_format = "%Y-%m-%d"

[analysis]
horizons = [1, 5, 10, 20]
min_samples_per_bin = 5
kernel_bandwidth = "auto"   # or a width in percentile points, e.g. 10.0
quantile_levels = [0.05, 0.5, 0.95]
polynomial_degree = 2
bar_duration = "1d"         # "15m", "1h", "4h", "1d", "1w"
# annualization_override = 252.0

[backtest]
train_window_length = 252
test_window_length = 21
# step = 21
purge_overlapping = true

# Percentile bins must partition [0, 100]. Omit to use the defaults.
[[bins]]
lower = 0.0
upper = 5.0
label = "extreme-low"

[[bins]]
lower = 5.0
upper = 30.0
label = "low"

[[bins]]
lower = 30.0
upper = 70.0
label = "neutral"

[[bins]]
lower = 70.0
upper = 95.0
label = "high"

[[bins]]
lower = 95.0
upper = 100.0
label = "extreme-high"
"#
        .to_string()
    }
}
