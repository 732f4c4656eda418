//! Rolling-window out-of-sample backtest.
//!
//! Each window fits every model family on its training slice only and
//! forecasts each observation of the following test slice. Training rows whose
//! forward-return label reaches into the test window are purged, so no model
//! of window `W` consumes a timestamp at or after `W`'s test start.

use crate::accuracy::{AccuracyEvaluator, AccuracyMetrics};
use crate::config::ForecastConfig;
use crate::dataset::{samples_for, Dataset};
use crate::ensemble::{ComponentForecasts, HorizonModels};
use crate::error::{FitWarning, ForecastError, Result};
use crate::types::{HorizonSample, Observation};
use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Cooperative cancellation flag, checked at every window boundary.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Index and time boundaries of one train/test window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacktestWindow {
    pub index: usize,
    pub train_start: usize,
    /// Exclusive; equal to `test_start`.
    pub train_end: usize,
    pub test_start: usize,
    /// Exclusive.
    pub test_end: usize,
    pub train_start_time: DateTime<Utc>,
    pub test_start_time: DateTime<Utc>,
    pub test_end_time: DateTime<Utc>,
}

/// One out-of-sample forecast and its realized outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestRecord {
    pub window_index: usize,
    /// First training timestamp of the window.
    pub window_start: DateTime<Utc>,
    /// Last test timestamp of the window.
    pub window_end: DateTime<Utc>,
    pub test_start: DateTime<Utc>,
    pub test_timestamp: DateTime<Utc>,
    pub horizon: usize,
    pub percentile: f64,
    /// Ensemble forecast; `None` when every component was undefined.
    pub predicted_return: Option<f64>,
    pub actual_return: f64,
    pub components: ComponentForecasts,
    /// Latest timestamp the models for this horizon consumed, label horizons
    /// included. `None` when the training set was empty.
    pub latest_training_timestamp: Option<DateTime<Utc>>,
}

/// A record whose models saw data at or after its test window start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookaheadViolation {
    pub window_index: usize,
    pub horizon: usize,
    pub test_timestamp: DateTime<Utc>,
    pub latest_training_timestamp: DateTime<Utc>,
}

/// Output of a rolling backtest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestRun {
    /// Sorted by window, test timestamp, then horizon.
    pub records: Vec<BacktestRecord>,
    pub windows: Vec<BacktestWindow>,
    /// Indices of the windows that were evaluated, ascending. A cancelled
    /// parallel run may leave gaps.
    pub completed_windows: Vec<usize>,
    pub windows_completed: usize,
    pub cancelled: bool,
    pub warnings: Vec<FitWarning>,
}

impl BacktestRun {
    /// Records whose prediction was undefined.
    pub fn coverage_gaps(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.predicted_return.is_none())
            .count()
    }

    /// Audit every record against its window's test start.
    pub fn verify_no_lookahead(&self) -> Vec<LookaheadViolation> {
        self.records
            .iter()
            .filter_map(|r| {
                let latest = r.latest_training_timestamp?;
                (latest >= r.test_start || latest >= r.test_timestamp).then(|| LookaheadViolation {
                    window_index: r.window_index,
                    horizon: r.horizon,
                    test_timestamp: r.test_timestamp,
                    latest_training_timestamp: latest,
                })
            })
            .collect()
    }

    pub fn evaluate(&self, config: &ForecastConfig) -> Vec<AccuracyMetrics> {
        AccuracyEvaluator::new(config).evaluate(&self.records)
    }
}

struct WindowResult {
    index: usize,
    records: Vec<BacktestRecord>,
    warnings: Vec<FitWarning>,
}

/// Rolling-window backtest engine.
#[derive(Debug, Clone)]
pub struct RollingBacktest {
    config: ForecastConfig,
    cancel: CancellationToken,
}

impl RollingBacktest {
    pub fn new(config: ForecastConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            cancel: CancellationToken::new(),
        })
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &ForecastConfig {
        &self.config
    }

    /// Window boundaries over the dataset's observations.
    pub fn calculate_windows(&self, dataset: &Dataset) -> Result<Vec<BacktestWindow>> {
        let train = self.config.train_window_length;
        let test = self.config.test_window_length;
        let step = self.config.effective_step();
        let n = dataset.len();

        if n < train + test {
            return Err(ForecastError::InsufficientData {
                required: train + test,
                available: n,
            });
        }

        let obs = &dataset.observations;
        let mut windows = Vec::new();
        let mut start = 0;
        while start + train + test <= n {
            let test_start = start + train;
            let test_end = test_start + test;
            windows.push(BacktestWindow {
                index: windows.len(),
                train_start: start,
                train_end: test_start,
                test_start,
                test_end,
                train_start_time: obs[start].timestamp,
                test_start_time: obs[test_start].timestamp,
                test_end_time: obs[test_end - 1].timestamp,
            });
            start += step;
        }
        Ok(windows)
    }

    /// Run every window sequentially.
    pub fn run(&self, dataset: &Dataset) -> Result<BacktestRun> {
        let windows = self.prepare(dataset)?;
        let progress = self.progress_bar(windows.len());

        let mut results = Vec::with_capacity(windows.len());
        for window in &windows {
            if self.cancel.is_cancelled() {
                warn!("Backtest cancelled before window {}", window.index);
                break;
            }
            results.push(self.evaluate_window(dataset, window));
            if let Some(pb) = &progress {
                pb.inc(1);
            }
        }

        if let Some(pb) = progress {
            pb.finish_with_message("done");
        }
        Ok(self.merge(windows, results))
    }

    /// Run windows in parallel. Output is identical to [`run`](Self::run).
    pub fn run_parallel(&self, dataset: &Dataset) -> Result<BacktestRun> {
        let windows = self.prepare(dataset)?;
        let progress = self.progress_bar(windows.len());

        let results: Vec<WindowResult> = windows
            .par_iter()
            .filter_map(|window| {
                if self.cancel.is_cancelled() {
                    return None;
                }
                let result = self.evaluate_window(dataset, window);
                if let Some(pb) = &progress {
                    pb.inc(1);
                }
                Some(result)
            })
            .collect();

        if let Some(pb) = progress {
            pb.finish_with_message("done");
        }
        Ok(self.merge(windows, results))
    }

    fn prepare(&self, dataset: &Dataset) -> Result<Vec<BacktestWindow>> {
        if dataset.horizons != self.config.horizons {
            return Err(ForecastError::InvalidConfiguration(format!(
                "Dataset horizons {:?} do not match configured horizons {:?}",
                dataset.horizons, self.config.horizons
            )));
        }
        let windows = self.calculate_windows(dataset)?;
        info!(
            "Running rolling backtest: {} windows (train {}, test {}, step {}, purge {})",
            windows.len(),
            self.config.train_window_length,
            self.config.test_window_length,
            self.config.effective_step(),
            self.config.purge_overlapping
        );
        Ok(windows)
    }

    fn progress_bar(&self, len: usize) -> Option<ProgressBar> {
        if !self.config.show_progress {
            return None;
        }
        let pb = ProgressBar::new(len as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} windows ({eta})")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        Some(pb)
    }

    fn evaluate_window(&self, dataset: &Dataset, window: &BacktestWindow) -> WindowResult {
        let train = &dataset.observations[window.train_start..window.train_end];
        let test = &dataset.observations[window.test_start..window.test_end];

        let mut records = Vec::with_capacity(test.len() * self.config.horizons.len());
        let mut warnings = Vec::new();

        for (hi, &horizon) in self.config.horizons.iter().enumerate() {
            let samples = self.training_samples(train, hi, window.test_start_time);
            let latest = latest_consumed(&samples);
            let models = HorizonModels::fit(&self.config, horizon, &samples);
            warnings.extend(models.warnings.iter().cloned());

            debug!(
                "Window {} horizon {}: {} training samples ({} purged)",
                window.index,
                horizon,
                samples.len(),
                train.len() - samples.len()
            );

            for obs in test {
                let components = models.components(obs.percentile);
                records.push(BacktestRecord {
                    window_index: window.index,
                    window_start: window.train_start_time,
                    window_end: window.test_end_time,
                    test_start: window.test_start_time,
                    test_timestamp: obs.timestamp,
                    horizon,
                    percentile: obs.percentile,
                    predicted_return: components.ensemble(),
                    actual_return: obs.forward_returns[hi],
                    components,
                    latest_training_timestamp: latest,
                });
            }
        }

        WindowResult {
            index: window.index,
            records,
            warnings,
        }
    }

    /// Training samples for one horizon, purged of rows whose label ends at
    /// or after the test start.
    fn training_samples(
        &self,
        train: &[Observation],
        horizon_index: usize,
        test_start: DateTime<Utc>,
    ) -> Vec<HorizonSample> {
        let samples = samples_for(train, horizon_index);
        if !self.config.purge_overlapping {
            return samples;
        }
        samples
            .into_iter()
            .filter(|s| s.horizon_end < test_start)
            .collect()
    }

    fn merge(&self, windows: Vec<BacktestWindow>, results: Vec<WindowResult>) -> BacktestRun {
        let windows_completed = results.len();
        let cancelled = windows_completed < windows.len();

        let mut records = Vec::new();
        let mut warnings = Vec::new();
        let mut completed_windows = Vec::with_capacity(results.len());
        for result in results {
            completed_windows.push(result.index);
            records.extend(result.records);
            warnings.extend(result.warnings);
        }
        completed_windows.sort_unstable();
        records.sort_by(|a, b| {
            (a.window_index, a.test_timestamp, a.horizon).cmp(&(b.window_index, b.test_timestamp, b.horizon))
        });

        info!(
            "Backtest finished: {}/{} windows, {} records, {} warnings",
            windows_completed,
            windows.len(),
            records.len(),
            warnings.len()
        );

        BacktestRun {
            records,
            windows,
            completed_windows,
            windows_completed,
            cancelled,
            warnings,
        }
    }
}

/// Latest timestamp a fit on `samples` depends on, labels included.
fn latest_consumed(samples: &[HorizonSample]) -> Option<DateTime<Utc>> {
    samples
        .iter()
        .map(|s| s.timestamp.max(s.horizon_end))
        .max()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::DatasetBuilder;
    use crate::types::{ModelKind, PercentilePoint, PricePoint};
    use chrono::TimeZone;

    fn dataset(n: usize, horizons: Vec<usize>) -> Dataset {
        let t0 = Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap();
        let mut price = 100.0;
        let mut prices = Vec::new();
        let mut pct = Vec::new();
        for i in 0..n {
            let ts = t0 + chrono::Duration::days(i as i64);
            let p = ((i * 53) % 101) as f64;
            prices.push(PricePoint::new(ts, price));
            pct.push(PercentilePoint::new(ts, Some(p)));
            price *= 1.0 - 0.0003 * (p - 50.0);
        }
        DatasetBuilder::new(horizons).unwrap().build(&pct, &prices).unwrap()
    }

    fn config(horizons: Vec<usize>, train: usize, test: usize) -> ForecastConfig {
        ForecastConfig::with_horizons(horizons).with_windows(train, test)
    }

    #[test]
    fn test_window_calculation() {
        let data = dataset(130, vec![1]);
        let bt = RollingBacktest::new(config(vec![1], 100, 10)).unwrap();
        let windows = bt.calculate_windows(&data).unwrap();

        // 129 observations: starts 0, 10 fit (0+110, 10+110 <= 129).
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[1].train_start, 10);
        assert_eq!(windows[1].test_start, 110);
        assert_eq!(windows[1].test_end, 120);
    }

    #[test]
    fn test_insufficient_data() {
        let data = dataset(50, vec![1]);
        let bt = RollingBacktest::new(config(vec![1], 100, 10)).unwrap();
        let err = bt.run(&data).unwrap_err();
        assert!(matches!(
            err,
            ForecastError::InsufficientData { required: 110, available: 49 }
        ));
    }

    #[test]
    fn test_zero_step_rejected() {
        let cfg = config(vec![1], 100, 10).with_step(0);
        assert!(matches!(
            RollingBacktest::new(cfg),
            Err(ForecastError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_records_are_lookahead_free() {
        let data = dataset(200, vec![1, 5]);
        let bt = RollingBacktest::new(config(vec![1, 5], 60, 20)).unwrap();
        let run = bt.run(&data).unwrap();

        assert!(!run.records.is_empty());
        assert!(run.verify_no_lookahead().is_empty());
        for r in &run.records {
            let latest = r.latest_training_timestamp.unwrap();
            assert!(latest < r.test_start);
            assert!(latest < r.test_timestamp);
        }
    }

    #[test]
    fn test_unpurged_run_reports_violations() {
        let data = dataset(200, vec![5]);
        let mut cfg = config(vec![5], 60, 20);
        cfg.purge_overlapping = false;
        let run = RollingBacktest::new(cfg).unwrap().run(&data).unwrap();
        assert!(!run.verify_no_lookahead().is_empty());
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let data = dataset(300, vec![1, 3]);
        let bt = RollingBacktest::new(config(vec![1, 3], 80, 15).with_step(10)).unwrap();
        let sequential = bt.run(&data).unwrap();
        let parallel = bt.run_parallel(&data).unwrap();
        assert_eq!(sequential.records, parallel.records);
        assert_eq!(sequential.windows_completed, parallel.windows_completed);
    }

    #[test]
    fn test_cancelled_run_returns_partial_results() {
        let data = dataset(200, vec![1]);
        let token = CancellationToken::new();
        token.cancel();
        let bt = RollingBacktest::new(config(vec![1], 60, 20))
            .unwrap()
            .with_cancellation(token);
        let run = bt.run(&data).unwrap();
        assert!(run.cancelled);
        assert_eq!(run.windows_completed, 0);
        assert!(run.completed_windows.is_empty());
        assert!(run.records.is_empty());
        assert!(!run.windows.is_empty());
    }

    #[test]
    fn test_completed_windows_listed_by_index() {
        let data = dataset(300, vec![1, 3]);
        let bt = RollingBacktest::new(config(vec![1, 3], 80, 15).with_step(10)).unwrap();
        let parallel = bt.run_parallel(&data).unwrap();
        let expected: Vec<usize> = parallel.windows.iter().map(|w| w.index).collect();
        assert_eq!(parallel.completed_windows, expected);
        assert_eq!(parallel.windows_completed, expected.len());
        assert_eq!(bt.run(&data).unwrap().completed_windows, expected);

        // Every record belongs to a listed window.
        assert!(parallel
            .records
            .iter()
            .all(|r| parallel.completed_windows.binary_search(&r.window_index).is_ok()));

        let token = CancellationToken::new();
        token.cancel();
        let cancelled = bt.with_cancellation(token).run_parallel(&data).unwrap();
        assert!(cancelled.cancelled);
        assert!(cancelled.completed_windows.is_empty());
    }

    #[test]
    fn test_forecasts_track_signal() {
        let data = dataset(400, vec![1]);
        let cfg = config(vec![1], 200, 50);
        let run = RollingBacktest::new(cfg.clone()).unwrap().run(&data).unwrap();
        let metrics = run.evaluate(&cfg);
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].coverage_gaps, 0);
        assert!(metrics[0].hit_rate.is_some());

        // Returns are exactly linear in the percentile; only p = 50 (flat
        // outcome) can miss.
        let linear = AccuracyEvaluator::new(&cfg).evaluate_component(&run.records, ModelKind::Linear);
        assert!(linear[0].hit_rate.unwrap() > 95.0);
        assert!(linear[0].correlation.unwrap() > 0.999);
    }
}
