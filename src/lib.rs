//! fwdmap - forward return forecasts conditioned on oscillator percentile rank.
//!
//! # Overview
//!
//! Given a price series and the percentile rank of an oscillator computed on
//! it, fwdmap estimates the distribution of forward returns over several
//! horizons and forecasts the return expected from the current reading.
//!
//! - **Percentile bins**: empirical return statistics per percentile range
//! - **Markov transitions**: bin-to-bin transition probabilities per horizon
//! - **Regressions**: linear, polynomial and quantile fits of return on percentile
//! - **Kernel smoothing**: Gaussian-weighted local averages
//! - **Ensemble**: the mean of every component defined at the query point
//! - **Rolling backtest**: purged out-of-sample windows, evaluated in parallel
//! - **Accuracy**: MAE, RMSE, hit rate, Sharpe, information ratio and correlation
//!
//! # Quick Start
//!
//! ```no_run
//! use fwdmap::{
//!     config::ForecastConfig,
//!     data::{load_csv, DataConfig},
//!     dataset::DatasetBuilder,
//!     ensemble::ForwardMapper,
//! };
//!
//! let config = ForecastConfig::with_horizons(vec![1, 5, 20]);
//! let series = load_csv("data/BTC.csv", &DataConfig::default()).unwrap();
//! let dataset = DatasetBuilder::from_config(&config)
//!     .build(&series.percentiles, &series.prices)
//!     .unwrap();
//!
//! let mapper = ForwardMapper::new(config).unwrap();
//! let report = mapper.analyze("BTC", &dataset).unwrap();
//! for p in &report.predictions {
//!     println!("h={}: {:?}", p.horizon, p.ensemble);
//! }
//! ```
//!
//! # Backtesting
//!
//! ```no_run
//! use fwdmap::backtest::RollingBacktest;
//! use fwdmap::config::ForecastConfig;
//! # fn dataset() -> fwdmap::dataset::Dataset { unimplemented!() }
//!
//! let config = ForecastConfig::with_horizons(vec![1, 5]).with_windows(500, 50);
//! let run = RollingBacktest::new(config.clone())
//!     .unwrap()
//!     .run_parallel(&dataset())
//!     .unwrap();
//! assert!(run.verify_no_lookahead().is_empty());
//! for m in run.evaluate(&config) {
//!     println!("h={} hit rate {:?}", m.horizon, m.hit_rate);
//! }
//! ```
//!
//! # Modules
//!
//! - [`types`]: Input points, observations and model kinds
//! - [`bins`]: Percentile bin partitions
//! - [`dataset`]: Alignment of prices and percentiles into observations
//! - [`empirical`]: Per-bin return statistics
//! - [`markov`]: Bin transition matrices
//! - [`regression`]: Linear, polynomial and quantile regressions
//! - [`kernel`]: Gaussian kernel smoothing
//! - [`ensemble`]: Forward mapper and prediction reports
//! - [`backtest`]: Rolling out-of-sample backtest
//! - [`accuracy`]: Forecast accuracy metrics
//! - [`cache`]: Caller-owned report cache
//! - [`config`]: Configuration and TOML file support
//! - [`data`]: CSV loading
//! - [`report`]: Terminal, JSON and CSV output

pub mod accuracy;
pub mod backtest;
pub mod bins;
pub mod cache;
pub mod config;
pub mod data;
pub mod dataset;
pub mod empirical;
pub mod ensemble;
pub mod error;
pub mod kernel;
pub mod markov;
pub mod regression;
pub mod report;
pub mod stats;
pub mod types;

// Re-exports for convenience
pub use accuracy::{AccuracyEvaluator, AccuracyMetrics};
pub use backtest::{
    BacktestRecord, BacktestRun, BacktestWindow, CancellationToken, LookaheadViolation,
    RollingBacktest,
};
pub use bins::{PercentileBin, PercentileBins};
pub use cache::{CacheKey, ForecastCache};
pub use config::{ForecastConfig, ForecastFileConfig};
pub use data::{load_csv, load_csv_from_str, DataConfig, InputSeries};
pub use dataset::{CurrentReading, Dataset, DatasetBuilder};
pub use empirical::{BinStatistics, EmpiricalModel};
pub use ensemble::{ComponentForecasts, ForwardMapper, ForwardPrediction, PredictionReport};
pub use error::{FitWarning, ForecastError, Result, WarningKind};
pub use kernel::{KernelBandwidth, KernelModel};
pub use markov::{MarkovModel, TransitionMatrix};
pub use regression::{LinearModel, PolynomialModel, QuantileModel, RegressionSuite};
pub use report::ReportFormatter;
pub use types::{BarDuration, ModelKind, Observation, PercentilePoint, PricePoint};
