//! Core data types shared by the dataset builder, models and backtest engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A single price bar reduced to what the framework needs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
}

impl PricePoint {
    pub fn new(timestamp: DateTime<Utc>, price: f64) -> Self {
        Self { timestamp, price }
    }
}

/// Percentile rank of the oscillator at a timestamp.
///
/// `percentile` is `None` during the oscillator warm-up period.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PercentilePoint {
    pub timestamp: DateTime<Utc>,
    pub percentile: Option<f64>,
}

impl PercentilePoint {
    pub fn new(timestamp: DateTime<Utc>, percentile: Option<f64>) -> Self {
        Self {
            timestamp,
            percentile,
        }
    }
}

/// One aligned row of the dataset.
///
/// The per-horizon vectors are indexed like the configured horizon list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub timestamp: DateTime<Utc>,
    pub percentile: f64,
    /// Simple forward return `price(t+h) / price(t) - 1`.
    pub forward_returns: Vec<f64>,
    /// Percentile at bar `t+h`, when the oscillator is defined there.
    pub forward_percentiles: Vec<Option<f64>>,
    /// Timestamp of bar `t+h`: the latest instant the label depends on.
    pub horizon_ends: Vec<DateTime<Utc>>,
}

/// The view of an observation a per-horizon model is fitted on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HorizonSample {
    pub timestamp: DateTime<Utc>,
    pub percentile: f64,
    pub forward_return: f64,
    pub forward_percentile: Option<f64>,
    pub horizon_end: DateTime<Utc>,
}

impl Observation {
    /// Project this row onto one horizon.
    pub fn sample(&self, horizon_index: usize) -> HorizonSample {
        HorizonSample {
            timestamp: self.timestamp,
            percentile: self.percentile,
            forward_return: self.forward_returns[horizon_index],
            forward_percentile: self.forward_percentiles[horizon_index],
            horizon_end: self.horizon_ends[horizon_index],
        }
    }
}

/// Ensemble component model families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Empirical,
    Markov,
    Linear,
    Polynomial,
    QuantileMedian,
    Kernel,
}

impl ModelKind {
    /// All ensemble components, in reporting order.
    pub const ALL: [ModelKind; 6] = [
        ModelKind::Empirical,
        ModelKind::Markov,
        ModelKind::Linear,
        ModelKind::Polynomial,
        ModelKind::QuantileMedian,
        ModelKind::Kernel,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ModelKind::Empirical => "empirical",
            ModelKind::Markov => "markov",
            ModelKind::Linear => "linear",
            ModelKind::Polynomial => "polynomial",
            ModelKind::QuantileMedian => "quantile_median",
            ModelKind::Kernel => "kernel",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Duration of one bar of the input series.
///
/// Daily and weekly bars use a trading calendar (252 / 52 bars per year);
/// intraday bars assume continuous sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BarDuration {
    Minute(u32),
    Hour(u32),
    #[default]
    Day,
    Week,
}

impl BarDuration {
    /// Number of bars in one year.
    pub fn bars_per_year(&self) -> f64 {
        match self {
            BarDuration::Minute(m) => 365.0 * 24.0 * 60.0 / (*m).max(1) as f64,
            BarDuration::Hour(h) => 365.0 * 24.0 / (*h).max(1) as f64,
            BarDuration::Day => 252.0,
            BarDuration::Week => 52.0,
        }
    }

    /// Annualization factor for returns measured over `horizon` bars.
    pub fn annualization_factor(&self, horizon: usize) -> f64 {
        self.bars_per_year() / horizon.max(1) as f64
    }

    /// Human-readable label for a horizon, e.g. `5d` or `12h`.
    pub fn horizon_label(&self, horizon: usize) -> String {
        match self {
            BarDuration::Minute(m) => format!("{}m", horizon as u64 * *m as u64),
            BarDuration::Hour(h) => format!("{}h", horizon as u64 * *h as u64),
            BarDuration::Day => format!("{}d", horizon),
            BarDuration::Week => format!("{}w", horizon),
        }
    }
}

impl fmt::Display for BarDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BarDuration::Minute(m) => write!(f, "{}m", m),
            BarDuration::Hour(h) => write!(f, "{}h", h),
            BarDuration::Day => write!(f, "1d"),
            BarDuration::Week => write!(f, "1w"),
        }
    }
}

impl FromStr for BarDuration {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        match s.as_str() {
            "1d" | "d" | "day" | "daily" => return Ok(BarDuration::Day),
            "1w" | "w" | "week" | "weekly" => return Ok(BarDuration::Week),
            _ => {}
        }

        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("missing unit in bar duration '{}'", s))?;
        let (count, unit) = s.split_at(split);
        let count: u32 = count
            .parse()
            .map_err(|_| format!("invalid bar duration '{}'", s))?;
        if count == 0 {
            return Err(format!("bar duration must be positive: '{}'", s));
        }

        match unit {
            "m" | "min" => Ok(BarDuration::Minute(count)),
            "h" => Ok(BarDuration::Hour(count)),
            _ => Err(format!("unsupported bar duration '{}'", s)),
        }
    }
}

impl TryFrom<String> for BarDuration {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BarDuration> for String {
    fn from(value: BarDuration) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_bar_duration_parsing() {
        assert_eq!("1d".parse::<BarDuration>().unwrap(), BarDuration::Day);
        assert_eq!("daily".parse::<BarDuration>().unwrap(), BarDuration::Day);
        assert_eq!("4h".parse::<BarDuration>().unwrap(), BarDuration::Hour(4));
        assert_eq!(
            "15m".parse::<BarDuration>().unwrap(),
            BarDuration::Minute(15)
        );
        assert_eq!("1w".parse::<BarDuration>().unwrap(), BarDuration::Week);
        assert!("0h".parse::<BarDuration>().is_err());
        assert!("3y".parse::<BarDuration>().is_err());
        assert!("h".parse::<BarDuration>().is_err());
    }

    #[test]
    fn test_annualization() {
        assert!((BarDuration::Day.annualization_factor(1) - 252.0).abs() < 1e-9);
        assert!((BarDuration::Day.annualization_factor(5) - 50.4).abs() < 1e-9);
        assert!((BarDuration::Hour(4).bars_per_year() - 2190.0).abs() < 1e-9);
    }

    #[test]
    fn test_horizon_labels() {
        assert_eq!(BarDuration::Day.horizon_label(5), "5d");
        assert_eq!(BarDuration::Hour(4).horizon_label(6), "24h");
        assert_eq!(BarDuration::Minute(15).horizon_label(4), "60m");
    }

    #[test]
    fn test_observation_sample() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let obs = Observation {
            timestamp: t0,
            percentile: 42.0,
            forward_returns: vec![0.01, 0.02],
            forward_percentiles: vec![Some(40.0), None],
            horizon_ends: vec![t0 + chrono::Duration::days(1), t0 + chrono::Duration::days(5)],
        };
        let s = obs.sample(1);
        assert_eq!(s.forward_return, 0.02);
        assert_eq!(s.forward_percentile, None);
        assert_eq!(s.horizon_end, t0 + chrono::Duration::days(5));
    }

    #[test]
    fn test_bar_duration_serde() {
        let json = serde_json::to_string(&BarDuration::Hour(4)).unwrap();
        assert_eq!(json, "\"4h\"");
        let back: BarDuration = serde_json::from_str(&json).unwrap();
        assert_eq!(back, BarDuration::Hour(4));
    }
}
