//! Nadaraya-Watson kernel smoothing of forward returns over percentile.
//!
//! The model keeps its reference `(percentile, return)` pairs and evaluates
//! the Gaussian-weighted average on every query; there is no closed-form fit.

use crate::types::HorizonSample;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bandwidth used when the reference spread is undefined.
pub const DEFAULT_BANDWIDTH: f64 = 10.0;
/// Clamp range for the automatic bandwidth, in percentile points.
pub const AUTO_BANDWIDTH_RANGE: (f64, f64) = (5.0, 15.0);

/// Kernel bandwidth setting: a fixed width or `auto`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "RawBandwidth", into = "RawBandwidth")]
pub enum KernelBandwidth {
    #[default]
    Auto,
    Fixed(f64),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawBandwidth {
    Value(f64),
    Text(String),
}

impl TryFrom<RawBandwidth> for KernelBandwidth {
    type Error = String;

    fn try_from(raw: RawBandwidth) -> std::result::Result<Self, Self::Error> {
        match raw {
            RawBandwidth::Value(v) => Ok(KernelBandwidth::Fixed(v)),
            RawBandwidth::Text(s) if s.eq_ignore_ascii_case("auto") => Ok(KernelBandwidth::Auto),
            RawBandwidth::Text(s) => s
                .parse::<f64>()
                .map(KernelBandwidth::Fixed)
                .map_err(|_| format!("kernel bandwidth must be a number or \"auto\", got '{}'", s)),
        }
    }
}

impl From<KernelBandwidth> for RawBandwidth {
    fn from(value: KernelBandwidth) -> Self {
        match value {
            KernelBandwidth::Auto => RawBandwidth::Text("auto".to_string()),
            KernelBandwidth::Fixed(v) => RawBandwidth::Value(v),
        }
    }
}

impl fmt::Display for KernelBandwidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelBandwidth::Auto => write!(f, "auto"),
            KernelBandwidth::Fixed(v) => write!(f, "{}", v),
        }
    }
}

impl KernelBandwidth {
    /// Resolve to a concrete width for the given reference percentiles.
    ///
    /// `auto` applies Silverman's rule of thumb and clamps the result to
    /// [`AUTO_BANDWIDTH_RANGE`], which lands near 10 points for percentiles
    /// spread over the whole range.
    pub fn resolve(&self, percentiles: &[f64]) -> f64 {
        match self {
            KernelBandwidth::Fixed(v) => *v,
            KernelBandwidth::Auto => {
                let n = percentiles.len();
                if n < 2 {
                    return DEFAULT_BANDWIDTH;
                }
                let mean = percentiles.iter().sum::<f64>() / n as f64;
                let var = percentiles.iter().map(|p| (p - mean).powi(2)).sum::<f64>()
                    / (n - 1) as f64;
                let sigma = var.sqrt();
                if !sigma.is_finite() || sigma <= 0.0 {
                    return DEFAULT_BANDWIDTH;
                }
                let silverman = 1.06 * sigma * (n as f64).powf(-0.2);
                silverman.clamp(AUTO_BANDWIDTH_RANGE.0, AUTO_BANDWIDTH_RANGE.1)
            }
        }
    }
}

/// Kernel smoothing model for one horizon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelModel {
    pub horizon: usize,
    pub bandwidth: f64,
    /// Reference `(percentile, forward_return)` pairs.
    pub reference: Vec<(f64, f64)>,
}

impl KernelModel {
    /// Collect the reference set. No parameters are estimated here.
    pub fn fit(horizon: usize, samples: &[HorizonSample], bandwidth: KernelBandwidth) -> Self {
        let reference: Vec<(f64, f64)> = samples
            .iter()
            .map(|s| (s.percentile, s.forward_return))
            .collect();
        let percentiles: Vec<f64> = reference.iter().map(|(p, _)| *p).collect();
        let bandwidth = bandwidth.resolve(&percentiles);

        Self {
            horizon,
            bandwidth,
            reference,
        }
    }

    pub fn len(&self) -> usize {
        self.reference.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reference.is_empty()
    }

    /// Gaussian-weighted average of reference returns around `percentile`.
    ///
    /// Undefined for an empty reference set, a non-positive bandwidth, or when
    /// every weight underflows.
    pub fn forecast(&self, percentile: f64) -> Option<f64> {
        if self.reference.is_empty() || !percentile.is_finite() {
            return None;
        }
        if !self.bandwidth.is_finite() || self.bandwidth <= 0.0 {
            return None;
        }

        let mut weighted = 0.0;
        let mut total = 0.0;
        for &(p, r) in &self.reference {
            let w = gaussian((p - percentile) / self.bandwidth);
            weighted += w * r;
            total += w;
        }

        if total <= f64::MIN_POSITIVE {
            return None;
        }
        Some(weighted / total)
    }
}

/// Unnormalized Gaussian kernel; the constant cancels in the ratio.
fn gaussian(u: f64) -> f64 {
    (-0.5 * u * u).exp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn samples(points: &[(f64, f64)]) -> Vec<HorizonSample> {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        points
            .iter()
            .enumerate()
            .map(|(i, &(p, r))| HorizonSample {
                timestamp: t0 + chrono::Duration::days(i as i64),
                percentile: p,
                forward_return: r,
                forward_percentile: None,
                horizon_end: t0 + chrono::Duration::days(i as i64 + 1),
            })
            .collect()
    }

    #[test]
    fn test_constant_returns() {
        let data = samples(&[(10.0, 0.02), (50.0, 0.02), (90.0, 0.02)]);
        let model = KernelModel::fit(1, &data, KernelBandwidth::Fixed(10.0));
        assert!((model.forecast(30.0).unwrap() - 0.02).abs() < 1e-12);
    }

    #[test]
    fn test_locality() {
        let data = samples(&[(10.0, 0.05), (12.0, 0.05), (88.0, -0.05), (90.0, -0.05)]);
        let model = KernelModel::fit(1, &data, KernelBandwidth::Fixed(5.0));
        assert!(model.forecast(11.0).unwrap() > 0.049);
        assert!(model.forecast(89.0).unwrap() < -0.049);
        assert!(model.forecast(50.0).unwrap().abs() < 1e-9);
    }

    #[test]
    fn test_empty_reference_is_undefined() {
        let model = KernelModel::fit(1, &[], KernelBandwidth::Auto);
        assert!(model.is_empty());
        assert_eq!(model.forecast(50.0), None);
        assert_eq!(model.bandwidth, DEFAULT_BANDWIDTH);
    }

    #[test]
    fn test_underflow_is_undefined() {
        let data = samples(&[(0.0, 0.01)]);
        let model = KernelModel::fit(1, &data, KernelBandwidth::Fixed(0.1));
        assert_eq!(model.forecast(100.0), None);
    }

    #[test]
    fn test_auto_bandwidth_is_clamped() {
        let uniform: Vec<f64> = (0..1000).map(|i| i as f64 / 10.0).collect();
        let bw = KernelBandwidth::Auto.resolve(&uniform);
        assert!(bw >= AUTO_BANDWIDTH_RANGE.0 && bw <= AUTO_BANDWIDTH_RANGE.1);

        let tight = vec![50.0, 50.1, 49.9, 50.05];
        assert_eq!(KernelBandwidth::Auto.resolve(&tight), AUTO_BANDWIDTH_RANGE.0);
        assert_eq!(KernelBandwidth::Auto.resolve(&[50.0, 50.0]), DEFAULT_BANDWIDTH);
    }

    #[test]
    fn test_bandwidth_serde() {
        let auto: KernelBandwidth = serde_json::from_str("\"auto\"").unwrap();
        assert_eq!(auto, KernelBandwidth::Auto);
        let fixed: KernelBandwidth = serde_json::from_str("7.5").unwrap();
        assert_eq!(fixed, KernelBandwidth::Fixed(7.5));
        assert!(serde_json::from_str::<KernelBandwidth>("\"wide\"").is_err());
        assert_eq!(serde_json::to_string(&KernelBandwidth::Auto).unwrap(), "\"auto\"");
    }
}
