//! Regression models of forward return on percentile.
//!
//! Linear OLS and polynomial least squares give a conditional mean; quantile
//! regression gives conditional quantiles of the forward return distribution.
//! Fitting failures are returned as [`ForecastError::NumericalFit`] and
//! downgraded to warnings by [`RegressionSuite::fit`].

use crate::error::{FitWarning, ForecastError, Result};
use crate::stats;
use crate::types::HorizonSample;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Fewest samples any regression is attempted on.
pub const MIN_REGRESSION_SAMPLES: usize = 3;

/// Percentile variance below which the design is treated as degenerate.
const MIN_PERCENTILE_VARIANCE: f64 = 1e-10;

const PIVOT_EPSILON: f64 = 1e-12;
const IRLS_MAX_ITERATIONS: usize = 200;
const IRLS_TOLERANCE: f64 = 1e-10;
const IRLS_RESIDUAL_FLOOR: f64 = 1e-9;

fn fit_error(model: &str, horizon: usize, reason: impl Into<String>) -> ForecastError {
    ForecastError::NumericalFit {
        model: model.to_string(),
        horizon,
        reason: reason.into(),
    }
}

fn check_design(model: &str, horizon: usize, samples: &[HorizonSample], min: usize) -> Result<()> {
    if samples.len() < min {
        return Err(fit_error(
            model,
            horizon,
            format!("need at least {} samples, got {}", min, samples.len()),
        ));
    }
    let xs: Vec<f64> = samples.iter().map(|s| s.percentile).collect();
    let spread = stats::sample_std(&xs).unwrap_or(0.0);
    if spread * spread < MIN_PERCENTILE_VARIANCE {
        return Err(fit_error(model, horizon, "percentile has near-zero variance"));
    }
    Ok(())
}

/// Goodness-of-fit measures shared by the mean regressions.
struct FitQuality {
    r_squared: Option<f64>,
    mae: f64,
    residual_std: Option<f64>,
}

fn fit_quality(samples: &[HorizonSample], parameters: usize, predict: impl Fn(f64) -> f64) -> FitQuality {
    let n = samples.len();
    let ys: Vec<f64> = samples.iter().map(|s| s.forward_return).collect();
    let y_mean = stats::mean(&ys).unwrap_or(0.0);

    let mut sse = 0.0;
    let mut sae = 0.0;
    let mut sst = 0.0;
    for s in samples {
        let residual = s.forward_return - predict(s.percentile);
        sse += residual * residual;
        sae += residual.abs();
        sst += (s.forward_return - y_mean).powi(2);
    }

    FitQuality {
        r_squared: (sst > 0.0).then(|| 1.0 - sse / sst),
        mae: sae / n as f64,
        residual_std: (n > parameters).then(|| (sse / (n - parameters) as f64).sqrt()),
    }
}

/// Ordinary least squares `return = intercept + slope * percentile`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    pub horizon: usize,
    pub intercept: f64,
    pub slope: f64,
    /// Undefined when the returns are constant.
    pub r_squared: Option<f64>,
    pub mae: f64,
    pub residual_std: Option<f64>,
    pub sample_count: usize,
    percentile_mean: f64,
    percentile_sxx: f64,
}

impl LinearModel {
    pub fn fit(horizon: usize, samples: &[HorizonSample]) -> Result<Self> {
        check_design("linear", horizon, samples, MIN_REGRESSION_SAMPLES)?;

        let n = samples.len() as f64;
        let x_mean = samples.iter().map(|s| s.percentile).sum::<f64>() / n;
        let y_mean = samples.iter().map(|s| s.forward_return).sum::<f64>() / n;

        let mut sxx = 0.0;
        let mut sxy = 0.0;
        for s in samples {
            let dx = s.percentile - x_mean;
            sxx += dx * dx;
            sxy += dx * (s.forward_return - y_mean);
        }

        let slope = sxy / sxx;
        let intercept = y_mean - slope * x_mean;
        if !slope.is_finite() || !intercept.is_finite() {
            return Err(fit_error("linear", horizon, "non-finite coefficients"));
        }

        let quality = fit_quality(samples, 2, |p| intercept + slope * p);
        Ok(Self {
            horizon,
            intercept,
            slope,
            r_squared: quality.r_squared,
            mae: quality.mae,
            residual_std: quality.residual_std,
            sample_count: samples.len(),
            percentile_mean: x_mean,
            percentile_sxx: sxx,
        })
    }

    pub fn predict(&self, percentile: f64) -> f64 {
        self.intercept + self.slope * percentile
    }

    /// Prediction interval `predict(p) ± z * s * sqrt(1 + 1/n + (p - p̄)² / Sxx)`.
    pub fn prediction_interval(&self, percentile: f64, z: f64) -> Option<(f64, f64)> {
        let s = self.residual_std?;
        let n = self.sample_count as f64;
        let leverage = 1.0 + 1.0 / n + (percentile - self.percentile_mean).powi(2) / self.percentile_sxx;
        let half = z * s * leverage.sqrt();
        let center = self.predict(percentile);
        half.is_finite().then_some((center - half, center + half))
    }
}

/// Least squares polynomial in the unit-scaled percentile `x = p / 100`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolynomialModel {
    pub horizon: usize,
    pub degree: usize,
    /// Coefficients of `x^0 .. x^degree`.
    pub coefficients: Vec<f64>,
    pub r_squared: Option<f64>,
    pub mae: f64,
    pub residual_std: Option<f64>,
    pub sample_count: usize,
}

impl PolynomialModel {
    pub fn fit(horizon: usize, degree: usize, samples: &[HorizonSample]) -> Result<Self> {
        let terms = degree + 1;
        check_design("polynomial", horizon, samples, MIN_REGRESSION_SAMPLES.max(terms + 1))?;

        // Normal equations X'X b = X'y over powers of x.
        let mut xtx = vec![vec![0.0; terms]; terms];
        let mut xty = vec![0.0; terms];
        let mut powers = vec![0.0; 2 * degree + 1];
        for s in samples {
            let x = s.percentile / 100.0;
            let mut v = 1.0;
            for (k, power) in powers.iter_mut().enumerate() {
                *power = v;
                if k < terms {
                    xty[k] += v * s.forward_return;
                }
                v *= x;
            }
            for (i, row) in xtx.iter_mut().enumerate() {
                for (j, cell) in row.iter_mut().enumerate() {
                    *cell += powers[i + j];
                }
            }
        }

        let coefficients = solve_linear_system(xtx, xty)
            .ok_or_else(|| fit_error("polynomial", horizon, "singular design matrix"))?;
        if coefficients.iter().any(|c| !c.is_finite()) {
            return Err(fit_error("polynomial", horizon, "non-finite coefficients"));
        }

        let quality = fit_quality(samples, terms, |p| horner(&coefficients, p / 100.0));
        Ok(Self {
            horizon,
            degree,
            coefficients,
            r_squared: quality.r_squared,
            mae: quality.mae,
            residual_std: quality.residual_std,
            sample_count: samples.len(),
        })
    }

    pub fn predict(&self, percentile: f64) -> f64 {
        horner(&self.coefficients, percentile / 100.0)
    }
}

fn horner(coefficients: &[f64], x: f64) -> f64 {
    coefficients.iter().rev().fold(0.0, |acc, c| acc * x + c)
}

/// Linear quantile regression at one level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantileModel {
    pub horizon: usize,
    pub level: f64,
    pub intercept: f64,
    pub slope: f64,
    /// Mean pinball loss of the fitted line.
    pub mean_loss: f64,
    pub iterations: usize,
    pub converged: bool,
    pub sample_count: usize,
}

impl QuantileModel {
    /// Minimize the pinball loss by iteratively reweighted least squares,
    /// starting from the OLS line.
    ///
    /// The best line seen is kept, so a non-converged fit is still the lowest
    /// loss reached within the iteration budget.
    pub fn fit(horizon: usize, level: f64, samples: &[HorizonSample]) -> Result<Self> {
        let model = "quantile";
        if !(level > 0.0 && level < 1.0) {
            return Err(fit_error(model, horizon, format!("level {} outside (0, 1)", level)));
        }
        let start = LinearModel::fit(horizon, samples).map_err(|e| match e {
            ForecastError::NumericalFit { horizon, reason, .. } => fit_error(model, horizon, reason),
            other => other,
        })?;

        let mut coef = (start.intercept, start.slope);
        let mut best = coef;
        let mut best_loss = pinball_loss(samples, level, coef);
        let mut converged = false;
        let mut iterations = 0;

        while iterations < IRLS_MAX_ITERATIONS {
            iterations += 1;

            let (mut sw, mut swx, mut swxx, mut swy, mut swxy) = (0.0, 0.0, 0.0, 0.0, 0.0);
            for s in samples {
                let residual = s.forward_return - (coef.0 + coef.1 * s.percentile);
                let tilt = if residual >= 0.0 { level } else { 1.0 - level };
                let w = tilt / residual.abs().max(IRLS_RESIDUAL_FLOOR);
                let x = s.percentile;
                sw += w;
                swx += w * x;
                swxx += w * x * x;
                swy += w * s.forward_return;
                swxy += w * x * s.forward_return;
            }

            let next = solve_linear_system(vec![vec![sw, swx], vec![swx, swxx]], vec![swy, swxy])
                .and_then(|b| (b[0].is_finite() && b[1].is_finite()).then_some((b[0], b[1])));
            let Some(next) = next else {
                debug!("IRLS step {} for level {} was singular", iterations, level);
                break;
            };

            let loss = pinball_loss(samples, level, next);
            if loss < best_loss {
                best_loss = loss;
                best = next;
            }

            let shift = (next.0 - coef.0).abs() / (1.0 + coef.0.abs())
                + (next.1 - coef.1).abs() / (1.0 + coef.1.abs());
            coef = next;
            if shift < IRLS_TOLERANCE {
                converged = true;
                break;
            }
        }

        if !best_loss.is_finite() {
            return Err(fit_error(model, horizon, "pinball loss is not finite"));
        }

        Ok(Self {
            horizon,
            level,
            intercept: best.0,
            slope: best.1,
            mean_loss: best_loss,
            iterations,
            converged,
            sample_count: samples.len(),
        })
    }

    pub fn predict(&self, percentile: f64) -> f64 {
        self.intercept + self.slope * percentile
    }
}

/// Mean pinball loss of a line at quantile level `tau`.
pub fn pinball_loss(samples: &[HorizonSample], tau: f64, (intercept, slope): (f64, f64)) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let total: f64 = samples
        .iter()
        .map(|s| {
            let r = s.forward_return - (intercept + slope * s.percentile);
            if r >= 0.0 {
                tau * r
            } else {
                (tau - 1.0) * r
            }
        })
        .sum();
    total / samples.len() as f64
}

/// Solve `a x = b` by Gaussian elimination with partial pivoting.
///
/// Returns `None` for a (numerically) singular matrix.
pub fn solve_linear_system(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Option<Vec<f64>> {
    let n = b.len();
    if a.len() != n || a.iter().any(|row| row.len() != n) {
        return None;
    }
    let scale = a
        .iter()
        .flat_map(|row| row.iter())
        .fold(0.0_f64, |m, v| m.max(v.abs()))
        .max(1.0);

    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))?;
        if a[pivot][col].abs() <= PIVOT_EPSILON * scale {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);

        for row in col + 1..n {
            let factor = a[row][col] / a[col][col];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    Some(x)
}

/// Every regression for one horizon, with failures recorded as warnings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionSuite {
    pub horizon: usize,
    pub linear: Option<LinearModel>,
    pub polynomial: Option<PolynomialModel>,
    /// Sorted by level.
    pub quantiles: Vec<QuantileModel>,
    pub warnings: Vec<FitWarning>,
}

impl RegressionSuite {
    /// Fit all regressions. The median (level 0.5) is always fitted because it
    /// is an ensemble component, whether or not it is a configured level.
    pub fn fit(
        horizon: usize,
        polynomial_degree: usize,
        quantile_levels: &[f64],
        samples: &[HorizonSample],
    ) -> Self {
        let mut warnings = Vec::new();

        let linear = recover(LinearModel::fit(horizon, samples), &mut warnings);
        let polynomial = recover(
            PolynomialModel::fit(horizon, polynomial_degree, samples),
            &mut warnings,
        );

        let mut levels = quantile_levels.to_vec();
        if !levels.iter().any(|l| (l - 0.5).abs() < 1e-12) {
            levels.push(0.5);
        }
        levels.sort_by(|a, b| a.total_cmp(b));

        // The quantile fits share the same failure cause when the design is
        // degenerate; report it once.
        let mut quantiles = Vec::with_capacity(levels.len());
        let mut quantile_failed = false;
        for level in levels {
            match QuantileModel::fit(horizon, level, samples) {
                Ok(model) => quantiles.push(model),
                Err(err) if !quantile_failed => {
                    quantile_failed = true;
                    recover::<QuantileModel>(Err(err), &mut warnings);
                }
                Err(_) => {}
            }
        }

        Self {
            horizon,
            linear,
            polynomial,
            quantiles,
            warnings,
        }
    }

    /// The median quantile model, if it was fitted.
    pub fn median(&self) -> Option<&QuantileModel> {
        self.quantile(0.5)
    }

    pub fn quantile(&self, level: f64) -> Option<&QuantileModel> {
        self.quantiles.iter().find(|q| (q.level - level).abs() < 1e-12)
    }
}

fn recover<T>(result: Result<T>, warnings: &mut Vec<FitWarning>) -> Option<T> {
    match result {
        Ok(model) => Some(model),
        Err(err) => {
            warn!("{}", err);
            warnings.extend(FitWarning::from_error(&err));
            None
        }
    }
}
