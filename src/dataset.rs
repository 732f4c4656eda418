//! Dataset building: aligning percentile and price series into observations.
//!
//! Both input series are explicitly sorted and validated before alignment;
//! construction order of the caller's vectors is never trusted.

use crate::config::ForecastConfig;
use crate::error::{ForecastError, Result};
use crate::types::{HorizonSample, Observation, PercentilePoint, PricePoint};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

/// The latest defined percentile in the input, used for single-shot forecasts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurrentReading {
    pub timestamp: DateTime<Utc>,
    pub percentile: f64,
}

/// Time-ordered observation table for a fixed horizon list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub horizons: Vec<usize>,
    pub observations: Vec<Observation>,
    /// Latest defined percentile, even when it has no forward returns yet.
    pub current: Option<CurrentReading>,
    /// SHA-256 over the aligned inputs and horizons.
    pub fingerprint: String,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Position of `horizon` in the horizon list.
    pub fn horizon_index(&self, horizon: usize) -> Option<usize> {
        self.horizons.iter().position(|&h| h == horizon)
    }

    /// All samples for one horizon.
    pub fn samples(&self, horizon_index: usize) -> Vec<HorizonSample> {
        samples_for(&self.observations, horizon_index)
    }

    pub fn first_timestamp(&self) -> Option<DateTime<Utc>> {
        self.observations.first().map(|o| o.timestamp)
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.observations.last().map(|o| o.timestamp)
    }
}

/// Project a slice of observations onto one horizon.
pub fn samples_for(observations: &[Observation], horizon_index: usize) -> Vec<HorizonSample> {
    observations.iter().map(|o| o.sample(horizon_index)).collect()
}

/// Builds [`Dataset`]s for a horizon list.
#[derive(Debug, Clone)]
pub struct DatasetBuilder {
    horizons: Vec<usize>,
}

impl DatasetBuilder {
    /// Create a builder; horizons must be positive and strictly increasing.
    pub fn new(horizons: Vec<usize>) -> Result<Self> {
        let config = ForecastConfig::with_horizons(horizons);
        config.validate()?;
        Ok(Self {
            horizons: config.horizons,
        })
    }

    /// Create a builder from an already validated configuration.
    pub fn from_config(config: &ForecastConfig) -> Self {
        Self {
            horizons: config.horizons.clone(),
        }
    }

    pub fn horizons(&self) -> &[usize] {
        &self.horizons
    }

    /// Align the two series and compute forward returns for every horizon.
    ///
    /// A price bar yields an observation when its percentile is defined and at
    /// least `max(horizons)` later bars exist. Percentile points without a
    /// matching price timestamp are ignored.
    ///
    /// Every observation carries a label for every horizon, so all horizons
    /// share one sample set. The last `max(horizons)` bars are dropped even
    /// for shorter horizons that could still be labelled there.
    pub fn build(&self, percentiles: &[PercentilePoint], prices: &[PricePoint]) -> Result<Dataset> {
        if prices.is_empty() {
            return Err(ForecastError::NoData);
        }

        let prices = sorted_prices(prices)?;
        let percentiles = sorted_percentiles(percentiles)?;
        let aligned = align(&percentiles, &prices);

        let max_horizon = self.horizons.iter().copied().max().unwrap_or(0);
        let n = prices.len();
        let mut observations = Vec::with_capacity(n.saturating_sub(max_horizon));
        let mut warmup = 0usize;

        for i in 0..n {
            let Some(percentile) = aligned[i] else {
                warmup += 1;
                continue;
            };
            if i + max_horizon >= n {
                break;
            }

            let base = prices[i].price;
            let mut forward_returns = Vec::with_capacity(self.horizons.len());
            let mut forward_percentiles = Vec::with_capacity(self.horizons.len());
            let mut horizon_ends = Vec::with_capacity(self.horizons.len());
            for &h in &self.horizons {
                let future = &prices[i + h];
                forward_returns.push(future.price / base - 1.0);
                forward_percentiles.push(aligned[i + h]);
                horizon_ends.push(future.timestamp);
            }

            observations.push(Observation {
                timestamp: prices[i].timestamp,
                percentile,
                forward_returns,
                forward_percentiles,
                horizon_ends,
            });
        }

        let current = aligned
            .iter()
            .enumerate()
            .rev()
            .find_map(|(i, p)| {
                p.map(|percentile| CurrentReading {
                    timestamp: prices[i].timestamp,
                    percentile,
                })
            });

        if observations.is_empty() {
            warn!(
                "No observations built from {} price bars (max horizon {})",
                n, max_horizon
            );
        }
        debug!("Dropped {} warm-up bars without a percentile", warmup);
        info!(
            "Built {} observations for horizons {:?}",
            observations.len(),
            self.horizons
        );

        Ok(Dataset {
            horizons: self.horizons.clone(),
            observations,
            current,
            fingerprint: fingerprint(&self.horizons, &prices, &aligned),
        })
    }
}

fn sorted_prices(prices: &[PricePoint]) -> Result<Vec<PricePoint>> {
    let mut sorted = prices.to_vec();
    sorted.sort_by_key(|p| p.timestamp);

    if let Some(w) = sorted.windows(2).find(|w| w[0].timestamp == w[1].timestamp) {
        return Err(ForecastError::DataError(format!(
            "Duplicate price timestamp {}",
            w[0].timestamp
        )));
    }
    if let Some(bad) = sorted.iter().find(|p| !p.price.is_finite() || p.price <= 0.0) {
        return Err(ForecastError::DataError(format!(
            "Price must be positive and finite at {}, got {}",
            bad.timestamp, bad.price
        )));
    }
    Ok(sorted)
}

fn sorted_percentiles(percentiles: &[PercentilePoint]) -> Result<Vec<PercentilePoint>> {
    let mut sorted = percentiles.to_vec();
    sorted.sort_by_key(|p| p.timestamp);

    if let Some(w) = sorted.windows(2).find(|w| w[0].timestamp == w[1].timestamp) {
        return Err(ForecastError::DataError(format!(
            "Duplicate percentile timestamp {}",
            w[0].timestamp
        )));
    }
    for point in &sorted {
        if let Some(p) = point.percentile {
            if !p.is_finite() || !(0.0..=100.0).contains(&p) {
                return Err(ForecastError::InvalidInput(format!(
                    "Percentile must lie in [0, 100] at {}, got {}",
                    point.timestamp, p
                )));
            }
        }
    }
    Ok(sorted)
}

/// Percentile per price bar, by merging the two sorted series.
fn align(percentiles: &[PercentilePoint], prices: &[PricePoint]) -> Vec<Option<f64>> {
    let mut aligned = vec![None; prices.len()];
    let mut j = 0;
    let mut unmatched = 0usize;

    for point in percentiles {
        while j < prices.len() && prices[j].timestamp < point.timestamp {
            j += 1;
        }
        if j < prices.len() && prices[j].timestamp == point.timestamp {
            aligned[j] = point.percentile;
        } else {
            unmatched += 1;
        }
    }

    if unmatched > 0 {
        debug!("{} percentile points have no matching price bar", unmatched);
    }
    aligned
}

fn fingerprint(horizons: &[usize], prices: &[PricePoint], aligned: &[Option<f64>]) -> String {
    let mut hasher = Sha256::new();
    for h in horizons {
        hasher.update((*h as u64).to_le_bytes());
    }
    for (point, pct) in prices.iter().zip(aligned) {
        hasher.update(point.timestamp.timestamp_millis().to_le_bytes());
        hasher.update(point.price.to_bits().to_le_bytes());
        match pct {
            Some(p) => hasher.update(p.to_bits().to_le_bytes()),
            None => hasher.update([0xff_u8; 8]),
        }
    }
    format!("{:x}", hasher.finalize())
}
