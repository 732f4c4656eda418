//! Caller-owned cache of prediction reports.
//!
//! Reports are keyed by instrument, horizon set, the fingerprint of the data
//! window they were computed from and a hash of the model configuration, so
//! a stale report can only be served for byte-identical inputs.

use crate::config::ForecastConfig;
use crate::dataset::Dataset;
use crate::ensemble::PredictionReport;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::{debug, warn};

/// SHA-256 of arbitrary bytes, hex encoded.
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Hash of a value's JSON serialization.
pub fn compute_config_hash<T: Serialize>(config: &T) -> String {
    match serde_json::to_vec(config) {
        Ok(bytes) => compute_hash(&bytes),
        Err(e) => {
            warn!("Failed to serialize config for hashing: {}", e);
            String::new()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub instrument: String,
    pub horizons: Vec<usize>,
    pub data_hash: String,
    pub config_hash: String,
}

impl CacheKey {
    pub fn new(instrument: impl Into<String>, config: &ForecastConfig, dataset: &Dataset) -> Self {
        Self {
            instrument: instrument.into(),
            horizons: config.horizons.clone(),
            data_hash: dataset.fingerprint.clone(),
            config_hash: compute_config_hash(config),
        }
    }
}

/// Explicit report cache; there is no global instance.
#[derive(Debug, Default)]
pub struct ForecastCache {
    entries: HashMap<CacheKey, PredictionReport>,
    hits: u64,
    misses: u64,
}

impl ForecastCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&mut self, key: &CacheKey) -> Option<&PredictionReport> {
        match self.entries.get(key) {
            Some(report) => {
                self.hits += 1;
                debug!("Cache hit for {}", key.instrument);
                Some(report)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, key: CacheKey, report: PredictionReport) -> Option<PredictionReport> {
        self.entries.insert(key, report)
    }

    /// Return the cached report or compute and store it.
    pub fn get_or_insert_with<F, E>(&mut self, key: CacheKey, compute: F) -> Result<&PredictionReport, E>
    where
        F: FnOnce() -> Result<PredictionReport, E>,
    {
        if self.entries.contains_key(&key) {
            self.hits += 1;
        } else {
            self.misses += 1;
            let report = compute()?;
            self.entries.insert(key.clone(), report);
        }
        // Present in both branches.
        Ok(&self.entries[&key])
    }

    /// Drop every entry for an instrument; returns how many were removed.
    pub fn invalidate_instrument(&mut self, instrument: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|k, _| k.instrument != instrument);
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(hits, misses)` since creation.
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}
