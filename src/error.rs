//! Error types for the forward mapping framework.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Main error type for dataset building, model fitting and backtesting.
#[derive(Error, Debug)]
pub enum ForecastError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Insufficient data: required {required} observations, available {available}")]
    InsufficientData { required: usize, available: usize },

    #[error("Degenerate bin '{bin}' at horizon {horizon}: {reason}")]
    DegenerateBin {
        bin: String,
        horizon: usize,
        reason: String,
    },

    #[error("Numerical fit error in {model} model at horizon {horizon}: {reason}")]
    NumericalFit {
        model: String,
        horizon: usize,
        reason: String,
    },

    #[error("Data error: {0}")]
    DataError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("No data loaded")]
    NoData,

    #[error("CSV parsing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Date parsing error: {0}")]
    DateParseError(#[from] chrono::ParseError),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),
}

/// Result type alias for forward mapping operations.
pub type Result<T> = std::result::Result<T, ForecastError>;

/// Category of a locally recovered fitting problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    DegenerateBin,
    NumericalFit,
}

/// A recovered, non-fatal error recorded while fitting a model.
///
/// Degenerate bins and failed regressions never abort an analysis; they are
/// downgraded to one of these and the affected component becomes undefined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitWarning {
    pub kind: WarningKind,
    pub horizon: usize,
    pub message: String,
}

impl FitWarning {
    /// Downgrade a recoverable error into a warning.
    ///
    /// Returns `None` for errors that must stay fatal.
    pub fn from_error(err: &ForecastError) -> Option<Self> {
        match err {
            ForecastError::DegenerateBin { horizon, .. } => Some(Self {
                kind: WarningKind::DegenerateBin,
                horizon: *horizon,
                message: err.to_string(),
            }),
            ForecastError::NumericalFit { horizon, .. } => Some(Self {
                kind: WarningKind::NumericalFit,
                horizon: *horizon,
                message: err.to_string(),
            }),
            _ => None,
        }
    }
}

impl fmt::Display for FitWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[h={}] {}", self.horizon, self.message)
    }
}
