//! Percentile bins partitioning the [0, 100] range.
//!
//! Bins are half-open `[lower, upper)` except the last one, which is closed
//! so that a percentile of exactly 100 still resolves to a bin.

use crate::error::{ForecastError, Result};
use serde::{Deserialize, Serialize};

/// Tolerance used when checking that adjacent bin edges meet.
const EDGE_EPSILON: f64 = 1e-9;

/// A single percentile bin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PercentileBin {
    pub lower: f64,
    pub upper: f64,
    pub label: String,
}

impl PercentileBin {
    pub fn new(lower: f64, upper: f64, label: impl Into<String>) -> Self {
        Self {
            lower,
            upper,
            label: label.into(),
        }
    }
}

/// An ordered set of bins validated to partition [0, 100] exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<PercentileBin>", into = "Vec<PercentileBin>")]
pub struct PercentileBins {
    bins: Vec<PercentileBin>,
}

/// Default partition: tails at the 5th and 95th percentiles, shoulders out
/// to 30 and 70, and a neutral middle.
const DEFAULT_BINS: [(f64, f64, &str); 5] = [
    (0.0, 5.0, "extreme-low"),
    (5.0, 30.0, "low"),
    (30.0, 70.0, "neutral"),
    (70.0, 95.0, "high"),
    (95.0, 100.0, "extreme-high"),
];

impl Default for PercentileBins {
    fn default() -> Self {
        Self {
            bins: DEFAULT_BINS
                .iter()
                .map(|&(lower, upper, label)| PercentileBin::new(lower, upper, label))
                .collect(),
        }
    }
}

impl PercentileBins {
    /// Create a bin set, rejecting anything that is not an exact partition.
    pub fn new(bins: Vec<PercentileBin>) -> Result<Self> {
        validate_partition(&bins)?;
        Ok(Self { bins })
    }

    /// Build bins from a sorted list of edges, labelling them `lo-hi`.
    pub fn from_edges(edges: &[f64]) -> Result<Self> {
        if edges.len() < 2 {
            return Err(ForecastError::InvalidConfiguration(
                "At least two bin edges are required".to_string(),
            ));
        }
        let bins = edges
            .windows(2)
            .map(|w| PercentileBin::new(w[0], w[1], format!("{}-{}", w[0], w[1])))
            .collect();
        Self::new(bins)
    }

    /// Evenly spaced bins of the given count.
    pub fn uniform(count: usize) -> Result<Self> {
        if count == 0 {
            return Err(ForecastError::InvalidConfiguration(
                "Bin count must be positive".to_string(),
            ));
        }
        let edges: Vec<f64> = (0..=count)
            .map(|i| 100.0 * i as f64 / count as f64)
            .collect();
        Self::from_edges(&edges)
    }

    pub fn len(&self) -> usize {
        self.bins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PercentileBin> {
        self.bins.iter()
    }

    pub fn get(&self, index: usize) -> Option<&PercentileBin> {
        self.bins.get(index)
    }

    pub fn as_slice(&self) -> &[PercentileBin] {
        &self.bins
    }

    pub fn labels(&self) -> Vec<String> {
        self.bins.iter().map(|b| b.label.clone()).collect()
    }

    /// Index of the bin containing `percentile`.
    ///
    /// Returns `None` only for values outside [0, 100] or NaN.
    pub fn index_of(&self, percentile: f64) -> Option<usize> {
        if !percentile.is_finite() || !(0.0..=100.0).contains(&percentile) {
            return None;
        }
        let last = self.bins.len() - 1;
        // First bin whose upper edge is strictly above the value.
        let idx = self.bins.partition_point(|b| b.upper <= percentile);
        Some(idx.min(last))
    }

    /// The bin containing `percentile`.
    pub fn bin_of(&self, percentile: f64) -> Option<&PercentileBin> {
        self.index_of(percentile).map(|i| &self.bins[i])
    }
}

impl TryFrom<Vec<PercentileBin>> for PercentileBins {
    type Error = ForecastError;

    fn try_from(bins: Vec<PercentileBin>) -> Result<Self> {
        Self::new(bins)
    }
}

impl From<PercentileBins> for Vec<PercentileBin> {
    fn from(value: PercentileBins) -> Self {
        value.bins
    }
}

impl<'a> IntoIterator for &'a PercentileBins {
    type Item = &'a PercentileBin;
    type IntoIter = std::slice::Iter<'a, PercentileBin>;

    fn into_iter(self) -> Self::IntoIter {
        self.bins.iter()
    }
}

fn validate_partition(bins: &[PercentileBin]) -> Result<()> {
    let first = bins.first().ok_or_else(|| {
        ForecastError::InvalidConfiguration("Bin list must not be empty".to_string())
    })?;
    let last = &bins[bins.len() - 1];

    for bin in bins {
        if !bin.lower.is_finite() || !bin.upper.is_finite() {
            return Err(ForecastError::InvalidConfiguration(format!(
                "Bin '{}' has non-finite edges",
                bin.label
            )));
        }
        if bin.lower >= bin.upper {
            return Err(ForecastError::InvalidConfiguration(format!(
                "Bin '{}' is not increasing: lower {} >= upper {}",
                bin.label, bin.lower, bin.upper
            )));
        }
    }

    if first.lower.abs() > EDGE_EPSILON {
        return Err(ForecastError::InvalidConfiguration(format!(
            "Bins must start at 0, first bin '{}' starts at {}",
            first.label, first.lower
        )));
    }
    if (last.upper - 100.0).abs() > EDGE_EPSILON {
        return Err(ForecastError::InvalidConfiguration(format!(
            "Bins must end at 100, last bin '{}' ends at {}",
            last.label, last.upper
        )));
    }

    for pair in bins.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        if b.lower > a.upper + EDGE_EPSILON {
            return Err(ForecastError::InvalidConfiguration(format!(
                "Gap between bins '{}' and '{}' ({} to {})",
                a.label, b.label, a.upper, b.lower
            )));
        }
        if b.lower < a.upper - EDGE_EPSILON {
            return Err(ForecastError::InvalidConfiguration(format!(
                "Bins '{}' and '{}' overlap or are out of order",
                a.label, b.label
            )));
        }
    }

    let mut labels: Vec<&str> = bins.iter().map(|b| b.label.as_str()).collect();
    labels.sort_unstable();
    if labels.windows(2).any(|w| w[0] == w[1]) {
        return Err(ForecastError::InvalidConfiguration(
            "Bin labels must be unique".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_bins_partition() {
        let bins = PercentileBins::default();
        assert_eq!(bins.len(), 5);
        assert_eq!(bins.get(0).unwrap().lower, 0.0);
        assert_eq!(bins.get(4).unwrap().upper, 100.0);
        assert!(PercentileBins::new(bins.as_slice().to_vec()).is_ok());
        assert_eq!(
            bins.labels(),
            vec!["extreme-low", "low", "neutral", "high", "extreme-high"]
        );
    }

    #[test]
    fn test_default_bins_match_example_config() {
        let example: crate::config::ForecastFileConfig =
            toml::from_str(&crate::config::ForecastFileConfig::example()).unwrap();
        assert_eq!(
            PercentileBins::new(example.bins).unwrap(),
            PercentileBins::default()
        );
    }

    #[test]
    fn test_boundaries_resolve() {
        let bins = PercentileBins::default();
        assert_eq!(bins.index_of(0.0), Some(0));
        assert_eq!(bins.index_of(100.0), Some(4));
        assert_eq!(bins.index_of(4.999), Some(0));
        assert_eq!(bins.index_of(5.0), Some(1));
        assert_eq!(bins.index_of(95.0), Some(4));
        assert_eq!(bins.index_of(50.0), Some(2));
        assert_eq!(bins.bin_of(2.5).unwrap().label, "extreme-low");
    }

    #[test]
    fn test_out_of_range_lookup() {
        let bins = PercentileBins::default();
        assert_eq!(bins.index_of(-0.1), None);
        assert_eq!(bins.index_of(100.1), None);
        assert_eq!(bins.index_of(f64::NAN), None);
    }

    #[test]
    fn test_gap_rejected() {
        let bins = vec![
            PercentileBin::new(0.0, 40.0, "low"),
            PercentileBin::new(50.0, 100.0, "high"),
        ];
        let err = PercentileBins::new(bins).unwrap_err();
        assert!(matches!(err, ForecastError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_overlap_rejected() {
        let bins = vec![
            PercentileBin::new(0.0, 60.0, "low"),
            PercentileBin::new(50.0, 100.0, "high"),
        ];
        assert!(PercentileBins::new(bins).is_err());
    }

    #[test]
    fn test_non_monotonic_rejected() {
        let bins = vec![
            PercentileBin::new(50.0, 100.0, "high"),
            PercentileBin::new(0.0, 50.0, "low"),
        ];
        assert!(PercentileBins::new(bins).is_err());

        let inverted = vec![PercentileBin::new(100.0, 0.0, "all")];
        assert!(PercentileBins::new(inverted).is_err());
    }

    #[test]
    fn test_must_cover_full_range() {
        assert!(PercentileBins::from_edges(&[0.0, 50.0, 90.0]).is_err());
        assert!(PercentileBins::from_edges(&[10.0, 50.0, 100.0]).is_err());
        assert!(PercentileBins::new(vec![]).is_err());
    }

    #[test]
    fn test_duplicate_labels_rejected() {
        let bins = vec![
            PercentileBin::new(0.0, 50.0, "x"),
            PercentileBin::new(50.0, 100.0, "x"),
        ];
        assert!(PercentileBins::new(bins).is_err());
    }

    #[test]
    fn test_uniform_bins() {
        let bins = PercentileBins::uniform(10).unwrap();
        assert_eq!(bins.len(), 10);
        assert_eq!(bins.index_of(99.9), Some(9));
        assert_eq!(bins.index_of(10.0), Some(1));
        assert!(PercentileBins::uniform(0).is_err());
    }

    #[test]
    fn test_serde_validates() {
        let json = r#"[{"lower":0.0,"upper":30.0,"label":"a"},{"lower":40.0,"upper":100.0,"label":"b"}]"#;
        assert!(serde_json::from_str::<PercentileBins>(json).is_err());

        let json = r#"[{"lower":0.0,"upper":30.0,"label":"a"},{"lower":30.0,"upper":100.0,"label":"b"}]"#;
        let bins: PercentileBins = serde_json::from_str(json).unwrap();
        assert_eq!(bins.len(), 2);
    }
}
