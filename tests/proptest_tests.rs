//! Property-based tests using proptest for invariant testing.
//!
//! These tests verify that:
//! 1. Bin partitions cover [0, 100] and every percentile maps to one bin
//! 2. Transition matrix rows are probability distributions
//! 3. Forecasts are deterministic and never zero-fill undefined components
//! 4. Accuracy metrics stay in range and are undefined on zero variance

use chrono::{TimeZone, Utc};
use proptest::prelude::*;

use fwdmap::accuracy::AccuracyMetrics;
use fwdmap::bins::PercentileBins;
use fwdmap::config::ForecastConfig;
use fwdmap::ensemble::HorizonModels;
use fwdmap::markov::TransitionMatrix;
use fwdmap::types::{HorizonSample, ModelKind};

/// Strategy for strictly increasing interior edges, giving a valid partition.
fn bin_edges_strategy() -> impl Strategy<Value = Vec<f64>> {
    prop::collection::btree_set(1u32..100, 0..8).prop_map(|interior| {
        let mut edges = vec![0.0];
        edges.extend(interior.into_iter().map(f64::from));
        edges.push(100.0);
        edges
    })
}

/// Strategy for training samples with optional forward percentiles.
fn samples_strategy(max_len: usize) -> impl Strategy<Value = Vec<HorizonSample>> {
    prop::collection::vec(
        (
            0.0..=100.0f64,
            -0.2..0.2f64,
            prop::option::weighted(0.9, 0.0..=100.0f64),
        ),
        0..max_len,
    )
    .prop_map(|points| {
        let t0 = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        points
            .into_iter()
            .enumerate()
            .map(|(i, (percentile, forward_return, forward_percentile))| {
                let ts = t0 + chrono::Duration::days(i as i64);
                HorizonSample {
                    timestamp: ts,
                    percentile,
                    forward_return,
                    forward_percentile,
                    horizon_end: ts + chrono::Duration::days(1),
                }
            })
            .collect()
    })
}

fn pairs_strategy() -> impl Strategy<Value = Vec<(Option<f64>, f64)>> {
    prop::collection::vec(
        (prop::option::weighted(0.8, -0.1..0.1f64), -0.1..0.1f64),
        0..200,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    // ========================================================================
    // Bin partition tests
    // ========================================================================

    #[test]
    fn bins_partition_unit_range(edges in bin_edges_strategy()) {
        let bins = PercentileBins::from_edges(&edges).unwrap();
        prop_assert_eq!(bins.len(), edges.len() - 1);

        let slice = bins.as_slice();
        prop_assert_eq!(slice[0].lower, 0.0);
        prop_assert_eq!(slice[slice.len() - 1].upper, 100.0);
        for pair in slice.windows(2) {
            prop_assert_eq!(pair[0].upper, pair[1].lower);
        }
    }

    #[test]
    fn every_percentile_maps_to_its_bin(edges in bin_edges_strategy(), p in 0.0..=100.0f64) {
        let bins = PercentileBins::from_edges(&edges).unwrap();
        let idx = bins.index_of(p);
        prop_assert!(idx.is_some());
        let bin = bins.get(idx.unwrap()).unwrap();
        prop_assert!(bin.lower <= p && p <= bin.upper);
        // Half-open except the last bin.
        if p == bin.upper {
            prop_assert_eq!(p, 100.0);
        }
    }

    #[test]
    fn interior_edges_belong_to_upper_bin(edges in bin_edges_strategy()) {
        let bins = PercentileBins::from_edges(&edges).unwrap();
        for (i, edge) in edges.iter().enumerate().skip(1).take(edges.len() - 2) {
            prop_assert_eq!(bins.index_of(*edge), Some(i));
        }
    }

    #[test]
    fn out_of_range_percentiles_have_no_bin(p in prop_oneof![-1e6..-1e-9f64, 100.000001..1e6f64]) {
        prop_assert_eq!(PercentileBins::default().index_of(p), None);
    }

    // ========================================================================
    // Transition matrix tests
    // ========================================================================

    #[test]
    fn transition_rows_are_distributions(samples in samples_strategy(300)) {
        let bins = PercentileBins::default();
        let matrix = TransitionMatrix::fit(1, &bins, &samples);
        prop_assert_eq!(matrix.size(), bins.len());

        for i in 0..matrix.size() {
            match matrix.row(i) {
                Some(row) => {
                    let sum: f64 = row.iter().sum();
                    prop_assert!((sum - 1.0).abs() < 1e-6, "row {} sums to {}", i, sum);
                    prop_assert!(row.iter().all(|p| (0.0..=1.0).contains(p)));
                    prop_assert!(matrix.row_total(i) > 0);
                }
                None => prop_assert_eq!(matrix.row_total(i), 0),
            }
        }

        if let Some(pi) = matrix.stationary_distribution() {
            let sum: f64 = pi.iter().sum();
            prop_assert!((sum - 1.0).abs() < 1e-6);
        }
    }

    // ========================================================================
    // Ensemble tests
    // ========================================================================

    #[test]
    fn forecasts_are_deterministic(samples in samples_strategy(200), p in 0.0..=100.0f64) {
        let config = ForecastConfig::with_horizons(vec![1]);
        let a = HorizonModels::fit(&config, 1, &samples).predict(p);
        let b = HorizonModels::fit(&config, 1, &samples).predict(p);
        prop_assert_eq!(a, b);
    }

    #[test]
    fn ensemble_is_mean_of_defined_components(samples in samples_strategy(200), p in 0.0..=100.0f64) {
        let config = ForecastConfig::with_horizons(vec![1]);
        let prediction = HorizonModels::fit(&config, 1, &samples).predict(p);

        let values: Vec<f64> = ModelKind::ALL
            .iter()
            .filter_map(|k| prediction.components.get(*k))
            .collect();
        prop_assert_eq!(values.len(), prediction.defined.len());
        match prediction.ensemble {
            Some(e) => {
                let mean = values.iter().sum::<f64>() / values.len() as f64;
                prop_assert!((e - mean).abs() < 1e-9);
            }
            None => prop_assert!(values.is_empty()),
        }
        if samples.is_empty() {
            prop_assert!(prediction.ensemble.is_none());
        }
    }

    // ========================================================================
    // Accuracy tests
    // ========================================================================

    #[test]
    fn accuracy_metrics_in_range(pairs in pairs_strategy()) {
        let m = AccuracyMetrics::from_pairs(1, &pairs, 252.0);

        let defined = pairs.iter().filter(|(p, _)| p.is_some()).count();
        prop_assert_eq!(m.sample_size, defined);
        prop_assert_eq!(m.coverage_gaps, pairs.len() - defined);
        prop_assert!(m.directional_count <= m.sample_size);

        if let Some(hit) = m.hit_rate {
            prop_assert!((0.0..=100.0).contains(&hit));
        }
        if let (Some(mae), Some(rmse)) = (m.mae, m.rmse) {
            prop_assert!(mae >= 0.0);
            prop_assert!(rmse + 1e-12 >= mae);
        }
        if let Some(c) = m.correlation {
            prop_assert!((-1.0 - 1e-9..=1.0 + 1e-9).contains(&c));
        }
    }

    #[test]
    fn constant_strategy_returns_have_no_sharpe(n in 2usize..100, actual in 0.001..0.1f64) {
        // Always long a constant outcome: zero variance in strategy returns
        // and in the excess over buy-and-hold.
        let pairs: Vec<(Option<f64>, f64)> = (0..n).map(|_| (Some(0.01), actual)).collect();
        let m = AccuracyMetrics::from_pairs(1, &pairs, 252.0);
        prop_assert_eq!(m.sharpe, None);
        prop_assert_eq!(m.information_ratio, None);
        prop_assert_eq!(m.hit_rate, Some(100.0));
    }
}
