//! Terminal, JSON and CSV rendering of reports and backtest results.

use crate::accuracy::AccuracyMetrics;
use crate::backtest::{BacktestRecord, BacktestRun};
use crate::ensemble::{BinTable, ForwardPrediction, PredictionReport};
use crate::markov::TransitionMatrix;
use crate::types::{BarDuration, ModelKind};
use colored::Colorize;
use serde::Serialize;
use tabled::{builder::Builder, settings::Style};

/// Format an optional return as a percentage.
fn pct(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:+.3}%", v * 100.0))
        .unwrap_or_else(|| "n/a".to_string())
}

fn num(value: Option<f64>, precision: usize) -> String {
    value
        .map(|v| format!("{:.*}", precision, v))
        .unwrap_or_else(|| "n/a".to_string())
}

fn csv_opt(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Horizon column text, e.g. `5 (5d)`.
fn horizon_cell(horizon: usize, bar: BarDuration) -> String {
    format!("{} ({})", horizon, bar.horizon_label(horizon))
}

fn colored_return(value: Option<f64>) -> String {
    match value {
        Some(v) if v > 0.0 => pct(value).green().to_string(),
        Some(v) if v < 0.0 => pct(value).red().to_string(),
        _ => pct(value),
    }
}

/// Format results for terminal display.
pub struct ReportFormatter;

impl ReportFormatter {
    /// Print a full analysis report to stdout.
    pub fn print_report(report: &PredictionReport) {
        println!();
        println!("{}", "═".repeat(60).blue());
        println!("{}", " FORWARD MAPPING REPORT ".bold().blue());
        println!("{}", "═".repeat(60).blue());
        println!();

        println!("{}", "Overview".bold().underline());
        println!("  Instrument:      {}", report.instrument);
        println!(
            "  As of:           {}",
            report.current_timestamp.format("%Y-%m-%d %H:%M")
        );
        println!("  Percentile:      {:>8.2}", report.current_percentile);
        println!(
            "  Bin:             {}",
            report.current_bin.as_deref().unwrap_or("n/a")
        );
        println!("  Observations:    {:>8}", report.sample_size);
        println!();

        println!("{}", "Forecasts".bold().underline());
        Self::print_predictions(&report.predictions, report.bar_duration);
        println!();

        if let Some(table) = report.bin_statistics.first() {
            println!(
                "{}",
                format!("Bin Statistics (h={})", table.horizon).bold().underline()
            );
            Self::print_bin_table(table);
            println!();
        }

        if let Some(accuracy) = &report.accuracy {
            println!("{}", "Backtest Accuracy".bold().underline());
            Self::print_accuracy(accuracy, report.bar_duration);
            println!();
        }

        if !report.warnings.is_empty() {
            println!("{}", "Warnings".bold().underline());
            for warning in &report.warnings {
                println!("  {} {}", "!".yellow(), warning);
            }
            println!();
        }

        println!("{}", "═".repeat(60).blue());
    }

    /// Print per-horizon forecasts as a table.
    pub fn print_predictions(predictions: &[ForwardPrediction], bar: BarDuration) {
        let mut builder = Builder::new();
        let mut header = vec!["Horizon".to_string()];
        header.extend(ModelKind::ALL.iter().map(|k| k.name().to_string()));
        header.push("Ensemble".to_string());
        header.push("95% interval".to_string());
        builder.push_record(header);

        for p in predictions {
            let mut row = vec![horizon_cell(p.horizon, bar)];
            for kind in ModelKind::ALL {
                let mut cell = pct(p.components.get(kind));
                if kind == ModelKind::Empirical && p.empirical_low_confidence == Some(true) {
                    cell.push('*');
                }
                row.push(cell);
            }
            row.push(colored_return(p.ensemble));
            row.push(
                p.linear_interval
                    .map(|i| format!("[{}, {}]", pct(Some(i.lower)), pct(Some(i.upper))))
                    .unwrap_or_else(|| "n/a".to_string()),
            );
            builder.push_record(row);
        }

        println!("{}", builder.build().with(Style::rounded()));
        if predictions
            .iter()
            .any(|p| p.empirical_low_confidence == Some(true))
        {
            println!("  * low-confidence bin");
        }
    }

    /// Print the statistics of every bin for one horizon.
    pub fn print_bin_table(table: &BinTable) {
        let mut builder = Builder::new();
        builder.push_record([
            "Bin", "Count", "Mean", "Median", "Std", "P5", "P95", "Up mean", "Down std",
        ]);
        for s in &table.bins {
            let label = if s.low_confidence {
                format!("{}*", s.label)
            } else {
                s.label.clone()
            };
            builder.push_record([
                label,
                s.count.to_string(),
                pct(s.mean),
                pct(s.median),
                pct(s.std),
                pct(s.pct5),
                pct(s.pct95),
                pct(s.upside_mean),
                pct(s.downside_std),
            ]);
        }
        println!("{}", builder.build().with(Style::rounded()));
    }

    /// Print transition probabilities with the stationary distribution.
    pub fn print_transition_matrix(matrix: &TransitionMatrix) {
        let mut builder = Builder::new();
        let mut header = vec![format!("h={}", matrix.horizon)];
        header.extend(matrix.labels.iter().cloned());
        header.push("n".to_string());
        builder.push_record(header);

        for (i, label) in matrix.labels.iter().enumerate() {
            let mut row = vec![label.clone()];
            match matrix.row(i) {
                Some(probs) => row.extend(probs.iter().map(|p| format!("{:.2}", p))),
                None => row.extend(matrix.labels.iter().map(|_| "-".to_string())),
            }
            row.push(matrix.row_total(i).to_string());
            builder.push_record(row);
        }

        if let Some(pi) = matrix.stationary_distribution() {
            let mut row = vec!["stationary".to_string()];
            row.extend(pi.iter().map(|p| format!("{:.2}", p)));
            row.push(String::new());
            builder.push_record(row);
        }
        println!("{}", builder.build().with(Style::rounded()));
    }

    /// Print accuracy metrics, one row per horizon.
    pub fn print_accuracy(metrics: &[AccuracyMetrics], bar: BarDuration) {
        let mut builder = Builder::new();
        builder.push_record([
            "Horizon", "N", "Gaps", "MAE", "RMSE", "Hit %", "Sharpe", "IR", "Corr",
        ]);
        for m in metrics {
            builder.push_record([
                horizon_cell(m.horizon, bar),
                m.sample_size.to_string(),
                m.coverage_gaps.to_string(),
                pct(m.mae),
                pct(m.rmse),
                num(m.hit_rate, 1),
                num(m.sharpe, 2),
                num(m.information_ratio, 3),
                num(m.correlation, 3),
            ]);
        }
        println!("{}", builder.build().with(Style::rounded()));
    }

    /// Print a backtest summary with ensemble and per-component accuracy.
    pub fn print_backtest(
        instrument: &str,
        bar: BarDuration,
        run: &BacktestRun,
        ensemble: &[AccuracyMetrics],
        components: &[(ModelKind, Vec<AccuracyMetrics>)],
    ) {
        println!();
        println!("{}", "═".repeat(60).blue());
        println!("{}", " ROLLING BACKTEST ".bold().blue());
        println!("{}", "═".repeat(60).blue());
        println!();
        println!("  Instrument:      {} ({} bars)", instrument, bar);
        println!(
            "  Windows:         {}/{}",
            run.windows_completed,
            run.windows.len()
        );
        println!("  Records:         {}", run.records.len());
        if run.cancelled {
            println!("  {}", "Run was cancelled; results are partial".yellow());
        }
        let violations = run.verify_no_lookahead();
        if violations.is_empty() {
            println!("  Lookahead audit: {}", "passed".green());
        } else {
            println!(
                "  Lookahead audit: {}",
                format!("{} violations", violations.len()).red()
            );
        }
        println!();

        println!("{}", "Ensemble".bold().underline());
        Self::print_accuracy(ensemble, bar);

        for (kind, metrics) in components {
            println!();
            println!("{}", kind.name().bold().underline());
            Self::print_accuracy(metrics, bar);
        }
        println!("{}", "═".repeat(60).blue());
    }

    /// Serialize any report type to pretty JSON.
    pub fn to_json<T: Serialize>(value: &T) -> String {
        serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn predictions_csv_header() -> &'static str {
        "instrument,horizon,percentile,bin,empirical,markov,linear,polynomial,quantile_median,kernel,ensemble"
    }

    /// One CSV line per horizon forecast.
    pub fn predictions_to_csv(report: &PredictionReport) -> String {
        Self::forecasts_to_csv(&report.instrument, &report.predictions)
    }

    pub fn forecasts_to_csv(instrument: &str, predictions: &[ForwardPrediction]) -> String {
        let mut out = String::from(Self::predictions_csv_header());
        out.push('\n');
        for p in predictions {
            let mut fields = vec![
                instrument.to_string(),
                p.horizon.to_string(),
                p.percentile.to_string(),
                p.bin_label.clone().unwrap_or_default(),
            ];
            fields.extend(ModelKind::ALL.iter().map(|k| csv_opt(p.components.get(*k))));
            fields.push(csv_opt(p.ensemble));
            out.push_str(&fields.join(","));
            out.push('\n');
        }
        out
    }

    pub fn accuracy_csv_header() -> &'static str {
        "horizon,sample_size,coverage_gaps,directional_count,mae,rmse,hit_rate,sharpe,information_ratio,correlation"
    }

    pub fn accuracy_to_csv(metrics: &[AccuracyMetrics]) -> String {
        let mut out = String::from(Self::accuracy_csv_header());
        out.push('\n');
        for m in metrics {
            out.push_str(&format!(
                "{},{},{},{},{},{},{},{},{},{}\n",
                m.horizon,
                m.sample_size,
                m.coverage_gaps,
                m.directional_count,
                csv_opt(m.mae),
                csv_opt(m.rmse),
                csv_opt(m.hit_rate),
                csv_opt(m.sharpe),
                csv_opt(m.information_ratio),
                csv_opt(m.correlation),
            ));
        }
        out
    }

    pub fn records_csv_header() -> &'static str {
        "window_index,test_timestamp,horizon,percentile,predicted_return,actual_return,latest_training_timestamp"
    }

    pub fn records_to_csv(records: &[BacktestRecord]) -> String {
        let mut out = String::from(Self::records_csv_header());
        out.push('\n');
        for r in records {
            out.push_str(&format!(
                "{},{},{},{},{},{},{}\n",
                r.window_index,
                r.test_timestamp.to_rfc3339(),
                r.horizon,
                r.percentile,
                csv_opt(r.predicted_return),
                r.actual_return,
                r.latest_training_timestamp
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default(),
            ));
        }
        out
    }
}
