//! CSV loading of aligned price and percentile series.

use crate::error::{ForecastError, Result};
use crate::types::{PercentilePoint, PricePoint};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use csv::ReaderBuilder;
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use tracing::{debug, info, warn};

/// Raw CSV row with flexible column names.
#[derive(Debug, Deserialize)]
struct CsvRow {
    #[serde(
        alias = "Date",
        alias = "date",
        alias = "DATE",
        alias = "Timestamp",
        alias = "timestamp",
        alias = "Time",
        alias = "time",
        alias = "datetime",
        alias = "Datetime"
    )]
    date: String,
    #[serde(
        alias = "Close",
        alias = "close",
        alias = "Price",
        alias = "price",
        alias = "Adj Close"
    )]
    price: f64,
    /// Empty during the oscillator warm-up.
    #[serde(
        alias = "Percentile",
        alias = "percentile",
        alias = "pct_rank",
        alias = "PctRank",
        default
    )]
    percentile: Option<f64>,
}

/// CSV loading options.
#[derive(Debug, Clone)]
pub struct DataConfig {
    /// Date format string, e.g. `%Y-%m-%d`; common formats are tried otherwise.
    pub date_format: Option<String>,
    pub has_headers: bool,
    /// Auto-detected when `None`.
    pub delimiter: Option<u8>,
    /// Skip malformed rows instead of failing.
    pub skip_invalid: bool,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            date_format: None,
            has_headers: true,
            delimiter: None,
            skip_invalid: true,
        }
    }
}

/// Price and percentile series loaded from one file, sorted by timestamp.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputSeries {
    pub prices: Vec<PricePoint>,
    pub percentiles: Vec<PercentilePoint>,
}

impl InputSeries {
    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }

    /// Bars with a defined percentile.
    pub fn defined_percentiles(&self) -> usize {
        self.percentiles
            .iter()
            .filter(|p| p.percentile.is_some())
            .count()
    }
}

/// Pick the delimiter giving a consistent column count over the first lines.
fn detect_delimiter(path: &Path) -> Result<u8> {
    let file = File::open(path)?;
    let lines: Vec<String> = BufReader::new(file)
        .lines()
        .take(5)
        .filter_map(|l| l.ok())
        .collect();
    Ok(detect_delimiter_in(&lines))
}

fn detect_delimiter_in(lines: &[String]) -> u8 {
    let mut best = b',';
    let mut best_score = 0;

    for delim in [b',', b'\t', b';', b'|'] {
        let counts: Vec<usize> = lines
            .iter()
            .map(|line| line.bytes().filter(|&b| b == delim).count() + 1)
            .collect();
        let Some(&first) = counts.first() else {
            continue;
        };
        // date, price, percentile
        if first >= 3 && counts.iter().all(|&c| c == first) && first > best_score {
            best_score = first;
            best = delim;
        }
    }

    debug!("Detected delimiter {:?}", best as char);
    best
}

/// Parse a date string, trying the explicit format first and then common
/// datetime, date and Unix timestamp forms.
pub fn parse_datetime(s: &str, format: Option<&str>) -> Result<DateTime<Utc>> {
    let s = s.trim();
    if let Some(fmt) = format {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(Utc.from_utc_datetime(&dt));
        }
        if let Some(dt) = NaiveDate::parse_from_str(s, fmt)
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
        {
            return Ok(Utc.from_utc_datetime(&dt));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    let datetime_formats = [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y/%m/%d %H:%M:%S",
        "%d/%m/%Y %H:%M:%S",
        "%m/%d/%Y %H:%M:%S",
    ];
    for fmt in &datetime_formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(Utc.from_utc_datetime(&dt));
        }
    }

    let date_formats = ["%Y-%m-%d", "%Y/%m/%d", "%d-%m-%Y", "%d/%m/%Y", "%m/%d/%Y", "%d-%b-%Y"];
    for fmt in &date_formats {
        if let Some(dt) = NaiveDate::parse_from_str(s, fmt)
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
        {
            return Ok(Utc.from_utc_datetime(&dt));
        }
    }

    // Unix seconds, or milliseconds for 13-digit values.
    if let Ok(ts) = s.parse::<i64>() {
        let dt = if s.len() >= 13 {
            DateTime::from_timestamp_millis(ts)
        } else {
            DateTime::from_timestamp(ts, 0)
        };
        if let Some(dt) = dt {
            return Ok(dt);
        }
    }

    Err(ForecastError::DataError(format!("Could not parse date: '{}'", s)))
}

/// Load timestamp, price and percentile columns from a CSV file.
pub fn load_csv(path: impl AsRef<Path>, config: &DataConfig) -> Result<InputSeries> {
    let path = path.as_ref();
    info!("Loading data from: {}", path.display());

    let delimiter = match config.delimiter {
        Some(d) => d,
        None => detect_delimiter(path)?,
    };
    let file = File::open(path)?;
    read_series(file, delimiter, config)
}

/// Load series from CSV text.
pub fn load_csv_from_str(content: &str, config: &DataConfig) -> Result<InputSeries> {
    let delimiter = match config.delimiter {
        Some(d) => d,
        None => {
            let lines: Vec<String> = content.lines().take(5).map(str::to_string).collect();
            detect_delimiter_in(&lines)
        }
    };
    read_series(content.as_bytes(), delimiter, config)
}

fn read_series<R: Read>(input: R, delimiter: u8, config: &DataConfig) -> Result<InputSeries> {
    let mut reader = ReaderBuilder::new()
        .has_headers(config.has_headers)
        .delimiter(delimiter)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(input);

    let mut rows: Vec<(DateTime<Utc>, f64, Option<f64>)> = Vec::new();
    let mut skipped = 0;

    for (i, result) in reader.deserialize::<CsvRow>().enumerate() {
        let row_num = i + 1;
        let row = match result {
            Ok(r) => r,
            Err(e) if config.skip_invalid => {
                debug!("Skipping row {}: {}", row_num, e);
                skipped += 1;
                continue;
            }
            Err(e) => return Err(ForecastError::CsvError(e)),
        };

        let timestamp = match parse_datetime(&row.date, config.date_format.as_deref()) {
            Ok(ts) => ts,
            Err(e) if config.skip_invalid => {
                debug!("Skipping row {} due to date parse error: {}", row_num, e);
                skipped += 1;
                continue;
            }
            Err(e) => return Err(e),
        };

        if !row.price.is_finite() || row.price <= 0.0 {
            if config.skip_invalid {
                debug!("Skipping row {} with invalid price {}", row_num, row.price);
                skipped += 1;
                continue;
            }
            return Err(ForecastError::DataError(format!(
                "Invalid price at row {}: {}",
                row_num, row.price
            )));
        }

        // NaN is a common warm-up marker in exported indicator columns.
        rows.push((timestamp, row.price, row.percentile.filter(|p| !p.is_nan())));
    }

    if skipped > 0 {
        warn!("Skipped {} invalid rows", skipped);
    }

    rows.sort_by_key(|r| r.0);
    let original_len = rows.len();
    rows.dedup_by_key(|r| r.0);
    if rows.len() < original_len {
        warn!("Removed {} duplicate timestamps", original_len - rows.len());
    }

    if rows.is_empty() {
        return Err(ForecastError::NoData);
    }

    let series = InputSeries {
        prices: rows.iter().map(|(t, p, _)| PricePoint::new(*t, *p)).collect(),
        percentiles: rows
            .iter()
            .map(|(t, _, pct)| PercentilePoint::new(*t, *pct))
            .collect(),
    };

    info!(
        "Loaded {} bars ({} with a percentile) from {} to {}",
        series.len(),
        series.defined_percentiles(),
        rows[0].0,
        rows[rows.len() - 1].0
    );
    Ok(series)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_csv_with_warmup() {
        let csv = "date,close,percentile\n\
                   2024-01-03,102.0,40.5\n\
                   2024-01-01,100.0,\n\
                   2024-01-02,101.0,NaN\n";
        let series = load_csv_from_str(csv, &DataConfig::default()).unwrap();

        assert_eq!(series.len(), 3);
        assert_eq!(series.prices[0].price, 100.0);
        assert_eq!(series.percentiles[0].percentile, None);
        assert_eq!(series.percentiles[1].percentile, None);
        assert_eq!(series.percentiles[2].percentile, Some(40.5));
        assert_eq!(series.defined_percentiles(), 1);
    }

    #[test]
    fn test_column_aliases_and_delimiter() {
        let csv = "timestamp;price;pct_rank\n\
                   2024-01-01 09:30:00;50.0;10\n\
                   2024-01-01 09:45:00;50.5;20\n";
        let series = load_csv_from_str(csv, &DataConfig::default()).unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series.percentiles[1].percentile, Some(20.0));
    }

    #[test]
    fn test_duplicates_and_invalid_rows() {
        let csv = "date,close,percentile\n\
                   2024-01-01,100.0,10\n\
                   2024-01-01,100.5,11\n\
                   not-a-date,101.0,12\n\
                   2024-01-02,-5.0,13\n\
                   2024-01-03,102.0,14\n";
        let series = load_csv_from_str(csv, &DataConfig::default()).unwrap();
        assert_eq!(series.len(), 2);

        let strict = DataConfig {
            skip_invalid: false,
            ..Default::default()
        };
        assert!(load_csv_from_str(csv, &strict).is_err());
    }

    #[test]
    fn test_empty_file_is_no_data() {
        let err = load_csv_from_str("date,close,percentile\n", &DataConfig::default()).unwrap_err();
        assert!(matches!(err, ForecastError::NoData));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "Date,Close,Percentile").unwrap();
        writeln!(file, "2024-03-01,10.0,5").unwrap();
        writeln!(file, "2024-03-04,10.5,95").unwrap();

        let series = load_csv(file.path(), &DataConfig::default()).unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series.prices[1].timestamp.day(), 4);
    }

    #[test]
    fn test_parse_datetime_formats() {
        assert!(parse_datetime("2024-01-15", None).is_ok());
        assert!(parse_datetime("2024-01-15T10:30:00Z", None).is_ok());
        assert!(parse_datetime("15-Jan-2024", None).is_ok());
        assert!(parse_datetime("1705312200", None).is_ok());
        let ms = parse_datetime("1705312200000", None).unwrap();
        assert_eq!(ms, parse_datetime("1705312200", None).unwrap());
        assert!(parse_datetime("15.01.2024", Some("%d.%m.%Y")).is_ok());
        assert!(parse_datetime("garbage", None).is_err());
    }
}
