//! Time-window bucketing and per-bucket statistics.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::dataset::AggregatedRow;
use crate::error::{Result, UnifyError};
use crate::rows::{Dimensions, UnifiedRow};

const MICROS_PER_MILLI: i64 = 1_000;
const MICROS_PER_SECOND: i64 = 1_000_000;
const MICROS_PER_MINUTE: i64 = 60 * MICROS_PER_SECOND;
const MICROS_PER_HOUR: i64 = 60 * MICROS_PER_MINUTE;
const MICROS_PER_DAY: i64 = 24 * MICROS_PER_HOUR;

/// Bucket granularity for aggregation.
///
/// Buckets are aligned to the Unix epoch, so a one-hour window starts every
/// bucket on the hour.
///
/// # Examples
///
/// ```rust
/// use unimetrics::aggregation::AggregationWindow;
///
/// let window: AggregationWindow = "15min".parse().unwrap();
/// assert_eq!(window.as_micros(), 15 * 60 * 1_000_000);
/// assert_eq!(window.to_string(), "15min");
/// assert_eq!("1H".parse::<AggregationWindow>().unwrap(), AggregationWindow::hours(1));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AggregationWindow {
    micros: i64,
}

impl AggregationWindow {
    /// Creates a window from a duration.
    ///
    /// # Errors
    /// Returns a configuration error for zero durations or durations that do
    /// not fit in 64-bit microseconds.
    pub fn new(duration: Duration) -> Result<Self> {
        let micros = i64::try_from(duration.as_micros()).map_err(|_| {
            UnifyError::Configuration(format!("aggregation window {duration:?} is too large"))
        })?;
        Self::from_micros(micros)
    }

    fn from_micros(micros: i64) -> Result<Self> {
        if micros <= 0 {
            return Err(UnifyError::Configuration(
                "aggregation window must be positive".to_string(),
            ));
        }
        Ok(Self { micros })
    }

    /// A window of `n` whole hours.
    pub const fn hours(n: u32) -> Self {
        Self {
            micros: n as i64 * MICROS_PER_HOUR,
        }
    }

    /// A window of `n` whole minutes.
    pub const fn minutes(n: u32) -> Self {
        Self {
            micros: n as i64 * MICROS_PER_MINUTE,
        }
    }

    pub fn as_micros(&self) -> i64 {
        self.micros
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_micros(self.micros as u64)
    }

    /// Returns the start of the bucket containing `timestamp`.
    pub fn floor(&self, timestamp: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let micros = timestamp.timestamp_micros();
        let floored = micros.div_euclid(self.micros) * self.micros;
        DateTime::from_timestamp_micros(floored).ok_or_else(|| {
            UnifyError::Internal(format!("bucket start for {timestamp} is out of range"))
        })
    }
}

impl Default for AggregationWindow {
    fn default() -> Self {
        Self::hours(1)
    }
}

static WINDOW_PATTERN: Lazy<Regex> = Lazy::new(|| {
    // Hard-coded pattern, known to be valid
    #[allow(clippy::expect_used)]
    Regex::new(r"^\s*(\d+)?\s*([A-Za-z]+)\s*$").expect("Hard-coded regex pattern should be valid")
});

impl FromStr for AggregationWindow {
    type Err = UnifyError;

    /// Parses pandas-style frequency strings such as `1H`, `15min`, `30S` or `1D`.
    fn from_str(s: &str) -> Result<Self> {
        let captures = WINDOW_PATTERN.captures(s).ok_or_else(|| {
            UnifyError::Configuration(format!("invalid aggregation window '{s}'"))
        })?;
        let count: i64 = match captures.get(1) {
            Some(m) => m.as_str().parse().map_err(|_| {
                UnifyError::Configuration(format!("invalid aggregation window count in '{s}'"))
            })?,
            None => 1,
        };
        let unit = &captures[2];
        let unit_micros = match unit {
            "ms" | "L" => MICROS_PER_MILLI,
            "s" | "S" | "sec" => MICROS_PER_SECOND,
            "T" | "min" => MICROS_PER_MINUTE,
            "H" | "h" => MICROS_PER_HOUR,
            "D" | "d" => MICROS_PER_DAY,
            other => {
                return Err(UnifyError::Configuration(format!(
                    "unknown aggregation window unit '{other}' in '{s}'"
                )))
            }
        };
        let micros = count.checked_mul(unit_micros).ok_or_else(|| {
            UnifyError::Configuration(format!("aggregation window '{s}' is too large"))
        })?;
        Self::from_micros(micros)
    }
}

impl TryFrom<String> for AggregationWindow {
    type Error = UnifyError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<AggregationWindow> for String {
    fn from(window: AggregationWindow) -> Self {
        window.to_string()
    }
}

impl fmt::Display for AggregationWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let units = [
            (MICROS_PER_DAY, "d"),
            (MICROS_PER_HOUR, "h"),
            (MICROS_PER_MINUTE, "min"),
            (MICROS_PER_SECOND, "s"),
            (MICROS_PER_MILLI, "ms"),
        ];
        for (size, suffix) in units {
            if self.micros % size == 0 {
                return write!(f, "{}{suffix}", self.micros / size);
            }
        }
        write!(f, "{}us", self.micros)
    }
}

/// Running statistics of one bucket.
#[derive(Debug, Clone, Default)]
struct BucketStats {
    count: i64,
    sum: f64,
    min: Option<f64>,
    max: Option<f64>,
}

impl BucketStats {
    fn add(&mut self, value: Option<f64>) {
        let Some(value) = value else {
            return;
        };
        self.count += 1;
        self.sum += value;
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
    }

    fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

type BucketKey = (DateTime<Utc>, String, String, Dimensions);

/// Groups rows into `(bucket, metric_name, source, dimensions)` buckets.
///
/// Statistics only consider non-null values; a bucket whose values are all
/// null still appears, with a `value_count` of zero and absent statistics.
/// Output is ordered by bucket start, then metric name, source and dimensions.
pub fn aggregate(rows: Vec<UnifiedRow>, window: AggregationWindow) -> Result<Vec<AggregatedRow>> {
    let mut buckets: BTreeMap<BucketKey, BucketStats> = BTreeMap::new();
    for row in rows {
        let bucket = window.floor(row.timestamp)?;
        buckets
            .entry((bucket, row.metric_name, row.source, row.dimensions))
            .or_default()
            .add(row.value);
    }

    Ok(buckets
        .into_iter()
        .map(
            |((timestamp, metric_name, source, dimensions), stats)| AggregatedRow {
                timestamp,
                metric_name,
                source,
                dimensions,
                value: stats.mean(),
                value_min: stats.min,
                value_max: stats.max,
                value_count: stats.count,
            },
        )
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 1, 1, h, m, 0).unwrap()
    }

    fn unified(ts: DateTime<Utc>, metric: &str, value: Option<f64>) -> UnifiedRow {
        UnifiedRow {
            timestamp: ts,
            metric_name: metric.to_string(),
            value,
            source: "s".to_string(),
            dimensions: Dimensions::new(),
        }
    }

    #[test]
    fn test_window_parsing() {
        assert_eq!("1H".parse::<AggregationWindow>().unwrap(), AggregationWindow::hours(1));
        assert_eq!("1h".parse::<AggregationWindow>().unwrap(), AggregationWindow::hours(1));
        assert_eq!("H".parse::<AggregationWindow>().unwrap(), AggregationWindow::hours(1));
        assert_eq!("15T".parse::<AggregationWindow>().unwrap(), AggregationWindow::minutes(15));
        assert_eq!("15min".parse::<AggregationWindow>().unwrap(), AggregationWindow::minutes(15));
        assert_eq!("2D".parse::<AggregationWindow>().unwrap(), AggregationWindow::hours(48));
        assert_eq!("30s".parse::<AggregationWindow>().unwrap().as_micros(), 30_000_000);
        assert_eq!("500ms".parse::<AggregationWindow>().unwrap().as_micros(), 500_000);
    }

    #[test]
    fn test_window_parsing_errors() {
        assert!("0H".parse::<AggregationWindow>().is_err());
        assert!("1W".parse::<AggregationWindow>().is_err());
        assert!("".parse::<AggregationWindow>().is_err());
        assert!("-1H".parse::<AggregationWindow>().is_err());
        assert!(AggregationWindow::new(Duration::ZERO).is_err());
    }

    #[test]
    fn test_window_display() {
        assert_eq!(AggregationWindow::hours(1).to_string(), "1h");
        assert_eq!(AggregationWindow::hours(24).to_string(), "1d");
        assert_eq!(AggregationWindow::minutes(90).to_string(), "90min");
        assert_eq!(
            AggregationWindow::new(Duration::from_millis(1500)).unwrap().to_string(),
            "1500ms"
        );
    }

    #[test]
    fn test_window_serde_roundtrip() {
        let window: AggregationWindow = serde_json::from_str("\"15min\"").unwrap();
        assert_eq!(window, AggregationWindow::minutes(15));
        assert_eq!(serde_json::to_string(&window).unwrap(), "\"15min\"");
        assert!(serde_json::from_str::<AggregationWindow>("\"fortnight\"").is_err());
    }

    #[test]
    fn test_floor_aligns_to_epoch() {
        let window = AggregationWindow::hours(1);
        assert_eq!(window.floor(at(0, 40)).unwrap(), at(0, 0));
        assert_eq!(window.floor(at(1, 0)).unwrap(), at(1, 0));

        let before_epoch = Utc.with_ymd_and_hms(1969, 12, 31, 23, 30, 0).unwrap();
        assert_eq!(
            window.floor(before_epoch).unwrap(),
            Utc.with_ymd_and_hms(1969, 12, 31, 23, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_hourly_bucket_statistics() {
        let rows = vec![
            unified(at(0, 10), "lat", Some(5.0)),
            unified(at(0, 40), "lat", Some(7.0)),
        ];
        let aggregated = aggregate(rows, AggregationWindow::hours(1)).unwrap();

        assert_eq!(aggregated.len(), 1);
        let bucket = &aggregated[0];
        assert_eq!(bucket.timestamp, at(0, 0));
        assert_eq!(bucket.value, Some(6.0));
        assert_eq!(bucket.value_min, Some(5.0));
        assert_eq!(bucket.value_max, Some(7.0));
        assert_eq!(bucket.value_count, 2);
    }

    #[test]
    fn test_all_null_bucket_is_kept() {
        let rows = vec![
            unified(at(0, 10), "lat", None),
            unified(at(1, 10), "lat", Some(3.0)),
        ];
        let aggregated = aggregate(rows, AggregationWindow::hours(1)).unwrap();

        assert_eq!(aggregated.len(), 2);
        assert_eq!(aggregated[0].value_count, 0);
        assert_eq!(aggregated[0].value, None);
        assert_eq!(aggregated[0].value_min, None);
        assert_eq!(aggregated[1].value, Some(3.0));
    }

    #[test]
    fn test_dimensions_split_buckets() {
        let mut a = unified(at(0, 10), "lat", Some(1.0));
        a.dimensions.insert("host".to_string(), "a".to_string());
        let mut b = unified(at(0, 20), "lat", Some(3.0));
        b.dimensions.insert("host".to_string(), "b".to_string());

        let aggregated = aggregate(vec![b, a], AggregationWindow::hours(1)).unwrap();
        assert_eq!(aggregated.len(), 2);
        assert_eq!(aggregated[0].dimensions.get("host"), Some(&"a".to_string()));
        assert_eq!(aggregated[1].dimensions.get("host"), Some(&"b".to_string()));
    }
}
