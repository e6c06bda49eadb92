//! Data-quality scoring.
//!
//! The score starts at 1.0 and loses up to 0.25 for each of four defects,
//! proportionally to the fraction of the dataset that exhibits it:
//!
//! - **Completeness**: mean null fraction across all columns
//! - **Duplication**: fraction of rows that repeat an earlier row exactly
//! - **Validity**: fraction of rows whose `value` is negative
//! - **Timeliness**: fraction of rows whose `timestamp` lies in the future
//!
//! An empty dataset has no defects and scores 1.0.

use arrow::array::{
    Array, ArrayRef, Float64Array, ListArray, MapArray, TimestampMicrosecondArray,
};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, TimeUnit};
use arrow::record_batch::RecordBatch;
use arrow::row::{RowConverter, SortField};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::dataset::{columns, TIMESTAMP_TZ};
use crate::error::{Result, UnifyError};

/// Maximum penalty applied by each check.
pub const CHECK_WEIGHT: f64 = 0.25;

/// Per-check defect fractions and the resulting score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub missing_fraction: f64,
    pub duplicate_fraction: f64,
    pub negative_fraction: f64,
    pub future_fraction: f64,
    /// Overall score in `[0.0, 1.0]`.
    pub score: f64,
}

impl QualityReport {
    fn from_fractions(missing: f64, duplicate: f64, negative: f64, future: f64) -> Self {
        let penalty = CHECK_WEIGHT * (missing + duplicate + negative + future);
        Self {
            missing_fraction: missing,
            duplicate_fraction: duplicate,
            negative_fraction: negative,
            future_fraction: future,
            score: (1.0 - penalty).clamp(0.0, 1.0),
        }
    }

    /// The report for a dataset without rows.
    pub fn neutral() -> Self {
        Self::from_fractions(0.0, 0.0, 0.0, 0.0)
    }
}

/// Computes quality scores for record batches.
///
/// # Example
///
/// ```rust
/// use unimetrics::dataset::AggregatedDataset;
/// use unimetrics::quality::QualityScorer;
///
/// let dataset = AggregatedDataset::empty();
/// let score = QualityScorer::new().score(dataset.record_batch()).unwrap();
/// assert_eq!(score, 1.0);
/// ```
#[derive(Debug, Clone, Default)]
pub struct QualityScorer {
    evaluated_at: Option<DateTime<Utc>>,
}

impl QualityScorer {
    /// Creates a scorer that judges timestamps against the current time.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins the instant that future timestamps are compared against.
    pub fn evaluated_at(mut self, now: DateTime<Utc>) -> Self {
        self.evaluated_at = Some(now);
        self
    }

    /// Returns the score of a batch.
    pub fn score(&self, batch: &RecordBatch) -> Result<f64> {
        Ok(self.assess(batch)?.score)
    }

    /// Computes every check and the resulting score.
    #[instrument(skip(self, batch), fields(rows = batch.num_rows()))]
    pub fn assess(&self, batch: &RecordBatch) -> Result<QualityReport> {
        let rows = batch.num_rows();
        if rows == 0 || batch.num_columns() == 0 {
            return Ok(QualityReport::neutral());
        }
        let now = self.evaluated_at.unwrap_or_else(Utc::now);

        let report = QualityReport::from_fractions(
            missing_fraction(batch),
            duplicate_fraction(batch)?,
            negative_fraction(batch)?,
            future_fraction(batch, now)?,
        );
        debug!(
            missing = report.missing_fraction,
            duplicate = report.duplicate_fraction,
            negative = report.negative_fraction,
            future = report.future_fraction,
            score = report.score,
            "Quality assessed"
        );
        Ok(report)
    }
}

fn missing_fraction(batch: &RecordBatch) -> f64 {
    let rows = batch.num_rows() as f64;
    let total: f64 = batch
        .columns()
        .iter()
        .map(|column| column.null_count() as f64 / rows)
        .sum();
    total / batch.num_columns() as f64
}

fn duplicate_fraction(batch: &RecordBatch) -> Result<f64> {
    let columns = batch
        .columns()
        .iter()
        .map(row_comparable)
        .collect::<Result<Vec<_>>>()?;
    let converter = RowConverter::new(
        columns
            .iter()
            .map(|c| SortField::new(c.data_type().clone()))
            .collect(),
    )?;
    let rows = converter.convert_columns(&columns)?;

    let mut seen = HashSet::with_capacity(batch.num_rows());
    let duplicates = rows.iter().filter(|row| !seen.insert(*row)).count();
    Ok(duplicates as f64 / batch.num_rows() as f64)
}

/// The row format has no map encoding, so maps are compared as their
/// underlying list of key/value entries.
fn row_comparable(column: &ArrayRef) -> Result<ArrayRef> {
    let Some(map) = column.as_any().downcast_ref::<MapArray>() else {
        return Ok(Arc::clone(column));
    };
    let entries = map.entries();
    let field = Arc::new(Field::new("entries", entries.data_type().clone(), false));
    let list = ListArray::try_new(
        field,
        map.offsets().clone(),
        Arc::new(entries.clone()),
        map.nulls().cloned(),
    )?;
    Ok(Arc::new(list))
}

fn negative_fraction(batch: &RecordBatch) -> Result<f64> {
    let Some(column) = batch.column_by_name(columns::VALUE) else {
        return Ok(0.0);
    };
    let values = cast(column.as_ref(), &DataType::Float64)?;
    let values = values
        .as_any()
        .downcast_ref::<Float64Array>()
        .ok_or_else(|| UnifyError::schema(columns::VALUE, "value column must be numeric"))?;

    let negatives = values.iter().flatten().filter(|v| *v < 0.0).count();
    Ok(negatives as f64 / batch.num_rows() as f64)
}

fn future_fraction(batch: &RecordBatch, now: DateTime<Utc>) -> Result<f64> {
    let Some(column) = batch.column_by_name(columns::TIMESTAMP) else {
        return Ok(0.0);
    };
    let utc = DataType::Timestamp(TimeUnit::Microsecond, Some(TIMESTAMP_TZ.into()));
    let timestamps = cast(column.as_ref(), &utc)?;
    let timestamps = timestamps
        .as_any()
        .downcast_ref::<TimestampMicrosecondArray>()
        .ok_or_else(|| {
            UnifyError::schema(columns::TIMESTAMP, "timestamp column must be timestamp type")
        })?;

    let now_micros = now.timestamp_micros();
    let future = timestamps
        .iter()
        .flatten()
        .filter(|ts| *ts > now_micros)
        .count();
    Ok(future as f64 / batch.num_rows() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{AggregatedDataset, AggregatedRow};
    use crate::rows::Dimensions;
    use arrow::array::StringArray;
    use arrow::datatypes::Schema;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn row(hour: u32, metric: &str, value: Option<f64>) -> AggregatedRow {
        AggregatedRow {
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap(),
            metric_name: metric.to_string(),
            source: "s".to_string(),
            dimensions: Dimensions::new(),
            value,
            value_min: value,
            value_max: value,
            value_count: i64::from(value.is_some()),
        }
    }

    fn assess(rows: Vec<AggregatedRow>) -> QualityReport {
        let dataset = AggregatedDataset::from_rows(rows).unwrap();
        QualityScorer::new()
            .evaluated_at(now())
            .assess(dataset.record_batch())
            .unwrap()
    }

    #[test]
    fn test_clean_dataset_scores_one() {
        let report = assess(vec![row(0, "a", Some(1.0)), row(1, "a", Some(2.0))]);
        assert_eq!(report.score, 1.0);
        assert_eq!(report, QualityReport::neutral());
    }

    #[test]
    fn test_empty_dataset_is_neutral() {
        let dataset = AggregatedDataset::empty();
        let report = QualityScorer::new().assess(dataset.record_batch()).unwrap();
        assert_eq!(report.score, 1.0);
    }

    #[test]
    fn test_missing_values_penalty() {
        // One row with three null columns out of eight.
        let report = assess(vec![row(0, "a", None)]);
        assert!((report.missing_fraction - 3.0 / 8.0).abs() < 1e-12);
        assert!((report.score - (1.0 - 0.25 * 3.0 / 8.0)).abs() < 1e-12);
    }

    #[test]
    fn test_duplicate_penalty() {
        let report = assess(vec![
            row(0, "a", Some(1.0)),
            row(0, "a", Some(1.0)),
            row(0, "a", Some(1.0)),
            row(1, "a", Some(1.0)),
        ]);
        assert!((report.duplicate_fraction - 0.5).abs() < 1e-12);
        assert!((report.score - 0.875).abs() < 1e-12);
    }

    #[test]
    fn test_negative_value_penalty() {
        let report = assess(vec![row(0, "a", Some(-1.0)), row(1, "a", Some(1.0))]);
        assert!((report.negative_fraction - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_future_timestamp_penalty() {
        let mut future = row(0, "a", Some(1.0));
        future.timestamp = now() + Duration::hours(1);
        let mut exactly_now = row(0, "b", Some(1.0));
        exactly_now.timestamp = now();

        let report = assess(vec![future, exactly_now]);
        assert!((report.future_fraction - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_all_null_batch_scores_at_most_three_quarters() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("timestamp", DataType::Timestamp(TimeUnit::Microsecond, None), true),
            Field::new("value", DataType::Float64, true),
            Field::new("metric_name", DataType::Utf8, true),
        ]));
        let columns: Vec<ArrayRef> = vec![
            Arc::new(TimestampMicrosecondArray::from(vec![None::<i64>; 3])),
            Arc::new(Float64Array::from(vec![None::<f64>; 3])),
            Arc::new(StringArray::from(vec![None::<&str>, None, None])),
        ];
        let batch = RecordBatch::try_new(schema, columns).unwrap();

        let report = QualityScorer::new().evaluated_at(now()).assess(&batch).unwrap();
        assert_eq!(report.missing_fraction, 1.0);
        assert!(report.score <= 0.75);
        assert!(report.score >= 0.0);
    }

    #[test]
    fn test_duplicates_differ_only_in_dimensions() {
        let mut api = row(0, "a", Some(1.0));
        api.dimensions = Dimensions::from([("service".to_string(), "api".to_string())]);
        let mut db = row(0, "a", Some(1.0));
        db.dimensions = Dimensions::from([("service".to_string(), "db".to_string())]);

        let report = assess(vec![api.clone(), db, api]);
        assert!((report.duplicate_fraction - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_nulls_compare_equal_for_duplicates() {
        let report = assess(vec![row(0, "a", None), row(0, "a", None)]);
        assert!((report.duplicate_fraction - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_named_utc_timestamps_are_read() {
        let timestamps = TimestampMicrosecondArray::from(vec![
            now().timestamp_micros() + 1,
            now().timestamp_micros() - 1,
        ])
        .with_timezone("UTC");
        let schema = Arc::new(Schema::new(vec![Field::new(
            "timestamp",
            timestamps.data_type().clone(),
            false,
        )]));
        let batch = RecordBatch::try_new(schema, vec![Arc::new(timestamps)]).unwrap();

        let report = QualityScorer::new().evaluated_at(now()).assess(&batch).unwrap();
        assert!((report.future_fraction - 0.5).abs() < 1e-12);
    }
}
