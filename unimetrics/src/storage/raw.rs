//! Landing tables for collector output, one per source.
//!
//! Raw tables keep every collected row before deduplication, outlier
//! suppression or aggregation, in a narrow four-column layout:
//!
//! | column        | type                        |
//! |---------------|-----------------------------|
//! | `timestamp`   | timestamp (µs, UTC)         |
//! | `metric_name` | utf8                        |
//! | `value`       | float64, nullable           |
//! | `metadata`    | map<utf8, utf8>             |

use arrow::array::{Array, ArrayRef, Float64Array, StringArray, TimestampMicrosecondArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, instrument, warn};

use crate::config::StorageConfig;
use crate::dataset::{columns, dimensions_builder, TIMESTAMP_TZ};
use crate::error::{Result, UnifyError};
use crate::log_data_op;
use crate::logging::LogConfig;
use crate::rows::{CollectorRow, SourceRow, UnifiedRow};

use super::store::{ensure_table, StorageMetrics, WriteMetrics};
use super::{validate_table_name, PartitionGranularity, TableInfo, TableSink};

/// Column holding the collector's attributes in raw tables.
pub const METADATA: &str = "metadata";

/// Returns the Arrow schema of raw tables.
pub fn raw_schema() -> SchemaRef {
    let metadata_type = dimensions_builder().finish().data_type().clone();
    Arc::new(Schema::new(vec![
        Field::new(
            columns::TIMESTAMP,
            DataType::Timestamp(TimeUnit::Microsecond, Some(TIMESTAMP_TZ.into())),
            false,
        ),
        Field::new(columns::METRIC_NAME, DataType::Utf8, false),
        Field::new(columns::VALUE, DataType::Float64, true),
        Field::new(METADATA, metadata_type, false),
    ]))
}

/// Converts collector rows into a raw-table batch.
///
/// Field names are mapped and timestamps coerced the same way the engine
/// does, so a row that cannot be stored raw cannot be unified either.
pub fn raw_batch(source: &str, rows: &[CollectorRow]) -> Result<RecordBatch> {
    let rows = rows
        .iter()
        .map(|row| UnifiedRow::from_collector_row(source, row.clone()))
        .collect::<Result<Vec<_>>>()?;

    let mut metadata = dimensions_builder();
    for row in &rows {
        for (key, value) in &row.dimensions {
            metadata.keys().append_value(key);
            metadata.values().append_value(value);
        }
        metadata.append(true)?;
    }

    let timestamps = TimestampMicrosecondArray::from_iter_values(
        rows.iter().map(|r| r.timestamp.timestamp_micros()),
    )
    .with_timezone(TIMESTAMP_TZ);

    let columns: Vec<ArrayRef> = vec![
        Arc::new(timestamps),
        Arc::new(StringArray::from_iter_values(
            rows.iter().map(|r| r.metric_name.as_str()),
        )),
        Arc::new(Float64Array::from_iter(rows.iter().map(|r| r.value))),
        Arc::new(metadata.finish()),
    ];
    Ok(RecordBatch::try_new(raw_schema(), columns)?)
}

/// Writes each source's collected rows to `{raw_namespace}.metrics_{source}`.
///
/// Raw tables are always partitioned by day.
#[derive(Debug)]
pub struct RawStore {
    sink: Arc<dyn TableSink>,
    config: StorageConfig,
    metrics: WriteMetrics,
    log_config: LogConfig,
}

impl RawStore {
    pub fn new(sink: Arc<dyn TableSink>, config: StorageConfig) -> Self {
        Self {
            sink,
            config,
            metrics: WriteMetrics::default(),
            log_config: LogConfig::default(),
        }
    }

    pub fn with_log_config(mut self, log_config: LogConfig) -> Self {
        self.log_config = log_config;
        self
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Stores the rows collected from `source`.
    ///
    /// Returns `Ok(false)` without writing when `rows` is empty.
    ///
    /// # Errors
    /// An empty source name is an input error and a source name that does
    /// not form a valid table name is a table name error. Timestamp coercion
    /// and sink failures are returned as they occur and counted as write
    /// errors.
    #[instrument(skip(self, rows), fields(source = %source, rows = rows.len()))]
    pub async fn store(&self, source: &str, rows: &[CollectorRow]) -> Result<bool> {
        if rows.is_empty() {
            warn!("No raw rows to store");
            return Ok(false);
        }
        if source.trim().is_empty() {
            return Err(UnifyError::input("Invalid source identifier"));
        }

        let name = self.config.raw_table_name(source);
        validate_table_name(&name)?;

        let start = Instant::now();
        match self.write(&name, source, rows).await {
            Ok(info) => {
                self.metrics.record_success(start, &info, rows.len());
                log_data_op!(
                    self.log_config,
                    table = %self.log_config.truncate(&name),
                    rows = rows.len(),
                    snapshots = info.snapshots,
                    "Raw rows stored"
                );
                Ok(true)
            }
            Err(e) => {
                self.metrics.record_failure(start);
                error!(table = %name, error = %e, "Failed to store raw rows");
                Err(e)
            }
        }
    }

    async fn write(&self, name: &str, source: &str, rows: &[CollectorRow]) -> Result<TableInfo> {
        let batch = raw_batch(source, rows)?;
        ensure_table(
            self.sink.as_ref(),
            name,
            raw_schema(),
            PartitionGranularity::Day,
        )
        .await?;
        self.sink.write(name, batch).await
    }

    /// Returns a snapshot of the write counters.
    pub fn metrics(&self) -> StorageMetrics {
        self.metrics.snapshot()
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    /// Writes one row to the raw table of the `health_check` source.
    pub async fn health_check(&self) -> bool {
        let row = SourceRow::new(Utc::now(), "test_metric", Some(1.0)).with_attribute("test", "value");
        match self.store("health_check", &[CollectorRow::from(row)]).await {
            Ok(stored) => stored,
            Err(e) => {
                error!(error = %e, "Raw storage health check failed");
                false
            }
        }
    }
}

impl fmt::Display for RawStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawStore(")?;
        self.metrics.fmt_summary(f)?;
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::rows::{Dimensions, MongoDbRow};
    use crate::storage::InMemoryTableSink;
    use arrow::array::MapArray;

    fn mongodb_rows() -> Vec<CollectorRow> {
        ["2024-01-01T00:00:00Z", "2024-01-01T01:00:00Z", "2024-01-02T00:00:00Z"]
            .into_iter()
            .zip([("response_time", 100.0), ("error_count", 5.0), ("request_count", 1000.0)])
            .map(|(ts, (metric, value))| {
                CollectorRow::MongoDb(MongoDbRow {
                    timestamp: ts.into(),
                    metric_id: metric.to_string(),
                    value: Some(value),
                    metadata: Some(Dimensions::from([("service".to_string(), "api".to_string())])),
                })
            })
            .collect()
    }

    fn store(sink: &InMemoryTableSink) -> RawStore {
        RawStore::new(Arc::new(sink.clone()), StorageConfig::default())
    }

    #[test]
    fn test_raw_batch_layout() {
        let batch = raw_batch("mongodb", &mongodb_rows()).unwrap();
        assert_eq!(batch.schema(), raw_schema());
        assert_eq!(batch.num_rows(), 3);

        let names = batch
            .column_by_name(columns::METRIC_NAME)
            .unwrap()
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(names.value(0), "response_time");

        let metadata = batch
            .column_by_name(METADATA)
            .unwrap()
            .as_any()
            .downcast_ref::<MapArray>()
            .unwrap();
        assert_eq!(metadata.null_count(), 0);
        assert_eq!(metadata.value_length(0), 1);
    }

    #[tokio::test]
    async fn test_store_writes_day_partitioned_source_table() {
        let sink = InMemoryTableSink::new();
        let store = store(&sink);

        assert!(store.store("mongodb", &mongodb_rows()).await.unwrap());

        let info = sink.load_table("raw.metrics_mongodb").await.unwrap().unwrap();
        assert_eq!(info.partition.granularity, PartitionGranularity::Day);
        assert_eq!(info.partitions, vec!["2024-01-01", "2024-01-02"]);
        assert_eq!(info.row_count, 3);

        let metrics = store.metrics();
        assert_eq!(metrics.records_written, 3);
        assert_eq!(metrics.table_snapshots.get("raw.metrics_mongodb"), Some(&1));
    }

    #[tokio::test]
    async fn test_duplicates_are_kept_raw() {
        let sink = InMemoryTableSink::new();
        let mut rows = mongodb_rows();
        rows.extend(mongodb_rows());

        store(&sink).store("mongodb", &rows).await.unwrap();
        assert_eq!(sink.read("raw.metrics_mongodb").await.unwrap().num_rows(), 6);
    }

    #[tokio::test]
    async fn test_empty_rows_are_skipped() {
        let sink = InMemoryTableSink::new();
        assert!(!store(&sink).store("mongodb", &[]).await.unwrap());
        assert!(sink.table_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_source_names() {
        let sink = InMemoryTableSink::new();
        let store = store(&sink);

        let err = store.store(" ", &mongodb_rows()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Input);

        let err = store.store("new relic", &mongodb_rows()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TableName);
        assert!(sink.table_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_bad_timestamp_counts_as_write_error() {
        let sink = InMemoryTableSink::new();
        let store = store(&sink);
        let rows = vec![CollectorRow::from(SourceRow::new("yesterday-ish", "cpu", Some(1.0)))];

        let err = store.store("postgres", &rows).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTimestamp);
        assert_eq!(store.metrics().write_errors, 1);
        assert_eq!(store.to_string(), "RawStore(records=0, errors=1, snapshots=0)");

        store.reset_metrics();
        assert_eq!(store.metrics().write_errors, 0);
    }

    #[tokio::test]
    async fn test_health_check() {
        let sink = InMemoryTableSink::new();
        let store = RawStore::new(
            Arc::new(sink.clone()),
            StorageConfig::default().with_raw_namespace("landing"),
        );
        assert!(store.health_check().await);
        assert_eq!(sink.table_names().await, vec!["landing.metrics_health_check"]);
    }
}
