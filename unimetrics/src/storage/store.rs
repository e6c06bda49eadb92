//! The processed-metrics store and the write counters shared by all stores.

use arrow::datatypes::SchemaRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{error, info, instrument, warn};

use crate::config::StorageConfig;
use crate::dataset::{columns, AggregatedDataset, AggregatedRow};
use crate::error::Result;
use crate::logging::LogConfig;
use crate::log_data_op;
use crate::rows::Dimensions;

use super::{
    validate_table_name, PartitionGranularity, TableInfo, TableSink, TableSpec, TimePartition,
};

/// Counters over all writes made by one store.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StorageMetrics {
    pub last_write_time: Option<DateTime<Utc>>,
    pub records_written: u64,
    pub write_errors: u64,
    /// Running mean of write duration in seconds.
    pub average_write_time: f64,
    pub total_writes: u64,
    /// Latest snapshot count per table.
    pub table_snapshots: BTreeMap<String, u64>,
}

impl StorageMetrics {
    /// Snapshots across every table this store has written to.
    pub fn total_snapshots(&self) -> u64 {
        self.table_snapshots.values().sum()
    }
}

/// Lock-protected [`StorageMetrics`] with the update rules every store uses.
#[derive(Debug, Default)]
pub(crate) struct WriteMetrics {
    inner: Mutex<StorageMetrics>,
}

impl WriteMetrics {
    pub(crate) fn record_success(&self, start: Instant, info: &TableInfo, rows: usize) {
        let mut metrics = self.record_write(start);
        metrics.records_written += rows as u64;
        metrics
            .table_snapshots
            .insert(info.name.clone(), info.snapshots);
    }

    pub(crate) fn record_failure(&self, start: Instant) {
        self.record_write(start).write_errors += 1;
    }

    /// Counts one write and folds its duration into the running mean.
    fn record_write(&self, start: Instant) -> MutexGuard<'_, StorageMetrics> {
        let elapsed = start.elapsed().as_secs_f64();
        let mut metrics = self.lock();
        metrics.last_write_time = Some(Utc::now());
        metrics.total_writes += 1;
        let n = metrics.total_writes as f64;
        metrics.average_write_time = (metrics.average_write_time * (n - 1.0) + elapsed) / n;
        metrics
    }

    pub(crate) fn snapshot(&self) -> StorageMetrics {
        self.lock().clone()
    }

    pub(crate) fn reset(&self) {
        *self.lock() = StorageMetrics::default();
    }

    /// Writes `records=N, errors=M, snapshots=K` for store `Display` impls.
    pub(crate) fn fmt_summary(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let metrics = self.lock();
        write!(
            f,
            "records={}, errors={}, snapshots={}",
            metrics.records_written,
            metrics.write_errors,
            metrics.total_snapshots()
        )
    }

    fn lock(&self) -> MutexGuard<'_, StorageMetrics> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Creates the table partitioned on `timestamp` unless it already exists.
pub(crate) async fn ensure_table(
    sink: &dyn TableSink,
    name: &str,
    schema: SchemaRef,
    granularity: PartitionGranularity,
) -> Result<()> {
    if sink.load_table(name).await?.is_none() {
        let spec = TableSpec::new(name, schema)
            .with_partition(TimePartition::new(columns::TIMESTAMP, granularity));
        sink.create_table(spec).await?;
        info!(table = %name, granularity = %granularity, "Created table");
    }
    Ok(())
}

/// Writes unified datasets into partitioned tables.
#[derive(Debug)]
pub struct ProcessedStore {
    sink: Arc<dyn TableSink>,
    config: StorageConfig,
    metrics: WriteMetrics,
    log_config: LogConfig,
}

impl ProcessedStore {
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

    /// Writes `dataset` to `table_name`, or to the configured default table.
    ///
    /// Returns `Ok(false)` without writing when the dataset is empty. The
    /// table is created with the configured partition granularity if it does
    /// not exist yet, and compacted after writes larger than
    /// `optimize_threshold_rows`.
    #[instrument(skip(self, dataset), fields(rows = dataset.len()))]
    pub async fn store(&self, dataset: &AggregatedDataset, table_name: Option<&str>) -> Result<bool> {
        if dataset.is_empty() {
            warn!("No data to store");
            return Ok(false);
        }

        let name = table_name
            .map(str::to_string)
            .unwrap_or_else(|| self.config.default_table_name());
        validate_table_name(&name)?;

        let start = Instant::now();
        match self.write(&name, dataset).await {
            Ok(info) => {
                self.metrics.record_success(start, &info, dataset.len());
                log_data_op!(
                    self.log_config,
                    table = %self.log_config.truncate(&name),
                    rows = dataset.len(),
                    snapshots = info.snapshots,
                    "Dataset stored"
                );
                Ok(true)
            }
            Err(e) => {
                self.metrics.record_failure(start);
                error!(table = %name, error = %e, "Failed to store dataset");
                Err(e)
            }
        }
    }

    async fn write(&self, name: &str, dataset: &AggregatedDataset) -> Result<TableInfo> {
        ensure_table(
            self.sink.as_ref(),
            name,
            dataset.schema(),
            self.config.partition_granularity,
        )
        .await?;

        let info = self.sink.write(name, dataset.record_batch().clone()).await?;
        if dataset.len() > self.config.optimize_threshold_rows {
            return self.sink.optimize(name).await;
        }
        Ok(info)
    }

    /// Returns a snapshot of the write counters.
    pub fn metrics(&self) -> StorageMetrics {
        self.metrics.snapshot()
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    /// Writes a one-row dataset to `{namespace}.health_check`.
    pub async fn health_check(&self) -> bool {
        let row = AggregatedRow {
            timestamp: Utc::now(),
            metric_name: "health_check".to_string(),
            source: "health_check".to_string(),
            dimensions: Dimensions::new(),
            value: Some(1.0),
            value_min: Some(1.0),
            value_max: Some(1.0),
            value_count: 1,
        };
        let table = format!("{}.health_check", self.config.processed_namespace);

        let result = match AggregatedDataset::from_rows(vec![row]) {
            Ok(dataset) => self.store(&dataset, Some(&table)).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(stored) => stored,
            Err(e) => {
                error!(error = %e, "Storage health check failed");
                false
            }
        }
    }
}

impl fmt::Display for ProcessedStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProcessedStore(")?;
        self.metrics.fmt_summary(f)?;
        write!(f, ")")
    }
}
