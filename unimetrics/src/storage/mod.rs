//! Persistence of unified datasets into time-partitioned tables.
//!
//! [`TableSink`] abstracts the table format and [`InMemoryTableSink`] is the
//! bundled implementation. The pipeline talks to two stores on top of a sink:
//! [`RawStore`] lands each source's collected rows, [`ProcessedStore`] keeps
//! the unified datasets.

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};

use crate::dataset::columns;
use crate::error::{Result, UnifyError};

pub mod in_memory;
pub mod raw;
pub mod store;

pub use in_memory::InMemoryTableSink;
pub use raw::RawStore;
pub use store::{ProcessedStore, StorageMetrics};

/// Longest accepted table name.
const MAX_TABLE_NAME_LENGTH: usize = 128;

static TABLE_NAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    // Hard-coded pattern, known to compile
    #[allow(clippy::expect_used)]
    Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*(\.[a-zA-Z_][a-zA-Z0-9_]*)*$")
        .expect("table name pattern is valid")
});

/// Checks that `name` is a plain or dot-qualified identifier.
///
/// ```rust
/// use unimetrics::storage::validate_table_name;
///
/// assert!(validate_table_name("processed.metrics_v1").is_ok());
/// assert!(validate_table_name("processed.metrics; DROP").is_err());
/// ```
pub fn validate_table_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(UnifyError::TableName(
            "table name cannot be empty".to_string(),
        ));
    }
    if name.len() > MAX_TABLE_NAME_LENGTH {
        return Err(UnifyError::TableName(format!(
            "table name too long (max {MAX_TABLE_NAME_LENGTH} characters)"
        )));
    }
    if !TABLE_NAME_REGEX.is_match(name) {
        return Err(UnifyError::TableName(format!(
            "'{name}' must start with a letter or underscore and contain only letters, numbers, underscores and dots"
        )));
    }
    Ok(())
}

/// Width of a time partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionGranularity {
    Hour,
    #[default]
    Day,
    Month,
    Year,
}

impl PartitionGranularity {
    /// Partition key of an instant, e.g. `2023-01-01` for day partitions.
    pub fn partition_key(&self, timestamp: DateTime<Utc>) -> String {
        let format = match self {
            Self::Hour => "%Y-%m-%d-%H",
            Self::Day => "%Y-%m-%d",
            Self::Month => "%Y-%m",
            Self::Year => "%Y",
        };
        timestamp.format(format).to_string()
    }
}

impl fmt::Display for PartitionGranularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hour => write!(f, "hour"),
            Self::Day => write!(f, "day"),
            Self::Month => write!(f, "month"),
            Self::Year => write!(f, "year"),
        }
    }
}

/// Time partitioning of a table by one timestamp column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimePartition {
    pub column: String,
    pub granularity: PartitionGranularity,
}

impl TimePartition {
    pub fn new(column: impl Into<String>, granularity: PartitionGranularity) -> Self {
        Self {
            column: column.into(),
            granularity,
        }
    }
}

impl Default for TimePartition {
    fn default() -> Self {
        Self::new(columns::TIMESTAMP, PartitionGranularity::Day)
    }
}

/// What a table should look like when it is created.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSpec {
    pub name: String,
    pub schema: SchemaRef,
    pub partition: TimePartition,
}

impl TableSpec {
    /// Creates a spec partitioned by day on `timestamp`.
    pub fn new(name: impl Into<String>, schema: SchemaRef) -> Self {
        Self {
            name: name.into(),
            schema,
            partition: TimePartition::default(),
        }
    }

    pub fn with_partition(mut self, partition: TimePartition) -> Self {
        self.partition = partition;
        self
    }
}

/// Current state of a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    pub name: String,
    pub partition: TimePartition,
    /// Number of successful non-empty writes.
    pub snapshots: u64,
    pub row_count: usize,
    /// Partition keys in ascending order.
    pub partitions: Vec<String>,
    /// Number of stored batches across all partitions.
    pub file_count: usize,
}

/// A destination for record batches, organized as named tables.
#[async_trait]
pub trait TableSink: Debug + Send + Sync {
    /// Returns the table if it exists.
    async fn load_table(&self, name: &str) -> Result<Option<TableInfo>>;

    /// Creates a table.
    ///
    /// # Errors
    /// Fails if the table already exists or the name is invalid.
    async fn create_table(&self, spec: TableSpec) -> Result<TableInfo>;

    /// Appends a batch, splitting it across time partitions.
    async fn write(&self, name: &str, batch: RecordBatch) -> Result<TableInfo>;

    /// Compacts each partition of the table.
    async fn optimize(&self, name: &str) -> Result<TableInfo>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use chrono::TimeZone;

    #[test]
    fn test_table_name_validation() {
        assert!(validate_table_name("metrics").is_ok());
        assert!(validate_table_name("_private.metrics_v2").is_ok());

        for bad in ["", "  ", "1metrics", "a..b", "a.b.", "metrics-v1", "a b", "x'; --"] {
            let err = validate_table_name(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::TableName, "{bad:?}");
        }
        assert!(validate_table_name(&"a".repeat(129)).is_err());
    }

    #[test]
    fn test_partition_keys() {
        let ts = Utc.with_ymd_and_hms(2023, 3, 7, 5, 30, 0).unwrap();
        assert_eq!(PartitionGranularity::Hour.partition_key(ts), "2023-03-07-05");
        assert_eq!(PartitionGranularity::Day.partition_key(ts), "2023-03-07");
        assert_eq!(PartitionGranularity::Month.partition_key(ts), "2023-03");
        assert_eq!(PartitionGranularity::Year.partition_key(ts), "2023");
    }

    #[test]
    fn test_granularity_serde() {
        let parsed: PartitionGranularity = serde_json::from_str("\"month\"").unwrap();
        assert_eq!(parsed, PartitionGranularity::Month);
        assert_eq!(PartitionGranularity::Hour.to_string(), "hour");
    }
}
