//! In-memory table sink for tests and single-process deployments.

use arrow::array::{Array, TimestampMicrosecondArray, UInt32Array};
use arrow::compute::{cast, concat_batches, take_record_batch};
use arrow::datatypes::{DataType, TimeUnit};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use chrono::DateTime;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use crate::dataset::TIMESTAMP_TZ;
use crate::error::{Result, UnifyError};

use super::{validate_table_name, PartitionGranularity, TableInfo, TableSink, TableSpec};

/// Partition key for rows whose partition column is null.
const NULL_PARTITION: &str = "__null__";

#[derive(Debug)]
struct MemoryTable {
    spec: TableSpec,
    partitions: BTreeMap<String, Vec<RecordBatch>>,
    snapshots: u64,
}

impl MemoryTable {
    fn info(&self) -> TableInfo {
        TableInfo {
            name: self.spec.name.clone(),
            partition: self.spec.partition.clone(),
            snapshots: self.snapshots,
            row_count: self
                .partitions
                .values()
                .flatten()
                .map(RecordBatch::num_rows)
                .sum(),
            partitions: self.partitions.keys().cloned().collect(),
            file_count: self.partitions.values().map(Vec::len).sum(),
        }
    }
}

/// Keeps tables as partitioned lists of record batches.
///
/// Cloning the sink shares the underlying tables.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTableSink {
    tables: Arc<RwLock<HashMap<String, MemoryTable>>>,
}

impl InMemoryTableSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of all tables, sorted.
    pub async fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns every row of a table as one batch, ordered by partition key.
    pub async fn read(&self, name: &str) -> Result<RecordBatch> {
        let tables = self.tables.read().await;
        let table = tables
            .get(name)
            .ok_or_else(|| UnifyError::storage("read", format!("table '{name}' does not exist")))?;
        let batches: Vec<&RecordBatch> = table.partitions.values().flatten().collect();
        Ok(concat_batches(&table.spec.schema, batches)?)
    }
}

#[async_trait]
impl TableSink for InMemoryTableSink {
    async fn load_table(&self, name: &str) -> Result<Option<TableInfo>> {
        Ok(self.tables.read().await.get(name).map(MemoryTable::info))
    }

    #[instrument(skip(self, spec), fields(table = %spec.name))]
    async fn create_table(&self, spec: TableSpec) -> Result<TableInfo> {
        validate_table_name(&spec.name)?;
        if spec.schema.field_with_name(&spec.partition.column).is_err() {
            return Err(UnifyError::storage(
                "create_table",
                format!(
                    "partition column '{}' is not in the schema",
                    spec.partition.column
                ),
            ));
        }

        let mut tables = self.tables.write().await;
        if tables.contains_key(&spec.name) {
            return Err(UnifyError::storage(
                "create_table",
                format!("table '{}' already exists", spec.name),
            ));
        }

        let table = MemoryTable {
            spec,
            partitions: BTreeMap::new(),
            snapshots: 0,
        };
        let info = table.info();
        tables.insert(info.name.clone(), table);
        debug!(granularity = %info.partition.granularity, "Table created");
        Ok(info)
    }

    #[instrument(skip(self, batch), fields(table = %name, rows = batch.num_rows()))]
    async fn write(&self, name: &str, batch: RecordBatch) -> Result<TableInfo> {
        let mut tables = self.tables.write().await;
        let table = tables.get_mut(name).ok_or_else(|| {
            UnifyError::storage("write", format!("table '{name}' does not exist"))
        })?;

        if table.spec.schema.fields() != batch.schema().fields() {
            return Err(UnifyError::storage(
                "write",
                format!("batch schema does not match table '{name}'"),
            ));
        }
        if batch.num_rows() == 0 {
            return Ok(table.info());
        }

        let parts = split_by_partition(
            &batch,
            &table.spec.partition.column,
            table.spec.partition.granularity,
        )?;
        for (key, part) in parts {
            table.partitions.entry(key).or_default().push(part);
        }
        table.snapshots += 1;
        Ok(table.info())
    }

    #[instrument(skip(self), fields(table = %name))]
    async fn optimize(&self, name: &str) -> Result<TableInfo> {
        let mut tables = self.tables.write().await;
        let table = tables.get_mut(name).ok_or_else(|| {
            UnifyError::storage("optimize", format!("table '{name}' does not exist"))
        })?;

        let schema = Arc::clone(&table.spec.schema);
        for batches in table.partitions.values_mut() {
            if batches.len() > 1 {
                let merged = concat_batches(&schema, batches.iter())?;
                *batches = vec![merged];
            }
        }
        debug!("Table compacted");
        Ok(table.info())
    }
}

/// Splits a batch into one batch per partition key.
fn split_by_partition(
    batch: &RecordBatch,
    column: &str,
    granularity: PartitionGranularity,
) -> Result<Vec<(String, RecordBatch)>> {
    let array = batch.column_by_name(column).ok_or_else(|| {
        UnifyError::storage("write", format!("partition column '{column}' is missing"))
    })?;
    let utc = DataType::Timestamp(TimeUnit::Microsecond, Some(TIMESTAMP_TZ.into()));
    let timestamps = cast(array.as_ref(), &utc)?;
    let timestamps = timestamps
        .as_any()
        .downcast_ref::<TimestampMicrosecondArray>()
        .ok_or_else(|| {
            UnifyError::storage("write", format!("partition column '{column}' is not a timestamp"))
        })?;

    let mut indices: BTreeMap<String, Vec<u32>> = BTreeMap::new();
    for (row, micros) in timestamps.iter().enumerate() {
        let key = match micros {
            Some(micros) => {
                let instant = DateTime::from_timestamp_micros(micros).ok_or_else(|| {
                    UnifyError::storage("write", format!("timestamp {micros} is out of range"))
                })?;
                granularity.partition_key(instant)
            }
            None => NULL_PARTITION.to_string(),
        };
        let row = u32::try_from(row).map_err(|_| {
            UnifyError::storage("write", "batch has too many rows to partition")
        })?;
        indices.entry(key).or_default().push(row);
    }

    indices
        .into_iter()
        .map(|(key, rows)| -> Result<(String, RecordBatch)> {
            let part = take_record_batch(batch, &UInt32Array::from(rows))?;
            Ok((key, part))
        })
        .collect()
}
