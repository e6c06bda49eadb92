//! The aggregated output dataset and its Arrow representation.

use arrow::array::{
    Array, ArrayRef, Float64Array, Int64Array, MapBuilder, StringArray, StringBuilder,
    TimestampMicrosecondArray,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::Result;
use crate::rows::Dimensions;

/// Column names of the released dataset.
pub mod columns {
    pub const TIMESTAMP: &str = "timestamp";
    pub const METRIC_NAME: &str = "metric_name";
    pub const VALUE: &str = "value";
    pub const SOURCE: &str = "source";
    pub const DIMENSIONS: &str = "dimensions";
    pub const VALUE_MIN: &str = "value_min";
    pub const VALUE_MAX: &str = "value_max";
    pub const VALUE_COUNT: &str = "value_count";

    /// Columns that must be present in every released dataset.
    pub const REQUIRED: [&str; 5] = [TIMESTAMP, METRIC_NAME, VALUE, SOURCE, DIMENSIONS];
}

/// Timezone attached to the `timestamp` column.
pub const TIMESTAMP_TZ: &str = "UTC";

/// One time bucket of one `(metric_name, source, dimensions)` series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedRow {
    /// Bucket start.
    pub timestamp: DateTime<Utc>,
    pub metric_name: String,
    pub source: String,
    pub dimensions: Dimensions,
    /// Mean of the contributing values; absent when none contributed.
    pub value: Option<f64>,
    pub value_min: Option<f64>,
    pub value_max: Option<f64>,
    /// Number of non-null values that contributed.
    pub value_count: i64,
}

pub(crate) fn dimensions_builder() -> MapBuilder<StringBuilder, StringBuilder> {
    MapBuilder::new(None, StringBuilder::new(), StringBuilder::new())
}

/// Returns the Arrow schema of the released dataset.
pub fn output_schema() -> SchemaRef {
    let dimensions_type = dimensions_builder().finish().data_type().clone();
    Arc::new(Schema::new(vec![
        Field::new(
            columns::TIMESTAMP,
            DataType::Timestamp(TimeUnit::Microsecond, Some(TIMESTAMP_TZ.into())),
            false,
        ),
        Field::new(columns::METRIC_NAME, DataType::Utf8, false),
        Field::new(columns::VALUE, DataType::Float64, true),
        Field::new(columns::SOURCE, DataType::Utf8, false),
        Field::new(columns::DIMENSIONS, dimensions_type, false),
        Field::new(columns::VALUE_MIN, DataType::Float64, true),
        Field::new(columns::VALUE_MAX, DataType::Float64, true),
        Field::new(columns::VALUE_COUNT, DataType::Int64, false),
    ]))
}

/// The aggregated rows together with their Arrow record batch.
#[derive(Debug, Clone)]
pub struct AggregatedDataset {
    rows: Vec<AggregatedRow>,
    batch: RecordBatch,
}

impl AggregatedDataset {
    /// Builds a dataset from aggregated rows, materializing the record batch.
    pub fn from_rows(rows: Vec<AggregatedRow>) -> Result<Self> {
        let batch = to_record_batch(&rows)?;
        Ok(Self { rows, batch })
    }

    /// Creates an empty dataset that still carries the full schema.
    pub fn empty() -> Self {
        Self {
            rows: Vec::new(),
            batch: RecordBatch::new_empty(output_schema()),
        }
    }

    /// Returns the typed rows.
    pub fn rows(&self) -> &[AggregatedRow] {
        &self.rows
    }

    /// Returns the Arrow record batch.
    pub fn record_batch(&self) -> &RecordBatch {
        &self.batch
    }

    /// Returns the schema of the record batch.
    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Consumes the dataset, returning the record batch.
    pub fn into_record_batch(self) -> RecordBatch {
        self.batch
    }
}

fn to_record_batch(rows: &[AggregatedRow]) -> Result<RecordBatch> {
    let mut dimensions = dimensions_builder();
    for row in rows {
        for (key, value) in &row.dimensions {
            dimensions.keys().append_value(key);
            dimensions.values().append_value(value);
        }
        dimensions.append(true)?;
    }

    let timestamps = TimestampMicrosecondArray::from(
        rows.iter()
            .map(|r| r.timestamp.timestamp_micros())
            .collect::<Vec<_>>(),
    )
    .with_timezone(TIMESTAMP_TZ);

    let columns: Vec<ArrayRef> = vec![
        Arc::new(timestamps),
        Arc::new(StringArray::from_iter_values(
            rows.iter().map(|r| r.metric_name.as_str()),
        )),
        Arc::new(Float64Array::from_iter(rows.iter().map(|r| r.value))),
        Arc::new(StringArray::from_iter_values(
            rows.iter().map(|r| r.source.as_str()),
        )),
        Arc::new(dimensions.finish()),
        Arc::new(Float64Array::from_iter(rows.iter().map(|r| r.value_min))),
        Arc::new(Float64Array::from_iter(rows.iter().map(|r| r.value_max))),
        Arc::new(Int64Array::from_iter_values(
            rows.iter().map(|r| r.value_count),
        )),
    ];

    Ok(RecordBatch::try_new(output_schema(), columns)?)
}
