//! Schema validation for released datasets.
//!
//! A dataset may only leave the engine if it carries the required columns
//! with the expected Arrow types. A violation means some collector produced
//! rows of the wrong shape.

use arrow::datatypes::{DataType, Schema};
use arrow::record_batch::RecordBatch;
use tracing::debug;

use crate::dataset::columns;
use crate::error::{Result, UnifyError};

/// Validates the schema of a record batch.
pub fn validate_batch(batch: &RecordBatch) -> Result<()> {
    validate_schema(batch.schema().as_ref())
}

/// Checks required columns and their types.
///
/// - `timestamp` must be an Arrow timestamp
/// - `value` must be numeric
/// - `metric_name` and `source` must be strings
/// - `dimensions` must be a map
pub fn validate_schema(schema: &Schema) -> Result<()> {
    let missing: Vec<&str> = columns::REQUIRED
        .iter()
        .copied()
        .filter(|name| schema.field_with_name(name).is_err())
        .collect();
    if !missing.is_empty() {
        return Err(UnifyError::schema(
            missing.join(", "),
            format!("Missing required columns: {missing:?}"),
        ));
    }

    expect_type(schema, columns::TIMESTAMP, "timestamp", |dt| {
        matches!(dt, DataType::Timestamp(_, _))
    })?;
    expect_type(schema, columns::VALUE, "numeric", DataType::is_numeric)?;
    expect_type(schema, columns::METRIC_NAME, "string", is_string)?;
    expect_type(schema, columns::SOURCE, "string", is_string)?;
    expect_type(schema, columns::DIMENSIONS, "map", |dt| {
        matches!(dt, DataType::Map(_, _))
    })?;

    debug!(fields = schema.fields().len(), "Schema validated");
    Ok(())
}

fn is_string(data_type: &DataType) -> bool {
    matches!(
        data_type,
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View
    )
}

fn expect_type(
    schema: &Schema,
    column: &str,
    expected: &str,
    accepts: impl Fn(&DataType) -> bool,
) -> Result<()> {
    let field = schema
        .field_with_name(column)
        .map_err(|e| UnifyError::schema(column, e.to_string()))?;
    if accepts(field.data_type()) {
        Ok(())
    } else {
        Err(UnifyError::schema(
            column,
            format!(
                "{column} column must be {expected} type, found {}",
                field.data_type()
            ),
        ))
    }
}
