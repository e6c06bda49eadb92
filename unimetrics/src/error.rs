//! Error types for the unimetrics pipeline.
//!
//! All fallible operations in the crate return [`UnifyError`] through the
//! [`Result`] alias. Empty input per source is not an error; see
//! [`crate::engine::UnifyOutcome`].

use thiserror::Error;

/// The main error type for the unimetrics library.
#[derive(Error, Debug)]
pub enum UnifyError {
    /// The caller supplied no sources at all, or an unusable source name.
    #[error("Input error: {0}")]
    Input(String),

    /// The unified dataset violates the released schema.
    #[error("Schema error on column '{column}': {message}")]
    Schema {
        /// Column that failed the check
        column: String,
        /// Detailed error message
        message: String,
    },

    /// A collector handed over a timestamp that cannot be read as an instant.
    #[error("Invalid timestamp '{value}' from source '{source_name}': {message}")]
    InvalidTimestamp {
        /// Source whose batch contained the timestamp
        source_name: String,
        /// The offending raw value
        value: String,
        /// Parser message
        message: String,
    },

    /// Error related to configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Error from Arrow operations.
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Error from I/O operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Error from serialization/deserialization operations.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A collector failed while fetching its batch.
    #[error("Collector '{collector}' failed: {message}")]
    Collector {
        /// Name of the collector
        collector: String,
        /// Detailed error message
        message: String,
    },

    /// A table sink operation failed.
    #[error("Storage error during {operation}: {message}")]
    Storage {
        /// Sink operation (e.g. "create_table", "write")
        operation: String,
        /// Detailed error message
        message: String,
    },

    /// A table name is not a valid identifier.
    #[error("Invalid table name: {0}")]
    TableName(String),

    /// Generic internal error for unexpected conditions.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A type alias for `Result<T, UnifyError>`.
pub type Result<T> = std::result::Result<T, UnifyError>;

/// Stable classification of [`UnifyError`] variants, used in logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Input,
    Schema,
    InvalidTimestamp,
    Configuration,
    Arrow,
    Io,
    Serialization,
    Collector,
    Storage,
    TableName,
    Internal,
}

impl ErrorKind {
    /// Returns the snake_case name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Schema => "schema",
            Self::InvalidTimestamp => "invalid_timestamp",
            Self::Configuration => "configuration",
            Self::Arrow => "arrow",
            Self::Io => "io",
            Self::Serialization => "serialization",
            Self::Collector => "collector",
            Self::Storage => "storage",
            Self::TableName => "table_name",
            Self::Internal => "internal",
        }
    }
}

impl UnifyError {
    /// Creates a new input error.
    pub fn input(message: impl Into<String>) -> Self {
        Self::Input(message.into())
    }

    /// Creates a new schema error for the given column.
    pub fn schema(column: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Schema {
            column: column.into(),
            message: message.into(),
        }
    }

    /// Creates a new collector error.
    pub fn collector(collector: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Collector {
            collector: collector.into(),
            message: message.into(),
        }
    }

    /// Creates a new storage error.
    pub fn storage(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Storage {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Returns the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Input(_) => ErrorKind::Input,
            Self::Schema { .. } => ErrorKind::Schema,
            Self::InvalidTimestamp { .. } => ErrorKind::InvalidTimestamp,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Arrow(_) => ErrorKind::Arrow,
            Self::Io(_) => ErrorKind::Io,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::Collector { .. } => ErrorKind::Collector,
            Self::Storage { .. } => ErrorKind::Storage,
            Self::TableName(_) => ErrorKind::TableName,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<serde_json::Error> for UnifyError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Adds context to an error.
    fn context(self, msg: &str) -> Result<T>;

    /// Adds context with a lazy message.
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: Into<UnifyError>,
{
    fn context(self, msg: &str) -> Result<T> {
        self.with_context(|| msg.to_string())
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let msg = f();
            match e.into() {
                UnifyError::Internal(inner) => UnifyError::Internal(format!("{msg}: {inner}")),
                UnifyError::Configuration(inner) => {
                    UnifyError::Configuration(format!("{msg}: {inner}"))
                }
                other => UnifyError::Internal(format!("{msg}: {other}")),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_error() {
        let err = UnifyError::input("No data to process");
        assert_eq!(err.to_string(), "Input error: No data to process");
        assert_eq!(err.kind(), ErrorKind::Input);
    }

    #[test]
    fn test_schema_error() {
        let err = UnifyError::schema("value", "must be numeric");
        assert_eq!(
            err.to_string(),
            "Schema error on column 'value': must be numeric"
        );
        assert_eq!(err.kind().as_str(), "schema");
    }

    #[test]
    fn test_invalid_timestamp_error() {
        let err = UnifyError::InvalidTimestamp {
            source_name: "mongodb".to_string(),
            value: "yesterday".to_string(),
            message: "unrecognized format".to_string(),
        };
        assert!(err.to_string().contains("'yesterday'"));
        assert!(err.to_string().contains("'mongodb'"));
    }

    #[test]
    fn test_serde_json_conversion() {
        let err: UnifyError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert_eq!(err.kind(), ErrorKind::Serialization);
    }

    #[test]
    fn test_error_context() {
        fn failing_operation() -> Result<()> {
            Err(UnifyError::Internal("Something went wrong".to_string()))
        }

        let err = failing_operation()
            .context("While loading configuration")
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Internal error: While loading configuration: Something went wrong"
        );
    }
}
