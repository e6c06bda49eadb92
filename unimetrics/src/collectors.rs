//! Collectors hand the engine one batch of rows per source.
//!
//! Connecting to a backend is the implementor's business; the pipeline only
//! needs a name and a batch of [`CollectorRow`]s.

use async_trait::async_trait;
use std::fmt::Debug;
use std::path::Path;
use tracing::instrument;

use crate::error::{ErrorContext, Result};
use crate::rows::CollectorRow;

/// A source of metric rows.
///
/// # Examples
///
/// ```rust,ignore
/// use unimetrics::collectors::Collector;
///
/// #[derive(Debug)]
/// struct PostgresStats { pool: PgPool }
///
/// #[async_trait]
/// impl Collector for PostgresStats {
///     fn name(&self) -> &str { "postgres" }
///
///     async fn collect(&self) -> Result<Vec<CollectorRow>> {
///         // query pg_stat_* and map to PostgresRow
///     }
/// }
/// ```
#[async_trait]
pub trait Collector: Debug + Send + Sync {
    /// Source name stamped on every row this collector produces.
    fn name(&self) -> &str;

    /// Fetches the current batch.
    async fn collect(&self) -> Result<Vec<CollectorRow>>;

    /// Whether the backend is reachable.
    async fn health_check(&self) -> bool {
        true
    }
}

/// Serves a fixed batch of rows.
#[derive(Debug, Clone)]
pub struct MemoryCollector {
    name: String,
    rows: Vec<CollectorRow>,
}

impl MemoryCollector {
    pub fn new(name: impl Into<String>, rows: Vec<CollectorRow>) -> Self {
        Self {
            name: name.into(),
            rows,
        }
    }

    /// Parses a JSON array of rows tagged by collector shape.
    ///
    /// ```rust
    /// use unimetrics::collectors::MemoryCollector;
    ///
    /// let collector = MemoryCollector::from_json(
    ///     "mongodb",
    ///     r#"[{"collector": "mongodb", "timestamp": "2023-01-01T00:10:00Z",
    ///         "metric_id": "response_time_ms", "value": 100.0}]"#,
    /// )
    /// .unwrap();
    /// assert_eq!(collector.rows().len(), 1);
    /// ```
    pub fn from_json(name: impl Into<String>, json: &str) -> Result<Self> {
        let rows: Vec<CollectorRow> = serde_json::from_str(json)?;
        Ok(Self::new(name, rows))
    }

    /// Reads a JSON array of rows from a file.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn from_path(name: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = tokio::fs::read_to_string(path).await?;
        Self::from_json(name, &contents)
            .with_context(|| format!("failed to load rows from {}", path.display()))
    }

    pub fn rows(&self) -> &[CollectorRow] {
        &self.rows
    }
}

#[async_trait]
impl Collector for MemoryCollector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn collect(&self) -> Result<Vec<CollectorRow>> {
        Ok(self.rows.clone())
    }
}
