//! Configuration for the engine, the processed store and the pipeline.
//!
//! [`PipelineConfig`] is read from a JSON document and then patched by
//! environment variables of the form `ANALYTICS_<SECTION>__<KEY>`, where `__`
//! separates nesting levels:
//!
//! ```text
//! ANALYTICS_ENVIRONMENT=production
//! ANALYTICS_PROCESSORS__UNIFIED__OUTLIER_THRESHOLD=2.5
//! ANALYTICS_PROCESSORS__UNIFIED__AGGREGATION_WINDOW=15min
//! ANALYTICS_STORAGE__PARTITION_GRANULARITY=hour
//! ```
//!
//! Override values are parsed as JSON when possible and used as plain strings
//! otherwise.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use tracing::{debug, instrument};

use crate::aggregation::AggregationWindow;
use crate::error::{Result, UnifyError};
use crate::outliers::DEFAULT_OUTLIER_THRESHOLD;
use crate::storage::{validate_table_name, PartitionGranularity};

/// Prefix of environment variables that override file configuration.
pub const ENV_PREFIX: &str = "ANALYTICS_";

/// Separator between nesting levels in override variable names.
pub const ENV_SEPARATOR: &str = "__";

/// Settings of the unification engine.
///
/// # Examples
///
/// ```rust
/// use unimetrics::aggregation::AggregationWindow;
/// use unimetrics::config::UnifyConfig;
///
/// let config = UnifyConfig::default()
///     .with_aggregation_window(AggregationWindow::minutes(15))
///     .with_outlier_threshold(2.5);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnifyConfig {
    /// Bucket width for time aggregation.
    pub aggregation_window: AggregationWindow,
    /// Z-score above which a value is nulled.
    pub outlier_threshold: f64,
}

impl Default for UnifyConfig {
    fn default() -> Self {
        Self {
            aggregation_window: AggregationWindow::default(),
            outlier_threshold: DEFAULT_OUTLIER_THRESHOLD,
        }
    }
}

impl UnifyConfig {
    pub fn with_aggregation_window(mut self, window: AggregationWindow) -> Self {
        self.aggregation_window = window;
        self
    }

    pub fn with_outlier_threshold(mut self, threshold: f64) -> Self {
        self.outlier_threshold = threshold;
        self
    }

    /// Checks that the threshold is a positive finite number.
    ///
    /// The window is validated when it is constructed.
    pub fn validate(&self) -> Result<()> {
        if !self.outlier_threshold.is_finite() || self.outlier_threshold <= 0.0 {
            return Err(UnifyError::Configuration(format!(
                "outlier_threshold must be a positive finite number, got {}",
                self.outlier_threshold
            )));
        }
        Ok(())
    }
}

/// Settings of the processed store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Namespace that per-source raw tables live in.
    pub raw_namespace: String,
    /// Namespace that processed tables live in.
    pub processed_namespace: String,
    /// Version suffix of the default table name.
    pub schema_version: String,
    /// Partition granularity for newly created tables.
    pub partition_granularity: PartitionGranularity,
    /// Writes larger than this many rows trigger compaction.
    pub optimize_threshold_rows: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            raw_namespace: "raw".to_string(),
            processed_namespace: "processed".to_string(),
            schema_version: "v1".to_string(),
            partition_granularity: PartitionGranularity::Day,
            optimize_threshold_rows: 1_000_000,
        }
    }
}

impl StorageConfig {
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.processed_namespace = namespace.into();
        self
    }

    pub fn with_raw_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.raw_namespace = namespace.into();
        self
    }

    pub fn with_partition_granularity(mut self, granularity: PartitionGranularity) -> Self {
        self.partition_granularity = granularity;
        self
    }

    pub fn with_optimize_threshold_rows(mut self, rows: usize) -> Self {
        self.optimize_threshold_rows = rows;
        self
    }

    /// Name of the table processed metrics go to when none is given.
    pub fn default_table_name(&self) -> String {
        format!(
            "{}.metrics_{}",
            self.processed_namespace, self.schema_version
        )
    }

    /// Name of the raw table that rows collected from `source` go to.
    pub fn raw_table_name(&self, source: &str) -> String {
        format!("{}.metrics_{source}", self.raw_namespace)
    }

    /// Checks that the default table names are valid identifiers.
    pub fn validate(&self) -> Result<()> {
        validate_table_name(&self.default_table_name())
            .and_then(|()| validate_table_name(&self.raw_namespace))
            .map_err(|e| UnifyError::Configuration(e.to_string()))
    }
}

/// Per-processor settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorsConfig {
    pub unified: UnifyConfig,
}

/// Top-level configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Deployment environment name, used only for logging.
    pub environment: String,
    pub processors: ProcessorsConfig,
    pub storage: StorageConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            processors: ProcessorsConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Parses a JSON document without environment overrides.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Self::from_json_str_with_overrides(json, std::iter::empty::<(String, String)>())
    }

    /// Parses a JSON document and applies the given override variables.
    ///
    /// Variables without the [`ENV_PREFIX`] are ignored.
    pub fn from_json_str_with_overrides<I, K, V>(json: &str, vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut document: Value = serde_json::from_str(json)?;
        if document.is_null() {
            document = Value::Object(Map::new());
        }
        apply_env_overrides(&mut document, vars)?;
        Self::from_value(document)
    }

    /// Loads a JSON file and applies overrides from the process environment.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str_with_overrides(&contents, std::env::vars())
    }

    /// Builds the configuration from defaults and the process environment only.
    pub fn from_env() -> Result<Self> {
        Self::from_json_str_with_overrides("{}", std::env::vars())
    }

    fn from_value(document: Value) -> Result<Self> {
        let config: Self = serde_json::from_value(document)
            .map_err(|e| UnifyError::Configuration(format!("invalid configuration: {e}")))?;
        config.validate()?;
        debug!(environment = %config.environment, "Configuration loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.processors.unified.validate()?;
        self.storage.validate()
    }
}

/// Patches `document` in place with `ANALYTICS_*` variables.
///
/// Path segments are lowercased; intermediate objects are created as needed.
pub fn apply_env_overrides<I, K, V>(document: &mut Value, vars: I) -> Result<()>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    for (key, raw) in vars {
        let Some(path) = key.as_ref().strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let segments: Vec<String> = path
            .split(ENV_SEPARATOR)
            .map(str::to_lowercase)
            .collect();
        if segments.iter().any(String::is_empty) {
            return Err(UnifyError::Configuration(format!(
                "malformed override variable '{}'",
                key.as_ref()
            )));
        }

        let raw = raw.as_ref();
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        set_path(document, &segments, value).map_err(|message| {
            UnifyError::Configuration(format!("cannot apply '{}': {message}", key.as_ref()))
        })?;
        debug!(variable = key.as_ref(), "Applied configuration override");
    }
    Ok(())
}

fn set_path(
    document: &mut Value,
    segments: &[String],
    value: Value,
) -> std::result::Result<(), String> {
    let Some((leaf, parents)) = segments.split_last() else {
        return Err("empty path".to_string());
    };

    let mut node = document;
    for segment in parents {
        let object = node
            .as_object_mut()
            .ok_or_else(|| format!("'{segment}' is nested under a non-object value"))?;
        node = object
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    let object = node
        .as_object_mut()
        .ok_or_else(|| format!("'{leaf}' is nested under a non-object value"))?;
    object.insert(leaf.clone(), value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.environment, "development");
        assert_eq!(config.processors.unified.outlier_threshold, 3.0);
        assert_eq!(
            config.processors.unified.aggregation_window,
            AggregationWindow::hours(1)
        );
        assert_eq!(config.storage.default_table_name(), "processed.metrics_v1");
        assert_eq!(config.storage.partition_granularity, PartitionGranularity::Day);
    }

    #[test]
    fn test_parse_partial_document() {
        let config = PipelineConfig::from_json_str(
            r#"{"processors": {"unified": {"aggregation_window": "15min"}}}"#,
        )
        .unwrap();
        assert_eq!(
            config.processors.unified.aggregation_window,
            AggregationWindow::minutes(15)
        );
        assert_eq!(config.processors.unified.outlier_threshold, 3.0);
    }

    #[test]
    fn test_env_overrides() {
        let vars = [
            ("ANALYTICS_ENVIRONMENT", "production"),
            ("ANALYTICS_PROCESSORS__UNIFIED__OUTLIER_THRESHOLD", "2.5"),
            ("ANALYTICS_PROCESSORS__UNIFIED__AGGREGATION_WINDOW", "30s"),
            ("ANALYTICS_STORAGE__PARTITION_GRANULARITY", "hour"),
            ("HOME", "/root"),
        ];
        let config = PipelineConfig::from_json_str_with_overrides("{}", vars).unwrap();
        assert_eq!(config.environment, "production");
        assert_eq!(config.processors.unified.outlier_threshold, 2.5);
        assert_eq!(
            config.processors.unified.aggregation_window.as_micros(),
            30_000_000
        );
        assert_eq!(
            config.storage.partition_granularity,
            PartitionGranularity::Hour
        );
    }

    #[test]
    fn test_override_wins_over_file() {
        let config = PipelineConfig::from_json_str_with_overrides(
            r#"{"processors": {"unified": {"outlier_threshold": 4.0}}}"#,
            [("ANALYTICS_PROCESSORS__UNIFIED__OUTLIER_THRESHOLD", "1.5")],
        )
        .unwrap();
        assert_eq!(config.processors.unified.outlier_threshold, 1.5);
    }

    #[test]
    fn test_invalid_values_are_configuration_errors() {
        let err = PipelineConfig::from_json_str(
            r#"{"processors": {"unified": {"outlier_threshold": -1.0}}}"#,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let err = PipelineConfig::from_json_str(
            r#"{"processors": {"unified": {"aggregation_window": "0h"}}}"#,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let err = PipelineConfig::from_json_str_with_overrides(
            r#"{"environment": "dev"}"#,
            [("ANALYTICS_ENVIRONMENT__NAME", "x")],
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_malformed_document() {
        let err = PipelineConfig::from_json_str("{not json").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Serialization);
    }

    #[test]
    fn test_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"environment": "staging", "storage": {{"processed_namespace": "analytics"}}}}"#
        )
        .unwrap();

        let config = PipelineConfig::from_path(file.path()).unwrap();
        assert_eq!(config.environment, "staging");
        assert_eq!(
            config.storage.default_table_name(),
            "analytics.metrics_v1"
        );
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = PipelineConfig::from_path(dir.path().join("missing.json")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_invalid_namespace() {
        let config = StorageConfig::default().with_namespace("bad namespace");
        assert_eq!(config.validate().unwrap_err().kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_document_without_overrides() {
        let config = PipelineConfig::from_json_str("{}").unwrap();
        assert_eq!(config, PipelineConfig::default());
    }

    #[test]
    fn test_raw_table_names() {
        let config = PipelineConfig::from_json_str_with_overrides(
            "{}",
            [("ANALYTICS_STORAGE__RAW_NAMESPACE", "landing")],
        )
        .unwrap();
        assert_eq!(config.storage.raw_table_name("mongodb"), "landing.metrics_mongodb");
        assert_eq!(
            StorageConfig::default().raw_table_name("newrelic"),
            "raw.metrics_newrelic"
        );

        let bad = StorageConfig::default().with_raw_namespace("raw zone");
        assert_eq!(bad.validate().unwrap_err().kind(), ErrorKind::Configuration);
    }
}
