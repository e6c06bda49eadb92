//! The unification engine.
//!
//! [`UnificationEngine::process`] turns one batch of rows per source into a
//! single aggregated dataset:
//!
//! 1. normalize every collector row onto the unified schema, stamping the
//!    source name
//! 2. drop exact duplicate rows, keeping the first occurrence
//! 3. order rows by timestamp
//! 4. null z-score outliers within each `(metric_name, source)` group
//! 5. aggregate into time buckets per `(metric_name, source, dimensions)`
//! 6. validate the output schema and compute the quality score
//!
//! Every call, successful or not, is recorded in the engine's
//! [`MetricsTracker`].

use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::time::Instant;
use tracing::{debug, error, info, instrument};

use crate::aggregation::aggregate;
use crate::config::UnifyConfig;
use crate::dataset::AggregatedDataset;
use crate::error::{Result, UnifyError};
use crate::logging::LogConfig;
use crate::outliers::OutlierDetector;
use crate::quality::QualityScorer;
use crate::rows::{CollectorRow, SourceRow, UnifiedRow};
use crate::schema::validate_batch;
use crate::tracker::{MetricsTracker, ProcessingMetrics};
use crate::{log_stage, perf_debug};

/// Rows per source, keyed by source name.
pub type SourceBatches = BTreeMap<String, Vec<CollectorRow>>;

/// Result of a successful [`UnificationEngine::process`] call.
#[derive(Debug, Clone)]
pub enum UnifyOutcome {
    /// Every supplied source was empty. The dataset has the output schema and
    /// no rows.
    Empty { dataset: AggregatedDataset },
    /// At least one row was aggregated.
    Aggregated {
        dataset: AggregatedDataset,
        /// Quality score of `dataset`, in `[0.0, 1.0]`.
        quality_score: f64,
    },
}

impl UnifyOutcome {
    pub fn dataset(&self) -> &AggregatedDataset {
        match self {
            Self::Empty { dataset } | Self::Aggregated { dataset, .. } => dataset,
        }
    }

    pub fn into_dataset(self) -> AggregatedDataset {
        match self {
            Self::Empty { dataset } | Self::Aggregated { dataset, .. } => dataset,
        }
    }

    /// Quality score of the released dataset; `None` for empty results.
    pub fn quality_score(&self) -> Option<f64> {
        match self {
            Self::Empty { .. } => None,
            Self::Aggregated { quality_score, .. } => Some(*quality_score),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty { .. })
    }
}

/// Merges per-source metric batches into one quality-scored dataset.
///
/// # Examples
///
/// ```rust
/// use chrono::{TimeZone, Utc};
/// use unimetrics::config::UnifyConfig;
/// use unimetrics::engine::{SourceBatches, UnificationEngine};
/// use unimetrics::rows::{CollectorRow, SourceRow};
///
/// let engine = UnificationEngine::new(UnifyConfig::default()).unwrap();
///
/// let ts = |m| Utc.with_ymd_and_hms(2023, 1, 1, 0, m, 0).unwrap();
/// let mut batches = SourceBatches::new();
/// batches.insert(
///     "postgres".to_string(),
///     vec![
///         CollectorRow::from(SourceRow::new(ts(10), "cpu", Some(5.0))),
///         CollectorRow::from(SourceRow::new(ts(40), "cpu", Some(7.0))),
///     ],
/// );
///
/// let outcome = engine.process(&batches).unwrap();
/// let row = &outcome.dataset().rows()[0];
/// assert_eq!(row.value, Some(6.0));
/// assert_eq!(row.value_count, 2);
/// ```
#[derive(Debug)]
pub struct UnificationEngine {
    config: UnifyConfig,
    detector: OutlierDetector,
    tracker: MetricsTracker,
    log_config: LogConfig,
}

impl UnificationEngine {
    /// Creates an engine with fresh counters.
    ///
    /// # Errors
    /// Returns a configuration error for an invalid outlier threshold.
    pub fn new(config: UnifyConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            detector: OutlierDetector::new(config.outlier_threshold)?,
            config,
            tracker: MetricsTracker::new(),
            log_config: LogConfig::default(),
        })
    }

    pub fn with_log_config(mut self, log_config: LogConfig) -> Self {
        self.log_config = log_config;
        self
    }

    pub fn config(&self) -> &UnifyConfig {
        &self.config
    }

    /// Unifies the given batches.
    ///
    /// The caller's rows are not modified. An outcome of
    /// [`UnifyOutcome::Empty`] is returned when every source is empty; an
    /// empty mapping is an [`UnifyError::Input`] error.
    #[instrument(skip(self, batches), fields(engine.sources = batches.len()))]
    pub fn process(&self, batches: &SourceBatches) -> Result<UnifyOutcome> {
        let start = Instant::now();
        match self.unify(batches) {
            Ok(outcome) => {
                match &outcome {
                    UnifyOutcome::Empty { .. } => {
                        debug!("All sources were empty");
                        self.tracker.record(start, 0, 1.0, false);
                    }
                    UnifyOutcome::Aggregated {
                        dataset,
                        quality_score,
                    } => {
                        self.tracker
                            .record(start, dataset.len(), *quality_score, false);
                        if self.log_config.log_metrics {
                            info!(
                                engine.rows = dataset.len(),
                                engine.quality_score = quality_score,
                                engine.elapsed_ms = start.elapsed().as_millis() as u64,
                                "Unification completed"
                            );
                        }
                    }
                }
                Ok(outcome)
            }
            Err(e) => {
                self.tracker.record(start, 0, 0.0, true);
                error!(
                    error = %self.log_config.truncate(&e.to_string()),
                    error.kind = e.kind().as_str(),
                    "Unification failed"
                );
                Err(e)
            }
        }
    }

    fn unify(&self, batches: &SourceBatches) -> Result<UnifyOutcome> {
        if batches.is_empty() {
            return Err(UnifyError::input("No data provided from any source"));
        }

        let rows = self.normalize(batches)?;
        if rows.is_empty() {
            return Ok(UnifyOutcome::Empty {
                dataset: AggregatedDataset::empty(),
            });
        }

        let before = rows.len();
        let mut rows = drop_duplicates(rows);
        log_stage!(
            self.log_config,
            stage = "dedup",
            rows.before = before,
            rows.after = rows.len(),
            "Duplicates removed"
        );

        rows.sort_by_key(|row| row.timestamp);

        let nulled = self.null_outliers(&mut rows);
        log_stage!(
            self.log_config,
            stage = "outliers",
            values.nulled = nulled,
            threshold = self.detector.threshold(),
            "Outliers nulled"
        );

        let aggregated = aggregate(rows, self.config.aggregation_window)?;
        log_stage!(
            self.log_config,
            stage = "aggregate",
            window = %self.config.aggregation_window,
            buckets = aggregated.len(),
            "Rows aggregated"
        );

        let dataset = AggregatedDataset::from_rows(aggregated)?;
        validate_batch(dataset.record_batch())?;
        let quality_score = QualityScorer::new().score(dataset.record_batch())?;

        Ok(UnifyOutcome::Aggregated {
            dataset,
            quality_score,
        })
    }

    fn normalize(&self, batches: &SourceBatches) -> Result<Vec<UnifiedRow>> {
        let capacity = batches.values().map(Vec::len).sum();
        let mut unified = Vec::with_capacity(capacity);
        for (source, rows) in batches {
            if source.trim().is_empty() {
                return Err(UnifyError::input("Source name must not be empty"));
            }
            for row in rows {
                unified.push(UnifiedRow::from_collector_row(source, row.clone())?);
            }
            perf_debug!(
                self.log_config,
                source = %self.log_config.truncate(source),
                rows = rows.len(),
                "Source normalized"
            );
        }
        Ok(unified)
    }

    /// Nulls outlying values in place and returns how many were nulled.
    fn null_outliers(&self, rows: &mut [UnifiedRow]) -> usize {
        let mut groups: HashMap<(&str, &str), Vec<usize>> = HashMap::new();
        for (idx, row) in rows.iter().enumerate() {
            groups
                .entry((row.metric_name.as_str(), row.source.as_str()))
                .or_default()
                .push(idx);
        }

        let mut flagged = Vec::new();
        for indices in groups.values() {
            let values: Vec<Option<f64>> = indices.iter().map(|&i| rows[i].value).collect();
            flagged.extend(self.detector.flag(&values).into_iter().map(|pos| indices[pos]));
        }

        for &idx in &flagged {
            rows[idx].value = None;
        }
        flagged.len()
    }

    /// Runs one synthetic row through [`process`](Self::process).
    ///
    /// Returns `true` only for a non-empty, schema-valid result. The run is
    /// counted in the processing metrics like any other call.
    pub fn health_check(&self) -> bool {
        let row =
            SourceRow::new(Utc::now(), "test_metric", Some(1.0)).with_attribute("test", "value");
        let batches =
            SourceBatches::from([("test_source".to_string(), vec![CollectorRow::from(row)])]);

        match self.process(&batches) {
            Ok(UnifyOutcome::Aggregated { dataset, .. }) => {
                !dataset.is_empty() && validate_batch(dataset.record_batch()).is_ok()
            }
            Ok(UnifyOutcome::Empty { .. }) => false,
            Err(e) => {
                error!(error = %e, "Engine health check failed");
                false
            }
        }
    }

    /// Returns a snapshot of the processing counters.
    pub fn metrics(&self) -> ProcessingMetrics {
        self.tracker.snapshot()
    }

    pub fn reset_metrics(&self) {
        self.tracker.reset();
    }
}

impl fmt::Display for UnificationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UnificationEngine({})", self.tracker.snapshot())
    }
}

/// Keeps the first occurrence of every distinct row.
fn drop_duplicates(rows: Vec<UnifiedRow>) -> Vec<UnifiedRow> {
    let keep: Vec<bool> = {
        let mut seen = HashSet::with_capacity(rows.len());
        rows.iter().map(|row| seen.insert(row.identity())).collect()
    };
    rows.into_iter()
        .zip(keep)
        .filter_map(|(row, keep)| keep.then_some(row))
        .collect()
}
