//! End-to-end orchestration: collect, land raw rows, unify, store.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};

use crate::collectors::Collector;
use crate::config::PipelineConfig;
use crate::engine::{SourceBatches, UnificationEngine, UnifyOutcome};
use crate::error::{Result, UnifyError};
use crate::logging::LogConfig;
use crate::storage::{ProcessedStore, RawStore, TableSink};

/// Summary of one [`Pipeline::run`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    /// Source names in the order they were processed.
    pub sources: Vec<String>,
    pub rows_collected: usize,
    /// Sources whose rows were written to a raw table.
    pub raw_stored: Vec<String>,
    pub rows_aggregated: usize,
    /// `None` when every source was empty.
    pub quality_score: Option<f64>,
    pub stored: bool,
    pub elapsed_ms: u64,
}

/// Runs collectors concurrently, lands their batches in the raw store and
/// feeds them through the engine into the processed store.
#[derive(Debug)]
pub struct Pipeline {
    collectors: Vec<Arc<dyn Collector>>,
    engine: UnificationEngine,
    raw_store: RawStore,
    store: ProcessedStore,
    table_name: Option<String>,
}

impl Pipeline {
    pub fn new(engine: UnificationEngine, raw_store: RawStore, store: ProcessedStore) -> Self {
        Self {
            collectors: Vec::new(),
            engine,
            raw_store,
            store,
            table_name: None,
        }
    }

    /// Builds the engine and both stores from configuration.
    pub fn from_config(config: &PipelineConfig, sink: Arc<dyn TableSink>) -> Result<Self> {
        let log_config = match config.environment.as_str() {
            "production" => LogConfig::production(),
            "development" => LogConfig::verbose(),
            _ => LogConfig::balanced(),
        };
        let engine =
            UnificationEngine::new(config.processors.unified)?.with_log_config(log_config.clone());
        let raw_store = RawStore::new(Arc::clone(&sink), config.storage.clone())
            .with_log_config(log_config.clone());
        let store = ProcessedStore::new(sink, config.storage.clone()).with_log_config(log_config);
        Ok(Self::new(engine, raw_store, store))
    }

    pub fn with_collector(mut self, collector: Arc<dyn Collector>) -> Self {
        self.collectors.push(collector);
        self
    }

    /// Stores results in `table_name` instead of the configured default.
    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = Some(table_name.into());
        self
    }

    pub fn engine(&self) -> &UnificationEngine {
        &self.engine
    }

    pub fn raw_store(&self) -> &RawStore {
        &self.raw_store
    }

    pub fn store(&self) -> &ProcessedStore {
        &self.store
    }

    /// Collects from every collector, stores each non-empty batch raw, then
    /// unifies and stores the result.
    ///
    /// # Errors
    /// Any collector failure aborts the run before anything is stored. Two
    /// collectors with the same name are an input error. A raw store failure
    /// aborts the run before the engine sees any rows.
    #[instrument(skip(self), fields(pipeline.collectors = self.collectors.len()))]
    pub async fn run(&self) -> Result<PipelineReport> {
        let start = Instant::now();
        let batches = self.collect().await?;
        let rows_collected = batches.values().map(Vec::len).sum();
        let raw_stored = self.store_raw(&batches).await?;

        let outcome = self.engine.process(&batches)?;
        let (stored, rows_aggregated) = match &outcome {
            UnifyOutcome::Empty { .. } => {
                warn!("Collectors returned no rows");
                (false, 0)
            }
            UnifyOutcome::Aggregated { dataset, .. } => (
                self.store.store(dataset, self.table_name.as_deref()).await?,
                dataset.len(),
            ),
        };

        let report = PipelineReport {
            sources: batches.keys().cloned().collect(),
            rows_collected,
            raw_stored,
            rows_aggregated,
            quality_score: outcome.quality_score(),
            stored,
            elapsed_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            pipeline.rows_collected = report.rows_collected,
            pipeline.rows_aggregated = report.rows_aggregated,
            pipeline.stored = report.stored,
            "Pipeline run completed"
        );
        Ok(report)
    }

    async fn collect(&self) -> Result<SourceBatches> {
        let results = join_all(self.collectors.iter().map(|c| async move {
            let rows = c
                .collect()
                .await
                .map_err(|e| UnifyError::collector(c.name(), e.to_string()))?;
            Ok::<_, UnifyError>((c.name().to_string(), rows))
        }))
        .await;

        let mut batches = SourceBatches::new();
        for result in results {
            let (name, rows) = result?;
            if batches.insert(name.clone(), rows).is_some() {
                return Err(UnifyError::input(format!(
                    "Duplicate collector name '{name}'"
                )));
            }
        }
        Ok(batches)
    }

    /// Writes every non-empty batch to its raw table, concurrently.
    ///
    /// Returns the sources that were stored.
    async fn store_raw(&self, batches: &SourceBatches) -> Result<Vec<String>> {
        let results = join_all(batches.iter().map(|(source, rows)| async move {
            let stored = self.raw_store.store(source, rows).await?;
            Ok::<_, UnifyError>(stored.then(|| source.clone()))
        }))
        .await;

        let mut stored = Vec::new();
        for result in results {
            stored.extend(result?);
        }
        Ok(stored)
    }

    /// True when the engine, every collector and both stores are healthy.
    pub async fn health_check(&self) -> bool {
        if !self.engine.health_check() {
            return false;
        }
        let collectors = join_all(self.collectors.iter().map(|c| c.health_check())).await;
        if collectors.contains(&false) {
            return false;
        }
        self.raw_store.health_check().await && self.store.health_check().await
    }
}
