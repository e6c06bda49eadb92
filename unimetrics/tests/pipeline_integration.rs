//! Integration tests for collect -> unify -> store runs.

use arrow::array::{Array, StringArray};
use async_trait::async_trait;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use unimetrics::prelude::*;
use unimetrics::storage::PartitionGranularity;

const POSTGRES_ROWS: &str = r#"[
    {"collector": "postgres", "timestamp": "2023-01-01 00:05:00",
     "metric_name": "active_connections", "value": 12.0, "metadata": {"db": "main"}},
    {"collector": "postgres", "timestamp": "2023-01-02 00:05:00",
     "metric_name": "active_connections", "value": 20.0, "metadata": {"db": "main"}}
]"#;

const MONGODB_ROWS: &str = r#"[
    {"collector": "mongodb", "timestamp": "2023-01-01T00:10:00Z",
     "metric_id": "response_time_ms", "value": 100.0, "metadata": {"service": "api"}},
    {"collector": "mongodb", "timestamp": "2023-01-01T00:10:00Z",
     "metric_id": "response_time_ms", "value": 100.0, "metadata": {"service": "api"}}
]"#;

/// Sleeps before answering so that concurrent collection is observable.
#[derive(Debug)]
struct SlowCollector {
    name: String,
    delay: Duration,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl Collector for SlowCollector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn collect(&self) -> Result<Vec<CollectorRow>> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(Vec::new())
    }
}

#[derive(Debug)]
struct TimeoutCollector;

#[async_trait]
impl Collector for TimeoutCollector {
    fn name(&self) -> &str {
        "newrelic"
    }

    async fn collect(&self) -> Result<Vec<CollectorRow>> {
        Err(UnifyError::Internal("request timed out".to_string()))
    }
}

fn collectors() -> Vec<Arc<dyn Collector>> {
    vec![
        Arc::new(MemoryCollector::from_json("postgres", POSTGRES_ROWS).unwrap()),
        Arc::new(MemoryCollector::from_json("mongodb", MONGODB_ROWS).unwrap()),
    ]
}

#[tokio::test]
async fn test_full_run_from_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{
            "environment": "test",
            "processors": {{"unified": {{"aggregation_window": "1h", "outlier_threshold": 3.0}}}},
            "storage": {{"raw_namespace": "landing", "processed_namespace": "analytics", "partition_granularity": "day"}}
        }}"#
    )
    .unwrap();
    let config = PipelineConfig::from_path(file.path()).unwrap();

    let sink = InMemoryTableSink::new();
    let mut pipeline = Pipeline::from_config(&config, Arc::new(sink.clone())).unwrap();
    for collector in collectors() {
        pipeline = pipeline.with_collector(collector);
    }

    let report = pipeline.run().await.unwrap();
    assert_eq!(report.sources, vec!["mongodb", "postgres"]);
    assert_eq!(report.rows_collected, 4);
    // The duplicate MongoDB row collapses; the two Postgres days stay apart.
    assert_eq!(report.rows_aggregated, 3);
    assert!(report.stored);

    let info = sink
        .load_table("analytics.metrics_v1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(info.partition.granularity, PartitionGranularity::Day);
    assert_eq!(info.partitions, vec!["2023-01-01", "2023-01-02"]);

    let stored = sink.read("analytics.metrics_v1").await.unwrap();
    assert_eq!(stored.num_rows(), 3);
    let sources = stored
        .column_by_name("source")
        .unwrap()
        .as_any()
        .downcast_ref::<StringArray>()
        .unwrap();
    assert_eq!(sources.null_count(), 0);

    // Raw tables keep what the collectors returned, duplicates included.
    assert_eq!(report.raw_stored, vec!["mongodb", "postgres"]);
    let raw = sink
        .load_table("landing.metrics_mongodb")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(raw.row_count, 2);
    assert_eq!(pipeline.raw_store().metrics().records_written, 4);

    let engine_metrics = pipeline.engine().metrics();
    assert_eq!(engine_metrics.records_processed, 3);
    assert_eq!(pipeline.store().metrics().records_written, 3);
}

#[tokio::test]
async fn test_repeated_runs_add_snapshots() {
    let sink = InMemoryTableSink::new();
    let mut pipeline =
        Pipeline::from_config(&PipelineConfig::default(), Arc::new(sink.clone())).unwrap();
    for collector in collectors() {
        pipeline = pipeline.with_collector(collector);
    }

    pipeline.run().await.unwrap();
    pipeline.run().await.unwrap();

    let info = sink
        .load_table("processed.metrics_v1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(info.snapshots, 2);
    assert_eq!(info.row_count, 6);
    assert_eq!(pipeline.engine().metrics().total_runs, 2);
}

#[tokio::test]
async fn test_collectors_run_concurrently() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let sink = InMemoryTableSink::new();
    let mut pipeline =
        Pipeline::from_config(&PipelineConfig::default(), Arc::new(sink)).unwrap();
    for i in 0..3 {
        pipeline = pipeline.with_collector(Arc::new(SlowCollector {
            name: format!("slow_{i}"),
            delay: Duration::from_millis(50),
            in_flight: Arc::clone(&in_flight),
            peak: Arc::clone(&peak),
        }));
    }

    let report = pipeline.run().await.unwrap();
    assert_eq!(report.rows_collected, 0);
    assert!(!report.stored);
    assert_eq!(peak.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_collector_error_is_reported_by_name() {
    let sink = InMemoryTableSink::new();
    let mut pipeline =
        Pipeline::from_config(&PipelineConfig::default(), Arc::new(sink.clone())).unwrap();
    for collector in collectors() {
        pipeline = pipeline.with_collector(collector);
    }
    let pipeline = pipeline.with_collector(Arc::new(TimeoutCollector));

    let err = pipeline.run().await.unwrap_err();
    match err {
        UnifyError::Collector { collector, message } => {
            assert_eq!(collector, "newrelic");
            assert!(message.contains("timed out"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(sink.table_names().await.is_empty());
}

#[tokio::test]
async fn test_env_overrides_reach_the_engine() {
    let config = PipelineConfig::from_json_str_with_overrides(
        "{}",
        [("ANALYTICS_PROCESSORS__UNIFIED__AGGREGATION_WINDOW", "1D")],
    )
    .unwrap();

    let sink = InMemoryTableSink::new();
    let pipeline = Pipeline::from_config(&config, Arc::new(sink.clone()))
        .unwrap()
        .with_collector(collectors().remove(0));

    let report = pipeline.run().await.unwrap();
    assert_eq!(report.rows_aggregated, 2);
    assert_eq!(
        pipeline.engine().config().aggregation_window,
        AggregationWindow::hours(24)
    );
}
