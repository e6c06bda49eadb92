//! Collects rows from three in-memory collectors, unifies them and stores the
//! result in an in-memory table.
//!
//! Run with `cargo run --example unify_sources`; set `ANALYTICS_*` variables
//! to override configuration, e.g.
//! `ANALYTICS_PROCESSORS__UNIFIED__AGGREGATION_WINDOW=15min`.

use std::sync::Arc;
use unimetrics::logging::setup::{init_logging, LoggingConfig};
use unimetrics::prelude::*;

const POSTGRES: &str = r#"[
    {"collector": "postgres", "timestamp": "2023-01-01 00:05:00",
     "metric_name": "active_connections", "value": 12.0, "metadata": {"db": "main"}},
    {"collector": "postgres", "timestamp": "2023-01-01 00:35:00",
     "metric_name": "active_connections", "value": 16.0, "metadata": {"db": "main"}}
]"#;

const MONGODB: &str = r#"[
    {"collector": "mongodb", "timestamp": "2023-01-01T00:10:00Z",
     "metric_id": "response_time_ms", "value": 100.0, "metadata": {"service": "api"}}
]"#;

const NEWRELIC: &str = r#"[
    {"collector": "newrelic", "timestamp": "2023-01-01T00:20:00Z",
     "name": "duration", "value": 150.0, "attributes": {"service": "api"}}
]"#;

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    init_logging(LoggingConfig::development())?;

    let config = PipelineConfig::from_env()?;
    let sink = InMemoryTableSink::new();
    let pipeline = Pipeline::from_config(&config, Arc::new(sink.clone()))?
        .with_collector(Arc::new(MemoryCollector::from_json("postgres", POSTGRES)?))
        .with_collector(Arc::new(MemoryCollector::from_json("mongodb", MONGODB)?))
        .with_collector(Arc::new(MemoryCollector::from_json("newrelic", NEWRELIC)?));

    if !pipeline.health_check().await {
        return Err("pipeline is unhealthy".into());
    }

    let report = pipeline.run().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    println!("{}", pipeline.engine());
    println!("{}", pipeline.raw_store());
    println!("{}", pipeline.store());

    let table = config.storage.default_table_name();
    let stored = sink.read(&table).await?;
    println!("{table}: {} rows", stored.num_rows());
    Ok(())
}
