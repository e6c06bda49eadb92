//! # unimetrics - Multi-Source Metrics Unification
//!
//! unimetrics merges time-series metric rows gathered from heterogeneous
//! backends (database statistics, document stores, APM APIs) into a single
//! time-bucketed Apache Arrow dataset with a data-quality score.
//!
//! ## Quick Start
//!
//! ```rust
//! use unimetrics::prelude::*;
//! use unimetrics::rows::{MongoDbRow, SourceRow};
//!
//! # fn main() -> Result<()> {
//! let engine = UnificationEngine::new(UnifyConfig::default())?;
//!
//! let mut batches = SourceBatches::new();
//! batches.insert(
//!     "mongodb".to_string(),
//!     vec![CollectorRow::MongoDb(MongoDbRow {
//!         timestamp: "2023-01-01T00:10:00Z".into(),
//!         metric_id: "response_time_ms".to_string(),
//!         value: Some(100.0),
//!         metadata: None,
//!     })],
//! );
//! batches.insert(
//!     "postgres".to_string(),
//!     vec![SourceRow::new("2023-01-01 00:20:00", "connections", Some(12.0)).into()],
//! );
//!
//! match engine.process(&batches)? {
//!     UnifyOutcome::Aggregated { dataset, quality_score } => {
//!         assert_eq!(dataset.len(), 2);
//!         assert!(quality_score > 0.9);
//!     }
//!     UnifyOutcome::Empty { .. } => unreachable!(),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Processing Steps
//!
//! For every call the engine:
//!
//! 1. maps each collector's row shape onto `(timestamp, metric_name, value,
//!    source, dimensions)`
//! 2. drops exact duplicate rows
//! 3. nulls values whose z-score within their `(metric_name, source)` group
//!    exceeds the configured threshold
//! 4. buckets rows into fixed windows and computes mean, min, max and count
//! 5. validates the output schema and scores the result for missing values,
//!    duplicates, negative values and future timestamps
//!
//! ## Architecture
//!
//! - **`rows`**: per-collector row shapes and the unified row
//! - **`engine`**: the unification engine and its outcome type
//! - **`outliers`**, **`aggregation`**, **`quality`**, **`schema`**: the
//!   individual processing steps
//! - **`tracker`**: processing counters shared across calls
//! - **`collectors`**, **`storage`**, **`pipeline`**: the collect/store
//!   boundary and its orchestration
//! - **`config`**, **`logging`**, **`error`**: ambient plumbing

pub mod aggregation;
pub mod collectors;
pub mod config;
pub mod dataset;
pub mod engine;
pub mod error;
pub mod logging;
pub mod outliers;
pub mod pipeline;
pub mod prelude;
pub mod quality;
pub mod rows;
pub mod schema;
pub mod storage;
pub mod tracker;
