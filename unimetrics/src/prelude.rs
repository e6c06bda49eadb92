//! Prelude for commonly used types and traits in unimetrics.

pub use crate::aggregation::AggregationWindow;
pub use crate::collectors::{Collector, MemoryCollector};
pub use crate::config::{PipelineConfig, StorageConfig, UnifyConfig};
pub use crate::dataset::{AggregatedDataset, AggregatedRow};
pub use crate::engine::{SourceBatches, UnificationEngine, UnifyOutcome};
pub use crate::error::{ErrorContext, ErrorKind, Result, UnifyError};
pub use crate::logging::LogConfig;
pub use crate::pipeline::{Pipeline, PipelineReport};
pub use crate::quality::{QualityReport, QualityScorer};
pub use crate::rows::{CollectorRow, Dimensions, UnifiedRow};
pub use crate::storage::{InMemoryTableSink, ProcessedStore, RawStore, TableSink};
pub use crate::tracker::ProcessingMetrics;
