//! Running counters across repeated engine invocations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::Result;

/// A read-only copy of the processing counters.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProcessingMetrics {
    /// When the most recent call finished.
    pub last_processing_time: Option<DateTime<Utc>>,
    /// Rows released across all calls; failed calls add nothing.
    pub records_processed: u64,
    /// Number of failed calls.
    pub processing_errors: u64,
    /// Running mean of call duration in seconds, over all calls.
    pub average_processing_time: f64,
    /// Quality score of the latest successful call.
    pub data_quality_score: f64,
    /// Number of calls recorded, successful or not.
    pub total_runs: u64,
}

impl ProcessingMetrics {
    /// Serializes the snapshot to a JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl fmt::Display for ProcessingMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "records={}, errors={}, quality={:.2}",
            self.records_processed, self.processing_errors, self.data_quality_score
        )
    }
}

/// Accumulates [`ProcessingMetrics`] behind a single lock.
///
/// Updates from concurrent callers are serialized; each update is applied
/// atomically with respect to [`MetricsTracker::snapshot`].
#[derive(Debug, Default)]
pub struct MetricsTracker {
    state: Mutex<ProcessingMetrics>,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one call that started at `start`.
    ///
    /// Failed calls pass `error = true` and a `record_count` of zero; their
    /// `quality_score` is ignored so the last successful score survives.
    pub fn record(&self, start: Instant, record_count: usize, quality_score: f64, error: bool) {
        self.record_elapsed(start.elapsed(), record_count, quality_score, error);
    }

    /// Records one call with an already measured duration.
    pub fn record_elapsed(
        &self,
        elapsed: Duration,
        record_count: usize,
        quality_score: f64,
        error: bool,
    ) {
        let mut state = self.lock();
        state.last_processing_time = Some(Utc::now());
        state.records_processed = state
            .records_processed
            .saturating_add(record_count as u64);
        if error {
            state.processing_errors = state.processing_errors.saturating_add(1);
        } else {
            state.data_quality_score = quality_score;
        }

        state.total_runs += 1;
        let n = state.total_runs as f64;
        state.average_processing_time =
            (state.average_processing_time * (n - 1.0) + elapsed.as_secs_f64()) / n;
    }

    /// Returns a copy of the current counters.
    pub fn snapshot(&self) -> ProcessingMetrics {
        self.lock().clone()
    }

    /// Returns every counter to its initial value.
    pub fn reset(&self) {
        *self.lock() = ProcessingMetrics::default();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ProcessingMetrics> {
        // A panic while holding the lock cannot leave the counters half-written
        // in a way that matters more than losing them, so recover the guard.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
