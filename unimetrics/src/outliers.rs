//! Z-score outlier detection within a `(metric_name, source)` group.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::{Result, UnifyError};

/// Relative tolerance below which a standard deviation counts as zero.
const EPSILON: f64 = 1e-12;

/// Default z-score cutoff.
pub const DEFAULT_OUTLIER_THRESHOLD: f64 = 3.0;

/// Sample statistics over the non-null values of a group.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroupStats {
    /// Number of non-null values.
    pub count: usize,
    pub mean: f64,
    /// Sample standard deviation (n - 1); `None` with fewer than two values.
    pub std_dev: Option<f64>,
}

impl GroupStats {
    /// Computes two-pass sample statistics, skipping absent values.
    ///
    /// Returns `None` when the group has no values at all.
    pub fn from_values(values: &[Option<f64>]) -> Option<Self> {
        let present: Vec<f64> = values.iter().flatten().copied().collect();
        if present.is_empty() {
            return None;
        }

        let count = present.len();
        let mean = present.iter().sum::<f64>() / count as f64;
        let std_dev = if count < 2 {
            None
        } else {
            let sum_sq: f64 = present.iter().map(|v| (v - mean).powi(2)).sum();
            Some((sum_sq / (count - 1) as f64).sqrt())
        };

        Some(Self {
            count,
            mean,
            std_dev,
        })
    }

    /// Returns the standard deviation if it can be used as a z-score divisor.
    ///
    /// Zero, undefined and non-finite deviations are degenerate; a group with
    /// degenerate variance never yields outliers.
    pub fn usable_std_dev(&self) -> Option<f64> {
        self.std_dev
            .filter(|sd| sd.is_finite() && *sd > EPSILON * self.mean.abs().max(1.0))
    }
}

/// Flags values whose z-score exceeds a threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutlierDetector {
    threshold: f64,
}

impl OutlierDetector {
    /// Creates a detector with the given z-score threshold.
    ///
    /// # Errors
    /// Returns a configuration error if the threshold is not finite and positive.
    pub fn new(threshold: f64) -> Result<Self> {
        if !threshold.is_finite() || threshold <= 0.0 {
            return Err(UnifyError::Configuration(format!(
                "outlier_threshold must be a positive finite number, got {threshold}"
            )));
        }
        Ok(Self { threshold })
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Returns the indices of the values considered outliers.
    ///
    /// A value is an outlier when `|value - mean| / std_dev > threshold`, with
    /// sample statistics computed over the non-null values of `group`. Null
    /// values are never flagged. The input is not modified; the caller
    /// applies any nulling.
    pub fn flag(&self, group: &[Option<f64>]) -> BTreeSet<usize> {
        let Some(stats) = GroupStats::from_values(group) else {
            return BTreeSet::new();
        };
        let Some(std_dev) = stats.usable_std_dev() else {
            return BTreeSet::new();
        };

        group
            .iter()
            .enumerate()
            .filter_map(|(idx, value)| {
                let z_score = (value.as_ref()? - stats.mean).abs() / std_dev;
                (z_score > self.threshold).then_some(idx)
            })
            .collect()
    }
}

impl Default for OutlierDetector {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_OUTLIER_THRESHOLD,
        }
    }
}
