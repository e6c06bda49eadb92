//! Collector row shapes and their mapping onto the common [`SourceRow`].
//!
//! Each backend emits rows in its own naming (`metric_id`, `name`, `metadata`,
//! `attributes`, ...). Those shapes are modelled as variants of
//! [`CollectorRow`] and converted explicitly into a [`SourceRow`] at the
//! boundary, so the engine never renames fields by string lookup.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Result, UnifyError};

/// Free-form string attributes attached to a metric sample.
pub type Dimensions = BTreeMap<String, String>;

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// A timestamp as handed over by a collector, before coercion.
///
/// Deserializes untagged: RFC 3339 strings become [`RawTimestamp::Instant`],
/// zone-less date-times [`RawTimestamp::Naive`], integers epoch seconds and
/// any other string is kept as [`RawTimestamp::Text`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    /// Already an instant.
    Instant(DateTime<Utc>),
    /// A date-time without zone, read as UTC.
    Naive(NaiveDateTime),
    /// Seconds since the Unix epoch.
    EpochSeconds(i64),
    /// Milliseconds since the Unix epoch.
    #[serde(skip_deserializing)]
    EpochMillis(i64),
    /// Textual timestamp parsed on coercion.
    Text(String),
}

impl RawTimestamp {
    /// Coerces this timestamp into a UTC instant.
    ///
    /// The error message is returned as a plain string; callers attach the
    /// source name.
    pub fn to_instant(&self) -> std::result::Result<DateTime<Utc>, String> {
        match self {
            Self::Instant(ts) => Ok(*ts),
            Self::Naive(naive) => Ok(naive.and_utc()),
            Self::EpochSeconds(secs) => DateTime::from_timestamp(*secs, 0)
                .ok_or_else(|| format!("epoch seconds {secs} out of range")),
            Self::EpochMillis(millis) => DateTime::from_timestamp_millis(*millis)
                .ok_or_else(|| format!("epoch milliseconds {millis} out of range")),
            Self::Text(text) => parse_text_timestamp(text),
        }
    }
}

impl fmt::Display for RawTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Instant(ts) => write!(f, "{}", ts.to_rfc3339()),
            Self::Naive(naive) => write!(f, "{naive}"),
            Self::EpochSeconds(secs) => write!(f, "{secs}s"),
            Self::EpochMillis(millis) => write!(f, "{millis}ms"),
            Self::Text(text) => f.write_str(text),
        }
    }
}

impl From<DateTime<Utc>> for RawTimestamp {
    fn from(ts: DateTime<Utc>) -> Self {
        Self::Instant(ts)
    }
}

impl From<NaiveDateTime> for RawTimestamp {
    fn from(naive: NaiveDateTime) -> Self {
        Self::Naive(naive)
    }
}

impl From<&str> for RawTimestamp {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

fn parse_text_timestamp(text: &str) -> std::result::Result<DateTime<Utc>, String> {
    let trimmed = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(naive.and_utc());
        }
    }
    Err("unrecognized timestamp format".to_string())
}

/// The common row shape every collector is mapped onto.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRow {
    /// When the sample was taken.
    pub timestamp: RawTimestamp,
    /// Identifier of the metric.
    pub metric_key: String,
    /// Sample value; absent when the backend reported none.
    #[serde(default)]
    pub value: Option<f64>,
    /// Optional string attributes.
    #[serde(default)]
    pub attributes: Option<Dimensions>,
}

impl SourceRow {
    /// Creates a row with no attributes.
    pub fn new(
        timestamp: impl Into<RawTimestamp>,
        metric_key: impl Into<String>,
        value: Option<f64>,
    ) -> Self {
        Self {
            timestamp: timestamp.into(),
            metric_key: metric_key.into(),
            value,
            attributes: None,
        }
    }

    /// Adds an attribute to this row.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes
            .get_or_insert_with(Dimensions::new)
            .insert(key.into(), value.into());
        self
    }

    /// Replaces all attributes of this row.
    pub fn with_attributes(mut self, attributes: Dimensions) -> Self {
        self.attributes = Some(attributes);
        self
    }
}

/// Row emitted by the PostgreSQL statistics collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostgresRow {
    pub timestamp: RawTimestamp,
    pub metric_name: String,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub metadata: Option<Dimensions>,
}

/// Row emitted by the MongoDB collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MongoDbRow {
    pub timestamp: RawTimestamp,
    pub metric_id: String,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub metadata: Option<Dimensions>,
}

/// Row emitted by the New Relic collector (one per timeslice).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRelicRow {
    pub timestamp: RawTimestamp,
    pub name: String,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub attributes: Option<Dimensions>,
}

/// A row in the shape of the collector that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "collector", rename_all = "snake_case")]
pub enum CollectorRow {
    Postgres(PostgresRow),
    #[serde(rename = "mongodb")]
    MongoDb(MongoDbRow),
    #[serde(rename = "newrelic")]
    NewRelic(NewRelicRow),
    Common(SourceRow),
}

impl From<CollectorRow> for SourceRow {
    fn from(row: CollectorRow) -> Self {
        match row {
            CollectorRow::Postgres(r) => SourceRow {
                timestamp: r.timestamp,
                metric_key: r.metric_name,
                value: r.value,
                attributes: r.metadata,
            },
            CollectorRow::MongoDb(r) => SourceRow {
                timestamp: r.timestamp,
                metric_key: r.metric_id,
                value: r.value,
                attributes: r.metadata,
            },
            CollectorRow::NewRelic(r) => SourceRow {
                timestamp: r.timestamp,
                metric_key: r.name,
                value: r.value,
                attributes: r.attributes,
            },
            CollectorRow::Common(r) => r,
        }
    }
}

impl From<SourceRow> for CollectorRow {
    fn from(row: SourceRow) -> Self {
        Self::Common(row)
    }
}

impl From<PostgresRow> for CollectorRow {
    fn from(row: PostgresRow) -> Self {
        Self::Postgres(row)
    }
}

impl From<MongoDbRow> for CollectorRow {
    fn from(row: MongoDbRow) -> Self {
        Self::MongoDb(row)
    }
}

impl From<NewRelicRow> for CollectorRow {
    fn from(row: NewRelicRow) -> Self {
        Self::NewRelic(row)
    }
}

/// A row in the unified, pre-aggregation schema.
#[derive(Debug, Clone, PartialEq)]
pub struct UnifiedRow {
    pub timestamp: DateTime<Utc>,
    pub metric_name: String,
    pub value: Option<f64>,
    pub source: String,
    pub dimensions: Dimensions,
}

impl UnifiedRow {
    /// Maps a collector row onto the unified schema, stamping `source`.
    ///
    /// Non-finite values are treated as absent and missing attributes become
    /// an empty mapping.
    pub fn from_collector_row(source: &str, row: CollectorRow) -> Result<Self> {
        let row = SourceRow::from(row);
        let timestamp =
            row.timestamp
                .to_instant()
                .map_err(|message| UnifyError::InvalidTimestamp {
                    source_name: source.to_string(),
                    value: row.timestamp.to_string(),
                    message,
                })?;

        Ok(Self {
            timestamp,
            metric_name: row.metric_key,
            value: row.value.filter(|v| v.is_finite()),
            source: source.to_string(),
            dimensions: row.attributes.unwrap_or_default(),
        })
    }

    /// Key used for exact-duplicate detection. Values compare by bit pattern.
    pub(crate) fn identity(&self) -> (i64, u32, &str, Option<u64>, &str, &Dimensions) {
        (
            self.timestamp.timestamp(),
            self.timestamp.timestamp_subsec_nanos(),
            &self.metric_name,
            self.value.map(f64::to_bits),
            &self.source,
            &self.dimensions,
        )
    }
}
