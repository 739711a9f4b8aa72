//! Core value types for call tracing.
//!
//! A [`Trace`] is the immutable record of one instrumented call. It is built
//! once, handed to a [`TraceStore`], and never mutated afterwards. Payloads
//! (`input`, `output`, context data, metadata) are plain `serde_json` values
//! produced by the total capture in [`to_storable`].

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

mod annotation;
mod capture;
mod store;

pub use annotation::{
    failure_taxonomy, Annotation, AnnotationId, AnnotationSet, AnnotationStats, JudgeExample,
    Judgment, DEFAULT_ANNOTATOR,
};
pub use capture::{
    debug_text, from_storable_text, to_storable, to_storable_text, Bytes, MessageLike, Model,
    ModelDump, Message, Opaque,
};
pub use store::{ListQuery, TraceStore, DEFAULT_LIST_LIMIT};

pub const META_FUNCTION_NAME: &str = "function_name";
pub const META_IS_ASYNC: &str = "is_async";
pub const META_AGENT_NAME: &str = "agent_name";
pub const META_METHOD: &str = "method";

/// Key under which a failed stream records the chunks it had already produced.
pub const PARTIAL_CHUNKS_KEY: &str = "partial_chunks";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("timestamp error: {0}")]
    Timestamp(String),
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TraceId(pub Ulid);

impl TraceId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parses the canonical 26-character ULID text form.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidId`] when `value` is not a ULID.
    pub fn parse(value: &str) -> Result<Self, CoreError> {
        Ulid::from_str(value.trim())
            .map(Self)
            .map_err(|err| CoreError::InvalidId(format!("invalid trace id '{value}': {err}")))
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for TraceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Success,
    Error,
}

impl TraceStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(Self::Success),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl Display for TraceStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Auxiliary data available while a call runs, e.g. a record fetched from a
/// collaborating system. Embedded into the trace it decorates.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TraceContext {
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub source: Option<String>,
}

impl TraceContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_data(data: Map<String, Value>) -> Self {
        Self { data, source: None }
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    #[must_use]
    pub fn with<T: Serialize + ?Sized>(mut self, key: impl Into<String>, value: &T) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert<T: Serialize + ?Sized>(&mut self, key: impl Into<String>, value: &T) {
        self.data.insert(key.into(), to_storable(value));
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trace {
    pub id: TraceId,
    pub input: Value,
    pub output: Value,
    pub context: Option<TraceContext>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub duration_ms: Option<f64>,
    pub status: TraceStatus,
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Trace {
    /// A successful call record. `error` is absent by construction.
    #[must_use]
    pub fn success(input: Value, output: Value) -> Self {
        Self {
            id: TraceId::new(),
            input,
            output,
            context: None,
            timestamp: now_utc(),
            duration_ms: None,
            status: TraceStatus::Success,
            error: None,
            metadata: Map::new(),
        }
    }

    /// A failed call record. `output` starts out null; `error` is always set.
    #[must_use]
    pub fn failure(input: Value, error: impl Into<String>) -> Self {
        Self {
            id: TraceId::new(),
            input,
            output: Value::Null,
            context: None,
            timestamp: now_utc(),
            duration_ms: None,
            status: TraceStatus::Error,
            error: Some(error.into()),
            metadata: Map::new(),
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: TraceId) -> Self {
        self.id = id;
        self
    }

    #[must_use]
    pub fn with_output(mut self, output: Value) -> Self {
        self.output = output;
        self
    }

    #[must_use]
    pub fn with_context(mut self, context: Option<TraceContext>) -> Self {
        self.context = context;
        self
    }

    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: Option<f64>) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: OffsetDateTime) -> Self {
        self.timestamp = truncate_to_micros(timestamp);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == TraceStatus::Success
    }

    /// Checks the status/error pairing and the duration.
    ///
    /// # Errors
    /// Returns [`CoreError::Validation`] when an error trace has no error text,
    /// a success trace carries one, or the duration is negative or not finite.
    pub fn validate(&self) -> Result<(), CoreError> {
        match (self.status, &self.error) {
            (TraceStatus::Error, None) => {
                return Err(CoreError::Validation(format!(
                    "trace {} has status=error but no error text",
                    self.id
                )));
            }
            (TraceStatus::Success, Some(_)) => {
                return Err(CoreError::Validation(format!(
                    "trace {} has status=success but carries error text",
                    self.id
                )));
            }
            _ => {}
        }

        if let Some(duration) = self.duration_ms {
            if !duration.is_finite() || duration < 0.0 {
                return Err(CoreError::Validation(format!(
                    "trace {} has invalid duration_ms {duration}",
                    self.id
                )));
            }
        }

        Ok(())
    }
}

/// Current UTC time at the precision timestamps are stored with.
#[must_use]
pub fn now_utc() -> OffsetDateTime {
    truncate_to_micros(OffsetDateTime::now_utc())
}

#[must_use]
pub fn truncate_to_micros(value: OffsetDateTime) -> OffsetDateTime {
    let value = value.to_offset(UtcOffset::UTC);
    value
        .replace_nanosecond(value.nanosecond() / 1_000 * 1_000)
        .unwrap_or(value)
}

/// Fixed-width UTC text (microsecond precision) so that lexical order of the
/// stored column equals chronological order.
///
/// # Errors
/// Returns [`CoreError::Timestamp`] when the value cannot be formatted.
pub fn format_timestamp(value: OffsetDateTime) -> Result<String, CoreError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
        ))
        .map_err(|err| CoreError::Timestamp(format!("failed to format timestamp: {err}")))
}

/// # Errors
/// Returns [`CoreError::Timestamp`] when `value` is not RFC 3339.
pub fn parse_timestamp(value: &str) -> Result<OffsetDateTime, CoreError> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map(|parsed| parsed.to_offset(UtcOffset::UTC))
        .map_err(|err| CoreError::Timestamp(format!("invalid RFC3339 timestamp '{value}': {err}")))
}
