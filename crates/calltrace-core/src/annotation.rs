//! Human review records attached to traces.
//!
//! Judgments are binary (pass/fail) with an explicit skip for traces that
//! cannot be evaluated. Tags on failing annotations form the failure
//! taxonomy.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::{now_utc, truncate_to_micros, CoreError, TraceId};

pub const DEFAULT_ANNOTATOR: &str = "default";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Judgment {
    Pass,
    Fail,
    Skip,
}

impl Judgment {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Skip => "skip",
        }
    }

    /// # Errors
    /// Returns [`CoreError::Validation`] for anything but `pass`, `fail` or `skip`.
    pub fn parse(value: &str) -> Result<Self, CoreError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pass" => Ok(Self::Pass),
            "fail" => Ok(Self::Fail),
            "skip" => Ok(Self::Skip),
            other => Err(CoreError::Validation(format!(
                "unsupported judgment '{other}'; expected pass, fail or skip"
            ))),
        }
    }
}

impl Display for Judgment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct AnnotationId(pub Ulid);

impl AnnotationId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// # Errors
    /// Returns [`CoreError::InvalidId`] when `value` is not a ULID.
    pub fn parse(value: &str) -> Result<Self, CoreError> {
        Ulid::from_str(value.trim())
            .map(Self)
            .map_err(|err| CoreError::InvalidId(format!("invalid annotation id '{value}': {err}")))
    }
}

impl Default for AnnotationId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for AnnotationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Annotation {
    pub id: AnnotationId,
    pub trace_id: TraceId,
    pub judgment: Judgment,
    pub critique: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub annotator: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Annotation {
    #[must_use]
    pub fn new(trace_id: TraceId, judgment: Judgment, critique: impl Into<String>) -> Self {
        Self {
            id: AnnotationId::new(),
            trace_id,
            judgment,
            critique: critique.into(),
            tags: Vec::new(),
            annotator: DEFAULT_ANNOTATOR.to_owned(),
            timestamp: now_utc(),
            metadata: Map::new(),
        }
    }

    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_annotator(mut self, annotator: impl Into<String>) -> Self {
        self.annotator = annotator.into();
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
    pub fn is_pass(&self) -> bool {
        self.judgment == Judgment::Pass
    }

    #[must_use]
    pub fn is_fail(&self) -> bool {
        self.judgment == Judgment::Fail
    }
}

/// Few-shot example for training an automated judge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JudgeExample {
    pub trace_id: TraceId,
    pub judgment: Judgment,
    pub critique: String,
    pub tags: Vec<String>,
}

impl From<&Annotation> for JudgeExample {
    fn from(annotation: &Annotation) -> Self {
        Self {
            trace_id: annotation.trace_id,
            judgment: annotation.judgment,
            critique: annotation.critique.clone(),
            tags: annotation.tags.clone(),
        }
    }
}

/// A named review session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnnotationSet {
    pub name: String,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl AnnotationSet {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            annotations: Vec::new(),
            created_at: now_utc(),
            metadata: Map::new(),
        }
    }

    pub fn add(&mut self, annotation: Annotation) {
        self.annotations.push(annotation);
    }

    #[must_use]
    pub fn pass_count(&self) -> u64 {
        self.annotations.iter().filter(|a| a.is_pass()).count() as u64
    }

    #[must_use]
    pub fn fail_count(&self) -> u64 {
        self.annotations.iter().filter(|a| a.is_fail()).count() as u64
    }

    /// Percentage of passes among pass/fail judgments; skips are ignored.
    #[must_use]
    pub fn pass_rate(&self) -> f64 {
        pass_rate(self.pass_count(), self.fail_count())
    }

    #[must_use]
    pub fn failure_taxonomy(&self) -> Vec<(String, u64)> {
        failure_taxonomy(
            self.annotations
                .iter()
                .filter(|a| a.is_fail())
                .map(|a| &a.tags),
        )
    }

    #[must_use]
    pub fn export_for_judge(&self) -> Vec<JudgeExample> {
        self.annotations
            .iter()
            .filter(|a| a.judgment != Judgment::Skip)
            .map(JudgeExample::from)
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct AnnotationStats {
    pub total: u64,
    pub pass: u64,
    pub fail: u64,
    pub skip: u64,
    /// Percent, rounded to one decimal.
    pub pass_rate: f64,
    #[serde(serialize_with = "serialize_taxonomy")]
    pub failure_taxonomy: Vec<(String, u64)>,
}

impl AnnotationStats {
    #[must_use]
    pub fn new(total: u64, pass: u64, fail: u64, skip: u64, taxonomy: Vec<(String, u64)>) -> Self {
        let rate = pass_rate(pass, fail);
        Self {
            total,
            pass,
            fail,
            skip,
            pass_rate: (rate * 10.0).round() / 10.0,
            failure_taxonomy: taxonomy,
        }
    }
}

fn serialize_taxonomy<S: Serializer>(
    taxonomy: &[(String, u64)],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_map(taxonomy.iter().map(|(tag, count)| (tag, count)))
}

#[allow(clippy::cast_precision_loss)]
fn pass_rate(pass: u64, fail: u64) -> f64 {
    let judged = pass + fail;
    if judged == 0 {
        return 0.0;
    }
    pass as f64 / judged as f64 * 100.0
}

/// Counts tags across the given tag lists, most frequent first, ties by tag.
pub fn failure_taxonomy<'a, I>(tag_lists: I) -> Vec<(String, u64)>
where
    I: IntoIterator<Item = &'a Vec<String>>,
{
    let mut counts: HashMap<&str, u64> = HashMap::new();
    for tags in tag_lists {
        for tag in tags {
            *counts.entry(tag.as_str()).or_insert(0) += 1;
        }
    }

    let mut taxonomy: Vec<(String, u64)> = counts
        .into_iter()
        .map(|(tag, count)| (tag.to_owned(), count))
        .collect();
    taxonomy.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    taxonomy
}
