//! CSV and JSON exports over the trace and annotation stores.
//!
//! Every export reads through the stores' fail-safe query API, so a broken
//! database yields an empty export rather than an error; only failures to
//! write the output are reported.

#![allow(clippy::missing_errors_doc)]

use std::collections::HashMap;
use std::io::Write;

use anyhow::{Context, Result};
use calltrace_core::{
    format_timestamp, to_storable, to_storable_text, Annotation, Judgment, ListQuery, Trace,
    TraceContext, TraceId, TraceStatus, TraceStore,
};
use calltrace_store_sqlite::{AnnotationQuery, SqliteAnnotationStore};
use serde::Serialize;
use serde_json::{Map, Value};

mod csv;

use crate::csv::{value_cell, CsvWriter};

pub const EXPORT_FORMAT_VERSION: &str = "1.0";
pub const DEFAULT_EXPORT_LIMIT: usize = 10_000;
pub const DEFAULT_JUDGE_LIMIT: usize = 1_000;

const JUDGE_DESCRIPTION: &str =
    "Training data for an LLM-as-judge: traces paired with a human judgment and critique";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceExportOptions {
    pub limit: usize,
    pub status: Option<TraceStatus>,
    /// CSV only; JSON always carries the context.
    pub include_context: bool,
}

impl Default for TraceExportOptions {
    fn default() -> Self {
        Self {
            limit: DEFAULT_EXPORT_LIMIT,
            status: None,
            include_context: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationExportOptions {
    pub limit: usize,
    pub judgment: Option<Judgment>,
    /// Attach the annotated trace's data when it can still be loaded.
    pub include_traces: bool,
}

impl Default for AnnotationExportOptions {
    fn default() -> Self {
        Self {
            limit: DEFAULT_EXPORT_LIMIT,
            judgment: None,
            include_traces: false,
        }
    }
}

fn select_traces(store: &dyn TraceStore, options: &TraceExportOptions) -> Vec<Trace> {
    store.list(&ListQuery::new(options.limit).with_status(options.status))
}

fn select_annotations(
    annotations: &SqliteAnnotationStore,
    options: &AnnotationExportOptions,
) -> Vec<Annotation> {
    annotations.list(&AnnotationQuery {
        limit: options.limit,
        judgment: options.judgment,
        ..AnnotationQuery::default()
    })
}

fn load_traces(store: &dyn TraceStore, annotations: &[Annotation]) -> HashMap<TraceId, Trace> {
    let mut traces = HashMap::new();
    for annotation in annotations {
        if traces.contains_key(&annotation.trace_id) {
            continue;
        }
        if let Some(trace) = store.load(annotation.trace_id) {
            traces.insert(annotation.trace_id, trace);
        }
    }
    traces
}

fn context_cell(context: Option<&TraceContext>) -> String {
    context.map_or_else(String::new, |context| {
        to_storable_text(&to_storable(context))
    })
}

fn metadata_cell(metadata: &Map<String, Value>) -> String {
    if metadata.is_empty() {
        String::new()
    } else {
        to_storable_text(&Value::Object(metadata.clone()))
    }
}

/// One CSV row per trace, newest first. Writes nothing when there is
/// nothing to export.
pub fn traces_to_csv<W: Write>(
    out: W,
    store: &dyn TraceStore,
    options: &TraceExportOptions,
) -> Result<usize> {
    let traces = select_traces(store, options);
    if traces.is_empty() {
        return Ok(0);
    }

    let mut header = vec![
        "id",
        "timestamp",
        "status",
        "duration_ms",
        "input",
        "output",
        "error",
    ];
    if options.include_context {
        header.push("context");
    }
    header.push("metadata");

    let mut writer = CsvWriter::new(out);
    writer.record(&header).context("failed to write CSV header")?;
    for trace in &traces {
        let mut row = vec![
            trace.id.to_string(),
            format_timestamp(trace.timestamp)?,
            trace.status.as_str().to_owned(),
            trace.duration_ms.map(|ms| ms.to_string()).unwrap_or_default(),
            value_cell(&trace.input),
            value_cell(&trace.output),
            trace.error.clone().unwrap_or_default(),
        ];
        if options.include_context {
            row.push(context_cell(trace.context.as_ref()));
        }
        row.push(metadata_cell(&trace.metadata));
        writer
            .record(&row)
            .with_context(|| format!("failed to write CSV row for trace {}", trace.id))?;
    }
    writer.finish().context("failed to flush CSV output")?;

    tracing::debug!(count = traces.len(), "exported traces as CSV");
    Ok(traces.len())
}

#[derive(Serialize)]
struct TraceDocument<'a> {
    version: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    count: usize,
    traces: &'a [Trace],
}

/// Pretty-printed `{version, type: "traces", count, traces}` document.
pub fn traces_to_json<W: Write>(
    out: W,
    store: &dyn TraceStore,
    options: &TraceExportOptions,
) -> Result<usize> {
    let traces = select_traces(store, options);
    let document = TraceDocument {
        version: EXPORT_FORMAT_VERSION,
        kind: "traces",
        count: traces.len(),
        traces: &traces,
    };
    write_json(out, &document)?;

    tracing::debug!(count = traces.len(), "exported traces as JSON");
    Ok(traces.len())
}

/// One CSV row per annotation, newest first; tags are comma-joined.
pub fn annotations_to_csv<W: Write>(
    out: W,
    annotations: &SqliteAnnotationStore,
    traces: &dyn TraceStore,
    options: &AnnotationExportOptions,
) -> Result<usize> {
    let selected = select_annotations(annotations, options);
    if selected.is_empty() {
        return Ok(0);
    }

    let mut header = vec![
        "id",
        "trace_id",
        "judgment",
        "critique",
        "tags",
        "annotator",
        "timestamp",
    ];
    if options.include_traces {
        header.extend(["trace_input", "trace_output"]);
    }
    let loaded = if options.include_traces {
        load_traces(traces, &selected)
    } else {
        HashMap::new()
    };

    let mut writer = CsvWriter::new(out);
    writer.record(&header).context("failed to write CSV header")?;
    for annotation in &selected {
        let mut row = vec![
            annotation.id.to_string(),
            annotation.trace_id.to_string(),
            annotation.judgment.as_str().to_owned(),
            annotation.critique.clone(),
            annotation.tags.join(","),
            annotation.annotator.clone(),
            format_timestamp(annotation.timestamp)?,
        ];
        if options.include_traces {
            match loaded.get(&annotation.trace_id) {
                Some(trace) => {
                    row.push(value_cell(&trace.input));
                    row.push(value_cell(&trace.output));
                }
                None => row.extend([String::new(), String::new()]),
            }
        }
        writer
            .record(&row)
            .with_context(|| format!("failed to write CSV row for annotation {}", annotation.id))?;
    }
    writer.finish().context("failed to flush CSV output")?;

    tracing::debug!(count = selected.len(), "exported annotations as CSV");
    Ok(selected.len())
}

#[derive(Serialize)]
struct AnnotationEntry<'a> {
    #[serde(flatten)]
    annotation: &'a Annotation,
    #[serde(skip_serializing_if = "Option::is_none")]
    trace: Option<&'a Trace>,
}

#[derive(Serialize)]
struct AnnotationDocument<'a> {
    version: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    count: usize,
    stats: Value,
    annotations: Vec<AnnotationEntry<'a>>,
}

/// `{version, type: "annotations", count, stats, annotations}`; `stats` is
/// an empty object when nothing was exported.
pub fn annotations_to_json<W: Write>(
    out: W,
    annotations: &SqliteAnnotationStore,
    traces: &dyn TraceStore,
    options: &AnnotationExportOptions,
) -> Result<usize> {
    let selected = select_annotations(annotations, options);
    let loaded = if options.include_traces {
        load_traces(traces, &selected)
    } else {
        HashMap::new()
    };
    let stats = if selected.is_empty() {
        Value::Object(Map::new())
    } else {
        to_storable(&annotations.stats())
    };

    let document = AnnotationDocument {
        version: EXPORT_FORMAT_VERSION,
        kind: "annotations",
        count: selected.len(),
        stats,
        annotations: selected
            .iter()
            .map(|annotation| AnnotationEntry {
                annotation,
                trace: loaded.get(&annotation.trace_id),
            })
            .collect(),
    };
    write_json(out, &document)?;

    tracing::debug!(count = selected.len(), "exported annotations as JSON");
    Ok(selected.len())
}

#[derive(Serialize)]
struct JudgeExample<'a> {
    input: &'a Value,
    output: &'a Value,
    context: Option<&'a TraceContext>,
    judgment: Judgment,
    critique: &'a str,
    tags: &'a [String],
}

#[derive(Serialize)]
struct JudgeDocument<'a> {
    version: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    description: &'static str,
    count: usize,
    pass_count: usize,
    fail_count: usize,
    examples: Vec<JudgeExample<'a>>,
}

/// Few-shot material for an automated judge: up to `limit / 2` passing and
/// `limit / 2` failing annotations, each paired with its trace. Annotations
/// whose trace is gone are left out of `examples` but still counted in
/// `pass_count` / `fail_count`. Returns the number of examples.
pub fn judge_training_json<W: Write>(
    out: W,
    annotations: &SqliteAnnotationStore,
    traces: &dyn TraceStore,
    limit: usize,
) -> Result<usize> {
    let per_judgment = |judgment| {
        annotations.list(&AnnotationQuery {
            limit: limit / 2,
            judgment: Some(judgment),
            ..AnnotationQuery::default()
        })
    };
    let passes = per_judgment(Judgment::Pass);
    let fails = per_judgment(Judgment::Fail);

    let mut selected = passes.clone();
    selected.extend(fails.iter().cloned());
    let loaded = load_traces(traces, &selected);

    let examples: Vec<JudgeExample<'_>> = selected
        .iter()
        .filter_map(|annotation| {
            let trace = loaded.get(&annotation.trace_id)?;
            Some(JudgeExample {
                input: &trace.input,
                output: &trace.output,
                context: trace.context.as_ref(),
                judgment: annotation.judgment,
                critique: &annotation.critique,
                tags: &annotation.tags,
            })
        })
        .collect();
    let count = examples.len();

    let document = JudgeDocument {
        version: EXPORT_FORMAT_VERSION,
        kind: "judge_training",
        description: JUDGE_DESCRIPTION,
        count,
        pass_count: passes.len(),
        fail_count: fails.len(),
        examples,
    };
    write_json(out, &document)?;

    tracing::debug!(count, "exported judge training examples");
    Ok(count)
}

fn write_json<W: Write, T: Serialize>(mut out: W, document: &T) -> Result<()> {
    serde_json::to_writer_pretty(&mut out, document).context("failed to write JSON export")?;
    out.write_all(b"\n").context("failed to write JSON export")?;
    out.flush().context("failed to flush JSON export")
}
