//! The `calltrace` command line: inspect, annotate and export the traces
//! recorded in a trace database.
//!
//! Every command writes a single JSON document to stdout; diagnostics go to
//! stderr through [`init_logging`].

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use calltrace_core::{Annotation, Judgment, ListQuery, TraceId, TraceStatus, TraceStore};
use calltrace_export::{
    annotations_to_csv, annotations_to_json, judge_training_json, traces_to_csv, traces_to_json,
    AnnotationExportOptions, TraceExportOptions, DEFAULT_EXPORT_LIMIT,
};
use calltrace_store_sqlite::{SqliteAnnotationStore, SqliteTraceStore};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::json;

mod logging;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};

pub const DB_PATH_ENV: &str = "CALLTRACE_DB";
pub const DEFAULT_DB_PATH: &str = "./calltrace.db";

const UNANNOTATED_SCAN_LIMIT: usize = 10_000;

#[derive(Debug, Parser)]
#[command(name = "calltrace", version)]
#[command(about = "Inspect, annotate and export recorded call traces")]
pub struct Cli {
    #[arg(long, global = true, env = DB_PATH_ENV, default_value = DEFAULT_DB_PATH)]
    db: PathBuf,

    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[arg(long, global = true, value_enum, default_value_t = LogFormatArg::Pretty)]
    log_format: LogFormatArg,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    #[must_use]
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            format: match self.log_format {
                LogFormatArg::Pretty => LogFormat::Pretty,
                LogFormatArg::Json => LogFormat::Json,
            },
            level: self.log_level.clone(),
        }
    }

    #[must_use]
    pub fn db(&self) -> &Path {
        &self.db
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Trace and annotation statistics.
    Stats,
    /// Recent traces, newest first.
    List(ListArgs),
    /// One trace with its annotations.
    Show(ShowArgs),
    Export(ExportArgs),
    /// Record a human judgment for a trace.
    Annotate(AnnotateArgs),
    /// Traces nobody has judged yet.
    Unannotated(UnannotatedArgs),
    /// Delete every trace.
    Clear(ClearArgs),
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(long, default_value_t = 20)]
    limit: usize,
    #[arg(long, default_value_t = 0)]
    offset: usize,
    #[arg(long, value_enum)]
    status: Option<StatusArg>,
}

#[derive(Debug, Args)]
pub struct ShowArgs {
    id: String,
}

#[derive(Debug, Args)]
pub struct ExportArgs {
    what: ExportWhat,
    #[arg(long, short = 'f', value_enum, default_value_t = ExportFormat::Json)]
    format: ExportFormat,
    #[arg(long, short = 'o')]
    output: PathBuf,
    #[arg(long, default_value_t = DEFAULT_EXPORT_LIMIT)]
    limit: usize,
    /// Embed trace input/output in annotation exports.
    #[arg(long)]
    include_traces: bool,
    #[arg(long, value_enum)]
    status: Option<StatusArg>,
}

#[derive(Debug, Args)]
pub struct AnnotateArgs {
    trace_id: String,
    #[arg(long, value_enum)]
    judgment: JudgmentArg,
    #[arg(long)]
    critique: String,
    #[arg(long = "tag")]
    tags: Vec<String>,
    #[arg(long, default_value = calltrace_core::DEFAULT_ANNOTATOR)]
    annotator: String,
}

#[derive(Debug, Args)]
pub struct UnannotatedArgs {
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

#[derive(Debug, Args)]
pub struct ClearArgs {
    /// Required; clearing cannot be undone.
    #[arg(long)]
    yes: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormatArg {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StatusArg {
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExportWhat {
    Traces,
    Annotations,
    Judge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExportFormat {
    Csv,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum JudgmentArg {
    Pass,
    Fail,
    Skip,
}

impl From<StatusArg> for TraceStatus {
    fn from(value: StatusArg) -> Self {
        match value {
            StatusArg::Success => TraceStatus::Success,
            StatusArg::Error => TraceStatus::Error,
        }
    }
}

impl From<JudgmentArg> for Judgment {
    fn from(value: JudgmentArg) -> Self {
        match value {
            JudgmentArg::Pass => Judgment::Pass,
            JudgmentArg::Fail => Judgment::Fail,
            JudgmentArg::Skip => Judgment::Skip,
        }
    }
}

/// Opens (and migrates) the database named by `--db` and runs the command,
/// printing its result to stdout.
///
/// # Errors
/// Returns an error when the database cannot be opened or the command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let store = SqliteTraceStore::open(&cli.db)
        .with_context(|| format!("failed to open trace database {}", cli.db.display()))?;
    tracing::debug!(db = %cli.db.display(), "opened trace database");

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    run_command(cli.command, &store, &mut out)
}

/// Runs one command against an open store, writing its JSON result to `out`.
///
/// # Errors
/// Returns an error when arguments are invalid, a referenced trace does not
/// exist, or writing the result fails.
pub fn run_command<W: Write>(command: Command, store: &SqliteTraceStore, out: &mut W) -> Result<()> {
    let annotations = store.annotations();
    let payload = match command {
        Command::Stats => stats(store, &annotations),
        Command::List(args) => {
            let query = ListQuery::new(args.limit)
                .with_offset(args.offset)
                .with_status(args.status.map(TraceStatus::from));
            serde_json::to_value(store.list(&query))?
        }
        Command::Show(args) => {
            let id = parse_trace_id(&args.id)?;
            let trace = store
                .load(id)
                .ok_or_else(|| anyhow!("trace not found: {id}"))?;
            json!({
                "trace": trace,
                "annotations": annotations.for_trace(id),
            })
        }
        Command::Export(args) => export(store, &annotations, &args)?,
        Command::Annotate(args) => annotate(store, &annotations, args)?,
        Command::Unannotated(args) => {
            let ids: Vec<String> = annotations
                .unannotated_traces(args.limit)
                .into_iter()
                .map(|id| id.to_string())
                .collect();
            json!(ids)
        }
        Command::Clear(args) => {
            if !args.yes {
                bail!("refusing to clear traces without --yes");
            }
            let removed = store.count(None);
            store.clear()?;
            tracing::info!(removed, "cleared trace database");
            json!({ "cleared": removed })
        }
    };

    writeln!(out, "{}", serde_json::to_string_pretty(&payload)?)
        .context("failed to write command output")?;
    Ok(())
}

fn stats(store: &SqliteTraceStore, annotations: &SqliteAnnotationStore) -> serde_json::Value {
    json!({
        "traces": {
            "total": store.count(None),
            "success": store.count(Some(TraceStatus::Success)),
            "error": store.count(Some(TraceStatus::Error)),
        },
        "annotations": annotations.stats(),
        "unannotated": annotations.unannotated_traces(UNANNOTATED_SCAN_LIMIT).len(),
    })
}

fn export(
    store: &SqliteTraceStore,
    annotations: &SqliteAnnotationStore,
    args: &ExportArgs,
) -> Result<serde_json::Value> {
    if args.what == ExportWhat::Judge && args.format == ExportFormat::Csv {
        bail!("judge export is only available as json");
    }

    let file = File::create(&args.output)
        .with_context(|| format!("failed to create {}", args.output.display()))?;
    let mut writer = BufWriter::new(file);

    let trace_options = TraceExportOptions {
        limit: args.limit,
        status: args.status.map(TraceStatus::from),
        include_context: true,
    };
    let annotation_options = AnnotationExportOptions {
        limit: args.limit,
        judgment: None,
        include_traces: args.include_traces,
    };

    let count = match (args.what, args.format) {
        (ExportWhat::Traces, ExportFormat::Csv) => traces_to_csv(&mut writer, store, &trace_options)?,
        (ExportWhat::Traces, ExportFormat::Json) => {
            traces_to_json(&mut writer, store, &trace_options)?
        }
        (ExportWhat::Annotations, ExportFormat::Csv) => {
            annotations_to_csv(&mut writer, annotations, store, &annotation_options)?
        }
        (ExportWhat::Annotations, ExportFormat::Json) => {
            annotations_to_json(&mut writer, annotations, store, &annotation_options)?
        }
        (ExportWhat::Judge, _) => judge_training_json(&mut writer, annotations, store, args.limit)?,
    };
    writer
        .flush()
        .with_context(|| format!("failed to write {}", args.output.display()))?;

    Ok(json!({
        "exported": count,
        "what": what_name(args.what),
        "format": match args.format {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
        },
        "output": args.output.display().to_string(),
    }))
}

fn what_name(what: ExportWhat) -> &'static str {
    match what {
        ExportWhat::Traces => "traces",
        ExportWhat::Annotations => "annotations",
        ExportWhat::Judge => "judge",
    }
}

fn annotate(
    store: &SqliteTraceStore,
    annotations: &SqliteAnnotationStore,
    args: AnnotateArgs,
) -> Result<serde_json::Value> {
    let trace_id = parse_trace_id(&args.trace_id)?;
    if store.load(trace_id).is_none() {
        bail!("trace not found: {trace_id}");
    }
    if args.critique.trim().is_empty() {
        bail!("--critique must not be empty");
    }

    let annotation = Annotation::new(trace_id, args.judgment.into(), args.critique)
        .with_tags(args.tags)
        .with_annotator(args.annotator);
    annotations.save(&annotation);

    let stored = annotations
        .load(annotation.id)
        .ok_or_else(|| anyhow!("annotation {} was not persisted", annotation.id))?;
    Ok(serde_json::to_value(stored)?)
}

fn parse_trace_id(raw: &str) -> Result<TraceId> {
    TraceId::parse(raw).with_context(|| format!("invalid trace id: {raw}"))
}
