#![allow(clippy::missing_errors_doc)]

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use calltrace_core::{
    format_timestamp, from_storable_text, now_utc, parse_timestamp, to_storable,
    to_storable_text, ListQuery, Trace, TraceContext, TraceId, TraceStatus, TraceStore,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};

mod annotations;

pub use annotations::{AnnotationQuery, SqliteAnnotationStore};

const SCHEMA_VERSION: i64 = 1;
const ITER_PAGE_SIZE: usize = 256;

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS traces (
  id TEXT PRIMARY KEY,
  input TEXT NOT NULL,
  output TEXT NOT NULL,
  context TEXT,
  timestamp TEXT NOT NULL,
  duration_ms REAL,
  status TEXT NOT NULL CHECK (status IN ('success', 'error')),
  error TEXT,
  metadata TEXT,
  CHECK ((status = 'error') = (error IS NOT NULL))
);

CREATE INDEX IF NOT EXISTS idx_traces_timestamp ON traces(timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_traces_status ON traces(status);

CREATE TABLE IF NOT EXISTS annotations (
  id TEXT PRIMARY KEY,
  trace_id TEXT NOT NULL,
  judgment TEXT NOT NULL CHECK (judgment IN ('pass', 'fail', 'skip')),
  critique TEXT NOT NULL,
  tags TEXT NOT NULL DEFAULT '[]',
  annotator TEXT NOT NULL DEFAULT 'default',
  timestamp TEXT NOT NULL,
  metadata TEXT
);

CREATE INDEX IF NOT EXISTS idx_annotations_trace_id ON annotations(trace_id);
CREATE INDEX IF NOT EXISTS idx_annotations_judgment ON annotations(judgment);
CREATE INDEX IF NOT EXISTS idx_annotations_annotator ON annotations(annotator);
CREATE INDEX IF NOT EXISTS idx_annotations_timestamp ON annotations(timestamp DESC);

CREATE TABLE IF NOT EXISTS annotation_sets (
  name TEXT PRIMARY KEY,
  created_at TEXT NOT NULL,
  metadata TEXT
);

CREATE TABLE IF NOT EXISTS annotation_set_members (
  set_name TEXT NOT NULL,
  annotation_id TEXT NOT NULL,
  position INTEGER NOT NULL,
  PRIMARY KEY (set_name, annotation_id),
  FOREIGN KEY (set_name) REFERENCES annotation_sets(name) ON DELETE CASCADE,
  FOREIGN KEY (annotation_id) REFERENCES annotations(id) ON DELETE CASCADE
);
";

const TRACE_COLUMNS: &str =
    "id, input, output, context, timestamp, duration_ms, status, error, metadata";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub busy_timeout: Duration,
}

impl StoreConfig {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }
}

/// Connections are shared only between handles opened with the same
/// configuration, so each handle keeps its own busy timeout.
type ConnectionKey = (PathBuf, Duration);

thread_local! {
    static CONNECTIONS: RefCell<HashMap<ConnectionKey, Connection>> = RefCell::new(HashMap::new());
}

enum Backing {
    File(StoreConfig),
    Memory(Mutex<Connection>),
}

/// Connection source shared by the trace and annotation stores.
///
/// File-backed databases hand every OS thread its own connection, cached
/// per path and busy timeout. The in-memory variant owns one connection behind a mutex.
pub(crate) struct Database {
    backing: Backing,
    write_lock: Mutex<()>,
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("sqlite store mutex poisoned, recovering");
        poisoned.into_inner()
    })
}

impl Database {
    fn file(config: StoreConfig) -> Self {
        Self {
            backing: Backing::File(config),
            write_lock: Mutex::new(()),
        }
    }

    fn memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite")?;
        configure(&conn, DEFAULT_BUSY_TIMEOUT)?;
        apply_schema(&conn)?;
        Ok(Self {
            backing: Backing::Memory(Mutex::new(conn)),
            write_lock: Mutex::new(()),
        })
    }

    pub(crate) fn label(&self) -> String {
        match &self.backing {
            Backing::File(config) => config.path.display().to_string(),
            Backing::Memory(_) => ":memory:".to_owned(),
        }
    }

    fn path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::File(config) => Some(config.path.as_path()),
            Backing::Memory(_) => None,
        }
    }

    /// Runs `f` on this thread's connection. `f` must not call back into the
    /// same database.
    pub(crate) fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        match &self.backing {
            Backing::Memory(conn) => {
                let guard = lock_or_recover(conn);
                f(&guard)
            }
            Backing::File(config) => {
                let key = (config.path.clone(), config.busy_timeout);
                let cached = CONNECTIONS
                    .try_with(|cell| cell.borrow_mut().remove(&key))
                    .ok()
                    .flatten();
                let conn = match cached {
                    Some(conn) => conn,
                    None => open_file_connection(config)?,
                };
                let result = f(&conn);
                let _ = CONNECTIONS.try_with(|cell| {
                    cell.borrow_mut().insert(key, conn);
                });
                result
            }
        }
    }

    pub(crate) fn write<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let _guard = lock_or_recover(&self.write_lock);
        self.read(f)
    }
}

fn open_file_connection(config: &StoreConfig) -> Result<Connection> {
    let conn = Connection::open(&config.path).with_context(|| {
        format!(
            "failed to open sqlite database at {}",
            config.path.display()
        )
    })?;
    configure(&conn, config.busy_timeout)?;
    apply_schema(&conn)?;
    tracing::debug!(db = %config.path.display(), "opened sqlite connection");
    Ok(conn)
}

fn configure(conn: &Connection, busy_timeout: Duration) -> Result<()> {
    conn.busy_timeout(busy_timeout)
        .context("failed to set sqlite busy timeout")?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;",
    )
    .context("failed to configure sqlite pragmas")?;
    Ok(())
}

fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        );",
    )
    .context("failed to ensure schema_migrations exists")?;

    conn.execute_batch(SCHEMA_V1)
        .context("failed to apply calltrace schema")?;

    let now = format_timestamp(now_utc())?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![SCHEMA_VERSION, now],
    )
    .context("failed to register calltrace schema migration")?;

    Ok(())
}

fn to_sql_count(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_sql_count(value: i64) -> Result<u64> {
    u64::try_from(value).with_context(|| format!("invalid row count: {value}"))
}

fn report_fault(operation: &'static str, db: &str, trace_id: Option<TraceId>, err: &anyhow::Error) {
    match trace_id {
        Some(id) => tracing::warn!(
            operation,
            trace_id = %id,
            db,
            error = %format!("{err:#}"),
            "trace storage fault masked"
        ),
        None => tracing::warn!(
            operation,
            db,
            error = %format!("{err:#}"),
            "trace storage fault masked"
        ),
    }
}

/// A stored row as raw text, before it is decoded into a [`Trace`].
struct TraceRow {
    id: String,
    input: String,
    output: String,
    context: Option<String>,
    timestamp: String,
    duration_ms: Option<f64>,
    status: String,
    error: Option<String>,
    metadata: Option<String>,
}

impl TraceRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            input: row.get(1)?,
            output: row.get(2)?,
            context: row.get(3)?,
            timestamp: row.get(4)?,
            duration_ms: row.get(5)?,
            status: row.get(6)?,
            error: row.get(7)?,
            metadata: row.get(8)?,
        })
    }

    fn decode(self) -> Result<Trace> {
        let id = TraceId::parse(&self.id)?;
        let status = TraceStatus::parse(&self.status)
            .ok_or_else(|| anyhow!("trace {id} has unknown status '{}'", self.status))?;
        let context = match self.context.as_deref() {
            None => None,
            Some(text) => Some(
                serde_json::from_value::<TraceContext>(from_storable_text(text))
                    .with_context(|| format!("trace {id} has an undecodable context"))?,
            ),
        };
        let metadata = match from_storable_text(self.metadata.as_deref().unwrap_or_default()) {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut wrapped = Map::new();
                wrapped.insert("value".to_owned(), other);
                wrapped
            }
        };

        let trace = Trace {
            id,
            input: from_storable_text(&self.input),
            output: from_storable_text(&self.output),
            context,
            timestamp: parse_timestamp(&self.timestamp)?,
            duration_ms: self.duration_ms,
            status,
            error: self.error,
            metadata,
        };
        trace.validate()?;
        Ok(trace)
    }
}

/// SQLite-backed [`TraceStore`].
///
/// `new` never touches the database; the schema is created the first time a
/// thread uses its connection. Use `open` to surface setup faults eagerly.
#[derive(Clone)]
pub struct SqliteTraceStore {
    db: Arc<Database>,
}

impl SqliteTraceStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_config(StoreConfig::new(path))
    }

    #[must_use]
    pub fn with_config(config: StoreConfig) -> Self {
        Self {
            db: Arc::new(Database::file(config)),
        }
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let store = Self::new(path);
        store.migrate()?;
        Ok(store)
    }

    /// A private database that lives as long as this handle and its clones.
    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            db: Arc::new(Database::memory()?),
        })
    }

    pub fn migrate(&self) -> Result<()> {
        self.db.write(apply_schema)
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.db.path()
    }

    /// Annotation store over the same database.
    #[must_use]
    pub fn annotations(&self) -> SqliteAnnotationStore {
        SqliteAnnotationStore::from_database(Arc::clone(&self.db))
    }

    fn try_save(&self, trace: &Trace) -> Result<()> {
        trace.validate()?;
        let context = trace
            .context
            .as_ref()
            .map(|context| to_storable_text(&to_storable(context)));
        let metadata = if trace.metadata.is_empty() {
            None
        } else {
            Some(to_storable_text(&Value::Object(trace.metadata.clone())))
        };
        let timestamp = format_timestamp(trace.timestamp)?;

        self.db.write(|conn| {
            conn.execute(
                "INSERT INTO traces (id, input, output, context, timestamp, duration_ms, status, error, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(id) DO UPDATE SET
                   input = excluded.input,
                   output = excluded.output,
                   context = excluded.context,
                   timestamp = excluded.timestamp,
                   duration_ms = excluded.duration_ms,
                   status = excluded.status,
                   error = excluded.error,
                   metadata = excluded.metadata",
                params![
                    trace.id.to_string(),
                    to_storable_text(&trace.input),
                    to_storable_text(&trace.output),
                    context,
                    timestamp,
                    trace.duration_ms,
                    trace.status.as_str(),
                    trace.error,
                    metadata,
                ],
            )
            .with_context(|| format!("failed to upsert trace {}", trace.id))?;
            Ok(())
        })
    }

    fn try_load(&self, id: TraceId) -> Result<Option<Trace>> {
        let row = self.db.read(|conn| {
            conn.query_row(
                &format!("SELECT {TRACE_COLUMNS} FROM traces WHERE id = ?1"),
                params![id.to_string()],
                TraceRow::read,
            )
            .optional()
            .with_context(|| format!("failed to query trace {id}"))
        })?;
        row.map(TraceRow::decode).transpose()
    }

    fn try_list(&self, query: &ListQuery) -> Result<Vec<Trace>> {
        let rows = self.db.read(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {TRACE_COLUMNS} FROM traces
                     WHERE (?1 IS NULL OR status = ?1)
                     ORDER BY timestamp DESC, id DESC
                     LIMIT ?2 OFFSET ?3"
                ))
                .context("failed to prepare trace listing")?;
            let rows = stmt
                .query_map(
                    params![
                        query.status.map(TraceStatus::as_str),
                        to_sql_count(query.limit),
                        to_sql_count(query.offset),
                    ],
                    TraceRow::read,
                )
                .context("failed to list traces")?;
            collect_rows(rows)
        })?;
        Ok(self.decode_rows("list", rows))
    }

    fn try_count(&self, status: Option<TraceStatus>) -> Result<u64> {
        let count = self.db.read(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM traces WHERE (?1 IS NULL OR status = ?1)",
                params![status.map(TraceStatus::as_str)],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to count traces")
        })?;
        from_sql_count(count)
    }

    /// One keyset page strictly after `cursor` in listing order.
    fn fetch_page(&self, cursor: Option<&(String, String)>) -> Result<Vec<TraceRow>> {
        self.db.read(|conn| {
            let page = to_sql_count(ITER_PAGE_SIZE);
            let rows = match cursor {
                None => {
                    let mut stmt = conn
                        .prepare(&format!(
                            "SELECT {TRACE_COLUMNS} FROM traces
                             ORDER BY timestamp DESC, id DESC LIMIT ?1"
                        ))
                        .context("failed to prepare first trace page")?;
                    let rows = stmt
                        .query_map(params![page], TraceRow::read)
                        .context("failed to read first trace page")?;
                    collect_rows(rows)?
                }
                Some((timestamp, id)) => {
                    let mut stmt = conn
                        .prepare(&format!(
                            "SELECT {TRACE_COLUMNS} FROM traces
                             WHERE (timestamp, id) < (?1, ?2)
                             ORDER BY timestamp DESC, id DESC LIMIT ?3"
                        ))
                        .context("failed to prepare trace page")?;
                    let rows = stmt
                        .query_map(params![timestamp, id, page], TraceRow::read)
                        .context("failed to read trace page")?;
                    collect_rows(rows)?
                }
            };
            Ok(rows)
        })
    }

    fn decode_rows(&self, operation: &'static str, rows: Vec<TraceRow>) -> Vec<Trace> {
        rows.into_iter()
            .filter_map(|row| match row.decode() {
                Ok(trace) => Some(trace),
                Err(err) => {
                    report_fault(operation, &self.db.label(), None, &err);
                    None
                }
            })
            .collect()
    }

    fn try_clear(&self) -> Result<()> {
        self.db.write(|conn| {
            conn.execute("DELETE FROM traces", [])
                .context("failed to clear traces")?;
            Ok(())
        })
    }

    #[cfg(test)]
    fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        self.db.read(f)
    }
}

impl TraceStore for SqliteTraceStore {
    fn save(&self, trace: &Trace) {
        if let Err(err) = self.try_save(trace) {
            report_fault("save", &self.db.label(), Some(trace.id), &err);
        }
    }

    fn load(&self, id: TraceId) -> Option<Trace> {
        self.try_load(id).unwrap_or_else(|err| {
            report_fault("load", &self.db.label(), Some(id), &err);
            None
        })
    }

    fn list(&self, query: &ListQuery) -> Vec<Trace> {
        self.try_list(query).unwrap_or_else(|err| {
            report_fault("list", &self.db.label(), None, &err);
            Vec::new()
        })
    }

    fn count(&self, status: Option<TraceStatus>) -> u64 {
        self.try_count(status).unwrap_or_else(|err| {
            report_fault("count", &self.db.label(), None, &err);
            0
        })
    }

    fn iter(&self) -> Box<dyn Iterator<Item = Trace> + Send + '_> {
        Box::new(TracePages {
            store: self,
            buffer: VecDeque::new(),
            cursor: None,
            exhausted: false,
        })
    }

    fn clear(&self) -> Result<()> {
        self.try_clear()
    }
}

struct TracePages<'a> {
    store: &'a SqliteTraceStore,
    buffer: VecDeque<Trace>,
    cursor: Option<(String, String)>,
    exhausted: bool,
}

impl Iterator for TracePages<'_> {
    type Item = Trace;

    fn next(&mut self) -> Option<Trace> {
        while self.buffer.is_empty() && !self.exhausted {
            let rows = match self.store.fetch_page(self.cursor.as_ref()) {
                Ok(rows) => rows,
                Err(err) => {
                    report_fault("iterate", &self.store.db.label(), None, &err);
                    self.exhausted = true;
                    break;
                }
            };
            if rows.len() < ITER_PAGE_SIZE {
                self.exhausted = true;
            }
            if let Some(last) = rows.last() {
                self.cursor = Some((last.timestamp.clone(), last.id.clone()));
            }
            self.buffer
                .extend(self.store.decode_rows("iterate", rows));
        }
        self.buffer.pop_front()
    }
}

pub(crate) fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
