use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use calltrace_core::{
    failure_taxonomy, format_timestamp, from_storable_text, parse_timestamp, to_storable_text,
    Annotation, AnnotationId, AnnotationSet, AnnotationStats, Judgment, TraceId,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};

use crate::{collect_rows, from_sql_count, to_sql_count, Database, StoreConfig};

const ANNOTATION_COLUMNS: &str =
    "id, trace_id, judgment, critique, tags, annotator, timestamp, metadata";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationQuery {
    pub limit: usize,
    pub offset: usize,
    pub judgment: Option<Judgment>,
    pub annotator: Option<String>,
    pub tag: Option<String>,
}

impl Default for AnnotationQuery {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
            judgment: None,
            annotator: None,
            tag: None,
        }
    }
}

fn report_fault(
    operation: &'static str,
    db: &str,
    annotation_id: Option<AnnotationId>,
    err: &anyhow::Error,
) {
    match annotation_id {
        Some(id) => tracing::warn!(
            operation,
            annotation_id = %id,
            db,
            error = %format!("{err:#}"),
            "annotation storage fault masked"
        ),
        None => tracing::warn!(
            operation,
            db,
            error = %format!("{err:#}"),
            "annotation storage fault masked"
        ),
    }
}

struct AnnotationRow {
    id: String,
    trace_id: String,
    judgment: String,
    critique: String,
    tags: Option<String>,
    annotator: String,
    timestamp: String,
    metadata: Option<String>,
}

impl AnnotationRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            trace_id: row.get(1)?,
            judgment: row.get(2)?,
            critique: row.get(3)?,
            tags: row.get(4)?,
            annotator: row.get(5)?,
            timestamp: row.get(6)?,
            metadata: row.get(7)?,
        })
    }

    fn decode(self) -> Result<Annotation> {
        let tags = decode_tags(self.tags.as_deref())?;
        let metadata = match from_storable_text(self.metadata.as_deref().unwrap_or_default()) {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Ok(Annotation {
            id: AnnotationId::parse(&self.id)?,
            trace_id: TraceId::parse(&self.trace_id)?,
            judgment: Judgment::parse(&self.judgment)?,
            critique: self.critique,
            tags,
            annotator: self.annotator,
            timestamp: parse_timestamp(&self.timestamp)?,
            metadata,
        })
    }
}

fn decode_tags(raw: Option<&str>) -> Result<Vec<String>> {
    match raw {
        None | Some("") => Ok(Vec::new()),
        Some(text) => serde_json::from_str(text).context("invalid stored tags JSON"),
    }
}

/// SQLite-backed annotation store. Fail-safe like the trace store: faults
/// are logged and replaced by empty results.
#[derive(Clone)]
pub struct SqliteAnnotationStore {
    db: Arc<Database>,
}

impl SqliteAnnotationStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::from_database(Arc::new(Database::file(StoreConfig::new(path))))
    }

    pub(crate) fn from_database(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn save(&self, annotation: &Annotation) {
        if let Err(err) = self.db.write(|conn| insert_annotation(conn, annotation)) {
            report_fault("save", &self.db.label(), Some(annotation.id), &err);
        }
    }

    #[must_use]
    pub fn load(&self, id: AnnotationId) -> Option<Annotation> {
        let loaded = self.db.read(|conn| {
            conn.query_row(
                &format!("SELECT {ANNOTATION_COLUMNS} FROM annotations WHERE id = ?1"),
                params![id.to_string()],
                AnnotationRow::read,
            )
            .optional()
            .with_context(|| format!("failed to query annotation {id}"))
        });
        match loaded.and_then(|row| row.map(AnnotationRow::decode).transpose()) {
            Ok(annotation) => annotation,
            Err(err) => {
                report_fault("load", &self.db.label(), Some(id), &err);
                None
            }
        }
    }

    /// Annotations of one trace, newest first.
    #[must_use]
    pub fn for_trace(&self, trace_id: TraceId) -> Vec<Annotation> {
        let rows = self.db.read(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {ANNOTATION_COLUMNS} FROM annotations
                     WHERE trace_id = ?1
                     ORDER BY timestamp DESC, id DESC"
                ))
                .context("failed to prepare annotations-for-trace query")?;
            let rows = stmt
                .query_map(params![trace_id.to_string()], AnnotationRow::read)
                .context("failed to query annotations for trace")?;
            collect_rows(rows)
        });
        self.decode_or_report("for_trace", rows)
    }

    #[must_use]
    pub fn list(&self, query: &AnnotationQuery) -> Vec<Annotation> {
        let rows = self.db.read(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {ANNOTATION_COLUMNS} FROM annotations
                     WHERE (?1 IS NULL OR judgment = ?1)
                       AND (?2 IS NULL OR annotator = ?2)
                       AND (?3 IS NULL OR EXISTS (
                             SELECT 1 FROM json_each(annotations.tags) WHERE json_each.value = ?3))
                     ORDER BY timestamp DESC, id DESC
                     LIMIT ?4 OFFSET ?5"
                ))
                .context("failed to prepare annotation listing")?;
            let rows = stmt
                .query_map(
                    params![
                        query.judgment.map(Judgment::as_str),
                        query.annotator.as_deref(),
                        query.tag.as_deref(),
                        to_sql_count(query.limit),
                        to_sql_count(query.offset),
                    ],
                    AnnotationRow::read,
                )
                .context("failed to list annotations")?;
            collect_rows(rows)
        });
        self.decode_or_report("list", rows)
    }

    #[must_use]
    pub fn count(&self, judgment: Option<Judgment>, annotator: Option<&str>) -> u64 {
        let counted = self.db.read(|conn| {
            let count = conn
                .query_row(
                    "SELECT COUNT(*) FROM annotations
                     WHERE (?1 IS NULL OR judgment = ?1)
                       AND (?2 IS NULL OR annotator = ?2)",
                    params![judgment.map(Judgment::as_str), annotator],
                    |row| row.get::<_, i64>(0),
                )
                .context("failed to count annotations")?;
            from_sql_count(count)
        });
        counted.unwrap_or_else(|err| {
            report_fault("count", &self.db.label(), None, &err);
            0
        })
    }

    /// Ids of traces nobody has annotated yet, newest first.
    #[must_use]
    pub fn unannotated_traces(&self, limit: usize) -> Vec<TraceId> {
        let ids = self.db.read(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT t.id FROM traces t
                     WHERE NOT EXISTS (SELECT 1 FROM annotations a WHERE a.trace_id = t.id)
                     ORDER BY t.timestamp DESC, t.id DESC
                     LIMIT ?1",
                )
                .context("failed to prepare unannotated trace query")?;
            let rows = stmt
                .query_map(params![to_sql_count(limit)], |row| row.get::<_, String>(0))
                .context("failed to query unannotated traces")?;
            collect_rows(rows)
        });
        match ids {
            Ok(ids) => ids
                .iter()
                .filter_map(|raw| match TraceId::parse(raw) {
                    Ok(id) => Some(id),
                    Err(err) => {
                        report_fault(
                            "unannotated",
                            &self.db.label(),
                            None,
                            &anyhow::Error::from(err),
                        );
                        None
                    }
                })
                .collect(),
            Err(err) => {
                report_fault("unannotated", &self.db.label(), None, &err);
                Vec::new()
            }
        }
    }

    /// Tag counts over failing annotations, most frequent first.
    #[must_use]
    pub fn failure_taxonomy(&self) -> Vec<(String, u64)> {
        self.try_failure_taxonomy().unwrap_or_else(|err| {
            report_fault("failure_taxonomy", &self.db.label(), None, &err);
            Vec::new()
        })
    }

    fn try_failure_taxonomy(&self) -> Result<Vec<(String, u64)>> {
        let raw_tags = self.db.read(|conn| {
            let mut stmt = conn
                .prepare("SELECT tags FROM annotations WHERE judgment = 'fail'")
                .context("failed to prepare failure taxonomy query")?;
            let rows = stmt
                .query_map([], |row| row.get::<_, Option<String>>(0))
                .context("failed to query failing annotation tags")?;
            collect_rows(rows)
        })?;
        let tag_lists = raw_tags
            .iter()
            .map(|raw| decode_tags(raw.as_deref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(failure_taxonomy(&tag_lists))
    }

    #[must_use]
    pub fn stats(&self) -> AnnotationStats {
        AnnotationStats::new(
            self.count(None, None),
            self.count(Some(Judgment::Pass), None),
            self.count(Some(Judgment::Fail), None),
            self.count(Some(Judgment::Skip), None),
            self.failure_taxonomy(),
        )
    }

    /// Lazily walks every annotation, newest first.
    pub fn iter(&self) -> impl Iterator<Item = Annotation> + '_ {
        let mut offset = 0;
        let mut done = false;
        std::iter::from_fn(move || {
            if done {
                return None;
            }
            let page = self.list(&AnnotationQuery {
                limit: 256,
                offset,
                ..AnnotationQuery::default()
            });
            if page.len() < 256 {
                done = true;
            }
            offset += page.len();
            if page.is_empty() {
                None
            } else {
                Some(page)
            }
        })
        .flatten()
    }

    /// Returns whether an annotation was removed.
    pub fn delete(&self, id: AnnotationId) -> bool {
        let deleted = self.db.write(|conn| {
            conn.execute(
                "DELETE FROM annotations WHERE id = ?1",
                params![id.to_string()],
            )
            .with_context(|| format!("failed to delete annotation {id}"))
        });
        match deleted {
            Ok(rows) => rows > 0,
            Err(err) => {
                report_fault("delete", &self.db.label(), Some(id), &err);
                false
            }
        }
    }

    /// Persists the set and all its annotations; membership is replaced.
    pub fn save_set(&self, set: &AnnotationSet) {
        if let Err(err) = self.db.write(|conn| insert_set(conn, set)) {
            report_fault("save_set", &self.db.label(), None, &err);
        }
    }

    #[must_use]
    pub fn load_set(&self, name: &str) -> Option<AnnotationSet> {
        self.try_load_set(name).unwrap_or_else(|err| {
            report_fault("load_set", &self.db.label(), None, &err);
            None
        })
    }

    fn try_load_set(&self, name: &str) -> Result<Option<AnnotationSet>> {
        let loaded = self.db.read(|conn| {
            let header = conn
                .query_row(
                    "SELECT created_at, metadata FROM annotation_sets WHERE name = ?1",
                    params![name],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)),
                )
                .optional()
                .with_context(|| format!("failed to query annotation set {name}"))?;
            let Some(header) = header else {
                return Ok(None);
            };
            let mut stmt = conn
                .prepare(
                    "SELECT a.id, a.trace_id, a.judgment, a.critique, a.tags, a.annotator,
                            a.timestamp, a.metadata
                     FROM annotation_set_members m
                     JOIN annotations a ON a.id = m.annotation_id
                     WHERE m.set_name = ?1
                     ORDER BY m.position ASC",
                )
                .context("failed to prepare annotation set members query")?;
            let rows = stmt
                .query_map(params![name], AnnotationRow::read)
                .context("failed to query annotation set members")?;
            Ok(Some((header, collect_rows(rows)?)))
        })?;

        let Some(((created_at, metadata), rows)) = loaded else {
            return Ok(None);
        };
        let annotations = rows
            .into_iter()
            .map(AnnotationRow::decode)
            .collect::<Result<Vec<_>>>()?;
        let metadata = match from_storable_text(metadata.as_deref().unwrap_or_default()) {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        Ok(Some(AnnotationSet {
            name: name.to_owned(),
            annotations,
            created_at: parse_timestamp(&created_at)?,
            metadata,
        }))
    }

    fn decode_or_report(
        &self,
        operation: &'static str,
        rows: Result<Vec<AnnotationRow>>,
    ) -> Vec<Annotation> {
        match rows {
            Ok(rows) => rows
                .into_iter()
                .filter_map(|row| match row.decode() {
                    Ok(annotation) => Some(annotation),
                    Err(err) => {
                        report_fault(operation, &self.db.label(), None, &err);
                        None
                    }
                })
                .collect(),
            Err(err) => {
                report_fault(operation, &self.db.label(), None, &err);
                Vec::new()
            }
        }
    }
}

fn metadata_text(metadata: &Map<String, Value>) -> Option<String> {
    if metadata.is_empty() {
        None
    } else {
        Some(to_storable_text(&Value::Object(metadata.clone())))
    }
}

fn insert_annotation(conn: &Connection, annotation: &Annotation) -> Result<()> {
    let tags = serde_json::to_string(&annotation.tags).context("failed to encode tags")?;
    conn.execute(
        "INSERT INTO annotations (id, trace_id, judgment, critique, tags, annotator, timestamp, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(id) DO UPDATE SET
           trace_id = excluded.trace_id,
           judgment = excluded.judgment,
           critique = excluded.critique,
           tags = excluded.tags,
           annotator = excluded.annotator,
           timestamp = excluded.timestamp,
           metadata = excluded.metadata",
        params![
            annotation.id.to_string(),
            annotation.trace_id.to_string(),
            annotation.judgment.as_str(),
            annotation.critique,
            tags,
            annotation.annotator,
            format_timestamp(annotation.timestamp)?,
            metadata_text(&annotation.metadata),
        ],
    )
    .with_context(|| format!("failed to upsert annotation {}", annotation.id))?;
    Ok(())
}

fn insert_set(conn: &Connection, set: &AnnotationSet) -> Result<()> {
    if set.name.trim().is_empty() {
        return Err(anyhow!("annotation set name must not be empty"));
    }
    let tx = conn
        .unchecked_transaction()
        .context("failed to start annotation set transaction")?;

    tx.execute(
        "INSERT INTO annotation_sets (name, created_at, metadata) VALUES (?1, ?2, ?3)
         ON CONFLICT(name) DO UPDATE SET
           created_at = excluded.created_at,
           metadata = excluded.metadata",
        params![
            set.name,
            format_timestamp(set.created_at)?,
            metadata_text(&set.metadata),
        ],
    )
    .with_context(|| format!("failed to upsert annotation set {}", set.name))?;

    tx.execute(
        "DELETE FROM annotation_set_members WHERE set_name = ?1",
        params![set.name],
    )
    .context("failed to reset annotation set membership")?;

    for (position, annotation) in set.annotations.iter().enumerate() {
        insert_annotation(&tx, annotation)?;
        tx.execute(
            "INSERT OR IGNORE INTO annotation_set_members (set_name, annotation_id, position)
             VALUES (?1, ?2, ?3)",
            params![set.name, annotation.id.to_string(), to_sql_count(position)],
        )
        .context("failed to record annotation set member")?;
    }

    tx.commit()
        .context("failed to commit annotation set transaction")?;
    Ok(())
}
