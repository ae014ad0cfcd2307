//! SQLite-backed trace store
//!
//! The database runs in WAL mode. A single connection guarded by a mutex
//! performs writes; every read opens its own connection, so queries proceed
//! while a batch is being written and only ever observe committed batches.

use rusqlite::types::Type;
use rusqlite::{Connection, OpenFlags, Row, params};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::{SpanQuery, SpanWriter, TraceFilter, TraceReader};
use crate::error::{ClearstoneError, Result};
use crate::observability::{
    InstrumentationScope, Span, SpanKind, SpanStatus, Trace, TraceSummary,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS spans (
    trace_id TEXT NOT NULL,
    span_id TEXT NOT NULL,
    parent_span_id TEXT,
    name TEXT NOT NULL,
    kind TEXT NOT NULL,
    start_ns INTEGER NOT NULL,
    end_ns INTEGER,
    status TEXT NOT NULL,
    attributes_json TEXT NOT NULL,
    events_json TEXT NOT NULL,
    error_message TEXT,
    error_stacktrace TEXT,
    operation_type TEXT,
    input_snapshot_json TEXT,
    output_snapshot_json TEXT,
    instrumentation_name TEXT NOT NULL,
    instrumentation_version TEXT NOT NULL,
    service_name TEXT NOT NULL,
    PRIMARY KEY (trace_id, span_id)
);
CREATE INDEX IF NOT EXISTS idx_spans_start ON spans (start_ns);
CREATE INDEX IF NOT EXISTS idx_spans_name ON spans (name);
CREATE INDEX IF NOT EXISTS idx_spans_operation_type ON spans (operation_type);
";

const SPAN_COLUMNS: &str = "trace_id, span_id, parent_span_id, name, kind, start_ns, end_ns, \
     status, attributes_json, events_json, error_message, error_stacktrace, operation_type, \
     input_snapshot_json, output_snapshot_json, instrumentation_name, instrumentation_version, \
     service_name";

struct StoreInner {
    path: PathBuf,
    writer: Mutex<Connection>,
}

/// Durable, append-only span store on a SQLite file
#[derive(Clone)]
pub struct TraceStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for TraceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceStore")
            .field("path", &self.inner.path)
            .finish()
    }
}

impl TraceStore {
    /// Open (creating if needed) the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or the schema applied.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            tracing::warn!(path = %path.display(), mode = %mode, "trace store is not in WAL mode");
        }
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;

        tracing::debug!(path = %path.display(), "opened trace store");

        Ok(Self {
            inner: Arc::new(StoreInner {
                path,
                writer: Mutex::new(conn),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    fn reader(&self) -> Result<Connection> {
        let conn = Connection::open_with_flags(
            &self.inner.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }
}

impl SpanWriter for TraceStore {
    fn persist_batch(&self, spans: &[Span]) -> Result<()> {
        if spans.is_empty() {
            return Ok(());
        }

        let mut conn = self
            .inner
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(&format!(
                "INSERT OR IGNORE INTO spans ({SPAN_COLUMNS}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)"
            ))?;
            for span in spans {
                let input = span.input_snapshot.as_ref().map(serde_json::to_string).transpose()?;
                let output = span
                    .output_snapshot
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?;
                stmt.execute(params![
                    span.trace_id,
                    span.span_id,
                    span.parent_span_id,
                    span.name,
                    span.kind.as_str(),
                    to_sql_ns(span.start_ns),
                    span.end_ns.map(to_sql_ns),
                    span.status.as_str(),
                    serde_json::to_string(&span.attributes)?,
                    serde_json::to_string(&span.events)?,
                    span.error_message,
                    span.error_stacktrace,
                    span.operation_type,
                    input,
                    output,
                    span.instrumentation.name,
                    span.instrumentation.version,
                    span.service_name,
                ])?;
            }
        }
        tx.commit()?;

        tracing::trace!(count = spans.len(), "persisted span batch");
        Ok(())
    }
}

impl TraceReader for TraceStore {
    fn get_trace(&self, trace_id: &str) -> Result<Trace> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SPAN_COLUMNS} FROM spans WHERE trace_id = ?1 ORDER BY start_ns, span_id"
        ))?;
        let spans = stmt
            .query_map(params![trace_id], row_to_span)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Trace::from_spans(trace_id, spans)
    }

    fn list_traces(&self, limit: usize, filter: &TraceFilter) -> Result<Vec<TraceSummary>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT trace_id, root_name, service_name, start_ns, end_ns, span_count, error_count
             FROM (
                SELECT s.trace_id AS trace_id,
                       (SELECT r.name FROM spans r
                         WHERE r.trace_id = s.trace_id AND r.parent_span_id IS NULL
                         ORDER BY r.start_ns, r.span_id
                         LIMIT 1) AS root_name,
                       COALESCE(
                           (SELECT r.service_name FROM spans r
                             WHERE r.trace_id = s.trace_id AND r.parent_span_id IS NULL
                             ORDER BY r.start_ns, r.span_id
                             LIMIT 1),
                           (SELECT e.service_name FROM spans e
                             WHERE e.trace_id = s.trace_id
                             ORDER BY e.start_ns, e.span_id
                             LIMIT 1)
                       ) AS service_name,
                       MIN(s.start_ns) AS start_ns,
                       MAX(s.end_ns) AS end_ns,
                       COUNT(*) AS span_count,
                       SUM(CASE WHEN s.status = 'error' THEN 1 ELSE 0 END) AS error_count
                FROM spans s
                GROUP BY s.trace_id
             )
             WHERE (?1 IS NULL OR service_name = ?1)
               AND (?2 IS NULL OR root_name = ?2)
               AND (?3 IS NULL OR (?3 = 1 AND error_count > 0) OR (?3 = 0 AND error_count = 0))
               AND (?4 IS NULL OR start_ns >= ?4)
             ORDER BY start_ns DESC, trace_id
             LIMIT ?5",
        )?;

        let summaries = stmt
            .query_map(
                params![
                    filter.service_name,
                    filter.root_name,
                    filter.has_error.map(i64::from),
                    filter.started_after_ns.map(to_sql_ns),
                    i64::try_from(limit).unwrap_or(i64::MAX),
                ],
                |row| {
                    Ok(TraceSummary {
                        trace_id: row.get(0)?,
                        root_name: row.get(1)?,
                        service_name: row.get(2)?,
                        start_ns: from_sql_ns(row.get(3)?),
                        end_ns: row.get::<_, Option<i64>>(4)?.map(from_sql_ns),
                        span_count: from_sql_count(row.get(5)?),
                        error_count: from_sql_count(row.get(6)?),
                    })
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(summaries)
    }

    fn query_spans(&self, query: &SpanQuery) -> Result<Vec<Span>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SPAN_COLUMNS} FROM spans
             WHERE (?1 IS NULL OR trace_id = ?1)
               AND (?2 IS NULL OR name = ?2)
               AND (?3 IS NULL OR status = ?3)
               AND (?4 IS NULL OR operation_type = ?4)
             ORDER BY start_ns, span_id
             LIMIT ?5"
        ))?;

        let limit = query
            .limit
            .map(|l| i64::try_from(l).unwrap_or(i64::MAX))
            .unwrap_or(-1);
        let spans = stmt
            .query_map(
                params![
                    query.trace_id,
                    query.name,
                    query.status.map(|s| s.as_str()),
                    query.operation_type,
                    limit,
                ],
                row_to_span,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(spans)
    }
}

fn to_sql_ns(ns: u64) -> i64 {
    i64::try_from(ns).unwrap_or(i64::MAX)
}

fn from_sql_ns(ns: i64) -> u64 {
    u64::try_from(ns).unwrap_or(0)
}

fn from_sql_count(count: i64) -> usize {
    usize::try_from(count).unwrap_or(0)
}

fn conversion_error(index: usize, ty: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        ty,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, index: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(index)?;
    serde_json::from_str(&raw)
        .map_err(|e| conversion_error(index, Type::Text, format!("invalid JSON column: {e}")))
}

fn optional_json_column<T: serde::de::DeserializeOwned>(
    row: &Row<'_>,
    index: usize,
) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(index)?;
    raw.map(|raw| {
        serde_json::from_str(&raw)
            .map_err(|e| conversion_error(index, Type::Text, format!("invalid JSON column: {e}")))
    })
    .transpose()
}

fn row_to_span(row: &Row<'_>) -> rusqlite::Result<Span> {
    let kind_raw: String = row.get(4)?;
    let kind: SpanKind = kind_raw
        .parse()
        .map_err(|e: ClearstoneError| conversion_error(4, Type::Text, e.to_string()))?;
    let status_raw: String = row.get(7)?;
    let status: SpanStatus = status_raw
        .parse()
        .map_err(|e: ClearstoneError| conversion_error(7, Type::Text, e.to_string()))?;

    Ok(Span {
        trace_id: row.get(0)?,
        span_id: row.get(1)?,
        parent_span_id: row.get(2)?,
        name: row.get(3)?,
        kind,
        start_ns: from_sql_ns(row.get(5)?),
        end_ns: row.get::<_, Option<i64>>(6)?.map(from_sql_ns),
        status,
        attributes: json_column(row, 8)?,
        events: json_column(row, 9)?,
        error_message: row.get(10)?,
        error_stacktrace: row.get(11)?,
        operation_type: row.get(12)?,
        input_snapshot: optional_json_column(row, 13)?,
        output_snapshot: optional_json_column(row, 14)?,
        instrumentation: InstrumentationScope {
            name: row.get(15)?,
            version: row.get(16)?,
        },
        service_name: row.get(17)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::span::test_support::span;
    use crate::observability::AttributeValue;
    use crate::serialization::SnapshotCapture;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, TraceStore) {
        let dir = TempDir::new().unwrap();
        let store = TraceStore::open(dir.path().join("traces.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_round_trip_preserves_every_field() {
        let (_dir, store) = open_store();

        let mut full = span("t1", "root", None, 1_000);
        full.attributes
            .insert("model".to_string(), AttributeValue::from("gpt"));
        full.attributes
            .insert("tokens".to_string(), AttributeValue::Int(42));
        full.operation_type = Some("llm".to_string());
        full.input_snapshot = Some(SnapshotCapture::default().capture(&serde_json::json!({"q": 1})));
        full.output_snapshot = Some(SnapshotCapture::default().capture("answer"));
        full.error_message = Some("partial".to_string());

        store.persist_batch(&[full.clone()]).unwrap();
        let trace = store.get_trace("t1").unwrap();
        assert_eq!(trace.spans, vec![full]);
    }

    #[test]
    fn test_insert_is_idempotent() {
        let (_dir, store) = open_store();
        let original = span("t1", "root", None, 0);
        store.persist_batch(&[original.clone()]).unwrap();

        let mut changed = original.clone();
        changed.name = "mutated".to_string();
        store.persist_batch(&[changed]).unwrap();

        let trace = store.get_trace("t1").unwrap();
        assert_eq!(trace.spans.len(), 1);
        assert_eq!(trace.spans[0].name, original.name);
    }

    #[test]
    fn test_missing_trace_is_not_found() {
        let (_dir, store) = open_store();
        assert!(matches!(
            store.get_trace("absent"),
            Err(ClearstoneError::TraceNotFound(_))
        ));
    }

    #[test]
    fn test_list_traces_newest_first_with_filters() {
        let (_dir, store) = open_store();
        let mut errored = span("t2", "c2", Some("r2"), 210);
        errored.status = SpanStatus::Error;
        store
            .persist_batch(&[
                span("t1", "r1", None, 100),
                span("t1", "c1", Some("r1"), 110),
                span("t2", "r2", None, 200),
                errored,
            ])
            .unwrap();

        let all = store.list_traces(10, &TraceFilter::new()).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].trace_id, "t2");
        assert_eq!(all[0].span_count, 2);
        assert_eq!(all[0].error_count, 1);
        assert_eq!(all[0].root_name.as_deref(), Some("op-r2"));
        assert_eq!(all[1].trace_id, "t1");

        let clean = store
            .list_traces(10, &TraceFilter::new().has_error(false))
            .unwrap();
        assert_eq!(clean.len(), 1);
        assert_eq!(clean[0].trace_id, "t1");

        let recent = store
            .list_traces(10, &TraceFilter::new().started_after(150))
            .unwrap();
        assert_eq!(recent.len(), 1);

        let by_root = store
            .list_traces(10, &TraceFilter::new().root_name("op-r1"))
            .unwrap();
        assert_eq!(by_root[0].trace_id, "t1");

        assert_eq!(store.list_traces(1, &TraceFilter::new()).unwrap().len(), 1);
    }

    #[test]
    fn test_query_spans() {
        let (_dir, store) = open_store();
        let mut llm = span("t1", "llm1", Some("root"), 20);
        llm.operation_type = Some("llm".to_string());
        store
            .persist_batch(&[span("t1", "root", None, 10), llm, span("t2", "other", None, 5)])
            .unwrap();

        let by_op = store
            .query_spans(&SpanQuery::new().operation_type("llm"))
            .unwrap();
        assert_eq!(by_op.len(), 1);
        assert_eq!(by_op[0].span_id, "llm1");

        let by_trace = store.query_spans(&SpanQuery::new().trace_id("t1")).unwrap();
        assert_eq!(by_trace.len(), 2);

        let limited = store.query_spans(&SpanQuery::new().limit(1)).unwrap();
        assert_eq!(limited[0].span_id, "other");
    }

    #[test]
    fn test_failed_batch_leaves_nothing_visible() {
        let (dir, store) = open_store();
        let saboteur = Connection::open(dir.path().join("traces.db")).unwrap();
        saboteur
            .execute_batch(
                "CREATE TRIGGER reject_poison BEFORE INSERT ON spans
                 WHEN NEW.span_id = 'poison'
                 BEGIN SELECT RAISE(ABORT, 'rejected span'); END;",
            )
            .unwrap();
        drop(saboteur);

        let result = store.persist_batch(&[
            span("t1", "root", None, 0),
            span("t1", "first", Some("root"), 1),
            span("t1", "poison", Some("root"), 2),
            span("t1", "last", Some("root"), 3),
        ]);
        assert!(result.is_err());
        assert!(matches!(
            store.get_trace("t1"),
            Err(ClearstoneError::TraceNotFound(_))
        ));
        assert!(store.list_traces(10, &TraceFilter::new()).unwrap().is_empty());

        // The writer connection is still usable once the batch rolled back.
        store.persist_batch(&[span("t2", "root", None, 0)]).unwrap();
        assert_eq!(store.get_trace("t2").unwrap().spans.len(), 1);
    }

    #[test]
    fn test_summary_reports_root_service() {
        let (_dir, store) = open_store();
        let mut root = span("t1", "root", None, 10);
        root.service_name = "planner".to_string();
        let mut early = span("t1", "early", Some("root"), 5);
        early.service_name = "aggregator".to_string();
        store.persist_batch(&[early, root]).unwrap();

        let summaries = store.list_traces(10, &TraceFilter::new()).unwrap();
        assert_eq!(summaries[0].service_name, "planner");
        let filtered = store
            .list_traces(10, &TraceFilter::new().service_name("planner"))
            .unwrap();
        assert_eq!(filtered.len(), 1);
    }

    #[test]
    fn test_reads_see_writes_from_another_handle() {
        let (dir, store) = open_store();
        store.persist_batch(&[span("t1", "root", None, 0)]).unwrap();

        let reopened = TraceStore::open(dir.path().join("traces.db")).unwrap();
        assert_eq!(reopened.get_trace("t1").unwrap().spans.len(), 1);
    }
}
