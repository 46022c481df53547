//! SQLite-backed record store
//!
//! One table each for spans, logs, sessions and metadata. Records are kept as
//! JSON next to the indexed columns the queries filter and order on, and every
//! write touches only the rows it concerns.

use crate::errors::Result;
use crate::store::{
    merge_span, LogRepository, MetadataRepository, SessionRepository, SpanRepository, UpsertOutcome,
};
use crate::telemetry::{
    LogRecord, MetadataKind, MetadataLifespan, MetadataRecord, ProcessId, SessionId, SessionRecord,
    SignalType, SpanContext, SpanRecord,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Params};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Record store on a single SQLite connection
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
    span_limit_default: usize,
    span_limits: HashMap<String, usize>,
}

impl SqliteStore {
    /// Open or create the database file at `path`
    pub fn open(path: impl AsRef<Path>, span_limit_default: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)?;
        let store = Self::with_connection(conn, Some(path), span_limit_default)?;
        debug!("Opened record store at {:?}", store.path);
        Ok(store)
    }

    /// A store that lives only as long as the process
    pub fn in_memory(span_limit_default: usize) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, None, span_limit_default)
    }

    fn with_connection(
        conn: Connection,
        path: Option<PathBuf>,
        span_limit_default: usize,
    ) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let store = Self {
            conn: Mutex::new(conn),
            path,
            span_limit_default,
            span_limits: HashMap::new(),
        };
        store.create_tables()?;
        Ok(store)
    }

    fn create_tables(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS spans (
                trace_id TEXT NOT NULL,
                span_id TEXT NOT NULL,
                primary_type TEXT NOT NULL,
                session_id TEXT,
                process_id TEXT NOT NULL,
                start_time INTEGER NOT NULL,
                end_time INTEGER,
                record TEXT NOT NULL,
                PRIMARY KEY (trace_id, span_id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_spans_type_start ON spans(primary_type, start_time ASC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_spans_session ON spans(session_id, start_time ASC)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS logs (
                id TEXT PRIMARY KEY,
                process_id TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                record TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_logs_process_time ON logs(process_id, timestamp ASC)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                start_time INTEGER NOT NULL,
                record TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS metadata (
                key TEXT NOT NULL,
                kind TEXT NOT NULL,
                lifespan TEXT NOT NULL,
                scope_id TEXT NOT NULL DEFAULT '',
                record TEXT NOT NULL,
                PRIMARY KEY (key, kind, lifespan, scope_id)
            )",
            [],
        )?;

        Ok(())
    }

    /// Per primary type retention overrides
    pub fn with_span_limits(mut self, span_limits: HashMap<String, usize>) -> Self {
        self.span_limits = span_limits;
        self
    }

    fn span_limit(&self, span_type: &SignalType) -> usize {
        self.span_limits
            .get(span_type.primary())
            .copied()
            .unwrap_or(self.span_limit_default)
    }

    /// Make room for one more span of the given type, oldest closed spans first
    fn evict_for(&self, conn: &Connection, span_type: &SignalType) -> Result<usize> {
        let limit = self.span_limit(span_type);
        let primary = span_type.primary();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM spans WHERE primary_type = ?1",
            params![primary],
            |row| row.get(0),
        )?;
        let count = count as usize;
        if count < limit {
            return Ok(0);
        }

        let excess = count - limit + 1;
        let evicted = conn.execute(
            "DELETE FROM spans WHERE rowid IN (
                SELECT rowid FROM spans
                WHERE primary_type = ?1 AND end_time IS NOT NULL
                ORDER BY start_time ASC
                LIMIT ?2
            )",
            params![primary, excess as i64],
        )?;

        if evicted < excess {
            warn!(
                "Span limit of {} reached for type {} with only open spans left",
                limit, primary
            );
        }
        Ok(evicted)
    }

    /// Number of stored spans
    pub fn span_count(&self) -> Result<usize> {
        count(&self.conn.lock(), "SELECT COUNT(*) FROM spans")
    }

    /// Number of stored logs
    pub fn log_count(&self) -> Result<usize> {
        count(&self.conn.lock(), "SELECT COUNT(*) FROM logs")
    }

    /// Whether a log with the given id is stored
    pub fn contains_log(&self, id: &str) -> Result<bool> {
        let found = self
            .conn
            .lock()
            .query_row("SELECT 1 FROM logs WHERE id = ?1", params![id], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.path)
            .field("span_limit_default", &self.span_limit_default)
            .field("span_limits", &self.span_limits)
            .finish()
    }
}

/// Nanoseconds since the epoch, used for ordering and range filters
fn nanos(time: DateTime<Utc>) -> i64 {
    time.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

fn count(conn: &Connection, sql: &str) -> Result<usize> {
    let count: i64 = conn.query_row(sql, [], |row| row.get(0))?;
    Ok(count as usize)
}

fn decode<T: DeserializeOwned>(raw: &str) -> Result<T> {
    Ok(serde_json::from_str(raw)?)
}

/// Run a query whose first column is a JSON record and decode every row
fn query_records<T: DeserializeOwned>(conn: &Connection, sql: &str, params: impl Params) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |row| row.get::<_, String>(0))?;

    let mut records = Vec::new();
    for raw in rows {
        records.push(decode(&raw?)?);
    }
    Ok(records)
}

fn fetch_span_row(conn: &Connection, context: &SpanContext) -> Result<Option<SpanRecord>> {
    conn.query_row(
        "SELECT record FROM spans WHERE trace_id = ?1 AND span_id = ?2",
        params![context.trace_id, context.span_id],
        |row| row.get::<_, String>(0),
    )
    .optional()?
    .map(|raw| decode(&raw))
    .transpose()
}

fn put_span(conn: &Connection, span: &SpanRecord) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO spans
            (trace_id, span_id, primary_type, session_id, process_id, start_time, end_time, record)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            span.trace_id,
            span.span_id,
            span.span_type.primary(),
            span.session_id.as_ref().map(|id| id.0.as_str()),
            span.process_id.as_str(),
            nanos(span.start_time),
            span.end_time.map(nanos),
            serde_json::to_string(span)?,
        ],
    )?;
    Ok(())
}

/// Column values identifying a metadata lifespan
fn lifespan_columns(lifespan: &MetadataLifespan) -> (&'static str, &str) {
    match lifespan {
        MetadataLifespan::Session(id) => ("session", id.0.as_str()),
        MetadataLifespan::Process(id) => ("process", id.as_str()),
        MetadataLifespan::Permanent => ("permanent", ""),
    }
}

fn kind_column(kind: &MetadataKind) -> Result<String> {
    Ok(serde_json::to_string(kind)?.trim_matches('"').to_string())
}

impl SpanRepository for SqliteStore {
    fn upsert_span(&self, span: &SpanRecord, only_update: bool) -> Result<UpsertOutcome> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let outcome = match fetch_span_row(&tx, &span.context())? {
            Some(stored) if stored.is_closed() => UpsertOutcome::Closed,
            Some(mut stored) => {
                merge_span(&mut stored, span);
                put_span(&tx, &stored)?;
                UpsertOutcome::Updated
            }
            None if only_update => UpsertOutcome::Skipped,
            None => {
                let evicted = self.evict_for(&tx, &span.span_type)?;
                put_span(&tx, span)?;
                UpsertOutcome::Inserted { evicted }
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    fn fetch_span(&self, context: &SpanContext) -> Result<Option<SpanRecord>> {
        fetch_span_row(&self.conn.lock(), context)
    }

    fn update_open_span(
        &self,
        context: &SpanContext,
        update: &mut dyn FnMut(&mut SpanRecord),
    ) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let Some(mut span) = fetch_span_row(&tx, context)? else {
            return Ok(false);
        };
        if span.is_closed() {
            return Ok(false);
        }

        update(&mut span);
        put_span(&tx, &span)?;
        tx.commit()?;
        Ok(true)
    }

    fn spans_for_session(&self, session_id: &SessionId) -> Result<Vec<SpanRecord>> {
        query_records(
            &self.conn.lock(),
            "SELECT record FROM spans WHERE session_id = ?1 ORDER BY start_time ASC",
            params![session_id.0],
        )
    }

    fn clean_up_spans(&self, before: Option<DateTime<Utc>>) -> Result<usize> {
        let conn = self.conn.lock();
        let removed = match before {
            Some(before) => conn.execute(
                "DELETE FROM spans WHERE end_time IS NOT NULL AND end_time < ?1",
                params![nanos(before)],
            )?,
            None => conn.execute(
                "DELETE FROM spans WHERE end_time IS NOT NULL AND process_id != ?1",
                params![ProcessId::current().as_str()],
            )?,
        };

        if removed > 0 {
            debug!("Removed {} closed spans", removed);
        }
        Ok(removed)
    }

    fn close_open_spans(&self, end_time: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let stale: Vec<SpanRecord> = query_records(
            &tx,
            "SELECT record FROM spans WHERE end_time IS NULL AND process_id != ?1",
            params![ProcessId::current().as_str()],
        )?;
        for mut span in stale.iter().cloned() {
            span.end_time = Some(end_time);
            put_span(&tx, &span)?;
        }

        tx.commit()?;
        Ok(stale.len())
    }
}

impl LogRepository for SqliteStore {
    fn create_log(&self, log: &LogRecord) -> Result<()> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO logs (id, process_id, timestamp, record) VALUES (?1, ?2, ?3, ?4)",
            params![
                log.id,
                log.process_id.as_str(),
                nanos(log.timestamp),
                serde_json::to_string(log)?,
            ],
        )?;
        Ok(())
    }

    fn fetch_all_excluding_process(&self, process_id: &ProcessId) -> Result<Vec<LogRecord>> {
        query_records(
            &self.conn.lock(),
            "SELECT record FROM logs WHERE process_id != ?1 ORDER BY timestamp ASC",
            params![process_id.as_str()],
        )
    }

    fn remove_logs(&self, logs: &[LogRecord]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let mut removed = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM logs WHERE id = ?1")?;
            for log in logs {
                removed += stmt.execute(params![log.id])?;
            }
        }

        tx.commit()?;
        Ok(removed)
    }

    fn remove_all_logs(&self) -> Result<usize> {
        Ok(self.conn.lock().execute("DELETE FROM logs", [])?)
    }
}

impl SessionRepository for SqliteStore {
    fn upsert_session(&self, session: &SessionRecord) -> Result<()> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO sessions (id, start_time, record) VALUES (?1, ?2, ?3)",
            params![
                session.id.0,
                nanos(session.start_time),
                serde_json::to_string(session)?,
            ],
        )?;
        Ok(())
    }

    fn fetch_session(&self, id: &SessionId) -> Result<Option<SessionRecord>> {
        self.conn
            .lock()
            .query_row(
                "SELECT record FROM sessions WHERE id = ?1",
                params![id.0],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .map(|raw| decode(&raw))
            .transpose()
    }

    fn latest_session(&self) -> Result<Option<SessionRecord>> {
        self.conn
            .lock()
            .query_row(
                "SELECT record FROM sessions ORDER BY start_time DESC LIMIT 1",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .map(|raw| decode(&raw))
            .transpose()
    }

    fn delete_session(&self, id: &SessionId) -> Result<bool> {
        let removed = self
            .conn
            .lock()
            .execute("DELETE FROM sessions WHERE id = ?1", params![id.0])?;
        Ok(removed > 0)
    }
}

impl MetadataRepository for SqliteStore {
    fn add_metadata(&self, record: &MetadataRecord) -> Result<()> {
        let (lifespan, scope_id) = lifespan_columns(&record.lifespan);
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO metadata (key, kind, lifespan, scope_id, record)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.key,
                kind_column(&record.kind)?,
                lifespan,
                scope_id,
                serde_json::to_string(record)?,
            ],
        )?;
        Ok(())
    }

    fn fetch_metadata(
        &self,
        kinds: &[MetadataKind],
        session_id: Option<&SessionId>,
        process_id: &ProcessId,
    ) -> Result<Vec<MetadataRecord>> {
        let records: Vec<MetadataRecord> = query_records(
            &self.conn.lock(),
            "SELECT record FROM metadata
             WHERE (lifespan = 'session' AND scope_id = ?1)
                OR (lifespan = 'process' AND scope_id = ?2)
                OR lifespan = 'permanent'
             ORDER BY rowid ASC",
            params![session_id.map(|id| id.0.as_str()), process_id.as_str()],
        )?;

        Ok(records
            .into_iter()
            .filter(|record| kinds.contains(&record.kind))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PipelineError;
    use crate::telemetry::{LogSeverity, SessionState, SpanEvent, SpanLink, SpanStatus};
    use chrono::Duration;
    use std::sync::Arc;

    fn store(limit: usize) -> SqliteStore {
        SqliteStore::in_memory(limit).unwrap()
    }

    fn open_span(name: &str) -> SpanRecord {
        SpanRecord::new(SpanContext::generate(), name, SignalType::performance())
    }

    #[test]
    fn test_insert_and_fetch_span() {
        let store = store(10);
        let span = open_span("load").with_attribute("screen", "home");

        let outcome = store.upsert_span(&span, false).unwrap();
        assert_eq!(outcome, UpsertOutcome::Inserted { evicted: 0 });

        let fetched = store.fetch_span(&span.context()).unwrap().unwrap();
        assert_eq!(fetched, span);
    }

    #[test]
    fn test_only_update_skips_missing_span() {
        let store = store(10);
        let outcome = store.upsert_span(&open_span("load"), true).unwrap();
        assert_eq!(outcome, UpsertOutcome::Skipped);
        assert_eq!(store.span_count().unwrap(), 0);
    }

    #[test]
    fn test_span_identity_includes_trace_id() {
        let store = store(10);
        let first = open_span("first");
        let mut second = open_span("second");
        second.span_id = first.span_id.clone();

        store.upsert_span(&first, false).unwrap();
        store.upsert_span(&second, false).unwrap();

        assert_eq!(store.span_count().unwrap(), 2);
        assert_eq!(store.fetch_span(&second.context()).unwrap().unwrap().name, "second");
    }

    #[test]
    fn test_closed_span_is_immutable() {
        let store = store(10);
        let end = Utc::now();
        let span = open_span("load").with_end_time(end);
        store.upsert_span(&span, false).unwrap();

        let mut changed = span.clone();
        changed.name = "renamed".to_string();
        changed.status = SpanStatus::Error;
        assert_eq!(store.upsert_span(&changed, false).unwrap(), UpsertOutcome::Closed);
        assert!(!store.set_span_status(&span.context(), SpanStatus::Ok).unwrap());
        assert!(!store.end_span(&span.context(), end + Duration::seconds(5)).unwrap());

        let stored = store.fetch_span(&span.context()).unwrap().unwrap();
        assert_eq!(stored.name, "load");
        assert_eq!(stored.status, SpanStatus::Unset);
        assert_eq!(stored.end_time, Some(end));
    }

    #[test]
    fn test_events_never_shrink() {
        let store = store(10);
        let now = Utc::now();
        let mut span = open_span("load");
        span.events = vec![SpanEvent::new("a", now), SpanEvent::new("b", now)];
        store.upsert_span(&span, false).unwrap();

        let mut shorter = span.clone();
        shorter.events = vec![SpanEvent::new("a", now)];
        store.upsert_span(&shorter, false).unwrap();
        let stored = store.fetch_span(&span.context()).unwrap().unwrap();
        assert_eq!(stored.events.len(), 2);

        let mut longer = span.clone();
        longer.events = vec![
            SpanEvent::new("a", now).with_attribute("k", "v"),
            SpanEvent::new("b", now),
            SpanEvent::new("c", now),
        ];
        store.upsert_span(&longer, false).unwrap();
        let stored = store.fetch_span(&span.context()).unwrap().unwrap();
        assert_eq!(stored.events.len(), 3);
        assert_eq!(stored.events[2].name, "c");
        assert_eq!(stored.events[0].attributes.get("k").map(String::as_str), Some("v"));
    }

    #[test]
    fn test_links_never_shrink() {
        let store = store(10);
        let mut span = open_span("load");
        span.links = vec![SpanLink::new("a", "t"), SpanLink::new("b", "t")];
        store.upsert_span(&span, false).unwrap();

        let mut shorter = span.clone();
        shorter.links.clear();
        store.upsert_span(&shorter, false).unwrap();
        let stored = store.fetch_span(&span.context()).unwrap().unwrap();
        assert_eq!(stored.links.len(), 2);
    }

    #[test]
    fn test_update_open_span_applies_all_changes_at_once() {
        let store = store(10);
        let span = open_span("load");
        store.upsert_span(&span, false).unwrap();

        let end = Utc::now();
        let updated = store
            .update_open_span(&span.context(), &mut |stored| {
                stored.status = SpanStatus::Error;
                stored.attributes.insert("k".to_string(), "v".to_string());
                stored.end_time = Some(end);
            })
            .unwrap();
        assert!(updated);

        let stored = store.fetch_span(&span.context()).unwrap().unwrap();
        assert_eq!(stored.status, SpanStatus::Error);
        assert_eq!(stored.end_time, Some(end));
        assert!(!store
            .update_open_span(&span.context(), &mut |stored| stored.name = "late".to_string())
            .unwrap());
    }

    #[test]
    fn test_concurrent_event_appends_are_kept() {
        let store = Arc::new(store(10));
        let span = open_span("load");
        store.upsert_span(&span, false).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let store = store.clone();
                let context = span.context();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        let event = SpanEvent::new(format!("{}-{}", worker, i), Utc::now());
                        assert!(store.add_span_event(&context, &event).unwrap());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stored = store.fetch_span(&span.context()).unwrap().unwrap();
        assert_eq!(stored.events.len(), 100);
    }

    #[test]
    fn test_eviction_removes_oldest_closed_span() {
        let limit = 3;
        let store = store(limit);
        let base = Utc::now();

        let oldest_closed = open_span("oldest")
            .with_start_time(base - Duration::seconds(100))
            .with_end_time(base - Duration::seconds(90));
        let oldest_open = open_span("open").with_start_time(base - Duration::seconds(200));
        let newer_closed = open_span("newer")
            .with_start_time(base - Duration::seconds(50))
            .with_end_time(base - Duration::seconds(40));

        for span in [&oldest_closed, &oldest_open, &newer_closed] {
            store.upsert_span(span, false).unwrap();
        }

        let outcome = store.upsert_span(&open_span("latest"), false).unwrap();
        assert_eq!(outcome, UpsertOutcome::Inserted { evicted: 1 });
        assert_eq!(store.span_count().unwrap(), limit);
        assert!(store.fetch_span(&oldest_closed.context()).unwrap().is_none());
        assert!(store.fetch_span(&oldest_open.context()).unwrap().is_some());
        assert!(store.fetch_span(&newer_closed.context()).unwrap().is_some());
    }

    #[test]
    fn test_eviction_is_per_primary_type() {
        let store = store(1);
        let closed = open_span("perf").with_end_time(Utc::now());
        store.upsert_span(&closed, false).unwrap();

        let view = SpanRecord::new(SpanContext::generate(), "view", SignalType::view());
        let outcome = store.upsert_span(&view, false).unwrap();
        assert_eq!(outcome, UpsertOutcome::Inserted { evicted: 0 });
        assert_eq!(store.span_count().unwrap(), 2);
    }

    #[test]
    fn test_type_override_limits_eviction() {
        let mut limits = HashMap::new();
        limits.insert("ux".to_string(), 1);
        let store = store(10).with_span_limits(limits);

        let first = SpanRecord::new(SpanContext::generate(), "home", SignalType::view())
            .with_end_time(Utc::now());
        store.upsert_span(&first, false).unwrap();
        let second = SpanRecord::new(SpanContext::generate(), "cart", SignalType::view());
        assert_eq!(
            store.upsert_span(&second, false).unwrap(),
            UpsertOutcome::Inserted { evicted: 1 }
        );
    }

    #[test]
    fn test_fetch_logs_excludes_process() {
        let store = store(10);
        let current = ProcessId::current();
        let previous = ProcessId::random();

        store
            .create_log(&LogRecord::new(LogSeverity::Info, "now").with_process(current.clone()))
            .unwrap();
        store
            .create_log(&LogRecord::new(LogSeverity::Info, "before").with_process(previous))
            .unwrap();

        let logs = store.fetch_all_excluding_process(&current).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].body, "before");
    }

    #[test]
    fn test_fetch_logs_oldest_first() {
        let store = store(10);
        let previous = ProcessId::random();
        let now = Utc::now();
        for (body, offset) in [("second", 5), ("first", 0), ("third", 10)] {
            store
                .create_log(
                    &LogRecord::new(LogSeverity::Info, body)
                        .with_process(previous.clone())
                        .with_timestamp(now + Duration::seconds(offset)),
                )
                .unwrap();
        }

        let bodies: Vec<String> = store
            .fetch_all_excluding_process(&ProcessId::current())
            .unwrap()
            .into_iter()
            .map(|log| log.body)
            .collect();
        assert_eq!(bodies, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_remove_logs_by_identity() {
        let store = store(10);
        let first = LogRecord::new(LogSeverity::Info, "first");
        let second = LogRecord::new(LogSeverity::Info, "second");
        store.create_log(&first).unwrap();
        store.create_log(&second).unwrap();

        assert_eq!(store.remove_logs(&[first.clone()]).unwrap(), 1);
        assert!(!store.contains_log(&first.id).unwrap());
        assert!(store.contains_log(&second.id).unwrap());
        assert_eq!(store.remove_logs(&[first]).unwrap(), 0);
        assert_eq!(store.remove_all_logs().unwrap(), 1);
    }

    #[test]
    fn test_clean_up_spans_by_age() {
        let store = store(10);
        let now = Utc::now();
        let old = open_span("old").with_end_time(now - Duration::days(10));
        let recent = open_span("recent").with_end_time(now - Duration::hours(1));
        let open = open_span("open");
        for span in [&old, &recent, &open] {
            store.upsert_span(span, false).unwrap();
        }

        let removed = store.clean_up_spans(Some(now - Duration::days(7))).unwrap();
        assert_eq!(removed, 1);
        assert!(store.fetch_span(&old.context()).unwrap().is_none());
        assert!(store.fetch_span(&open.context()).unwrap().is_some());
    }

    #[test]
    fn test_clean_up_without_date_keeps_current_process() {
        let store = store(10);
        let previous = open_span("previous")
            .with_process(ProcessId::random())
            .with_end_time(Utc::now());
        let current = open_span("current").with_end_time(Utc::now());
        store.upsert_span(&previous, false).unwrap();
        store.upsert_span(&current, false).unwrap();

        assert_eq!(store.clean_up_spans(None).unwrap(), 1);
        assert!(store.fetch_span(&current.context()).unwrap().is_some());
    }

    #[test]
    fn test_close_open_spans_from_previous_process() {
        let store = store(10);
        let previous = open_span("previous").with_process(ProcessId::random());
        let current = open_span("current");
        store.upsert_span(&previous, false).unwrap();
        store.upsert_span(&current, false).unwrap();

        assert_eq!(store.close_open_spans(Utc::now()).unwrap(), 1);
        assert!(store.fetch_span(&previous.context()).unwrap().unwrap().is_closed());
        assert!(!store.fetch_span(&current.context()).unwrap().unwrap().is_closed());
    }

    #[test]
    fn test_sessions_latest_and_delete() {
        let store = store(10);
        let mut older = SessionRecord::new(SessionId::random(), ProcessId::current(), SessionState::Foreground);
        older.start_time = Utc::now() - Duration::minutes(5);
        let newer = SessionRecord::new(SessionId::random(), ProcessId::current(), SessionState::Background);
        store.upsert_session(&older).unwrap();
        store.upsert_session(&newer).unwrap();

        assert_eq!(store.latest_session().unwrap().unwrap().id, newer.id);
        assert!(store.delete_session(&newer.id).unwrap());
        assert!(!store.delete_session(&newer.id).unwrap());
        assert_eq!(store.latest_session().unwrap().unwrap().id, older.id);
    }

    #[test]
    fn test_metadata_scoping() {
        let store = store(10);
        let session = SessionId::random();
        let other = SessionId::random();
        let process = ProcessId::current();

        store
            .add_metadata(&MetadataRecord::new(
                "os.version",
                "17.0",
                MetadataKind::Resource,
                MetadataLifespan::Process(process.clone()),
            ))
            .unwrap();
        store
            .add_metadata(&MetadataRecord::new(
                "plan",
                "pro",
                MetadataKind::CustomProperty,
                MetadataLifespan::Session(session.clone()),
            ))
            .unwrap();
        store
            .add_metadata(&MetadataRecord::new(
                "plan",
                "free",
                MetadataKind::CustomProperty,
                MetadataLifespan::Session(other),
            ))
            .unwrap();

        let properties = store
            .fetch_metadata(&[MetadataKind::CustomProperty], Some(&session), &process)
            .unwrap();
        assert_eq!(properties.len(), 1);
        assert_eq!(properties[0].value, "pro");

        let resources = store
            .fetch_metadata(&[MetadataKind::Resource], None, &process)
            .unwrap();
        assert_eq!(resources.len(), 1);
    }

    #[test]
    fn test_metadata_replaces_same_key() {
        let store = store(10);
        let process = ProcessId::current();
        for value in ["1.0", "1.1"] {
            store
                .add_metadata(&MetadataRecord::new(
                    "sdk.version",
                    value,
                    MetadataKind::RequiredResource,
                    MetadataLifespan::Permanent,
                ))
                .unwrap();
        }

        let records = store
            .fetch_metadata(&[MetadataKind::RequiredResource], None, &process)
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value, "1.1");
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signals.db");

        let log = LogRecord::new(LogSeverity::Error, "crashed").with_process(ProcessId::random());
        let span = open_span("load");
        {
            let store = SqliteStore::open(&path, 10).unwrap();
            store.create_log(&log).unwrap();
            store.upsert_span(&span, false).unwrap();
            store
                .upsert_session(&SessionRecord::new(
                    SessionId::random(),
                    ProcessId::current(),
                    SessionState::Foreground,
                ))
                .unwrap();
        }

        let reopened = SqliteStore::open(&path, 10).unwrap();
        assert!(reopened.contains_log(&log.id).unwrap());
        assert!(reopened.fetch_span(&span.context()).unwrap().is_some());
        assert!(reopened.latest_session().unwrap().is_some());
    }

    #[test]
    fn test_corrupt_file_is_database_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signals.db");
        std::fs::write(&path, vec![b'x'; 4096]).unwrap();

        let result = SqliteStore::open(&path, 10);
        assert!(matches!(result, Err(PipelineError::Database(_))));
    }

    #[test]
    fn test_corrupt_row_fails_fetch() {
        let store = store(10);
        store
            .conn
            .lock()
            .execute(
                "INSERT INTO logs (id, process_id, timestamp, record) VALUES ('x', 'p', 0, 'not json')",
                [],
            )
            .unwrap();

        let result = store.fetch_all_excluding_process(&ProcessId::current());
        assert!(matches!(result, Err(PipelineError::Json(_))));
    }
}
