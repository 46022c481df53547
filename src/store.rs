//! Repository traits for spans, logs, sessions and metadata
//!
//! Every mutation of an open span goes through `update_open_span`, which an
//! implementation must run as a single read-modify-write so that concurrent
//! writers never interleave between the read and the write.

use crate::errors::Result;
use crate::telemetry::{
    Attributes, LogRecord, MetadataKind, MetadataRecord, ProcessId, SessionId, SessionRecord,
    SpanContext, SpanEvent, SpanLink, SpanRecord, SpanStatus,
};
use chrono::{DateTime, Utc};

/// Result of `SpanRepository::upsert_span`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// A new record was stored, after evicting the given number of old spans
    Inserted { evicted: usize },
    /// An open record was merged with the incoming state
    Updated,
    /// The stored record is closed and was left untouched
    Closed,
    /// No record existed and the caller only allowed updates
    Skipped,
}

pub trait SpanRepository: Send + Sync {
    /// Insert the span, or merge it into the stored open record with the same identity
    fn upsert_span(&self, span: &SpanRecord, only_update: bool) -> Result<UpsertOutcome>;

    fn fetch_span(&self, context: &SpanContext) -> Result<Option<SpanRecord>>;

    /// Apply `update` to the stored span if it is still open, atomically.
    /// Returns false if the span is missing or already closed.
    fn update_open_span(
        &self,
        context: &SpanContext,
        update: &mut dyn FnMut(&mut SpanRecord),
    ) -> Result<bool>;

    /// Set the end time of an open span. Returns false if missing or already closed.
    fn end_span(&self, context: &SpanContext, end_time: DateTime<Utc>) -> Result<bool> {
        self.update_open_span(context, &mut |span| span.end_time = Some(end_time))
    }

    fn set_span_status(&self, context: &SpanContext, status: SpanStatus) -> Result<bool> {
        self.update_open_span(context, &mut |span| span.status = status)
    }

    fn set_span_attributes(&self, context: &SpanContext, attributes: &Attributes) -> Result<bool> {
        self.update_open_span(context, &mut |span| span.attributes = attributes.clone())
    }

    fn add_span_event(&self, context: &SpanContext, event: &SpanEvent) -> Result<bool> {
        self.update_open_span(context, &mut |span| span.events.push(event.clone()))
    }

    fn add_span_link(&self, context: &SpanContext, link: &SpanLink) -> Result<bool> {
        self.update_open_span(context, &mut |span| span.links.push(link.clone()))
    }

    fn spans_for_session(&self, session_id: &SessionId) -> Result<Vec<SpanRecord>>;

    fn open_spans_for_session(&self, session_id: &SessionId) -> Result<Vec<SpanRecord>> {
        Ok(self
            .spans_for_session(session_id)?
            .into_iter()
            .filter(|span| !span.is_closed())
            .collect())
    }

    /// Remove closed spans that ended before `before`, or all closed spans
    /// from other processes when no date is given
    fn clean_up_spans(&self, before: Option<DateTime<Utc>>) -> Result<usize>;

    /// Close every open span left behind by a previous process
    fn close_open_spans(&self, end_time: DateTime<Utc>) -> Result<usize>;
}

pub trait LogRepository: Send + Sync {
    fn create_log(&self, log: &LogRecord) -> Result<()>;

    /// All logs not written by `process_id`, oldest first
    fn fetch_all_excluding_process(&self, process_id: &ProcessId) -> Result<Vec<LogRecord>>;

    /// Remove exactly the given logs, matched by identity
    fn remove_logs(&self, logs: &[LogRecord]) -> Result<usize>;

    fn remove_all_logs(&self) -> Result<usize>;
}

pub trait SessionRepository: Send + Sync {
    fn upsert_session(&self, session: &SessionRecord) -> Result<()>;

    fn fetch_session(&self, id: &SessionId) -> Result<Option<SessionRecord>>;

    fn latest_session(&self) -> Result<Option<SessionRecord>>;

    fn delete_session(&self, id: &SessionId) -> Result<bool>;
}

pub trait MetadataRepository: Send + Sync {
    /// Insert or replace the record with the same key, kind and lifespan
    fn add_metadata(&self, record: &MetadataRecord) -> Result<()>;

    /// Records of the given kinds visible to the session or process
    fn fetch_metadata(
        &self,
        kinds: &[MetadataKind],
        session_id: Option<&SessionId>,
        process_id: &ProcessId,
    ) -> Result<Vec<MetadataRecord>>;
}

/// Everything the pipeline needs from persistence
pub trait RecordStore: SpanRepository + LogRepository + SessionRepository + MetadataRepository {}

impl<T> RecordStore for T where
    T: SpanRepository + LogRepository + SessionRepository + MetadataRepository
{
}

/// Merge an incoming span state into the stored open record.
/// Events and links only ever grow.
pub fn merge_span(stored: &mut SpanRecord, incoming: &SpanRecord) {
    stored.name = incoming.name.clone();
    stored.parent_span_id = incoming.parent_span_id.clone();
    stored.span_type = incoming.span_type.clone();
    stored.status = incoming.status;
    stored.start_time = incoming.start_time;
    stored.end_time = incoming.end_time;
    stored.process_id = incoming.process_id.clone();
    stored.session_id = incoming.session_id.clone();
    stored.attributes = incoming.attributes.clone();
    merge_growing(&mut stored.events, &incoming.events);
    merge_growing(&mut stored.links, &incoming.links);
}

/// Replace the known entries and append the new tail; never shrink
fn merge_growing<T: Clone>(stored: &mut Vec<T>, incoming: &[T]) {
    if incoming.len() < stored.len() {
        return;
    }

    for (current, updated) in stored.iter_mut().zip(incoming.iter()) {
        *current = updated.clone();
    }

    let known = stored.len();
    stored.extend(incoming[known..].iter().cloned());
}
