//! Conversion between OpenTelemetry SDK signals and store records

use crate::errors::{PipelineError, Result};
use crate::telemetry::{
    generate_log_id, keys, Attributes, LogRecord, LogSeverity, ProcessId, SessionId, SessionState,
    SignalType, SpanContext, SpanEvent, SpanLink, SpanRecord, SpanStatus,
};
use chrono::{DateTime, Utc};
use opentelemetry::logs::{AnyValue, Severity};
use opentelemetry::trace::{
    Event, Link, SpanContext as OtelSpanContext, SpanId, Status, TraceFlags, TraceId, TraceState,
};
use opentelemetry::{KeyValue, Value};
use opentelemetry_sdk::logs::SdkLogRecord;
use opentelemetry_sdk::trace::SpanData;

/// Source of the session context stamped onto signals
pub trait SessionMetadata: Send + Sync {
    fn current_session_id(&self) -> Option<SessionId>;

    fn current_session_state(&self) -> SessionState;

    fn process_id(&self) -> ProcessId {
        ProcessId::current()
    }
}

/// Metadata source for signals produced outside of any session
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSession;

impl SessionMetadata for NoSession {
    fn current_session_id(&self) -> Option<SessionId> {
        None
    }

    fn current_session_state(&self) -> SessionState {
        SessionState::Unknown
    }
}

impl From<&OtelSpanContext> for SpanContext {
    fn from(context: &OtelSpanContext) -> Self {
        SpanContext::new(context.span_id().to_string(), context.trace_id().to_string())
    }
}

/// Sampled SDK span context for a stored identity
pub fn otel_context(context: &SpanContext) -> Result<OtelSpanContext> {
    let trace_id = TraceId::from_hex(&context.trace_id)
        .map_err(|e| PipelineError::Other(format!("invalid trace id {}: {}", context.trace_id, e)))?;
    let span_id = SpanId::from_hex(&context.span_id)
        .map_err(|e| PipelineError::Other(format!("invalid span id {}: {}", context.span_id, e)))?;

    Ok(OtelSpanContext::new(
        trace_id,
        span_id,
        TraceFlags::SAMPLED,
        true,
        TraceState::default(),
    ))
}

pub fn key_values(attributes: &Attributes) -> Vec<KeyValue> {
    attributes
        .iter()
        .map(|(key, value)| KeyValue::new(key.clone(), value.clone()))
        .collect()
}

fn attributes_from(key_values: &[KeyValue]) -> Attributes {
    key_values
        .iter()
        .map(|kv| (kv.key.as_str().to_string(), value_string(&kv.value)))
        .collect()
}

fn value_string(value: &Value) -> String {
    value.as_str().into_owned()
}

fn any_value_string(value: &AnyValue) -> String {
    match value {
        AnyValue::String(s) => s.as_str().to_string(),
        AnyValue::Int(i) => i.to_string(),
        AnyValue::Double(d) => d.to_string(),
        AnyValue::Boolean(b) => b.to_string(),
        other => format!("{other:?}"),
    }
}

pub fn otel_status(status: SpanStatus) -> Status {
    match status {
        SpanStatus::Unset => Status::Unset,
        SpanStatus::Ok => Status::Ok,
        SpanStatus::Error => Status::error(""),
    }
}

fn span_status(status: &Status) -> SpanStatus {
    match status {
        Status::Unset => SpanStatus::Unset,
        Status::Ok => SpanStatus::Ok,
        Status::Error { .. } => SpanStatus::Error,
    }
}

pub fn otel_event(event: &SpanEvent) -> Event {
    Event::new(
        event.name.clone(),
        event.timestamp.into(),
        key_values(&event.attributes),
        0,
    )
}

pub fn otel_link(link: &SpanLink) -> Result<Link> {
    let context = otel_context(&SpanContext::new(link.span_id.clone(), link.trace_id.clone()))?;
    Ok(Link::new(context, key_values(&link.attributes), 0))
}

pub fn otel_severity(severity: LogSeverity) -> Severity {
    match severity {
        LogSeverity::Trace => Severity::Trace,
        LogSeverity::Debug => Severity::Debug,
        LogSeverity::Info => Severity::Info,
        LogSeverity::Warn => Severity::Warn,
        LogSeverity::Error => Severity::Error,
        LogSeverity::Fatal => Severity::Fatal,
    }
}

/// Build the store record for a span the SDK started or ended. The SDK fills
/// `end_time` with the start time until the span ends, so only `ended` decides.
fn span_record(
    data: &SpanData,
    ended: bool,
    session_id: Option<SessionId>,
    process_id: ProcessId,
) -> SpanRecord {
    let parent_span_id = (data.parent_span_id != SpanId::INVALID).then(|| data.parent_span_id.to_string());

    SpanRecord {
        span_id: data.span_context.span_id().to_string(),
        trace_id: data.span_context.trace_id().to_string(),
        parent_span_id,
        name: data.name.to_string(),
        span_type: SignalType::performance(),
        status: span_status(&data.status),
        start_time: data.start_time.into(),
        end_time: ended.then(|| data.end_time.into()),
        events: data
            .events
            .events
            .iter()
            .map(|event| SpanEvent {
                name: event.name.to_string(),
                timestamp: event.timestamp.into(),
                attributes: attributes_from(&event.attributes),
            })
            .collect(),
        links: data
            .links
            .links
            .iter()
            .map(|link| {
                let context = SpanContext::from(&link.span_context);
                SpanLink {
                    span_id: context.span_id,
                    trace_id: context.trace_id,
                    attributes: attributes_from(&link.attributes),
                }
            })
            .collect(),
        attributes: attributes_from(&data.attributes),
        session_id,
        process_id,
    }
}

/// Stamp type, state and session onto a span created by other code
fn stamp_external_span(record: &mut SpanRecord, metadata: &dyn SessionMetadata) {
    let span_type = record
        .attributes
        .entry(keys::EMB_TYPE.to_string())
        .or_insert_with(|| SignalType::performance().to_string())
        .clone();
    record.span_type = SignalType::new(span_type);
    record.attributes.insert(
        keys::EMB_STATE.to_string(),
        metadata.current_session_state().as_str().to_string(),
    );
    if let Some(session_id) = &record.session_id {
        record
            .attributes
            .insert(keys::SESSION_ID.to_string(), session_id.to_string());
    }
}

/// Adapt an SDK span created by other code
pub fn external_span(data: &SpanData, ended: bool, metadata: &dyn SessionMetadata) -> SpanRecord {
    let mut record = span_record(data, ended, metadata.current_session_id(), metadata.process_id());
    stamp_external_span(&mut record, metadata);
    record
}

/// Adapt an SDK log emitted by other code. Logs without an id get a fresh one.
pub fn external_log(data: &SdkLogRecord, metadata: &dyn SessionMetadata) -> LogRecord {
    let mut attributes: Attributes = data
        .attributes_iter()
        .map(|(key, value)| (key.as_str().to_string(), any_value_string(value)))
        .collect();
    stamp_external_log(&mut attributes, metadata);

    let id = attributes
        .entry(keys::LOG_ID.to_string())
        .or_insert_with(generate_log_id)
        .clone();
    let log_type = attributes
        .get(keys::EMB_TYPE)
        .cloned()
        .unwrap_or_else(|| SignalType::message().to_string());

    LogRecord {
        id,
        process_id: metadata.process_id(),
        session_id: metadata.current_session_id(),
        severity: data
            .severity_number()
            .map(|severity| LogSeverity::from_number(severity as u8))
            .unwrap_or(LogSeverity::Info),
        body: data.body().map(any_value_string).unwrap_or_default(),
        log_type: SignalType::new(log_type),
        timestamp: data
            .timestamp()
            .or_else(|| data.observed_timestamp())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(Utc::now),
        attributes,
    }
}

fn stamp_external_log(attributes: &mut Attributes, metadata: &dyn SessionMetadata) {
    attributes
        .entry(keys::EMB_TYPE.to_string())
        .or_insert_with(|| SignalType::message().to_string());
    attributes.insert(
        keys::EMB_STATE.to_string(),
        metadata.current_session_state().as_str().to_string(),
    );
    if let Some(session_id) = metadata.current_session_id() {
        attributes.insert(keys::SESSION_ID.to_string(), session_id.to_string());
    }
}
