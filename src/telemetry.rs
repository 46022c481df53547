//! Telemetry data structures and utilities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use uuid::Uuid;

/// String-keyed attribute map shared by spans, events, links and logs
pub type Attributes = BTreeMap<String, String>;

/// Well-known attribute keys
pub mod keys {
    pub const EMB_TYPE: &str = "emb.type";
    pub const EMB_STATE: &str = "emb.state";
    pub const SESSION_ID: &str = "session.id";
    pub const ERROR_CODE: &str = "emb.error_code";
    pub const LOG_ID: &str = "log.record.uid";
    pub const ATTACHMENT_ID: &str = "emb.attachment_id";
    pub const ATTACHMENT_SIZE: &str = "emb.attachment_size";
    pub const ATTACHMENT_URL: &str = "emb.attachment_url";
    pub const ATTACHMENT_ERROR_CODE: &str = "emb.attachment_error_code";
}

/// Identity of a span: unique per (span_id, trace_id) pair
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpanContext {
    pub span_id: String,
    pub trace_id: String,
}

impl SpanContext {
    pub fn new(span_id: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            span_id: span_id.into(),
            trace_id: trace_id.into(),
        }
    }

    /// A fresh random context in W3C hex format
    pub fn generate() -> Self {
        Self::new(generate_span_id(), generate_trace_id())
    }
}

impl std::fmt::Display for SpanContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.trace_id, self.span_id)
    }
}

/// Identifier of a session
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn random() -> Self {
        SessionId(Uuid::new_v4().simple().to_string().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of the process that produced a record
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ProcessId(pub String);

impl ProcessId {
    pub fn random() -> Self {
        ProcessId(format!("{:08x}", rand::random::<u32>()))
    }

    /// Identifier of the running process, fixed for its lifetime
    pub fn current() -> ProcessId {
        static CURRENT: OnceLock<ProcessId> = OnceLock::new();
        CURRENT.get_or_init(ProcessId::random).clone()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Semantic category of a signal, e.g. `perf.network` or `sys.log`
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct SignalType(String);

impl SignalType {
    pub fn new(raw: impl Into<String>) -> Self {
        SignalType(raw.into())
    }

    pub fn performance() -> Self {
        SignalType::new("perf")
    }

    pub fn network() -> Self {
        SignalType::new("perf.network")
    }

    pub fn view() -> Self {
        SignalType::new("ux.view")
    }

    pub fn session() -> Self {
        SignalType::new("ux.session")
    }

    pub fn message() -> Self {
        SignalType::new("sys.log")
    }

    pub fn internal() -> Self {
        SignalType::new("sys.internal")
    }

    pub fn crash() -> Self {
        SignalType::new("sys.ios_crash")
    }

    pub fn hang() -> Self {
        SignalType::new("perf.thread_blockage")
    }

    pub fn breadcrumb() -> Self {
        SignalType::new("sys.breadcrumb")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The part before the first `.`; retention limits are applied per primary type
    pub fn primary(&self) -> &str {
        self.0.split('.').next().unwrap_or_default()
    }
}

impl Default for SignalType {
    fn default() -> Self {
        SignalType::performance()
    }
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum SpanStatus {
    #[default]
    Unset,
    Ok,
    Error,
}

impl std::fmt::Display for SpanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpanStatus::Unset => write!(f, "UNSET"),
            SpanStatus::Ok => write!(f, "OK"),
            SpanStatus::Error => write!(f, "ERROR"),
        }
    }
}

/// Code attached to spans that get closed on behalf of their creator
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SpanErrorCode {
    Failure,
    UserAbandon,
    Unknown,
}

impl SpanErrorCode {
    pub fn name(&self) -> &'static str {
        match self {
            SpanErrorCode::Failure => "failure",
            SpanErrorCode::UserAbandon => "user_abandon",
            SpanErrorCode::Unknown => "unknown",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SpanEvent {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub attributes: Attributes,
}

impl SpanEvent {
    pub fn new(name: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            timestamp,
            attributes: Attributes::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SpanLink {
    pub span_id: String,
    pub trace_id: String,
    #[serde(default)]
    pub attributes: Attributes,
}

impl SpanLink {
    pub fn new(span_id: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            span_id: span_id.into(),
            trace_id: trace_id.into(),
            attributes: Attributes::new(),
        }
    }
}

/// A persisted span. Open while `end_time` is `None`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SpanRecord {
    pub span_id: String,
    pub trace_id: String,
    pub parent_span_id: Option<String>,
    pub name: String,
    pub span_type: SignalType,
    pub status: SpanStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub events: Vec<SpanEvent>,
    #[serde(default)]
    pub links: Vec<SpanLink>,
    #[serde(default)]
    pub attributes: Attributes,
    pub session_id: Option<SessionId>,
    pub process_id: ProcessId,
}

impl SpanRecord {
    pub fn new(context: SpanContext, name: impl Into<String>, span_type: SignalType) -> Self {
        Self {
            span_id: context.span_id,
            trace_id: context.trace_id,
            parent_span_id: None,
            name: name.into(),
            span_type,
            status: SpanStatus::Unset,
            start_time: Utc::now(),
            end_time: None,
            events: Vec::new(),
            links: Vec::new(),
            attributes: Attributes::new(),
            session_id: None,
            process_id: ProcessId::current(),
        }
    }

    pub fn context(&self) -> SpanContext {
        SpanContext::new(self.span_id.clone(), self.trace_id.clone())
    }

    pub fn is_closed(&self) -> bool {
        self.end_time.is_some()
    }

    /// Close with an error status and the error code attribute
    pub fn close_with_error(&mut self, code: SpanErrorCode, end_time: DateTime<Utc>) {
        self.attributes
            .insert(keys::ERROR_CODE.to_string(), code.name().to_string());
        self.status = SpanStatus::Error;
        self.end_time = Some(end_time);
    }

    pub fn with_parent(mut self, parent_span_id: impl Into<String>) -> Self {
        self.parent_span_id = Some(parent_span_id.into());
        self
    }

    pub fn with_start_time(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = start_time;
        self
    }

    pub fn with_end_time(mut self, end_time: DateTime<Utc>) -> Self {
        self.end_time = Some(end_time);
        self
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_process(mut self, process_id: ProcessId) -> Self {
        self.process_id = process_id;
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LogSeverity {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogSeverity {
    /// OpenTelemetry severity number
    pub fn number(&self) -> u8 {
        match self {
            LogSeverity::Trace => 1,
            LogSeverity::Debug => 5,
            LogSeverity::Info => 9,
            LogSeverity::Warn => 13,
            LogSeverity::Error => 17,
            LogSeverity::Fatal => 21,
        }
    }

    pub fn from_number(number: u8) -> Self {
        match number {
            0..=4 => LogSeverity::Trace,
            5..=8 => LogSeverity::Debug,
            9..=12 => LogSeverity::Info,
            13..=16 => LogSeverity::Warn,
            17..=20 => LogSeverity::Error,
            _ => LogSeverity::Fatal,
        }
    }
}

impl std::fmt::Display for LogSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogSeverity::Trace => write!(f, "TRACE"),
            LogSeverity::Debug => write!(f, "DEBUG"),
            LogSeverity::Info => write!(f, "INFO"),
            LogSeverity::Warn => write!(f, "WARN"),
            LogSeverity::Error => write!(f, "ERROR"),
            LogSeverity::Fatal => write!(f, "FATAL"),
        }
    }
}

impl From<&str> for LogSeverity {
    fn from(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "TRACE" | "VERBOSE" => LogSeverity::Trace,
            "DEBUG" => LogSeverity::Debug,
            "INFO" | "INFORMATION" => LogSeverity::Info,
            "WARN" | "WARNING" => LogSeverity::Warn,
            "ERROR" | "ERR" => LogSeverity::Error,
            "FATAL" | "CRITICAL" => LogSeverity::Fatal,
            _ => LogSeverity::Info,
        }
    }
}

/// A persisted log. Immutable once created.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LogRecord {
    pub id: String,
    pub process_id: ProcessId,
    pub session_id: Option<SessionId>,
    pub severity: LogSeverity,
    pub body: String,
    pub log_type: SignalType,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub attributes: Attributes,
}

impl LogRecord {
    pub fn new(severity: LogSeverity, body: impl Into<String>) -> Self {
        Self {
            id: generate_log_id(),
            process_id: ProcessId::current(),
            session_id: None,
            severity,
            body: body.into(),
            log_type: SignalType::message(),
            timestamp: Utc::now(),
            attributes: Attributes::new(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_type(mut self, log_type: SignalType) -> Self {
        self.log_type = log_type;
        self
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_process(mut self, process_id: ProcessId) -> Self {
        self.process_id = process_id;
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes.extend(attributes);
        self
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Foreground,
    Background,
    #[default]
    Unknown,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Foreground => "foreground",
            SessionState::Background => "background",
            SessionState::Unknown => "unknown",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    pub id: SessionId,
    pub process_id: ProcessId,
    pub state: SessionState,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_heartbeat_time: DateTime<Utc>,
    pub cold_start: bool,
    pub clean_exit: bool,
    pub app_terminated: bool,
    pub crash_report_id: Option<String>,
}

impl SessionRecord {
    pub fn new(id: SessionId, process_id: ProcessId, state: SessionState) -> Self {
        let now = Utc::now();
        Self {
            id,
            process_id,
            state,
            start_time: now,
            end_time: None,
            last_heartbeat_time: now,
            cold_start: false,
            clean_exit: false,
            app_terminated: false,
            crash_report_id: None,
        }
    }
}

/// Kind of a key/value metadata record
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MetadataKind {
    Resource,
    RequiredResource,
    CustomProperty,
    PersonaTag,
}

/// How long a metadata record applies
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum MetadataLifespan {
    Session(SessionId),
    Process(ProcessId),
    Permanent,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MetadataRecord {
    pub key: String,
    pub value: String,
    pub kind: MetadataKind,
    pub lifespan: MetadataLifespan,
    pub collected_at: DateTime<Utc>,
}

impl MetadataRecord {
    pub fn new(
        key: impl Into<String>,
        value: impl Into<String>,
        kind: MetadataKind,
        lifespan: MetadataLifespan,
    ) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            kind,
            lifespan,
            collected_at: Utc::now(),
        }
    }
}

/// Generate a new trace ID
pub fn generate_trace_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

/// Generate a new span ID
pub fn generate_span_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

/// Generate a new log ID
pub fn generate_log_id() -> String {
    Uuid::new_v4().to_string()
}
