//! Span and log creation API
//!
//! `SignalsHandler` creates signals through the bridge and persists them
//! directly. It is also the bridge's delegate, persisting external signals the
//! same way.

use crate::adapter::SessionMetadata;
use crate::attachment::{Attachment, AttachmentPolicy};
use crate::batch::LogBatcher;
use crate::bridge::{SignalBridge, SignalDelegate};
use crate::controller::LogController;
use crate::errors::{PipelineError, Result};
use crate::limiter::SignalLimiter;
use crate::sanitizer::SignalSanitizer;
use crate::store::{RecordStore, UpsertOutcome};
use crate::telemetry::{
    generate_span_id, keys, Attributes, LogRecord, LogSeverity, SignalType, SpanContext,
    SpanErrorCode, SpanEvent, SpanLink, SpanRecord, SpanStatus,
};
use crate::termination::AutoTerminationSweep;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Parameters of a new span
#[derive(Debug, Clone)]
pub struct SpanOptions {
    pub name: String,
    pub span_type: SignalType,
    pub parent: Option<SpanContext>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: SpanStatus,
    pub events: Vec<SpanEvent>,
    pub links: Vec<SpanLink>,
    pub attributes: Attributes,
    pub auto_termination_code: Option<SpanErrorCode>,
    /// Internal spans skip the limiter and the sanitizer
    pub internal: bool,
}

impl SpanOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            span_type: SignalType::performance(),
            parent: None,
            start_time: None,
            end_time: None,
            status: SpanStatus::Unset,
            events: Vec::new(),
            links: Vec::new(),
            attributes: Attributes::new(),
            auto_termination_code: None,
            internal: false,
        }
    }

    pub fn with_type(mut self, span_type: SignalType) -> Self {
        self.span_type = span_type;
        self
    }

    pub fn with_parent(mut self, parent: SpanContext) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_start_time(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = Some(start_time);
        self
    }

    pub fn with_end_time(mut self, end_time: DateTime<Utc>) -> Self {
        self.end_time = Some(end_time);
        self
    }

    pub fn with_status(mut self, status: SpanStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_event(mut self, event: SpanEvent) -> Self {
        self.events.push(event);
        self
    }

    pub fn with_link(mut self, link: SpanLink) -> Self {
        self.links.push(link);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_auto_termination(mut self, code: SpanErrorCode) -> Self {
        self.auto_termination_code = Some(code);
        self
    }

    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }
}

/// Parameters of a new log
#[derive(Debug, Clone)]
pub struct LogOptions {
    pub severity: LogSeverity,
    pub body: String,
    pub log_type: SignalType,
    pub timestamp: Option<DateTime<Utc>>,
    pub attributes: Attributes,
    pub attachment: Option<Attachment>,
    pub internal: bool,
}

impl LogOptions {
    pub fn new(severity: LogSeverity, body: impl Into<String>) -> Self {
        Self {
            severity,
            body: body.into(),
            log_type: SignalType::message(),
            timestamp: None,
            attributes: Attributes::new(),
            attachment: None,
            internal: false,
        }
    }

    pub fn with_type(mut self, log_type: SignalType) -> Self {
        self.log_type = log_type;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }

    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }
}

struct Shared {
    store: Arc<dyn RecordStore>,
    bridge: Arc<SignalBridge>,
    sanitizer: Arc<dyn SignalSanitizer>,
    limiter: Arc<dyn SignalLimiter>,
    metadata: Arc<dyn SessionMetadata>,
    sweep: Arc<AutoTerminationSweep>,
    batcher: Arc<LogBatcher>,
    controller: Arc<LogController>,
    attachments: Arc<AttachmentPolicy>,
}

/// Collaborators of the handler
pub struct HandlerParts {
    pub store: Arc<dyn RecordStore>,
    pub bridge: Arc<SignalBridge>,
    pub sanitizer: Arc<dyn SignalSanitizer>,
    pub limiter: Arc<dyn SignalLimiter>,
    pub metadata: Arc<dyn SessionMetadata>,
    pub sweep: Arc<AutoTerminationSweep>,
    pub batcher: Arc<LogBatcher>,
    pub controller: Arc<LogController>,
    pub attachments: Arc<AttachmentPolicy>,
}

pub struct SignalsHandler {
    shared: Arc<Shared>,
}

impl SignalsHandler {
    pub fn new(parts: HandlerParts) -> Self {
        Self {
            shared: Arc::new(Shared {
                store: parts.store,
                bridge: parts.bridge,
                sanitizer: parts.sanitizer,
                limiter: parts.limiter,
                metadata: parts.metadata,
                sweep: parts.sweep,
                batcher: parts.batcher,
                controller: parts.controller,
                attachments: parts.attachments,
            }),
        }
    }

    /// Create a span, persist it and return a handle to update it
    #[instrument(skip(self, options), fields(name = %options.name, internal = options.internal))]
    pub fn create_span(&self, options: SpanOptions) -> Result<SpanHandle> {
        let shared = &self.shared;
        let mut options = options;

        if !options.internal {
            if !shared.limiter.should_create_custom_span() {
                debug!("Span {} rejected by limiter", options.name);
                return Err(PipelineError::SpanLimitReached);
            }

            let sanitizer = &shared.sanitizer;
            options.name = sanitizer.sanitize_span_name(&options.name);
            options.attributes = sanitizer.sanitize_span_attributes(options.attributes);
            for event in &mut options.events {
                event.name = sanitizer.sanitize_event_name(&event.name);
                event.attributes = sanitizer.sanitize_event_attributes(std::mem::take(&mut event.attributes));
            }
            for link in &mut options.links {
                link.attributes = sanitizer.sanitize_link_attributes(std::mem::take(&mut link.attributes));
            }
        }

        let session_id = shared.metadata.current_session_id();
        let mut attributes = options.attributes;
        attributes.insert(keys::EMB_TYPE.to_string(), options.span_type.to_string());
        if let Some(session_id) = &session_id {
            attributes.insert(keys::SESSION_ID.to_string(), session_id.to_string());
        }

        let code = options.auto_termination_code.or_else(|| {
            options
                .parent
                .as_ref()
                .and_then(|parent| shared.sweep.code_for(&parent.span_id))
        });

        let context = match &options.parent {
            Some(parent) => SpanContext::new(generate_span_id(), parent.trace_id.clone()),
            None => SpanContext::generate(),
        };
        let mut record = SpanRecord::new(context.clone(), options.name.clone(), options.span_type.clone())
            .with_process(shared.metadata.process_id());
        record.parent_span_id = options.parent.map(|parent| parent.span_id);
        record.status = options.status;
        record.events = options.events;
        record.links = options.links;
        record.attributes = attributes;
        record.session_id = session_id;
        if let Some(start_time) = options.start_time {
            record.start_time = start_time;
        }
        record.end_time = options.end_time;

        shared.bridge.start_span(&record)?;
        if let Err(e) = shared.store.upsert_span(&record, false) {
            warn!("Failed to persist span {}: {}", context, e);
            shared.bridge.end_span(&context, Utc::now());
            return Err(e);
        }

        if let Some(code) = code {
            if !record.is_closed() {
                shared.sweep.register(&context.span_id, code);
            }
        }

        Ok(SpanHandle {
            context,
            name: options.name,
            span_type: options.span_type,
            shared: self.shared.clone(),
            counts: Mutex::new(HandleCounts::default()),
        })
    }

    /// Create a log, persist it and queue it for upload
    #[instrument(skip(self, options), fields(severity = %options.severity, internal = options.internal))]
    pub fn create_log(&self, options: LogOptions) -> Result<LogRecord> {
        let shared = &self.shared;

        if !options.internal && !shared.limiter.should_create_log(&options.log_type, options.severity) {
            debug!("Log rejected by limiter");
            return Err(PipelineError::LogLimitReached);
        }

        let mut attributes = shared.sanitizer.sanitize_log_attributes(options.attributes);
        let pending = options
            .attachment
            .and_then(|attachment| shared.attachments.apply(attachment, &mut attributes));
        attributes.insert(keys::EMB_TYPE.to_string(), options.log_type.to_string());

        let session_id = shared.metadata.current_session_id();
        let mut record = LogRecord::new(options.severity, options.body)
            .with_type(options.log_type)
            .with_process(shared.metadata.process_id())
            .with_attributes(attributes);
        if let Some(timestamp) = options.timestamp {
            record.timestamp = timestamp;
        }
        record.attributes.insert(
            keys::EMB_STATE.to_string(),
            shared.metadata.current_session_state().as_str().to_string(),
        );
        record.attributes.insert(keys::LOG_ID.to_string(), record.id.clone());
        if let Some(session_id) = &session_id {
            record
                .attributes
                .insert(keys::SESSION_ID.to_string(), session_id.to_string());
        }
        record.session_id = session_id;

        shared.bridge.emit_log(&record);

        if let Err(e) = shared.store.create_log(&record) {
            warn!("Failed to persist log {}: {}", record.id, e);
            if pending.is_some() {
                shared.attachments.release();
            }
            return Err(e);
        }
        shared.batcher.add_log(record.clone())?;

        if let Some(pending) = pending {
            shared.controller.upload_attachment(pending);
        }

        Ok(record)
    }
}

impl SignalDelegate for SignalsHandler {
    fn on_start_span(&self, span: SpanRecord) {
        let admitted = self.shared.limiter.should_create_custom_span();
        if !admitted {
            debug!("External span {} over the limit, only updating", span.context());
        }
        if let Err(e) = self.shared.store.upsert_span(&span, !admitted) {
            warn!("Failed to persist external span {}: {}", span.context(), e);
        }
    }

    fn on_end_span(&self, span: SpanRecord) {
        match self.shared.store.upsert_span(&span, true) {
            Ok(UpsertOutcome::Skipped) => debug!("External span {} was never stored", span.context()),
            Ok(_) => {}
            Err(e) => warn!("Failed to persist external span end {}: {}", span.context(), e),
        }
    }

    fn on_emit_log(&self, log: LogRecord) {
        if !self.shared.limiter.should_create_log(&log.log_type, log.severity) {
            debug!("External log {} rejected by limiter", log.id);
            return;
        }
        if let Err(e) = self.shared.store.create_log(&log) {
            warn!("Failed to persist external log {}: {}", log.id, e);
            return;
        }
        if let Err(e) = self.shared.batcher.add_log(log) {
            warn!("Failed to batch external log: {}", e);
        }
    }
}

#[derive(Debug, Default)]
struct HandleCounts {
    events: usize,
    links: usize,
    attribute_keys: HashSet<String>,
}

/// Handle to an internal span that may still be open
pub struct SpanHandle {
    context: SpanContext,
    name: String,
    span_type: SignalType,
    shared: Arc<Shared>,
    counts: Mutex<HandleCounts>,
}

impl SpanHandle {
    pub fn context(&self) -> &SpanContext {
        &self.context
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn span_type(&self) -> &SignalType {
        &self.span_type
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.shared.store.fetch_span(&self.context), Ok(Some(span)) if span.is_closed())
    }

    pub fn set_status(&self, status: SpanStatus) -> Result<()> {
        let _guard = self.counts.lock();
        if self.shared.store.set_span_status(&self.context, status)? {
            self.shared.bridge.set_span_status(&self.context, status);
        }
        Ok(())
    }

    /// Add an event, subject to the per-span event cap
    pub fn add_event(&self, name: &str, attributes: Attributes) -> Result<()> {
        let mut counts = self.counts.lock();
        if !self.shared.limiter.should_add_span_event(counts.events) {
            return Err(PipelineError::SpanEventLimitReached(self.name.clone()));
        }

        let sanitizer = &self.shared.sanitizer;
        let mut event = SpanEvent::new(sanitizer.sanitize_event_name(name), Utc::now());
        event.attributes = sanitizer.sanitize_event_attributes(attributes);

        if self.push_event(event)? {
            counts.events += 1;
        }
        Ok(())
    }

    /// Add an event on behalf of the pipeline; does not count against the cap
    pub fn add_internal_event(&self, event: SpanEvent) -> Result<()> {
        let _guard = self.counts.lock();
        self.push_event(event).map(|_| ())
    }

    fn push_event(&self, event: SpanEvent) -> Result<bool> {
        if !self.shared.store.add_span_event(&self.context, &event)? {
            return Ok(false);
        }
        self.shared.bridge.add_span_event(&self.context, &event);
        Ok(true)
    }

    /// Add a link, subject to the per-span link cap
    pub fn add_link(&self, link: SpanLink) -> Result<()> {
        let mut counts = self.counts.lock();
        if !self.shared.limiter.should_add_span_link(counts.links) {
            return Err(PipelineError::SpanLinkLimitReached(self.name.clone()));
        }

        let mut link = link;
        link.attributes = self.shared.sanitizer.sanitize_link_attributes(link.attributes);
        if self.shared.store.add_span_link(&self.context, &link)? {
            self.shared.bridge.add_span_link(&self.context, &link);
            counts.links += 1;
        }
        Ok(())
    }

    /// Set or, with `None`, remove an attribute. New keys count against the attribute cap.
    pub fn set_attribute(&self, key: &str, value: Option<&str>) -> Result<()> {
        let mut counts = self.counts.lock();
        let sanitizer = &self.shared.sanitizer;
        let key = sanitizer.sanitize_attribute_key(key);

        if value.is_some()
            && !counts.attribute_keys.contains(&key)
            && !self.shared.limiter.should_add_span_attribute(counts.attribute_keys.len())
        {
            return Err(PipelineError::SpanAttributeLimitReached(self.name.clone()));
        }

        let value = value.map(|value| sanitizer.sanitize_attribute_value(value));
        let updated = self.shared.store.update_open_span(&self.context, &mut |span| match &value {
            Some(value) => {
                span.attributes.insert(key.clone(), value.clone());
            }
            None => {
                span.attributes.remove(&key);
            }
        })?;

        if updated {
            self.shared.bridge.set_span_attribute(&self.context, &key, value.clone());
            if value.is_some() {
                counts.attribute_keys.insert(key);
            } else {
                counts.attribute_keys.remove(&key);
            }
        }
        Ok(())
    }

    /// End the span now
    pub fn end(&self) -> Result<bool> {
        self.end_at(Utc::now())
    }

    /// End the span at `end_time`. Ending twice keeps the first result.
    pub fn end_at(&self, end_time: DateTime<Utc>) -> Result<bool> {
        let _guard = self.counts.lock();
        self.finish(end_time)
    }

    /// End the span with an error status and error code attribute
    pub fn end_with_error(&self, code: SpanErrorCode) -> Result<bool> {
        let _guard = self.counts.lock();
        let end_time = Utc::now();
        let ended = self
            .shared
            .store
            .update_open_span(&self.context, &mut |span| span.close_with_error(code, end_time))?;
        if !ended {
            return Ok(false);
        }

        let bridge = &self.shared.bridge;
        bridge.set_span_attribute(&self.context, keys::ERROR_CODE, Some(code.name().to_string()));
        bridge.set_span_status(&self.context, SpanStatus::Error);
        bridge.end_span(&self.context, end_time);
        self.shared.sweep.forget(&self.context.span_id);
        Ok(true)
    }

    fn finish(&self, end_time: DateTime<Utc>) -> Result<bool> {
        let ended = self.shared.store.end_span(&self.context, end_time)?;
        if ended {
            self.shared.bridge.end_span(&self.context, end_time);
            self.shared.sweep.forget(&self.context.span_id);
        }
        Ok(ended)
    }
}

impl std::fmt::Debug for SpanHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpanHandle")
            .field("context", &self.context)
            .field("name", &self.name)
            .field("span_type", &self.span_type)
            .finish()
    }
}
