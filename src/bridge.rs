//! Signal bridge between the OpenTelemetry SDK providers and the pipeline
//!
//! The bridge owns a tracer provider and a logger provider that other code can
//! use directly. Signals the pipeline creates through the bridge are registered
//! as internal before the SDK sees them; the bridge's span and log processor
//! forwards only the remaining external signals to the delegate.

use crate::adapter::{self, SessionMetadata};
use crate::errors::Result;
use crate::registry::{IdentityRegistry, Origin};
use crate::telemetry::{keys, LogRecord, SpanContext, SpanEvent, SpanLink, SpanRecord, SpanStatus};
use chrono::{DateTime, Utc};
use opentelemetry::logs::{AnyValue, LogRecord as _, Logger as _, LoggerProvider as _};
use opentelemetry::trace::{Span as _, SpanBuilder, TraceContextExt, Tracer as _, TracerProvider as _};
use opentelemetry::{Context, InstrumentationScope, KeyValue};
use opentelemetry_sdk::error::OTelSdkResult;
use opentelemetry_sdk::logs::{LogProcessor, SdkLogRecord, SdkLogger, SdkLoggerProvider};
use opentelemetry_sdk::trace::{Span as SdkSpan, SdkTracer, SdkTracerProvider, SpanData, SpanProcessor};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};
use tracing::{debug, trace, warn};

const SCOPE: &str = "signal_pipeline";

/// Receiver of signals created outside the pipeline
pub trait SignalDelegate: Send + Sync {
    fn on_start_span(&self, span: SpanRecord);

    fn on_end_span(&self, span: SpanRecord);

    fn on_emit_log(&self, log: LogRecord);
}

struct HookState {
    spans: IdentityRegistry<SpanContext>,
    logs: IdentityRegistry<String>,
    metadata: Arc<dyn SessionMetadata>,
    delegate: RwLock<Option<Weak<dyn SignalDelegate>>>,
}

/// Span and log processor registered on both providers
#[derive(Clone)]
struct BridgeHook {
    state: Arc<HookState>,
}

impl BridgeHook {
    fn delegate_for(&self, origin: Origin) -> Option<Arc<dyn SignalDelegate>> {
        if origin == Origin::Internal {
            return None;
        }
        self.state.delegate.read().as_ref().and_then(Weak::upgrade)
    }
}

impl std::fmt::Debug for BridgeHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeHook")
            .field("internal_spans", &self.state.spans.len())
            .field("internal_logs", &self.state.logs.len())
            .finish()
    }
}

impl SpanProcessor for BridgeHook {
    fn on_start(&self, span: &mut SdkSpan, _cx: &Context) {
        let context = SpanContext::from(span.span_context());
        let Some(delegate) = self.delegate_for(self.state.spans.classify(&context)) else {
            return;
        };
        let Some(data) = span.exported_data() else {
            return;
        };

        trace!("Forwarding external span start {}", context);
        delegate.on_start_span(adapter::external_span(&data, false, self.state.metadata.as_ref()));
    }

    fn on_end(&self, span: SpanData) {
        let context = SpanContext::from(&span.span_context);
        if let Some(delegate) = self.delegate_for(self.state.spans.classify(&context)) {
            trace!("Forwarding external span end {}", context);
            delegate.on_end_span(adapter::external_span(&span, true, self.state.metadata.as_ref()));
        }
    }

    fn force_flush(&self) -> OTelSdkResult {
        Ok(())
    }

    fn shutdown_with_timeout(&self, _timeout: Duration) -> OTelSdkResult {
        Ok(())
    }
}

impl LogProcessor for BridgeHook {
    fn emit(&self, data: &mut SdkLogRecord, _scope: &InstrumentationScope) {
        let origin = data
            .attributes_iter()
            .find(|(key, _)| key.as_str() == keys::LOG_ID)
            .and_then(|(_, value)| match value {
                AnyValue::String(id) => Some(self.state.logs.classify(&id.as_str().to_string())),
                _ => None,
            })
            .unwrap_or(Origin::External);

        if let Some(delegate) = self.delegate_for(origin) {
            let log = adapter::external_log(data, self.state.metadata.as_ref());
            trace!("Forwarding external log {}", log.id);
            delegate.on_emit_log(log);
        }
    }

    fn force_flush(&self) -> OTelSdkResult {
        Ok(())
    }

    fn shutdown_with_timeout(&self, _timeout: Duration) -> OTelSdkResult {
        Ok(())
    }
}

/// Creates internal signals on the shared providers and classifies every signal they see
pub struct SignalBridge {
    tracer_provider: SdkTracerProvider,
    logger_provider: SdkLoggerProvider,
    tracer: SdkTracer,
    logger: SdkLogger,
    state: Arc<HookState>,
    live_spans: Mutex<HashMap<SpanContext, SdkSpan>>,
}

impl SignalBridge {
    /// Create the providers with the bridge's processor installed on both
    pub fn new(metadata: Arc<dyn SessionMetadata>) -> Self {
        let state = Arc::new(HookState {
            spans: IdentityRegistry::new(),
            logs: IdentityRegistry::new(),
            metadata,
            delegate: RwLock::new(None),
        });
        let hook = BridgeHook {
            state: state.clone(),
        };

        let tracer_provider = SdkTracerProvider::builder()
            .with_span_processor(hook.clone())
            .build();
        let logger_provider = SdkLoggerProvider::builder().with_log_processor(hook).build();
        let tracer = tracer_provider.tracer(SCOPE);
        let logger = logger_provider.logger(SCOPE);

        Self {
            tracer_provider,
            logger_provider,
            tracer,
            logger,
            state,
            live_spans: Mutex::new(HashMap::new()),
        }
    }

    /// Install the receiver of external signals. Only a weak reference is kept.
    pub fn set_delegate(&self, delegate: &Arc<dyn SignalDelegate>) {
        *self.state.delegate.write() = Some(Arc::downgrade(delegate));
    }

    /// The shared tracer provider, for code outside the pipeline
    pub fn tracer_provider(&self) -> &SdkTracerProvider {
        &self.tracer_provider
    }

    /// The shared logger provider, for code outside the pipeline
    pub fn logger_provider(&self) -> &SdkLoggerProvider {
        &self.logger_provider
    }

    pub fn span_registry(&self) -> &IdentityRegistry<SpanContext> {
        &self.state.spans
    }

    pub fn log_registry(&self) -> &IdentityRegistry<String> {
        &self.state.logs
    }

    /// Start an SDK span mirroring `record`, with the record's own identity.
    /// A record that already has an end time is ended right away.
    pub fn start_span(&self, record: &SpanRecord) -> Result<()> {
        let context = record.context();
        let ids = adapter::otel_context(&context)?;
        let parent = match &record.parent_span_id {
            Some(parent_span_id) => {
                let parent = SpanContext::new(parent_span_id.clone(), record.trace_id.clone());
                Context::new().with_remote_span_context(adapter::otel_context(&parent)?)
            }
            None => Context::new(),
        };
        let links = record
            .links
            .iter()
            .map(adapter::otel_link)
            .collect::<Result<Vec<_>>>()?;

        let builder = SpanBuilder::from_name(record.name.clone())
            .with_trace_id(ids.trace_id())
            .with_span_id(ids.span_id())
            .with_start_time(SystemTime::from(record.start_time))
            .with_attributes(adapter::key_values(&record.attributes))
            .with_events(record.events.iter().map(adapter::otel_event).collect())
            .with_links(links)
            .with_status(adapter::otel_status(record.status));

        let mut span = self
            .state
            .spans
            .register_internal(&context, || self.tracer.build_with_context(builder, &parent));

        match record.end_time {
            Some(end_time) => span.end_with_timestamp(end_time.into()),
            None => {
                self.live_spans.lock().insert(context, span);
            }
        }
        Ok(())
    }

    /// End a live span. Returns false if it is unknown or already ended.
    pub fn end_span(&self, context: &SpanContext, end_time: DateTime<Utc>) -> bool {
        let removed = self.live_spans.lock().remove(context);
        let Some(mut span) = removed else {
            debug!("Span {} is not live, ignoring end", context);
            return false;
        };
        span.end_with_timestamp(end_time.into());
        true
    }

    fn with_live_span(&self, context: &SpanContext, update: impl FnOnce(&mut SdkSpan)) {
        if let Some(span) = self.live_spans.lock().get_mut(context) {
            update(span);
        }
    }

    pub fn set_span_status(&self, context: &SpanContext, status: SpanStatus) {
        self.with_live_span(context, |span| span.set_status(adapter::otel_status(status)));
    }

    /// Mirror an attribute change. The SDK cannot remove attributes, so a
    /// removal only reaches the store.
    pub fn set_span_attribute(&self, context: &SpanContext, key: &str, value: Option<String>) {
        let Some(value) = value else {
            return;
        };
        self.with_live_span(context, |span| {
            span.set_attribute(KeyValue::new(key.to_string(), value))
        });
    }

    pub fn add_span_event(&self, context: &SpanContext, event: &SpanEvent) {
        self.with_live_span(context, |span| {
            span.add_event_with_timestamp(
                event.name.clone(),
                event.timestamp.into(),
                adapter::key_values(&event.attributes),
            )
        });
    }

    pub fn add_span_link(&self, context: &SpanContext, link: &SpanLink) {
        match adapter::otel_link(link) {
            Ok(link) => self.with_live_span(context, |span| {
                span.add_link(link.span_context, link.attributes)
            }),
            Err(e) => warn!("Link on span {} not mirrored: {}", context, e),
        }
    }

    pub fn live_span_count(&self) -> usize {
        self.live_spans.lock().len()
    }

    /// Emit an internal log through the logger provider
    pub fn emit_log(&self, log: &LogRecord) {
        let mut record = self.logger.create_log_record();
        record.set_timestamp(log.timestamp.into());
        record.set_observed_timestamp(SystemTime::now());
        record.set_severity_number(adapter::otel_severity(log.severity));
        record.set_body(AnyValue::from(log.body.clone()));
        for (key, value) in &log.attributes {
            record.add_attribute(key.clone(), value.clone());
        }
        record.add_attribute(keys::LOG_ID, log.id.clone());

        self.state
            .logs
            .register_internal(&log.id, || self.logger.emit(record));
    }

    /// Detach the delegate, end live spans and shut both providers down
    pub fn shutdown(&self) {
        *self.state.delegate.write() = None;

        let live: Vec<SdkSpan> = self.live_spans.lock().drain().map(|(_, span)| span).collect();
        for mut span in live {
            span.end();
        }
        self.state.spans.clear();
        self.state.logs.clear();

        if let Err(e) = self.tracer_provider.shutdown() {
            debug!("Tracer provider shutdown: {}", e);
        }
        if let Err(e) = self.logger_provider.shutdown() {
            debug!("Logger provider shutdown: {}", e);
        }
        debug!("Signal bridge shut down");
    }
}

impl std::fmt::Debug for SignalBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalBridge")
            .field("internal_spans", &self.state.spans.len())
            .field("internal_logs", &self.state.logs.len())
            .field("live_spans", &self.live_span_count())
            .finish()
    }
}
