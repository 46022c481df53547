//! Auto-termination of spans left open when their session ends

use crate::bridge::SignalBridge;
use crate::errors::Result;
use crate::store::SpanRepository;
use crate::telemetry::{keys, SessionId, SpanContext, SpanErrorCode, SpanRecord, SpanStatus};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Closes open spans that carry an auto-termination code, directly or through a parent
pub struct AutoTerminationSweep {
    store: Arc<dyn SpanRepository>,
    bridge: Arc<SignalBridge>,
    codes: Mutex<HashMap<String, SpanErrorCode>>,
}

impl AutoTerminationSweep {
    pub fn new(store: Arc<dyn SpanRepository>, bridge: Arc<SignalBridge>) -> Self {
        Self {
            store,
            bridge,
            codes: Mutex::new(HashMap::new()),
        }
    }

    /// Remember the code a span should be closed with
    pub fn register(&self, span_id: &str, code: SpanErrorCode) {
        self.codes.lock().insert(span_id.to_string(), code);
    }

    pub fn code_for(&self, span_id: &str) -> Option<SpanErrorCode> {
        self.codes.lock().get(span_id).copied()
    }

    pub fn forget(&self, span_id: &str) {
        self.codes.lock().remove(span_id);
    }

    /// Code of the span or of its nearest ancestor carrying one
    fn resolve_code(&self, span: &SpanRecord) -> Option<SpanErrorCode> {
        if let Some(code) = self.code_for(&span.span_id) {
            return Some(code);
        }

        let mut parent_id = span.parent_span_id.clone();
        let mut depth = 0;
        while let Some(id) = parent_id {
            if let Some(code) = self.code_for(&id) {
                return Some(code);
            }

            // Guards against cycles in corrupt parent chains
            depth += 1;
            if depth > 64 {
                break;
            }

            parent_id = match self.store.fetch_span(&SpanContext::new(id, span.trace_id.clone())) {
                Ok(Some(parent)) => parent.parent_span_id,
                _ => None,
            };
        }
        None
    }

    /// End every open span of the session that resolves to a code, at `end_time`.
    /// Returns the number of spans closed.
    #[instrument(skip(self), fields(session = %session_id))]
    pub fn sweep(&self, session_id: &SessionId, end_time: DateTime<Utc>) -> Result<usize> {
        let open = self.store.open_spans_for_session(session_id)?;
        let targets: Vec<(SpanRecord, SpanErrorCode)> = open
            .into_iter()
            .filter_map(|span| self.resolve_code(&span).map(|code| (span, code)))
            .collect();

        let mut closed = 0;
        for (span, code) in &targets {
            match self.terminate(span, *code, end_time) {
                Ok(true) => closed += 1,
                Ok(false) => debug!("Span {} was closed before the sweep", span.context()),
                Err(e) => warn!("Failed to auto-terminate span {}: {}", span.context(), e),
            }
        }

        {
            let mut codes = self.codes.lock();
            for (span, _) in &targets {
                codes.remove(&span.span_id);
            }
        }

        if closed > 0 {
            info!("Auto-terminated {} spans", closed);
        }
        Ok(closed)
    }

    /// Close the span in one store update, then mirror the result to the bridge
    fn terminate(&self, span: &SpanRecord, code: SpanErrorCode, end_time: DateTime<Utc>) -> Result<bool> {
        let context = span.context();
        let ended = self
            .store
            .update_open_span(&context, &mut |stored| stored.close_with_error(code, end_time))?;
        if !ended {
            return Ok(false);
        }

        self.bridge
            .set_span_attribute(&context, keys::ERROR_CODE, Some(code.name().to_string()));
        self.bridge.set_span_status(&context, SpanStatus::Error);
        self.bridge.end_span(&context, end_time);
        Ok(true)
    }
}

impl std::fmt::Debug for AutoTerminationSweep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoTerminationSweep")
            .field("registered", &self.codes.lock().len())
            .finish()
    }
}
