//! Session lifecycle
//!
//! `SessionTracker` holds the active session and serves it to the bridge and
//! handler as session metadata. `SessionController` starts and ends sessions
//! and runs the end-of-session work: the auto-termination sweep, a batch flush
//! and the reset of per-session limits.

use crate::adapter::SessionMetadata;
use crate::attachment::AttachmentPolicy;
use crate::batch::LogBatcher;
use crate::errors::Result;
use crate::limiter::SignalLimiter;
use crate::store::SessionRepository;
use crate::telemetry::{ProcessId, SessionId, SessionRecord, SessionState};
use crate::termination::AutoTerminationSweep;
use chrono::Utc;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// The active session, if any
#[derive(Debug, Default)]
pub struct SessionTracker {
    current: RwLock<Option<SessionRecord>>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<SessionRecord> {
        self.current.read().clone()
    }

    fn replace(&self, session: Option<SessionRecord>) -> Option<SessionRecord> {
        std::mem::replace(&mut *self.current.write(), session)
    }

    fn update(&self, update: impl FnOnce(&mut SessionRecord)) -> Option<SessionRecord> {
        let mut current = self.current.write();
        let session = current.as_mut()?;
        update(session);
        Some(session.clone())
    }
}

impl SessionMetadata for SessionTracker {
    fn current_session_id(&self) -> Option<SessionId> {
        self.current.read().as_ref().map(|session| session.id.clone())
    }

    fn current_session_state(&self) -> SessionState {
        self.current
            .read()
            .as_ref()
            .map(|session| session.state)
            .unwrap_or_default()
    }
}

pub struct SessionController {
    tracker: Arc<SessionTracker>,
    store: Arc<dyn SessionRepository>,
    sweep: Arc<AutoTerminationSweep>,
    batcher: Arc<LogBatcher>,
    limiter: Arc<dyn SignalLimiter>,
    attachments: Arc<AttachmentPolicy>,
    started_any: AtomicBool,
}

impl SessionController {
    pub fn new(
        tracker: Arc<SessionTracker>,
        store: Arc<dyn SessionRepository>,
        sweep: Arc<AutoTerminationSweep>,
        batcher: Arc<LogBatcher>,
        limiter: Arc<dyn SignalLimiter>,
        attachments: Arc<AttachmentPolicy>,
    ) -> Self {
        Self {
            tracker,
            store,
            sweep,
            batcher,
            limiter,
            attachments,
            started_any: AtomicBool::new(false),
        }
    }

    pub fn current_session(&self) -> Option<SessionRecord> {
        self.tracker.current()
    }

    /// Start a new session, ending the active one first
    #[instrument(skip(self))]
    pub async fn start_session(&self, state: SessionState) -> Result<SessionRecord> {
        if self.tracker.current().is_some() {
            self.end_session().await?;
        }

        let mut session = SessionRecord::new(SessionId::random(), ProcessId::current(), state);
        session.cold_start = !self.started_any.swap(true, Ordering::SeqCst);

        self.store.upsert_session(&session)?;
        self.tracker.replace(Some(session.clone()));
        info!("Started session {} ({})", session.id, state.as_str());

        Ok(session)
    }

    /// End the active session and run the end-of-session work
    #[instrument(skip(self))]
    pub async fn end_session(&self) -> Result<Option<SessionRecord>> {
        let Some(mut session) = self.tracker.replace(None) else {
            return Ok(None);
        };

        let end_time = Utc::now();
        session.end_time = Some(end_time);
        session.last_heartbeat_time = end_time;
        session.clean_exit = true;

        if let Err(e) = self.sweep.sweep(&session.id, end_time) {
            warn!("Auto-termination sweep failed for session {}: {}", session.id, e);
        }
        if let Err(e) = self.batcher.force_end_current_batch().await {
            warn!("Failed to flush log batch at session end: {}", e);
        }
        self.limiter.reset();
        self.attachments.reset();

        self.store.upsert_session(&session)?;
        info!("Ended session {}", session.id);

        Ok(Some(session))
    }

    /// Change the foreground/background state of the active session
    pub fn set_state(&self, state: SessionState) -> Result<()> {
        if let Some(session) = self.tracker.update(|session| session.state = state) {
            self.store.upsert_session(&session)?;
        }
        Ok(())
    }

    /// Record that the active session is still alive
    pub fn heartbeat(&self) -> Result<()> {
        if let Some(session) = self.tracker.update(|session| session.last_heartbeat_time = Utc::now()) {
            self.store.upsert_session(&session)?;
        }
        Ok(())
    }

    /// Attach a crash report to a stored session
    pub fn record_crash(&self, session_id: &SessionId, report_id: &str) -> Result<bool> {
        let Some(mut session) = self.store.fetch_session(session_id)? else {
            return Ok(false);
        };
        session.crash_report_id = Some(report_id.to_string());
        session.clean_exit = false;
        self.store.upsert_session(&session)?;
        Ok(true)
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("current", &self.tracker.current().map(|session| session.id))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment::Attachment;
    use crate::batch::{BatchLimits, BatchSink, LogBatch};
    use crate::bridge::SignalBridge;
    use crate::config::SessionLimits;
    use crate::limiter::DefaultLimiter;
    use crate::db::SqliteStore;
    use crate::store::SpanRepository;
    use crate::telemetry::{
        keys, Attributes, LogRecord, LogSeverity, SignalType, SpanContext, SpanErrorCode,
        SpanRecord, SpanStatus,
    };
    use parking_lot::Mutex;

    #[derive(Default)]
    struct CollectingSink(Mutex<Vec<LogBatch>>);

    impl BatchSink for CollectingSink {
        fn batch_finished(&self, batch: LogBatch) {
            self.0.lock().push(batch);
        }
    }

    struct Fixture {
        store: Arc<SqliteStore>,
        tracker: Arc<SessionTracker>,
        sweep: Arc<AutoTerminationSweep>,
        batcher: Arc<LogBatcher>,
        sink: Arc<CollectingSink>,
        limiter: Arc<DefaultLimiter>,
        attachments: Arc<AttachmentPolicy>,
        controller: SessionController,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(SqliteStore::in_memory(100).unwrap());
        let tracker = Arc::new(SessionTracker::new());
        let bridge = Arc::new(SignalBridge::new(tracker.clone()));
        let sweep = Arc::new(AutoTerminationSweep::new(store.clone(), bridge));
        let sink = Arc::new(CollectingSink::default());
        let batcher = Arc::new(LogBatcher::spawn(BatchLimits::new(None, 20), sink.clone()));
        let limiter = Arc::new(DefaultLimiter::new(SessionLimits {
            custom_spans: 1,
            ..SessionLimits::default()
        }));
        let attachments = Arc::new(AttachmentPolicy::new(1, 1024));
        let controller = SessionController::new(
            tracker.clone(),
            store.clone(),
            sweep.clone(),
            batcher.clone(),
            limiter.clone(),
            attachments.clone(),
        );

        Fixture {
            store,
            tracker,
            sweep,
            batcher,
            sink,
            limiter,
            attachments,
            controller,
        }
    }

    #[tokio::test]
    async fn test_start_session_sets_metadata() {
        let f = fixture();
        assert!(f.tracker.current_session_id().is_none());

        let session = f.controller.start_session(SessionState::Foreground).await.unwrap();
        assert!(session.cold_start);
        assert_eq!(f.tracker.current_session_id(), Some(session.id.clone()));
        assert_eq!(f.tracker.current_session_state(), SessionState::Foreground);
        assert!(f.store.fetch_session(&session.id).unwrap().is_some());

        let next = f.controller.start_session(SessionState::Background).await.unwrap();
        assert!(!next.cold_start);
        let previous = f.store.fetch_session(&session.id).unwrap().unwrap();
        assert!(previous.end_time.is_some());
    }

    #[tokio::test]
    async fn test_end_session_runs_cleanup() {
        let f = fixture();
        let session = f.controller.start_session(SessionState::Foreground).await.unwrap();

        let span = SpanRecord::new(SpanContext::generate(), "dangling", SignalType::performance())
            .with_session(session.id.clone());
        f.store.upsert_span(&span, false).unwrap();
        f.sweep.register(&span.span_id, SpanErrorCode::UserAbandon);

        f.batcher.add_log(LogRecord::new(LogSeverity::Info, "pending")).unwrap();
        assert!(f.limiter.should_create_custom_span());
        assert!(f.attachments.apply(Attachment::Data(vec![1]), &mut Attributes::new()).is_some());

        let ended = f.controller.end_session().await.unwrap().unwrap();
        assert!(ended.end_time.is_some());
        assert!(f.tracker.current().is_none());

        let stored = f.store.fetch_span(&span.context()).unwrap().unwrap();
        assert_eq!(stored.status, SpanStatus::Error);
        assert_eq!(stored.end_time, ended.end_time);
        assert_eq!(
            stored.attributes.get(keys::ERROR_CODE).map(String::as_str),
            Some("user_abandon")
        );

        assert_eq!(f.sink.0.lock().len(), 1);
        assert!(f.limiter.should_create_custom_span());
        assert_eq!(f.attachments.count(), 0);
    }

    #[tokio::test]
    async fn test_end_without_session_is_noop() {
        let f = fixture();
        assert!(f.controller.end_session().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_state_change_and_crash_are_persisted() {
        let f = fixture();
        let session = f.controller.start_session(SessionState::Foreground).await.unwrap();
        f.controller.set_state(SessionState::Background).unwrap();
        f.controller.heartbeat().unwrap();

        let stored = f.store.fetch_session(&session.id).unwrap().unwrap();
        assert_eq!(stored.state, SessionState::Background);

        assert!(f.controller.record_crash(&session.id, "crash-1").unwrap());
        let stored = f.store.fetch_session(&session.id).unwrap().unwrap();
        assert_eq!(stored.crash_report_id.as_deref(), Some("crash-1"));
        assert!(!f.controller.record_crash(&SessionId::random(), "crash-2").unwrap());
    }
}
