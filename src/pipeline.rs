//! The signal pipeline object
//!
//! `SignalPipeline` wires the store, bridge, handler, batcher,
//! upload controller and session controller together. One pipeline is meant to
//! exist per process; it is created at startup and shut down explicitly.

use crate::adapter::SessionMetadata;
use crate::attachment::AttachmentPolicy;
use crate::batch::{BatchLimits, LogBatcher};
use crate::bridge::{SignalBridge, SignalDelegate};
use crate::config::PipelineConfig;
use crate::controller::LogController;
use crate::db::SqliteStore;
use crate::errors::{PipelineError, Result};
use crate::handler::{HandlerParts, SignalsHandler};
use crate::limiter::{DefaultLimiter, SignalLimiter};
use crate::sanitizer::DefaultSanitizer;
use crate::session::{SessionController, SessionTracker};
use crate::store::{MetadataRepository, SpanRepository};
use crate::telemetry::{
    MetadataKind, MetadataLifespan, MetadataRecord, ProcessId, SessionId, SessionState,
};
use crate::termination::AutoTerminationSweep;
use crate::transport::{HttpUploader, LogUploader};
use chrono::Utc;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use std::sync::Arc;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, instrument, warn};

pub struct SignalPipeline {
    config: PipelineConfig,
    store: Arc<SqliteStore>,
    bridge: Arc<SignalBridge>,
    handler: Arc<SignalsHandler>,
    sessions: Arc<SessionController>,
    tracker: Arc<SessionTracker>,
    controller: Arc<LogController>,
    batcher: Arc<LogBatcher>,
    http: Option<Arc<HttpUploader>>,
}

impl SignalPipeline {
    /// Build a pipeline that uploads over HTTP. Must be called inside a tokio runtime.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate().map_err(PipelineError::Config)?;

        let http = Arc::new(HttpUploader::new(
            config.endpoint_url.clone(),
            config.app_id.clone(),
            config.http_timeout,
            config.max_retries,
            config.retry_backoff_ms,
        )?);

        let store = Self::open_store(&config)?;
        let mut pipeline = Self::with_parts(config, store, http.clone())?;
        pipeline.http = Some(http);
        Ok(pipeline)
    }

    /// Build a pipeline around the given uploader
    pub fn with_uploader(config: PipelineConfig, uploader: Arc<dyn LogUploader>) -> Result<Self> {
        config.validate().map_err(PipelineError::Config)?;
        let store = Self::open_store(&config)?;
        Self::with_parts(config, store, uploader)
    }

    fn open_store(config: &PipelineConfig) -> Result<Arc<SqliteStore>> {
        let store = match &config.store_path {
            Some(path) => SqliteStore::open(path, config.span_limit_default)?,
            None => SqliteStore::in_memory(config.span_limit_default)?,
        };
        Ok(Arc::new(store.with_span_limits(config.span_limits.clone())))
    }

    /// Build a pipeline from an existing store and uploader
    pub fn with_parts(
        config: PipelineConfig,
        store: Arc<SqliteStore>,
        uploader: Arc<dyn LogUploader>,
    ) -> Result<Self> {
        config.validate().map_err(PipelineError::Config)?;

        let tracker = Arc::new(SessionTracker::new());
        let metadata: Arc<dyn SessionMetadata> = tracker.clone();
        let bridge = Arc::new(SignalBridge::new(metadata.clone()));

        let controller = Arc::new(LogController::new(
            store.clone(),
            store.clone(),
            uploader,
            BatchLimits::new(Some(config.recovery_batch_max_age), config.max_logs_per_batch),
            config.app_id.clone(),
        ));
        let batcher = Arc::new(LogBatcher::spawn(
            BatchLimits::new(config.live_batch_max_age, config.max_logs_per_batch),
            controller.clone(),
        ));

        let limiter: Arc<dyn SignalLimiter> = Arc::new(DefaultLimiter::new(config.limits.clone()));
        let attachments = Arc::new(AttachmentPolicy::new(
            config.max_attachments_per_session,
            config.max_attachment_size,
        ));
        let sweep = Arc::new(AutoTerminationSweep::new(store.clone(), bridge.clone()));

        let handler = Arc::new(SignalsHandler::new(HandlerParts {
            store: store.clone(),
            bridge: bridge.clone(),
            sanitizer: Arc::new(DefaultSanitizer::new(config.sanitizer.clone())),
            limiter: limiter.clone(),
            metadata,
            sweep: sweep.clone(),
            batcher: batcher.clone(),
            controller: controller.clone(),
            attachments: attachments.clone(),
        }));
        let delegate: Arc<dyn SignalDelegate> = handler.clone();
        bridge.set_delegate(&delegate);

        let sessions = Arc::new(SessionController::new(
            tracker.clone(),
            store.clone(),
            sweep,
            batcher.clone(),
            limiter,
            attachments,
        ));

        Ok(Self {
            config,
            store,
            bridge,
            handler,
            sessions,
            tracker,
            controller,
            batcher,
            http: None,
        })
    }

    /// Clean up what earlier processes left behind, recover their unsent logs
    /// and start the first session
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        info!("Starting signal pipeline for app {}", self.config.app_id);

        let now = Utc::now();
        match self.store.close_open_spans(now) {
            Ok(closed) if closed > 0 => info!("Closed {} spans left open by earlier processes", closed),
            Ok(_) => {}
            Err(e) => warn!("Failed to close stale spans: {}", e),
        }

        let retention = chrono::Duration::from_std(self.config.span_retention)
            .unwrap_or_else(|_| chrono::Duration::days(7));
        match self.store.clean_up_spans(Some(now - retention)) {
            Ok(removed) if removed > 0 => debug!("Pruned {} old spans", removed),
            Ok(_) => {}
            Err(e) => warn!("Failed to prune old spans: {}", e),
        }

        self.add_resource("app_id", &self.config.app_id)?;
        self.add_resource("sdk.version", env!("CARGO_PKG_VERSION"))?;

        if let Err(e) = self.controller.recover_unsent().await {
            error!("Backlog recovery failed: {}", e);
        }

        self.sessions.start_session(SessionState::Foreground).await?;
        Ok(())
    }

    /// Start, then run until ctrl-c and shut down
    pub async fn run(&self) -> Result<()> {
        self.start().await?;

        let mut heartbeat = interval(Duration::from_secs(60));
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if let Err(e) = self.sessions.heartbeat() {
                        warn!("Heartbeat failed: {}", e);
                    }
                    self.report_metrics();
                }
                signal = tokio::signal::ctrl_c() => {
                    signal.map_err(|e| {
                        PipelineError::Other(format!("Failed to wait for shutdown signal: {}", e))
                    })?;
                    break;
                }
            }
        }

        info!("Shutting down signal pipeline");
        self.shutdown().await
    }

    fn report_metrics(&self) {
        let stats = self.stats();
        match &self.http {
            Some(http) => {
                let metrics = http.metrics();
                info!(
                    "Pipeline metrics - Stored: {} spans, {} logs, Live spans: {}, Uploads: {:.1}% success rate, {} uploads",
                    stats.stored_spans,
                    stats.stored_logs,
                    stats.live_spans,
                    metrics.success_rate,
                    metrics.uploads
                );
            }
            None => info!(
                "Pipeline metrics - Stored: {} spans, {} logs, Live spans: {}",
                stats.stored_spans, stats.stored_logs, stats.live_spans
            ),
        }
    }

    /// End the session, flush and wait for uploads, then shut the providers down
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<()> {
        if let Err(e) = self.sessions.end_session().await {
            warn!("Failed to end session during shutdown: {}", e);
        }
        if let Err(e) = self.batcher.shutdown().await {
            warn!("Failed to stop log batcher: {}", e);
        }
        self.controller.wait_for_uploads().await?;
        self.bridge.shutdown();

        if let Some(http) = &self.http {
            let metrics = http.metrics();
            info!(
                "Final upload metrics - Success rate: {:.1}%, Total uploads: {}, Avg duration: {}ms",
                metrics.success_rate, metrics.uploads, metrics.avg_duration_ms
            );
        }

        info!("Signal pipeline shutdown complete");
        Ok(())
    }

    /// Resource attribute for every upload of this process
    pub fn add_resource(&self, key: &str, value: &str) -> Result<()> {
        self.store.add_metadata(&MetadataRecord::new(
            key,
            value,
            MetadataKind::RequiredResource,
            MetadataLifespan::Process(ProcessId::current()),
        ))
    }

    /// Custom property for the active session
    pub fn add_property(&self, key: &str, value: &str) -> Result<()> {
        let session_id = self.current_session_id()?;
        self.store.add_metadata(&MetadataRecord::new(
            key,
            value,
            MetadataKind::CustomProperty,
            MetadataLifespan::Session(session_id),
        ))
    }

    /// Persona tag for the active session
    pub fn add_persona_tag(&self, tag: &str) -> Result<()> {
        let session_id = self.current_session_id()?;
        self.store.add_metadata(&MetadataRecord::new(
            tag,
            tag,
            MetadataKind::PersonaTag,
            MetadataLifespan::Session(session_id),
        ))
    }

    fn current_session_id(&self) -> Result<SessionId> {
        self.tracker
            .current_session_id()
            .ok_or(PipelineError::InvalidSession)
    }

    /// The shared tracer provider for code outside the pipeline
    pub fn tracer_provider(&self) -> &SdkTracerProvider {
        self.bridge.tracer_provider()
    }

    /// The shared logger provider for code outside the pipeline
    pub fn logger_provider(&self) -> &SdkLoggerProvider {
        self.bridge.logger_provider()
    }

    pub fn handler(&self) -> &Arc<SignalsHandler> {
        &self.handler
    }

    pub fn sessions(&self) -> &Arc<SessionController> {
        &self.sessions
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    pub fn controller(&self) -> &Arc<LogController> {
        &self.controller
    }

    pub fn batcher(&self) -> &Arc<LogBatcher> {
        &self.batcher
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            app_id: self.config.app_id.clone(),
            session_id: self.tracker.current_session_id(),
            stored_spans: self.store.span_count().unwrap_or(0),
            stored_logs: self.store.log_count().unwrap_or(0),
            live_spans: self.bridge.live_span_count(),
        }
    }
}

impl std::fmt::Debug for SignalPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalPipeline")
            .field("app_id", &self.config.app_id)
            .field("bridge", &self.bridge)
            .finish()
    }
}

/// Pipeline statistics
#[derive(Debug, Clone)]
pub struct PipelineStats {
    pub app_id: String,
    pub session_id: Option<SessionId>,
    pub stored_spans: usize,
    pub stored_logs: usize,
    pub live_spans: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{LogOptions, SpanOptions};
    use crate::store::LogRepository;
    use crate::telemetry::{LogRecord, LogSeverity};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingUploader {
        uploads: Mutex<usize>,
    }

    #[async_trait]
    impl LogUploader for RecordingUploader {
        async fn upload_log(&self, _id: &str, _data: Vec<u8>) -> Result<()> {
            *self.uploads.lock() += 1;
            Ok(())
        }

        async fn upload_attachment(&self, _id: &str, _data: Vec<u8>) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = PipelineConfig {
            max_logs_per_batch: 0,
            ..PipelineConfig::default()
        };
        let result = SignalPipeline::with_uploader(config, Arc::new(RecordingUploader::default()));
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[tokio::test]
    async fn test_start_recovers_backlog_and_opens_session() {
        let store = Arc::new(SqliteStore::in_memory(100).unwrap());
        let stale = LogRecord::new(LogSeverity::Error, "from last run").with_process(ProcessId::random());
        store.create_log(&stale).unwrap();

        let uploader = Arc::new(RecordingUploader::default());
        let pipeline =
            SignalPipeline::with_parts(PipelineConfig::default(), store.clone(), uploader.clone()).unwrap();
        pipeline.start().await.unwrap();

        assert_eq!(*uploader.uploads.lock(), 1);
        assert!(!store.contains_log(&stale.id).unwrap());
        assert!(pipeline.stats().session_id.is_some());

        pipeline.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_flushes_live_batch() {
        let uploader = Arc::new(RecordingUploader::default());
        let pipeline =
            SignalPipeline::with_uploader(PipelineConfig::default(), uploader.clone()).unwrap();
        pipeline.start().await.unwrap();

        let span = pipeline.handler().create_span(SpanOptions::new("load")).unwrap();
        span.end().unwrap();
        pipeline
            .handler()
            .create_log(LogOptions::new(LogSeverity::Info, "hello"))
            .unwrap();
        pipeline.add_property("plan", "pro").unwrap();

        pipeline.shutdown().await.unwrap();
        assert_eq!(*uploader.uploads.lock(), 1);
        assert_eq!(pipeline.store().log_count().unwrap(), 0);
        assert_eq!(pipeline.store().span_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_property_requires_session() {
        let pipeline = SignalPipeline::with_uploader(
            PipelineConfig::default(),
            Arc::new(RecordingUploader::default()),
        )
        .unwrap();
        assert!(matches!(
            pipeline.add_property("plan", "pro"),
            Err(PipelineError::InvalidSession)
        ));
    }
}
