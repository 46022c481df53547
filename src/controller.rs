//! Log upload orchestration
//!
//! Finished batches and the backlog left by previous processes are encoded,
//! uploaded and only then removed from the store. A failed upload leaves the
//! logs in place for the next recovery pass.

use crate::attachment::PendingAttachment;
use crate::batch::{BatchClosed, BatchLimits, BatchSink, BatchState, LogBatch};
use crate::errors::{PipelineError, Result};
use crate::payload::{LogPayload, PayloadEnvelope};
use crate::store::{LogRepository, MetadataRepository};
use crate::telemetry::{LogRecord, MetadataKind, ProcessId};
use crate::transport::LogUploader;
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

const ALL_METADATA: [MetadataKind; 4] = [
    MetadataKind::Resource,
    MetadataKind::RequiredResource,
    MetadataKind::CustomProperty,
    MetadataKind::PersonaTag,
];

/// Split logs into batches, measuring each batch's age at the timestamp of the log being added
pub fn divide_in_batches(logs: Vec<LogRecord>, limits: BatchLimits) -> Vec<LogBatch> {
    let mut batches = Vec::new();
    let mut current = LogBatch::new(limits);

    for log in logs {
        let timestamp = log.timestamp;
        match current.add_at(log, timestamp) {
            Ok(BatchState::Open) => {}
            Ok(BatchState::Closed) => {
                batches.push(std::mem::replace(&mut current, LogBatch::new(limits)));
            }
            Err(BatchClosed(log)) => {
                batches.push(std::mem::replace(&mut current, LogBatch::new(limits)));
                if let Ok(BatchState::Closed) = current.add_at(log, timestamp) {
                    batches.push(std::mem::replace(&mut current, LogBatch::new(limits)));
                }
            }
        }
    }

    if !current.is_empty() {
        batches.push(current);
    }

    batches
}

struct ControllerInner {
    logs: Arc<dyn LogRepository>,
    metadata: Arc<dyn MetadataRepository>,
    uploader: Arc<dyn LogUploader>,
    app_id: String,
}

impl ControllerInner {
    async fn send(&self, logs: Vec<LogRecord>) -> Result<()> {
        if logs.is_empty() {
            return Ok(());
        }

        let session_id = logs.iter().find_map(|log| log.session_id.clone());
        let process_id = logs[0].process_id.clone();

        let records = self
            .metadata
            .fetch_metadata(&ALL_METADATA, session_id.as_ref(), &process_id)
            .unwrap_or_else(|e| {
                warn!("Failed to fetch metadata for log batch: {}", e);
                Vec::new()
            });

        let payloads: Vec<LogPayload> = logs.iter().map(LogPayload::from).collect();
        let mut envelope = PayloadEnvelope::new(payloads, &records);
        envelope
            .resource
            .entry("app_id".to_string())
            .or_insert_with(|| self.app_id.clone());
        envelope
            .resource
            .entry("process_id".to_string())
            .or_insert_with(|| process_id.to_string());
        if let Some(session_id) = &session_id {
            envelope
                .resource
                .entry("session_id".to_string())
                .or_insert_with(|| session_id.to_string());
        }

        let data = envelope.encode()?;
        let upload_id = Uuid::new_v4().to_string();

        match self.uploader.upload_log(&upload_id, data).await {
            Ok(()) => {
                match self.logs.remove_logs(&logs) {
                    Ok(removed) => debug!("Removed {} uploaded logs", removed),
                    Err(e) => warn!("Failed to remove uploaded logs: {}", e),
                }
                info!("Uploaded batch {} with {} logs", upload_id, logs.len());
                Ok(())
            }
            Err(e) => {
                warn!(
                    "Upload of batch {} failed, keeping {} logs for retry: {}",
                    upload_id,
                    logs.len(),
                    e
                );
                Err(e)
            }
        }
    }
}

/// Sends log batches and recovers the backlog of earlier processes
pub struct LogController {
    inner: Arc<ControllerInner>,
    recovery_limits: BatchLimits,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
}

impl LogController {
    pub fn new(
        logs: Arc<dyn LogRepository>,
        metadata: Arc<dyn MetadataRepository>,
        uploader: Arc<dyn LogUploader>,
        recovery_limits: BatchLimits,
        app_id: String,
    ) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                logs,
                metadata,
                uploader,
                app_id,
            }),
            recovery_limits,
            in_flight: Mutex::new(Vec::new()),
        }
    }

    /// Upload every stored log not written by the current process.
    /// Returns the number of batches that were uploaded.
    #[instrument(skip(self))]
    pub async fn recover_unsent(&self) -> Result<usize> {
        let logs = match self
            .inner
            .logs
            .fetch_all_excluding_process(&ProcessId::current())
        {
            Ok(logs) => logs,
            Err(e) => {
                error!("Failed to fetch unsent logs, purging backlog: {}", e);
                if let Err(purge_error) = self.inner.logs.remove_all_logs() {
                    error!("Failed to purge log backlog: {}", purge_error);
                }
                return Err(e);
            }
        };

        if logs.is_empty() {
            debug!("No unsent logs to recover");
            return Ok(0);
        }

        let batches = divide_in_batches(logs, self.recovery_limits);
        info!("Recovering {} unsent log batches", batches.len());

        let results = join_all(
            batches
                .into_iter()
                .map(|batch| self.inner.send(batch.into_logs())),
        )
        .await;

        let sent = results.iter().filter(|result| result.is_ok()).count();
        if sent < results.len() {
            warn!("{} of {} recovered batches failed to upload", results.len() - sent, results.len());
        }

        Ok(sent)
    }

    /// Upload a batch and wait for the outcome
    pub async fn send(&self, batch: LogBatch) -> Result<()> {
        self.inner.send(batch.into_logs()).await
    }

    /// Upload attachment data in the background. Failures are logged and not retried.
    pub fn upload_attachment(&self, attachment: PendingAttachment) {
        let uploader = self.inner.uploader.clone();
        self.track(tokio::spawn(async move {
            if let Err(e) = uploader.upload_attachment(&attachment.id, attachment.data).await {
                warn!("Attachment {} was not uploaded: {}", attachment.id, e);
            }
        }));
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut in_flight = self.in_flight.lock();
        in_flight.retain(|task| !task.is_finished());
        in_flight.push(handle);
    }

    /// Wait until every background upload started so far has completed
    pub async fn wait_for_uploads(&self) -> Result<()> {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.in_flight.lock());
        for result in join_all(handles).await {
            result.map_err(|e| PipelineError::Other(format!("upload task failed: {}", e)))?;
        }
        Ok(())
    }
}

impl BatchSink for LogController {
    fn batch_finished(&self, batch: LogBatch) {
        let inner = self.inner.clone();
        self.track(tokio::spawn(async move {
            // Failures are already logged and the logs stay stored
            let _ = inner.send(batch.into_logs()).await;
        }));
    }
}

impl std::fmt::Debug for LogController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogController")
            .field("recovery_limits", &self.recovery_limits)
            .field("in_flight", &self.in_flight.lock().len())
            .finish()
    }
}
