//! HTTP upload transport for log payloads and attachments

use crate::errors::{PipelineError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, Response};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Network uploader used by the log controller
#[async_trait]
pub trait LogUploader: Send + Sync {
    /// Upload a gzip compressed log envelope
    async fn upload_log(&self, id: &str, data: Vec<u8>) -> Result<()>;

    /// Upload the raw bytes of an attachment
    async fn upload_attachment(&self, id: &str, data: Vec<u8>) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
enum Endpoint {
    Logs,
    Attachments,
}

impl Endpoint {
    fn path(&self) -> &'static str {
        match self {
            Endpoint::Logs => "/v2/logs",
            Endpoint::Attachments => "/v2/attachments",
        }
    }

    fn content_type(&self) -> &'static str {
        match self {
            Endpoint::Logs => "application/json",
            Endpoint::Attachments => "application/octet-stream",
        }
    }
}

/// Uploader over HTTP with retries and exponential backoff
#[derive(Debug)]
pub struct HttpUploader {
    client: Client,
    base_url: String,
    app_id: String,
    timeout: Duration,
    max_retries: u32,
    retry_backoff_ms: u64,
    metrics: UploadMetrics,
}

impl HttpUploader {
    pub fn new(
        base_url: String,
        app_id: String,
        http_timeout: Duration,
        max_retries: u32,
        retry_backoff_ms: u64,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(http_timeout)
            .user_agent(format!("signal_pipeline/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(PipelineError::Http)?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            app_id,
            timeout: http_timeout,
            max_retries,
            retry_backoff_ms,
            metrics: UploadMetrics::default(),
        })
    }

    async fn upload(&self, endpoint: Endpoint, id: &str, data: Vec<u8>) -> Result<()> {
        let url = format!("{}{}", self.base_url, endpoint.path());
        debug!("Uploading {} ({} bytes) to {}", id, data.len(), url);

        let start_time = std::time::Instant::now();
        let mut attempt = 0;
        let mut last_error = None;

        while attempt <= self.max_retries {
            match self.upload_attempt(endpoint, &url, id, &data).await {
                Ok(()) => {
                    info!("Uploaded {} (attempt {})", id, attempt + 1);
                    self.metrics.record(true, start_time.elapsed());
                    return Ok(());
                }
                Err(PipelineError::Upload(message)) => {
                    last_error = Some(PipelineError::Upload(message));
                    break;
                }
                Err(e) => {
                    attempt += 1;
                    if attempt <= self.max_retries {
                        let backoff_ms = self.retry_backoff_ms * 2_u64.pow(attempt - 1);
                        warn!(
                            "Failed to upload {} (attempt {}), retrying in {}ms: {}",
                            id, attempt, backoff_ms, e
                        );
                        sleep(Duration::from_millis(backoff_ms)).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        let final_error = last_error
            .unwrap_or_else(|| PipelineError::Other("All retry attempts failed".to_string()));
        error!("Failed to upload {}: {}", id, final_error);
        self.metrics.record(false, start_time.elapsed());

        Err(final_error)
    }

    async fn upload_attempt(
        &self,
        endpoint: Endpoint,
        url: &str,
        id: &str,
        data: &[u8],
    ) -> Result<()> {
        let mut request = self
            .client
            .post(url)
            .header("Content-Type", endpoint.content_type())
            .header("X-EM-AID", &self.app_id)
            .header("X-Request-Id", id)
            .body(data.to_vec());

        if let Endpoint::Logs = endpoint {
            request = request.header("Content-Encoding", "gzip");
        }

        let response = timeout(self.timeout, request.send())
            .await
            .map_err(|_| PipelineError::Transport("Request timeout".to_string()))?
            .map_err(PipelineError::Http)?;

        self.handle_response(response, id).await
    }

    /// Client errors other than 408 and 429 are final; everything else may be retried
    async fn handle_response(&self, response: Response, id: &str) -> Result<()> {
        let status = response.status();

        if status.is_success() {
            debug!("Upload {} accepted", id);
            return Ok(());
        }

        let error_body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());

        match status.as_u16() {
            400 => Err(PipelineError::Upload(format!("Bad request for {}: {}", id, error_body))),
            401 => Err(PipelineError::Upload(format!("Unauthorized for {}: {}", id, error_body))),
            403 => Err(PipelineError::Upload(format!("Forbidden for {}: {}", id, error_body))),
            404 => Err(PipelineError::Upload(format!("Upload endpoint not found for {}: {}", id, error_body))),
            413 => Err(PipelineError::Upload(format!("Payload {} too large: {}", id, error_body))),
            408 | 429 => Err(PipelineError::Transport(format!(
                "Throttled upload {} ({}): {}",
                id, status, error_body
            ))),
            500..=599 => Err(PipelineError::Transport(format!(
                "Server error for {}: {}",
                id, error_body
            ))),
            _ => Err(PipelineError::Upload(format!(
                "Unexpected response {} for {}: {}",
                status, id, error_body
            ))),
        }
    }

    pub fn metrics(&self) -> UploadMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }
}

#[async_trait]
impl LogUploader for HttpUploader {
    async fn upload_log(&self, id: &str, data: Vec<u8>) -> Result<()> {
        self.upload(Endpoint::Logs, id, data).await
    }

    async fn upload_attachment(&self, id: &str, data: Vec<u8>) -> Result<()> {
        self.upload(Endpoint::Attachments, id, data).await
    }
}

#[derive(Debug, Default)]
struct MetricsState {
    uploads: u64,
    successes: u64,
    failures: u64,
    total_duration: Duration,
    min_duration: Option<Duration>,
    max_duration: Option<Duration>,
}

#[derive(Debug, Default)]
struct UploadMetrics {
    state: Mutex<MetricsState>,
}

impl UploadMetrics {
    fn record(&self, success: bool, duration: Duration) {
        let mut state = self.state.lock();
        state.uploads += 1;
        if success {
            state.successes += 1;
        } else {
            state.failures += 1;
        }
        state.total_duration += duration;
        state.min_duration = Some(state.min_duration.map_or(duration, |m| m.min(duration)));
        state.max_duration = Some(state.max_duration.map_or(duration, |m| m.max(duration)));
    }

    fn snapshot(&self) -> UploadMetricsSnapshot {
        let state = self.state.lock();

        let success_rate = if state.uploads > 0 {
            (state.successes as f64 / state.uploads as f64) * 100.0
        } else {
            0.0
        };

        let avg_duration = if state.uploads > 0 {
            state.total_duration / state.uploads as u32
        } else {
            Duration::ZERO
        };

        UploadMetricsSnapshot {
            uploads: state.uploads,
            successes: state.successes,
            failures: state.failures,
            success_rate,
            avg_duration_ms: avg_duration.as_millis() as u64,
            min_duration_ms: state.min_duration.map(|d| d.as_millis() as u64),
            max_duration_ms: state.max_duration.map(|d| d.as_millis() as u64),
        }
    }

    fn reset(&self) {
        *self.state.lock() = MetricsState::default();
    }
}

/// Snapshot of upload metrics
#[derive(Debug, Clone)]
pub struct UploadMetricsSnapshot {
    pub uploads: u64,
    pub successes: u64,
    pub failures: u64,
    pub success_rate: f64,
    pub avg_duration_ms: u64,
    pub min_duration_ms: Option<u64>,
    pub max_duration_ms: Option<u64>,
}
