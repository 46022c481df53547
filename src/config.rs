//! Configuration management for the signal pipeline

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Bounds applied by the sanitizer before persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanitizerLimits {
    pub span_name_length: usize,
    pub event_name_length: usize,
    pub attribute_key_length: usize,
    pub attribute_value_length: usize,
    pub span_attribute_count: usize,
    pub event_attribute_count: usize,
    pub link_attribute_count: usize,
    pub log_attribute_count: usize,
}

impl Default for SanitizerLimits {
    fn default() -> Self {
        Self {
            span_name_length: 128,
            event_name_length: 128,
            attribute_key_length: 128,
            attribute_value_length: 1024,
            span_attribute_count: 100,
            event_attribute_count: 10,
            link_attribute_count: 10,
            log_attribute_count: 100,
        }
    }
}

/// Per-session admission caps enforced by the limiter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionLimits {
    pub custom_spans: usize,
    pub events_per_span: usize,
    pub links_per_span: usize,
    pub attributes_per_span: usize,
    pub session_events: usize,
    pub breadcrumbs: Option<usize>,
    pub info_logs: usize,
    pub warning_logs: usize,
    pub error_logs: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            custom_spans: 500,
            events_per_span: 10,
            links_per_span: 10,
            attributes_per_span: 100,
            session_events: 9999,
            breadcrumbs: Some(100),
            info_logs: 100,
            warning_logs: 200,
            error_logs: 250,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Application identifier sent with every upload
    pub app_id: String,

    /// Base URL of the upload endpoint
    pub endpoint_url: String,

    /// HTTP timeout for upload requests
    pub http_timeout: Duration,

    /// Maximum retry attempts for failed uploads
    pub max_retries: u32,

    /// Retry backoff base in milliseconds
    pub retry_backoff_ms: u64,

    /// Maximum number of logs in a batch
    pub max_logs_per_batch: usize,

    /// Age after which the live batch closes. `None` keeps it open until full.
    pub live_batch_max_age: Option<Duration>,

    /// Age limit used when dividing the recovered backlog into batches
    pub recovery_batch_max_age: Duration,

    /// Default number of stored spans per primary type
    pub span_limit_default: usize,

    /// Overrides of `span_limit_default` keyed by primary type (`perf`, `ux`, `sys`)
    pub span_limits: HashMap<String, usize>,

    /// Maximum attachments per session
    pub max_attachments_per_session: usize,

    /// Maximum size of a single attachment in bytes
    pub max_attachment_size: usize,

    /// Closed spans older than this are pruned on startup
    pub span_retention: Duration,

    /// SQLite database file for the record store; in memory when unset
    pub store_path: Option<PathBuf>,

    pub sanitizer: SanitizerLimits,

    pub limits: SessionLimits,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            app_id: "unknown-app".to_string(),
            endpoint_url: "http://localhost:8080".to_string(),
            http_timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_backoff_ms: 1000,
            max_logs_per_batch: 20,
            live_batch_max_age: None,
            recovery_batch_max_age: Duration::from_secs(5),
            span_limit_default: 1500,
            span_limits: HashMap::new(),
            max_attachments_per_session: 5,
            max_attachment_size: 1_048_576,
            span_retention: Duration::from_secs(7 * 24 * 60 * 60),
            store_path: None,
            sanitizer: SanitizerLimits::default(),
            limits: SessionLimits::default(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = PipelineConfig::default();

        if let Ok(app_id) = env::var("SIGNAL_APP_ID") {
            config.app_id = app_id;
        }

        if let Ok(endpoint_url) = env::var("SIGNAL_ENDPOINT_URL") {
            config.endpoint_url = endpoint_url;
        }

        if let Ok(timeout) = env::var("SIGNAL_HTTP_TIMEOUT_SECONDS") {
            if let Ok(seconds) = timeout.parse::<u64>() {
                config.http_timeout = Duration::from_secs(seconds);
            }
        }

        if let Ok(max_retries) = env::var("SIGNAL_MAX_RETRIES") {
            if let Ok(retries) = max_retries.parse() {
                config.max_retries = retries;
            }
        }

        if let Ok(backoff) = env::var("SIGNAL_RETRY_BACKOFF_MS") {
            if let Ok(ms) = backoff.parse() {
                config.retry_backoff_ms = ms;
            }
        }

        if let Ok(batch_size) = env::var("SIGNAL_MAX_LOGS_PER_BATCH") {
            if let Ok(size) = batch_size.parse() {
                config.max_logs_per_batch = size;
            }
        }

        if let Ok(age) = env::var("SIGNAL_LIVE_BATCH_MAX_AGE_SECONDS") {
            if let Ok(seconds) = age.parse::<u64>() {
                config.live_batch_max_age = Some(Duration::from_secs(seconds));
            }
        }

        if let Ok(limit) = env::var("SIGNAL_SPAN_LIMIT") {
            if let Ok(limit) = limit.parse() {
                config.span_limit_default = limit;
            }
        }

        if let Ok(limit) = env::var("SIGNAL_MAX_ATTACHMENTS") {
            if let Ok(limit) = limit.parse() {
                config.max_attachments_per_session = limit;
            }
        }

        if let Ok(size) = env::var("SIGNAL_MAX_ATTACHMENT_BYTES") {
            if let Ok(size) = size.parse() {
                config.max_attachment_size = size;
            }
        }

        if let Ok(path) = env::var("SIGNAL_STORE_PATH") {
            if !path.trim().is_empty() {
                config.store_path = Some(PathBuf::from(path));
            }
        }

        config
    }

    /// Retention limit for spans of the given primary type
    pub fn span_limit(&self, primary: &str) -> usize {
        self.span_limits
            .get(primary)
            .copied()
            .unwrap_or(self.span_limit_default)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.app_id.is_empty() {
            return Err("app_id cannot be empty".to_string());
        }

        if self.endpoint_url.is_empty() {
            return Err("endpoint_url cannot be empty".to_string());
        }

        if self.max_logs_per_batch == 0 {
            return Err("max_logs_per_batch must be greater than 0".to_string());
        }

        if self.recovery_batch_max_age.is_zero() {
            return Err("recovery_batch_max_age must be greater than 0".to_string());
        }

        if self.span_limit_default == 0 || self.span_limits.values().any(|limit| *limit == 0) {
            return Err("span limits must be greater than 0".to_string());
        }

        if self.max_attachment_size == 0 {
            return Err("max_attachment_size must be greater than 0".to_string());
        }

        Ok(())
    }
}
