//! Telemetry signal pipeline
//!
//! This library captures spans and logs from an application, persists them
//! in SQLite, batches logs and uploads them to a telemetry endpoint. Signals
//! emitted through the shared OpenTelemetry tracer and logger providers are
//! bridged into the same pipeline without looping back into it.

pub mod adapter;
pub mod attachment;
pub mod batch;
pub mod bridge;
pub mod config;
pub mod controller;
pub mod db;
pub mod errors;
pub mod handler;
pub mod limiter;
pub mod payload;
pub mod pipeline;
pub mod registry;
pub mod sanitizer;
pub mod session;
pub mod store;
pub mod telemetry;
pub mod termination;
pub mod transport;

pub use config::PipelineConfig;
pub use db::SqliteStore;
pub use errors::{PipelineError, Result};
pub use handler::{LogOptions, SignalsHandler, SpanHandle, SpanOptions};
pub use pipeline::{PipelineStats, SignalPipeline};
pub use telemetry::{LogRecord, LogSeverity, SessionId, SignalType, SpanContext, SpanRecord};
