//! Log batching
//!
//! `LogBatch` is the size and age bounded batch state machine. `LogBatcher`
//! owns the current batch inside a tokio task so that every `add` is applied
//! by a single writer and each batch is reported closed exactly once.

use crate::errors::{PipelineError, Result};
use crate::telemetry::LogRecord;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Limits that close a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    /// Age of the first log after which the batch closes. `None` never closes by age.
    pub max_age: Option<Duration>,
    pub max_count: usize,
}

impl BatchLimits {
    pub fn new(max_age: Option<Duration>, max_count: usize) -> Self {
        Self { max_age, max_count }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Open,
    Closed,
}

/// Returned by `LogBatch::add` on a closed batch, handing the log back
#[derive(Debug, Clone, PartialEq)]
pub struct BatchClosed(pub LogRecord);

impl std::fmt::Display for BatchClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "batch is closed, log {} was not added", self.0.id)
    }
}

impl std::error::Error for BatchClosed {}

#[derive(Debug, Clone)]
pub struct LogBatch {
    limits: BatchLimits,
    logs: Vec<LogRecord>,
    state: BatchState,
}

impl LogBatch {
    pub fn new(limits: BatchLimits) -> Self {
        Self {
            limits,
            logs: Vec::new(),
            state: BatchState::Open,
        }
    }

    /// A batch that starts with `logs`; its state is computed right away
    pub fn with_logs(limits: BatchLimits, logs: Vec<LogRecord>) -> Self {
        let mut batch = Self {
            limits,
            logs,
            state: BatchState::Open,
        };
        batch.state = batch.compute_state(Utc::now());
        batch
    }

    /// Append a log. A closed batch rejects it and stays unchanged.
    pub fn add(&mut self, log: LogRecord) -> std::result::Result<BatchState, BatchClosed> {
        self.add_at(log, Utc::now())
    }

    /// Append a log, measuring the batch age at `now`
    pub fn add_at(
        &mut self,
        log: LogRecord,
        now: DateTime<Utc>,
    ) -> std::result::Result<BatchState, BatchClosed> {
        if self.state == BatchState::Closed {
            return Err(BatchClosed(log));
        }

        self.logs.push(log);
        self.state = self.compute_state(now);
        Ok(self.state)
    }

    fn compute_state(&self, now: DateTime<Utc>) -> BatchState {
        let Some(first) = self.logs.first() else {
            return BatchState::Open;
        };

        if self.logs.len() >= self.limits.max_count {
            return BatchState::Closed;
        }

        let expired = self
            .limits
            .max_age
            .and_then(|age| chrono::Duration::from_std(age).ok())
            .is_some_and(|age| now - first.timestamp >= age);

        if expired {
            BatchState::Closed
        } else {
            BatchState::Open
        }
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    pub fn limits(&self) -> BatchLimits {
        self.limits
    }

    pub fn logs(&self) -> &[LogRecord] {
        &self.logs
    }

    pub fn into_logs(self) -> Vec<LogRecord> {
        self.logs
    }

    pub fn len(&self) -> usize {
        self.logs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }
}

/// Receiver of finished batches
pub trait BatchSink: Send + Sync {
    fn batch_finished(&self, batch: LogBatch);
}

enum Command {
    Add(LogRecord),
    ForceEnd(oneshot::Sender<()>),
}

/// Batches live logs on a dedicated task
#[derive(Debug)]
pub struct LogBatcher {
    sender: mpsc::UnboundedSender<Command>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LogBatcher {
    /// Start the batching task. Must be called inside a tokio runtime.
    pub fn spawn(limits: BatchLimits, sink: Arc<dyn BatchSink>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_batcher(limits, sink, receiver));

        Self {
            sender,
            task: Mutex::new(Some(task)),
        }
    }

    /// Queue a log for batching without blocking the caller
    pub fn add_log(&self, log: LogRecord) -> Result<()> {
        self.sender
            .send(Command::Add(log))
            .map_err(|_| PipelineError::Other("log batcher has stopped".to_string()))
    }

    /// Close the current batch, if it has logs, and hand it to the sink
    pub async fn force_end_current_batch(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.sender
            .send(Command::ForceEnd(ack))
            .map_err(|_| PipelineError::Other("log batcher has stopped".to_string()))?;
        done.await
            .map_err(|_| PipelineError::Other("log batcher stopped while flushing".to_string()))
    }

    /// Flush the current batch and stop the task
    pub async fn shutdown(&self) -> Result<()> {
        self.force_end_current_batch().await?;
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.abort();
        }
        Ok(())
    }
}

async fn run_batcher(
    limits: BatchLimits,
    sink: Arc<dyn BatchSink>,
    mut receiver: mpsc::UnboundedReceiver<Command>,
) {
    let mut batch = LogBatch::new(limits);
    let mut deadline: Option<Instant> = None;

    loop {
        let expiry = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            command = receiver.recv() => match command {
                Some(Command::Add(log)) => match batch.add(log) {
                    Ok(BatchState::Closed) => {
                        finish(&mut batch, &sink);
                        deadline = None;
                    }
                    Ok(BatchState::Open) => {
                        if deadline.is_none() {
                            deadline = limits.max_age.map(|age| Instant::now() + age);
                        }
                    }
                    Err(BatchClosed(log)) => {
                        warn!("Current batch was already closed, starting a new one");
                        finish(&mut batch, &sink);
                        batch = LogBatch::with_logs(limits, vec![log]);
                        deadline = None;
                        if batch.state() == BatchState::Closed {
                            finish(&mut batch, &sink);
                        } else {
                            deadline = limits.max_age.map(|age| Instant::now() + age);
                        }
                    }
                },
                Some(Command::ForceEnd(ack)) => {
                    finish(&mut batch, &sink);
                    deadline = None;
                    let _ = ack.send(());
                }
                None => {
                    finish(&mut batch, &sink);
                    break;
                }
            },
            _ = expiry => {
                debug!("Batch reached its maximum age");
                finish(&mut batch, &sink);
                deadline = None;
            }
        }
    }
}

/// Hand a non-empty batch to the sink and start a new one
fn finish(batch: &mut LogBatch, sink: &Arc<dyn BatchSink>) {
    let limits = batch.limits();
    let finished = std::mem::replace(batch, LogBatch::new(limits));
    if finished.is_empty() {
        return;
    }

    debug!("Finished batch with {} logs", finished.len());
    sink.batch_finished(finished);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::LogSeverity;

    fn log(body: &str) -> LogRecord {
        LogRecord::new(LogSeverity::Info, body)
    }

    struct ChannelSink(mpsc::UnboundedSender<LogBatch>);

    impl BatchSink for ChannelSink {
        fn batch_finished(&self, batch: LogBatch) {
            let _ = self.0.send(batch);
        }
    }

    fn channel_sink() -> (Arc<dyn BatchSink>, mpsc::UnboundedReceiver<LogBatch>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Arc::new(ChannelSink(sender)), receiver)
    }

    async fn next_batch(receiver: &mut mpsc::UnboundedReceiver<LogBatch>) -> LogBatch {
        tokio::time::timeout(Duration::from_secs(2), receiver.recv())
            .await
            .expect("timed out waiting for batch")
            .expect("sink closed")
    }

    #[test]
    fn test_empty_batch_is_open() {
        let batch = LogBatch::with_logs(BatchLimits::new(Some(Duration::ZERO), 1), Vec::new());
        assert_eq!(batch.state(), BatchState::Open);
    }

    #[test]
    fn test_batch_closes_at_max_count() {
        let mut batch = LogBatch::new(BatchLimits::new(None, 1));
        assert_eq!(batch.add(log("first")), Ok(BatchState::Closed));

        let rejected = batch.add(log("second"));
        assert!(matches!(rejected, Err(BatchClosed(ref l)) if l.body == "second"));
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn test_batch_stays_open_below_limits() {
        let mut batch = LogBatch::new(BatchLimits::new(None, 3));
        assert_eq!(batch.add(log("a")), Ok(BatchState::Open));
        assert_eq!(batch.add(log("b")), Ok(BatchState::Open));
        assert_eq!(batch.add(log("c")), Ok(BatchState::Closed));
    }

    #[test]
    fn test_batch_closes_by_age() {
        let old = log("old").with_timestamp(Utc::now() - chrono::Duration::seconds(10));
        let batch = LogBatch::with_logs(BatchLimits::new(Some(Duration::from_secs(5)), 20), vec![old]);
        assert_eq!(batch.state(), BatchState::Closed);

        let mut fresh = LogBatch::new(BatchLimits::new(Some(Duration::from_secs(5)), 20));
        assert_eq!(fresh.add(log("new")), Ok(BatchState::Open));
    }

    #[tokio::test]
    async fn test_batcher_hands_off_full_batches() {
        let (sink, mut receiver) = channel_sink();
        let batcher = LogBatcher::spawn(BatchLimits::new(None, 2), sink);

        for body in ["a", "b", "c", "d"] {
            batcher.add_log(log(body)).unwrap();
        }

        let first = next_batch(&mut receiver).await;
        let second = next_batch(&mut receiver).await;
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        assert_eq!(first.logs()[0].body, "a");
        assert_eq!(second.logs()[1].body, "d");
    }

    #[tokio::test]
    async fn test_force_end_flushes_partial_batch() {
        let (sink, mut receiver) = channel_sink();
        let batcher = LogBatcher::spawn(BatchLimits::new(None, 20), sink);

        batcher.add_log(log("only")).unwrap();
        batcher.force_end_current_batch().await.unwrap();

        let batch = next_batch(&mut receiver).await;
        assert_eq!(batch.len(), 1);

        batcher.force_end_current_batch().await.unwrap();
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_deadline_closes_open_batch() {
        let (sink, mut receiver) = channel_sink();
        let batcher = LogBatcher::spawn(BatchLimits::new(Some(Duration::from_millis(50)), 20), sink);

        batcher.add_log(log("slow")).unwrap();
        let batch = next_batch(&mut receiver).await;
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_add_after_shutdown_fails() {
        let (sink, _receiver) = channel_sink();
        let batcher = LogBatcher::spawn(BatchLimits::new(None, 20), sink);
        batcher.shutdown().await.unwrap();
        tokio::task::yield_now().await;

        assert!(batcher.force_end_current_batch().await.is_err());
    }
}
