//! Input batching boundary.
//!
//! Text destined for a session is queued and written by a single task that
//! flushes at most once per interval, coalescing everything queued since the
//! previous flush into one write. One task per session keeps flushes ordered.

use std::io::Write;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{trace, warn};

/// Destination of flushed input.
pub trait InputSink: Send + 'static {
    fn write_batch(&mut self, data: &[u8]) -> std::io::Result<()>;
}

impl InputSink for Box<dyn Write + Send> {
    fn write_batch(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.write_all(data)?;
        self.flush()
    }
}

/// Handle to a session's input batching task.
#[derive(Debug)]
pub struct InputBatcher {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    task: JoinHandle<()>,
}

impl InputBatcher {
    /// Start the batching task for `sink`.
    pub fn spawn<S: InputSink>(sink: S, interval: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_batcher(rx, sink, interval));
        Self { tx, task }
    }

    /// Queue input. Returns `false` once the sink has failed or shut down.
    pub fn send(&self, data: impl Into<Vec<u8>>) -> bool {
        self.tx.send(data.into()).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl Drop for InputBatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_batcher<S: InputSink>(
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    mut sink: S,
    interval: Duration,
) {
    let mut last_flush: Option<Instant> = None;
    while let Some(mut batch) = rx.recv().await {
        if let Some(at) = last_flush {
            tokio::time::sleep_until(at + interval).await;
        }
        while let Ok(more) = rx.try_recv() {
            batch.extend_from_slice(&more);
        }

        trace!(bytes = batch.len(), "Flushing session input");
        if let Err(e) = sink.write_batch(&batch) {
            warn!(error = %e, "Session input write failed, closing batcher");
            break;
        }
        last_flush = Some(Instant::now());
    }
}
