//! The bulk dispatcher: ships batches to the sink and acknowledges them.
//!
//! One batch is in flight at a time. Each attempt carries a 30 second
//! deadline; transient failures (transport errors, timeouts, items failed
//! with a sink-side 5xx) retry the whole batch up to three times with
//! 100 ms / 500 ms / 2 s backoff before becoming fatal. Permanently
//! rejected items (4xx other than 404-on-delete) are logged and the batch
//! is acknowledged anyway: retrying bad writes forever would stall the
//! pipeline, and the coordinate must advance.
//!
//! Acknowledging a batch forwards its coordinate to the position tracker
//! and appends the batch's wall-clock latency to the stats ring.

use crate::action::{ActionKind, Batch};
use crate::error::{EstuaryError, Result};
use crate::latency::LatencyRing;
use crate::tracker::PositionTracker;
use crate::traits::{BulkReply, BulkSink};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const RETRY_BACKOFF: [Duration; 3] = [
    Duration::from_millis(100),
    Duration::from_millis(500),
    Duration::from_secs(2),
];

/// Terminal stage of the pipeline chain.
pub struct BulkDispatcher {
    sink: Arc<dyn BulkSink>,
    tracker: Arc<PositionTracker>,
    latency: Arc<LatencyRing>,
    batches: mpsc::Receiver<Batch>,
}

enum Disposition {
    Ack,
    Retry(String),
}

impl BulkDispatcher {
    pub fn new(
        sink: Arc<dyn BulkSink>,
        tracker: Arc<PositionTracker>,
        latency: Arc<LatencyRing>,
        batches: mpsc::Receiver<Batch>,
    ) -> Self {
        Self {
            sink,
            tracker,
            latency,
            batches,
        }
    }

    /// Run until the batch channel closes. Shutdown is driven by the
    /// upstream stages: once the pipeline flushes its last batch and
    /// drops the sender, the dispatcher drains and returns.
    pub async fn run(mut self) -> Result<()> {
        while let Some(batch) = self.batches.recv().await {
            self.dispatch(batch).await?;
        }
        debug!("batch channel closed, bulk dispatcher stopped");
        Ok(())
    }

    async fn dispatch(&mut self, batch: Batch) -> Result<()> {
        let started = Instant::now();
        let mut attempt = 0usize;

        loop {
            attempt += 1;

            let disposition = match timeout(REQUEST_TIMEOUT, self.sink.write(&batch)).await {
                Err(_) => Disposition::Retry(format!(
                    "bulk request timed out after {:?}",
                    REQUEST_TIMEOUT
                )),
                Ok(Err(e)) if e.is_retriable() => Disposition::Retry(e.to_string()),
                Ok(Err(e)) => return Err(e),
                Ok(Ok(reply)) => self.inspect(&reply, &batch),
            };

            match disposition {
                Disposition::Ack => {
                    self.tracker.save(batch.position.clone()).await;
                    self.latency.record(started.elapsed());
                    debug!(
                        "acknowledged batch of {} actions at {}",
                        batch.len(),
                        batch.position
                    );
                    return Ok(());
                }
                Disposition::Retry(reason) => {
                    if attempt > RETRY_BACKOFF.len() {
                        return Err(EstuaryError::sink(format!(
                            "batch of {} actions at {} failed after {} attempts: {}",
                            batch.len(),
                            batch.position,
                            attempt,
                            reason
                        )));
                    }
                    let backoff = RETRY_BACKOFF[attempt - 1];
                    warn!(
                        "bulk attempt {} failed ({}), retrying in {:?}",
                        attempt, reason, backoff
                    );
                    sleep(backoff).await;
                }
            }
        }
    }

    /// Classify a bulk reply: any retryable item retries the whole batch,
    /// permanent item failures are logged and swallowed.
    fn inspect(&self, reply: &BulkReply, batch: &Batch) -> Disposition {
        if !reply.errors {
            return Disposition::Ack;
        }

        let mut retryable = 0usize;
        for (item, action) in reply.items.iter().zip(batch.actions.iter()) {
            match item.status {
                status if status >= 500 => retryable += 1,
                404 if action.kind == ActionKind::Delete => {
                    // Deleting an already-absent document is fine on replay.
                }
                status if (400..500).contains(&status) => {
                    error!(
                        "bulk item {} on {} permanently rejected with {}: {}",
                        item.id,
                        action.index,
                        status,
                        item.error.as_deref().unwrap_or("")
                    );
                }
                _ => {}
            }
        }

        if retryable > 0 {
            Disposition::Retry(format!("{} items failed with a 5xx status", retryable))
        } else {
            Disposition::Ack
        }
    }
}
