//! The mutation pipeline: row events in, bulk batches out.
//!
//! A single task owns the pending batch. A batch is flushed whenever
//! either trigger fires:
//!
//! - **size**: the pending action count reached `bulk_size`;
//! - **time**: the oldest pending action has waited `flush_bulk_time`.
//!
//! Batches leave over a bounded channel of capacity one, so at most one
//! batch is in flight and row-event order is preserved end to end. The
//! batch carries the highest source coordinate among its actions; the
//! coordinate only reaches the tracker once the dispatcher acknowledges.

use crate::action::{Batch, BulkAction};
use crate::error::{EstuaryError, Result};
use crate::event::RowEvent;
use crate::position::BinlogPosition;
use crate::rule::RuleSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Single-owner batching stage between the pump and the dispatcher.
pub struct MutationPipeline {
    rules: Arc<RuleSet>,
    bulk_size: usize,
    flush_interval: Duration,
    events: mpsc::Receiver<RowEvent>,
    batches: mpsc::Sender<Batch>,
    cancel: CancellationToken,
    pending: Vec<BulkAction>,
    pending_position: BinlogPosition,
    pending_since: Option<Instant>,
}

impl MutationPipeline {
    pub fn new(
        rules: Arc<RuleSet>,
        bulk_size: usize,
        flush_interval: Duration,
        events: mpsc::Receiver<RowEvent>,
        batches: mpsc::Sender<Batch>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            rules,
            bulk_size,
            flush_interval,
            events,
            batches,
            cancel,
            pending: Vec::new(),
            pending_position: BinlogPosition::zero(),
            pending_since: None,
        }
    }

    /// Run until the event channel closes or cancellation is requested.
    /// Either way the partial batch is flushed before returning.
    pub async fn run(mut self) -> Result<()> {
        loop {
            let flush_at = self.pending_since.map(|t| t + self.flush_interval);

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.drain().await?;
                    self.flush().await?;
                    debug!("mutation pipeline drained and stopped");
                    return Ok(());
                }
                event = self.events.recv() => match event {
                    Some(event) => {
                        self.ingest(event);
                        if self.pending.len() >= self.bulk_size {
                            self.flush().await?;
                        }
                    }
                    None => {
                        self.flush().await?;
                        debug!("event channel closed, mutation pipeline stopped");
                        return Ok(());
                    }
                },
                _ = wait_until(flush_at) => {
                    self.flush().await?;
                }
            }
        }
    }

    fn ingest(&mut self, event: RowEvent) {
        let actions = self.rules.convert(&event);
        if actions.is_empty() {
            trace!("no action for {}.{} event", event.schema, event.table);
            return;
        }

        if self.pending.is_empty() {
            self.pending_since = Some(Instant::now());
        }
        if event.position > self.pending_position {
            self.pending_position = event.position;
        }
        self.pending.extend(actions);
    }

    async fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            self.pending_since = None;
            return Ok(());
        }

        let batch = Batch {
            actions: std::mem::take(&mut self.pending),
            position: std::mem::take(&mut self.pending_position),
        };
        self.pending_since = None;

        trace!("flushing batch of {} actions at {}", batch.len(), batch.position);
        self.batches
            .send(batch)
            .await
            .map_err(|_| EstuaryError::other("bulk dispatcher stopped"))
    }

    /// Consume events already buffered in the channel without waiting for
    /// new arrivals. Used on shutdown so the pump's final events still
    /// reach the sink.
    async fn drain(&mut self) -> Result<()> {
        while let Ok(event) = self.events.try_recv() {
            self.ingest(event);
            if self.pending.len() >= self.bulk_size {
                self.flush().await?;
            }
        }
        Ok(())
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
