//! Capability traits at the edges of the core.
//!
//! The pipeline never speaks a wire protocol itself. The upstream
//! database, the bulk endpoint, the durable stores, the alert channel and
//! the host process are all reached through the traits in this module;
//! production adapters live outside the crate, in-memory implementations
//! for tests live in [`crate::testing`].

use crate::action::Batch;
use crate::error::Result;
use crate::event::{DumpRow, SourceEvent};
use crate::position::BinlogPosition;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::warn;

/// A live replication session delivering binlog events in order.
#[async_trait]
pub trait EventStream: Send {
    /// Next event, `Ok(None)` when the upstream closed the stream.
    async fn next_event(&mut self) -> Result<Option<SourceEvent>>;
}

/// The upstream database, seen as a replication master.
#[async_trait]
pub trait BinlogSource: Send + Sync {
    /// Register as a replica and stream events from `start`.
    async fn register(
        &self,
        server_id: u32,
        start: BinlogPosition,
    ) -> Result<Box<dyn EventStream>>;

    /// The master's current binlog coordinate (`SHOW MASTER STATUS`).
    async fn current_tip(&self) -> Result<BinlogPosition>;

    /// Ordered column names of a table, from the upstream schema query.
    async fn table_columns(&self, schema: &str, table: &str) -> Result<Vec<String>>;
}

/// Adapter over the external dump tool used for the initial snapshot.
#[async_trait]
pub trait DumpSource: Send + Sync {
    /// Stream a consistent snapshot into `out` and return the binlog
    /// coordinate the dump completed at.
    async fn dump(&self, out: mpsc::Sender<DumpRow>) -> Result<BinlogPosition>;
}

/// Per-item result of a bulk write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkItemReply {
    /// HTTP-style status of the item
    pub status: u16,
    /// Document id the item addressed
    pub id: String,
    /// Error body for failed items
    #[serde(default)]
    pub error: Option<String>,
}

/// Result of one bulk write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkReply {
    pub took_ms: u64,
    pub errors: bool,
    pub items: Vec<BulkItemReply>,
}

/// The document search engine's bulk endpoint.
#[async_trait]
pub trait BulkSink: Send + Sync {
    /// Apply a batch in one round-trip and report per-item results.
    async fn write(&self, batch: &Batch) -> Result<BulkReply>;
}

/// Backing store for the tracker's applied coordinate.
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Load the persisted coordinate; zero when nothing was stored yet.
    async fn load(&self) -> Result<BinlogPosition>;

    /// Persist the coordinate.
    async fn store(&self, position: &BinlogPosition) -> Result<()>;
}

/// An external hash-shaped key-value store (field access under one key).
#[async_trait]
pub trait HashStore: Send + Sync {
    /// Read named fields of a key; `None` per field that is absent.
    async fn read_fields(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>>;

    /// Write named fields of a key.
    async fn write_fields(&self, key: &str, fields: &[(&str, String)]) -> Result<()>;
}

/// Durable integer counters shared across process restarts.
#[async_trait]
pub trait DurableCounter: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<i64>>;
    async fn set(&self, key: &str, value: i64) -> Result<()>;
    async fn incr(&self, key: &str) -> Result<i64>;
}

/// Outbound alert channel (webhook, chat, pager).
#[async_trait]
pub trait Alerter: Send + Sync {
    async fn notify(&self, message: &str, fields: &[(String, String)]) -> Result<()>;
}

/// Alerter that writes to the log. The default when no webhook is wired.
pub struct LogAlerter;

#[async_trait]
impl Alerter for LogAlerter {
    async fn notify(&self, message: &str, fields: &[(String, String)]) -> Result<()> {
        warn!("ALERT: {} {:?}", message, fields);
        Ok(())
    }
}

/// Host process control, used by the drift supervisor's escalation.
pub trait ProcessControl: Send + Sync {
    /// Terminate the process with the given exit code.
    fn terminate(&self, code: i32);
}

/// Production [`ProcessControl`]: exits the process.
pub struct HostExit;

impl ProcessControl for HostExit {
    fn terminate(&self, code: i32) {
        std::process::exit(code);
    }
}

/// Monotonic clock, injectable for timing-sensitive tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Production [`Clock`] backed by [`Instant::now`].
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
