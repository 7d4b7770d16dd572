//! In-memory capability implementations.
//!
//! Everything the pipeline plugs into, backed by process memory: handy
//! for unit tests, integration tests and examples. None of these talk to
//! a network.

use crate::action::Batch;
use crate::error::{EstuaryError, Result};
use crate::event::{DumpRow, SourceEvent};
use crate::position::BinlogPosition;
use crate::traits::{
    Alerter, BinlogSource, BulkItemReply, BulkReply, BulkSink, Clock, DumpSource, DurableCounter,
    EventStream, HashStore, PositionStore, ProcessControl,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};

// ============================================================================
// Stores
// ============================================================================

/// Hash store over a process-local map.
#[derive(Default)]
pub struct MemoryHashStore {
    data: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl MemoryHashStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HashStore for MemoryHashStore {
    async fn read_fields(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>> {
        let data = self.data.lock().await;
        let entry = data.get(key);
        Ok(fields
            .iter()
            .map(|f| entry.and_then(|e| e.get(*f).cloned()))
            .collect())
    }

    async fn write_fields(&self, key: &str, fields: &[(&str, String)]) -> Result<()> {
        let mut data = self.data.lock().await;
        let entry = data.entry(key.to_string()).or_default();
        for (field, value) in fields {
            entry.insert(field.to_string(), value.clone());
        }
        Ok(())
    }
}

/// Position store over a shared in-memory slot, counting writes.
pub struct MemoryPositionStore {
    position: Arc<StdMutex<BinlogPosition>>,
    writes: Arc<AtomicUsize>,
}

impl Default for MemoryPositionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPositionStore {
    pub fn new() -> Self {
        Self {
            position: Arc::new(StdMutex::new(BinlogPosition::zero())),
            writes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared handle to the stored position.
    pub fn shared_position(&self) -> Arc<StdMutex<BinlogPosition>> {
        self.position.clone()
    }

    /// Shared count of store writes.
    pub fn writes(&self) -> Arc<AtomicUsize> {
        self.writes.clone()
    }
}

#[async_trait]
impl PositionStore for MemoryPositionStore {
    async fn load(&self) -> Result<BinlogPosition> {
        Ok(self.position.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn store(&self, position: &BinlogPosition) -> Result<()> {
        *self.position.lock().unwrap_or_else(|e| e.into_inner()) = position.clone();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Durable counter store over a process-local map.
#[derive(Default)]
pub struct MemoryCounter {
    data: Mutex<HashMap<String, i64>>,
}

impl MemoryCounter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableCounter for MemoryCounter {
    async fn get(&self, key: &str) -> Result<Option<i64>> {
        Ok(self.data.lock().await.get(key).copied())
    }

    async fn set(&self, key: &str, value: i64) -> Result<()> {
        self.data.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut data = self.data.lock().await;
        let value = data.entry(key.to_string()).or_insert(0);
        *value += 1;
        Ok(*value)
    }
}

// ============================================================================
// Alerting and process control
// ============================================================================

/// Alerter that collects messages instead of delivering them.
#[derive(Default)]
pub struct CollectingAlerter {
    messages: StdMutex<Vec<(String, Vec<(String, String)>)>>,
}

impl CollectingAlerter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything notified so far.
    pub fn messages(&self) -> Vec<(String, Vec<(String, String)>)> {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl Alerter for CollectingAlerter {
    async fn notify(&self, message: &str, fields: &[(String, String)]) -> Result<()> {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((message.to_string(), fields.to_vec()));
        Ok(())
    }
}

/// Process control that records the exit code instead of exiting.
#[derive(Default)]
pub struct RecordingProcess {
    code: StdMutex<Option<i32>>,
}

impl RecordingProcess {
    pub fn new() -> Self {
        Self::default()
    }

    /// The exit code of the last terminate call, if any.
    pub fn exit_code(&self) -> Option<i32> {
        *self.code.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ProcessControl for RecordingProcess {
    fn terminate(&self, code: i32) {
        *self.code.lock().unwrap_or_else(|e| e.into_inner()) = Some(code);
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: StdMutex<Instant>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: StdMutex::new(Instant::now()),
        }
    }

    /// Advance the clock.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ============================================================================
// Source and sink
// ============================================================================

/// Binlog source driven by test-scripted channels.
///
/// Each [`push_stream`](Self::push_stream) queues one replica session;
/// every `register` call consumes the next queued session, so reconnect
/// behaviour is scriptable.
#[derive(Default)]
pub struct ScriptedBinlogSource {
    tip: StdMutex<BinlogPosition>,
    columns: StdMutex<HashMap<(String, String), Vec<String>>>,
    streams: StdMutex<VecDeque<mpsc::Receiver<Result<SourceEvent>>>>,
    registrations: StdMutex<Vec<(u32, BinlogPosition)>>,
}

impl ScriptedBinlogSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a replica session and get the sender that scripts it.
    pub fn push_stream(&self) -> mpsc::Sender<Result<SourceEvent>> {
        let (tx, rx) = mpsc::channel(1024);
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(rx);
        tx
    }

    /// Set the coordinate `current_tip` reports.
    pub fn set_tip(&self, tip: BinlogPosition) {
        *self.tip.lock().unwrap_or_else(|e| e.into_inner()) = tip;
    }

    /// Set the column names of a table.
    pub fn set_columns(&self, schema: &str, table: &str, columns: &[&str]) {
        self.columns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                (schema.to_string(), table.to_string()),
                columns.iter().map(|c| c.to_string()).collect(),
            );
    }

    /// All `register` calls observed so far.
    pub fn registrations(&self) -> Vec<(u32, BinlogPosition)> {
        self.registrations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

struct ChannelStream {
    events: mpsc::Receiver<Result<SourceEvent>>,
}

#[async_trait]
impl EventStream for ChannelStream {
    async fn next_event(&mut self) -> Result<Option<SourceEvent>> {
        match self.events.recv().await {
            Some(Ok(event)) => Ok(Some(event)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl BinlogSource for ScriptedBinlogSource {
    async fn register(
        &self,
        server_id: u32,
        start: BinlogPosition,
    ) -> Result<Box<dyn EventStream>> {
        self.registrations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((server_id, start));
        let stream = self
            .streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .ok_or_else(|| EstuaryError::replication("no scripted replica session left"))?;
        Ok(Box::new(ChannelStream { events: stream }))
    }

    async fn current_tip(&self) -> Result<BinlogPosition> {
        Ok(self.tip.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn table_columns(&self, schema: &str, table: &str) -> Result<Vec<String>> {
        self.columns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(schema.to_string(), table.to_string()))
            .cloned()
            .ok_or_else(|| {
                EstuaryError::replication(format!("no columns scripted for {}.{}", schema, table))
            })
    }
}

/// Dump source replaying a fixed list of rows.
pub struct ScriptedDump {
    rows: Vec<DumpRow>,
    end: BinlogPosition,
}

impl ScriptedDump {
    pub fn new(rows: Vec<DumpRow>, end: BinlogPosition) -> Self {
        Self { rows, end }
    }
}

#[async_trait]
impl DumpSource for ScriptedDump {
    async fn dump(&self, out: mpsc::Sender<DumpRow>) -> Result<BinlogPosition> {
        for row in &self.rows {
            out.send(row.clone())
                .await
                .map_err(|_| EstuaryError::other("dump receiver dropped"))?;
        }
        Ok(self.end.clone())
    }
}

/// Bulk sink recording batches and replaying scripted outcomes.
///
/// When the script queue is empty, every write succeeds with a 200 per
/// item.
#[derive(Default)]
pub struct RecordingSink {
    batches: Mutex<Vec<Batch>>,
    outcomes: Mutex<VecDeque<Result<BulkReply>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a scripted reply for the next write.
    pub async fn push_reply(&self, reply: BulkReply) {
        self.outcomes.lock().await.push_back(Ok(reply));
    }

    /// Queue a scripted transport-level failure for the next write.
    pub async fn push_error(&self, error: EstuaryError) {
        self.outcomes.lock().await.push_back(Err(error));
    }

    /// Every batch the sink has seen, including retried ones.
    pub async fn batches(&self) -> Vec<Batch> {
        self.batches.lock().await.clone()
    }
}

#[async_trait]
impl BulkSink for RecordingSink {
    async fn write(&self, batch: &Batch) -> Result<BulkReply> {
        self.batches.lock().await.push(batch.clone());

        if let Some(outcome) = self.outcomes.lock().await.pop_front() {
            return outcome;
        }
        Ok(BulkReply {
            took_ms: 1,
            errors: false,
            items: batch
                .actions
                .iter()
                .map(|a| BulkItemReply {
                    status: 200,
                    id: a.id.clone(),
                    error: None,
                })
                .collect(),
        })
    }
}
