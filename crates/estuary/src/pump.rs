//! The replication pump: snapshot handover and binlog streaming.
//!
//! The pump owns the session with the upstream. Initialisation is
//! two-phased: when the tracker is at the zero coordinate an external
//! dump is teed into the pipeline as synthetic inserts, then streaming
//! registers as a replica from the handover coordinate. Transport
//! failures resume from the last-known coordinate with exponential
//! backoff; replay overlap is harmless because document writes are
//! idempotent on id.
//!
//! Binlog rows arrive positional and nameless. The pump resolves column
//! names through the upstream schema query, caches them per table, and
//! invalidates the cache when a DDL event touches the table.

use crate::error::{EstuaryError, Result};
use crate::event::{ChangeRows, DumpRow, RowEvent, RowsChange, SourceEvent};
use crate::position::BinlogPosition;
use crate::traits::{BinlogSource, DumpSource};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DUMP_CHANNEL_DEPTH: usize = 1024;
const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Exponential backoff: base doubles per attempt up to a cap.
struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl ExponentialBackoff {
    fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    fn next_backoff(&mut self) -> Duration {
        let backoff = self.base.saturating_mul(2u32.saturating_pow(self.attempt));
        self.attempt += 1;
        backoff.min(self.max)
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Column-name cache per `(schema, table)`, FIFO-bounded.
///
/// Column arity is fixed for the lifetime of a session unless a DDL event
/// invalidates the entry.
struct SchemaCache {
    tables: HashMap<(String, String), Arc<Vec<String>>>,
    insertion_order: VecDeque<(String, String)>,
    max_entries: usize,
}

impl SchemaCache {
    const DEFAULT_MAX_ENTRIES: usize = 1024;

    fn new() -> Self {
        Self {
            tables: HashMap::new(),
            insertion_order: VecDeque::new(),
            max_entries: Self::DEFAULT_MAX_ENTRIES,
        }
    }

    fn get(&self, schema: &str, table: &str) -> Option<Arc<Vec<String>>> {
        self.tables
            .get(&(schema.to_string(), table.to_string()))
            .cloned()
    }

    fn insert(&mut self, schema: &str, table: &str, columns: Arc<Vec<String>>) {
        let key = (schema.to_string(), table.to_string());
        if self.tables.insert(key.clone(), columns).is_none() {
            self.insertion_order.push_back(key);
            while self.tables.len() > self.max_entries {
                match self.insertion_order.pop_front() {
                    Some(oldest) => {
                        self.tables.remove(&oldest);
                    }
                    None => break,
                }
            }
        }
    }

    fn invalidate(&mut self, schema: &str, table: &str) {
        self.tables
            .remove(&(schema.to_string(), table.to_string()));
    }
}

/// Ingress stage owning the upstream replication session.
pub struct ReplicationPump {
    source: Arc<dyn BinlogSource>,
    dump: Option<Arc<dyn DumpSource>>,
    events: mpsc::Sender<RowEvent>,
    server_id: u32,
    skip_master_data: bool,
    start: BinlogPosition,
    cancel: CancellationToken,
    cache: SchemaCache,
    position: BinlogPosition,
}

impl ReplicationPump {
    /// `start` is the tracker's coordinate at startup; a zero value
    /// triggers the snapshot phase when a dump source is configured.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<dyn BinlogSource>,
        dump: Option<Arc<dyn DumpSource>>,
        events: mpsc::Sender<RowEvent>,
        server_id: u32,
        skip_master_data: bool,
        start: BinlogPosition,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            dump,
            events,
            server_id,
            skip_master_data,
            position: start.clone(),
            start,
            cancel,
            cache: SchemaCache::new(),
        }
    }

    /// Run the snapshot phase (if due) and then stream until cancelled.
    pub async fn run(mut self) -> Result<()> {
        if self.start.is_zero() {
            if let Some(dump) = self.dump.clone() {
                match self.run_snapshot(dump).await? {
                    Some(handover) => self.position = handover,
                    None => return Ok(()), // cancelled mid-snapshot
                }
            }
        }
        self.stream().await
    }

    /// Tee the external dump into the pipeline as synthetic inserts and
    /// return the streaming handover coordinate. Snapshot events carry
    /// the zero coordinate so the applied tip stays at zero until
    /// streaming starts.
    async fn run_snapshot(
        &mut self,
        dump: Arc<dyn DumpSource>,
    ) -> Result<Option<BinlogPosition>> {
        info!("position is zero, taking initial snapshot");

        let pre_dump_tip = if self.skip_master_data {
            let tip = self.source.current_tip().await?;
            debug!("skip_master_data set, streaming will start at {}", tip);
            Some(tip)
        } else {
            None
        };

        let (tx, mut rx) = mpsc::channel::<DumpRow>(DUMP_CHANNEL_DEPTH);
        let dump_task = tokio::spawn(async move { dump.dump(tx).await });

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    dump_task.abort();
                    info!("snapshot cancelled, tracker stays at zero");
                    return Ok(None);
                }
                row = rx.recv() => match row {
                    Some(row) => {
                        let columns = self.columns_for(&row.schema, &row.table).await?;
                        let event = RowEvent::insert(
                            row.schema,
                            row.table,
                            columns,
                            row.values,
                            BinlogPosition::zero(),
                        );
                        if self.events.send(event).await.is_err() {
                            dump_task.abort();
                            if self.cancel.is_cancelled() {
                                return Ok(None);
                            }
                            return Err(EstuaryError::other("mutation pipeline stopped"));
                        }
                    }
                    None => break,
                },
            }
        }

        let dumped_at = dump_task
            .await
            .map_err(|e| EstuaryError::replication(format!("dump task failed: {}", e)))??;

        // The dump coordinate may be older than events already in the
        // binlog; streaming still begins there, replay overlap is safe.
        let handover = pre_dump_tip.unwrap_or(dumped_at);
        info!("snapshot complete, streaming from {}", handover);
        Ok(Some(handover))
    }

    /// Streaming phase: register, pull events, reconnect on transport
    /// loss from the last-known coordinate.
    async fn stream(&mut self) -> Result<()> {
        let mut backoff = ExponentialBackoff::new(BACKOFF_BASE, BACKOFF_CAP);

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            let mut stream = match self
                .source
                .register(self.server_id, self.position.clone())
                .await
            {
                Ok(stream) => {
                    info!(
                        "registered as replica (server_id={}) from {}",
                        self.server_id, self.position
                    );
                    backoff.reset();
                    stream
                }
                Err(e) if e.is_retriable() => {
                    let delay = backoff.next_backoff();
                    warn!("replica registration failed ({}), retrying in {:?}", e, delay);
                    if self.pause(delay).await {
                        return Ok(());
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };

            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        debug!("pump cancelled at {}", self.position);
                        return Ok(());
                    }
                    event = stream.next_event() => match event {
                        Ok(Some(SourceEvent::Rows(change))) => {
                            if let Err(e) = self.forward(change).await {
                                // During shutdown the pipeline may already
                                // be gone; that is a clean stop, not a fault.
                                if self.cancel.is_cancelled() {
                                    return Ok(());
                                }
                                return Err(e);
                            }
                        }
                        Ok(Some(SourceEvent::Ddl { schema, table })) => {
                            debug!("DDL on {}.{}, invalidating cached columns", schema, table);
                            self.cache.invalidate(&schema, &table);
                        }
                        Ok(None) => {
                            warn!("binlog stream closed, resuming from {}", self.position);
                            break;
                        }
                        Err(e) if e.is_retriable() => {
                            warn!("binlog read failed ({}), resuming from {}", e, self.position);
                            break;
                        }
                        Err(e) => return Err(e),
                    },
                }
            }

            let delay = backoff.next_backoff();
            if self.pause(delay).await {
                return Ok(());
            }
        }
    }

    /// Sleep for `delay` unless cancelled first; true means cancelled.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => true,
            _ = sleep(delay) => false,
        }
    }

    /// Fan a multi-row change out into per-row events with column names.
    async fn forward(&mut self, change: RowsChange) -> Result<()> {
        let mut columns = self.columns_for(&change.schema, &change.table).await?;

        // A stale cache entry shows up as an arity mismatch; re-read once.
        if let Some(arity) = change.rows.arity() {
            if arity != columns.len() {
                self.cache.invalidate(&change.schema, &change.table);
                columns = self.columns_for(&change.schema, &change.table).await?;
                if arity != columns.len() {
                    warn!(
                        "{}.{} rows have {} values but {} columns, skipping event",
                        change.schema,
                        change.table,
                        arity,
                        columns.len()
                    );
                    return Ok(());
                }
            }
        }

        let position = change.position.clone();
        match change.rows {
            ChangeRows::Insert(rows) => {
                for row in rows {
                    self.emit(RowEvent::insert(
                        change.schema.clone(),
                        change.table.clone(),
                        columns.clone(),
                        row,
                        position.clone(),
                    ))
                    .await?;
                }
            }
            ChangeRows::Update(pairs) => {
                for (before, after) in pairs {
                    self.emit(RowEvent::update(
                        change.schema.clone(),
                        change.table.clone(),
                        columns.clone(),
                        before,
                        after,
                        position.clone(),
                    ))
                    .await?;
                }
            }
            ChangeRows::Delete(rows) => {
                for row in rows {
                    self.emit(RowEvent::delete(
                        change.schema.clone(),
                        change.table.clone(),
                        columns.clone(),
                        row,
                        position.clone(),
                    ))
                    .await?;
                }
            }
        }

        self.position = position;
        Ok(())
    }

    async fn emit(&self, event: RowEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| EstuaryError::other("mutation pipeline stopped"))
    }

    async fn columns_for(&mut self, schema: &str, table: &str) -> Result<Arc<Vec<String>>> {
        if let Some(columns) = self.cache.get(schema, table) {
            return Ok(columns);
        }
        let columns = Arc::new(self.source.table_columns(schema, table).await?);
        self.cache.insert(schema, table, columns.clone());
        Ok(columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedBinlogSource, ScriptedDump};
    use serde_json::json;

    fn change(pos: u32, rows: ChangeRows) -> SourceEvent {
        SourceEvent::Rows(RowsChange {
            schema: "shop".to_string(),
            table: "users".to_string(),
            rows,
            position: BinlogPosition::new("binlog.000001", pos),
        })
    }

    fn pump_over(
        source: Arc<ScriptedBinlogSource>,
        dump: Option<Arc<dyn DumpSource>>,
        skip_master_data: bool,
        start: BinlogPosition,
    ) -> (
        mpsc::Receiver<RowEvent>,
        CancellationToken,
        tokio::task::JoinHandle<Result<()>>,
    ) {
        let (events_tx, events_rx) = mpsc::channel(1024);
        let cancel = CancellationToken::new();
        let pump = ReplicationPump::new(
            source,
            dump,
            events_tx,
            1001,
            skip_master_data,
            start,
            cancel.clone(),
        );
        let task = tokio::spawn(pump.run());
        (events_rx, cancel, task)
    }

    #[tokio::test(start_paused = true)]
    async fn test_streaming_fans_out_rows_with_column_names() {
        let source = Arc::new(ScriptedBinlogSource::new());
        source.set_columns("shop", "users", &["id", "name"]);
        let stream = source.push_stream();

        let (mut events, cancel, task) =
            pump_over(source.clone(), None, false, BinlogPosition::new("binlog.000001", 4));

        stream
            .send(Ok(change(
                100,
                ChangeRows::Insert(vec![
                    vec![json!(1), json!("a")],
                    vec![json!(2), json!("b")],
                ]),
            )))
            .await
            .unwrap();

        let first = events.recv().await.unwrap();
        assert_eq!(first.columns.as_slice(), ["id", "name"]);
        let second = events.recv().await.unwrap();
        assert_eq!(second.position, BinlogPosition::new("binlog.000001", 100));

        cancel.cancel();
        task.await.unwrap().unwrap();

        // Registration used the tracker's coordinate.
        assert_eq!(
            source.registrations(),
            vec![(1001, BinlogPosition::new("binlog.000001", 4))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_then_stream_handover() {
        let source = Arc::new(ScriptedBinlogSource::new());
        source.set_columns("shop", "users", &["id", "name"]);
        let _stream = source.push_stream();

        let dump = Arc::new(ScriptedDump::new(
            vec![DumpRow {
                schema: "shop".to_string(),
                table: "users".to_string(),
                values: vec![json!(1), json!("a")],
            }],
            BinlogPosition::new("binlog.000001", 800),
        ));

        let (mut events, cancel, task) =
            pump_over(source.clone(), Some(dump), false, BinlogPosition::zero());

        // Snapshot rows arrive as inserts at the zero coordinate.
        let event = events.recv().await.unwrap();
        assert!(matches!(event.op, crate::event::RowOp::Insert { .. }));
        assert!(event.position.is_zero());

        // Streaming registered from the dump's completion coordinate.
        while source.registrations().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            source.registrations(),
            vec![(1001, BinlogPosition::new("binlog.000001", 800))]
        );

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_master_data_uses_pre_dump_tip() {
        let source = Arc::new(ScriptedBinlogSource::new());
        source.set_columns("shop", "users", &["id", "name"]);
        source.set_tip(BinlogPosition::new("binlog.000002", 40));
        let _stream = source.push_stream();

        let dump = Arc::new(ScriptedDump::new(
            vec![],
            BinlogPosition::new("binlog.000001", 800),
        ));

        let (_events, cancel, task) =
            pump_over(source.clone(), Some(dump), true, BinlogPosition::zero());

        while source.registrations().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            source.registrations(),
            vec![(1001, BinlogPosition::new("binlog.000002", 40))]
        );

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_loss_reconnects_from_last_position() {
        let source = Arc::new(ScriptedBinlogSource::new());
        source.set_columns("shop", "users", &["id", "name"]);

        let first = source.push_stream();
        let second = source.push_stream();

        let (mut events, cancel, task) =
            pump_over(source.clone(), None, false, BinlogPosition::new("binlog.000001", 4));

        first
            .send(Ok(change(
                120,
                ChangeRows::Insert(vec![vec![json!(1), json!("a")]]),
            )))
            .await
            .unwrap();
        first
            .send(Err(EstuaryError::transport("connection reset")))
            .await
            .unwrap();

        let _ = events.recv().await.unwrap();

        // After the backoff the pump re-registers from the last position.
        second
            .send(Ok(change(
                200,
                ChangeRows::Insert(vec![vec![json!(2), json!("b")]]),
            )))
            .await
            .unwrap();
        let resumed = events.recv().await.unwrap();
        assert_eq!(resumed.position, BinlogPosition::new("binlog.000001", 200));

        let registrations = source.registrations();
        assert_eq!(registrations.len(), 2);
        assert_eq!(
            registrations[1],
            (1001, BinlogPosition::new("binlog.000001", 120))
        );

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ddl_invalidates_cached_columns() {
        let source = Arc::new(ScriptedBinlogSource::new());
        source.set_columns("shop", "users", &["id", "name"]);
        let stream = source.push_stream();

        let (mut events, cancel, task) =
            pump_over(source.clone(), None, false, BinlogPosition::new("binlog.000001", 4));

        stream
            .send(Ok(change(
                100,
                ChangeRows::Insert(vec![vec![json!(1), json!("a")]]),
            )))
            .await
            .unwrap();
        assert_eq!(events.recv().await.unwrap().columns.len(), 2);

        // Table gains a column; DDL invalidates, next lookup re-reads.
        source.set_columns("shop", "users", &["id", "name", "email"]);
        stream
            .send(Ok(SourceEvent::Ddl {
                schema: "shop".to_string(),
                table: "users".to_string(),
            }))
            .await
            .unwrap();
        stream
            .send(Ok(change(
                200,
                ChangeRows::Insert(vec![vec![json!(1), json!("a"), json!("a@x")]]),
            )))
            .await
            .unwrap();

        assert_eq!(events.recv().await.unwrap().columns.len(), 3);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_replication_error_propagates() {
        let source = Arc::new(ScriptedBinlogSource::new());
        let stream = source.push_stream();

        let (_events, _cancel, task) =
            pump_over(source.clone(), None, false, BinlogPosition::new("binlog.000001", 4));

        stream
            .send(Err(EstuaryError::replication("could not find first log file")))
            .await
            .unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, EstuaryError::Replication(_)));
    }
}
