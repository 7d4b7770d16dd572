//! Full-chain tests: scripted binlog source through pump, pipeline and
//! dispatcher into a recording sink, with the keyed position tracker and
//! the drift supervisor wired in.

use estuary::testing::{
    CollectingAlerter, ManualClock, MemoryCounter, MemoryHashStore, RecordingProcess,
    RecordingSink, ScriptedBinlogSource, ScriptedDump,
};
use estuary::{
    ActionKind, BinlogPosition, ChangeRows, Config, DumpRow, DurableCounter, Replicator, Rule,
    RowsChange, SourceEvent,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn users_rule() -> Rule {
    Rule {
        schema: "shop".to_string(),
        table: "users".to_string(),
        index: "users".to_string(),
        field_map: HashMap::from([("name".to_string(), "full_name".to_string())]),
        id_column: Some("id".to_string()),
        id_columns: vec![],
        id_separator: ":".to_string(),
        pipeline: None,
        full_replace: false,
    }
}

fn config() -> Config {
    Config {
        bulk_size: 256,
        flush_bulk_time_ms: 200,
        // Keep the supervisor quiet unless a test wants it.
        unsynced_threshold: u32::MAX,
        rules: vec![users_rule()],
        ..Config::default()
    }
}

struct Harness {
    source: Arc<ScriptedBinlogSource>,
    sink: Arc<RecordingSink>,
    counters: Arc<MemoryCounter>,
    alerter: Arc<CollectingAlerter>,
    process: Arc<RecordingProcess>,
    hash_store: Arc<MemoryHashStore>,
    clock: Arc<ManualClock>,
}

impl Harness {
    fn new() -> Self {
        let source = Arc::new(ScriptedBinlogSource::new());
        source.set_columns("shop", "users", &["id", "name"]);
        source.set_tip(BinlogPosition::new("binlog.000001", 4));
        Self {
            source,
            sink: Arc::new(RecordingSink::new()),
            counters: Arc::new(MemoryCounter::new()),
            alerter: Arc::new(CollectingAlerter::new()),
            process: Arc::new(RecordingProcess::new()),
            hash_store: Arc::new(MemoryHashStore::new()),
            clock: Arc::new(ManualClock::new()),
        }
    }

    async fn replicator(&self, config: Config, dump: Option<Arc<ScriptedDump>>) -> Replicator {
        let mut builder = Replicator::builder(config)
            .binlog_source(self.source.clone())
            .bulk_sink(self.sink.clone())
            .hash_store(self.hash_store.clone())
            .durable_counter(self.counters.clone())
            .alerter(self.alerter.clone())
            .process_control(self.process.clone())
            .clock(self.clock.clone());
        if let Some(dump) = dump {
            builder = builder.dump_source(dump);
        }
        builder.build().await.unwrap()
    }
}

fn insert_change(pos: u32, ids: std::ops::Range<u64>) -> SourceEvent {
    SourceEvent::Rows(RowsChange {
        schema: "shop".to_string(),
        table: "users".to_string(),
        rows: ChangeRows::Insert(
            ids.map(|i| vec![json!(i), json!(format!("user-{}", i))])
                .collect(),
        ),
        position: BinlogPosition::new("binlog.000001", pos),
    })
}

async fn settle() {
    // Paused-clock runs auto-advance, so this returns as soon as every
    // task is idle.
    tokio::time::sleep(Duration::from_secs(2)).await;
}

#[tokio::test(start_paused = true)]
async fn size_then_time_trigger_split() {
    let harness = Harness::new();
    // The keyed store already holds a coordinate: no snapshot phase.
    let stream = harness.source.push_stream();
    let replicator = harness.replicator(config(), None).await;
    let tracker = replicator.tracker();
    tracker.save(BinlogPosition::new("binlog.000001", 4)).await;

    let shutdown = replicator.shutdown_handle();
    let run = tokio::spawn(replicator.run());

    // 257 inserts inside one event burst: 256 leave on the size trigger,
    // the last one on the time trigger.
    stream.send(Ok(insert_change(100, 0..257))).await.unwrap();
    settle().await;

    let batches = harness.sink.batches().await;
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].len(), 256);
    assert_eq!(batches[1].len(), 1);

    // Both batches acknowledged: the applied coordinate advanced.
    assert_eq!(
        tracker.position().await,
        BinlogPosition::new("binlog.000001", 100)
    );

    shutdown.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn update_patch_and_identity_change() {
    let harness = Harness::new();
    let stream = harness.source.push_stream();
    let replicator = harness.replicator(config(), None).await;
    let tracker = replicator.tracker();
    tracker.save(BinlogPosition::new("binlog.000001", 4)).await;

    let shutdown = replicator.shutdown_handle();
    let run = tokio::spawn(replicator.run());

    // Update touching only `name`: one patch action.
    stream
        .send(Ok(SourceEvent::Rows(RowsChange {
            schema: "shop".to_string(),
            table: "users".to_string(),
            rows: ChangeRows::Update(vec![(
                vec![json!(7), json!("Bob")],
                vec![json!(7), json!("Alice")],
            )]),
            position: BinlogPosition::new("binlog.000001", 120),
        })))
        .await
        .unwrap();
    settle().await;

    // Update moving the id from 7 to 8: delete + index in one batch.
    stream
        .send(Ok(SourceEvent::Rows(RowsChange {
            schema: "shop".to_string(),
            table: "users".to_string(),
            rows: ChangeRows::Update(vec![(
                vec![json!(7), json!("Alice")],
                vec![json!(8), json!("Alice")],
            )]),
            position: BinlogPosition::new("binlog.000001", 160),
        })))
        .await
        .unwrap();
    settle().await;

    let batches = harness.sink.batches().await;
    assert_eq!(batches.len(), 2);

    let patch = &batches[0].actions[0];
    assert_eq!(patch.kind, ActionKind::Update);
    assert_eq!(patch.id, "7");
    assert_eq!(
        patch.body_line(),
        Some(json!({"doc": {"full_name": "Alice"}}))
    );

    let moved = &batches[1].actions;
    assert_eq!(moved.len(), 2);
    assert_eq!(moved[0].kind, ActionKind::Delete);
    assert_eq!(moved[0].id, "7");
    assert_eq!(moved[1].kind, ActionKind::Index);
    assert_eq!(moved[1].id, "8");
    assert_eq!(
        moved[1].body_line(),
        Some(json!({"id": 8, "full_name": "Alice"}))
    );
    assert_eq!(batches[1].position, BinlogPosition::new("binlog.000001", 160));

    shutdown.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn coordinate_advances_only_after_acknowledgement() {
    let harness = Harness::new();
    // First write fails twice with a 503 before succeeding.
    harness
        .sink
        .push_reply(estuary::BulkReply {
            took_ms: 1,
            errors: true,
            items: vec![estuary::BulkItemReply {
                status: 503,
                id: "0".to_string(),
                error: Some("unavailable".to_string()),
            }],
        })
        .await;
    harness
        .sink
        .push_error(estuary::EstuaryError::transport("connection reset"))
        .await;

    let stream = harness.source.push_stream();
    let replicator = harness.replicator(config(), None).await;
    let tracker = replicator.tracker();
    tracker.save(BinlogPosition::new("binlog.000001", 4)).await;

    let shutdown = replicator.shutdown_handle();
    let run = tokio::spawn(replicator.run());

    stream.send(Ok(insert_change(300, 0..1))).await.unwrap();
    settle().await;

    // Three attempts hit the sink; the coordinate advanced exactly once,
    // after the final successful attempt.
    assert_eq!(harness.sink.batches().await.len(), 3);
    assert_eq!(
        tracker.position().await,
        BinlogPosition::new("binlog.000001", 300)
    );

    shutdown.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn snapshot_rows_reach_sink_before_streaming() {
    let harness = Harness::new();
    let stream = harness.source.push_stream();

    let dump = Arc::new(ScriptedDump::new(
        vec![
            DumpRow {
                schema: "shop".to_string(),
                table: "users".to_string(),
                values: vec![json!(1), json!("snap-1")],
            },
            DumpRow {
                schema: "shop".to_string(),
                table: "users".to_string(),
                values: vec![json!(2), json!("snap-2")],
            },
        ],
        BinlogPosition::new("binlog.000001", 900),
    ));

    let replicator = harness.replicator(config(), Some(dump)).await;
    let tracker = replicator.tracker();

    let shutdown = replicator.shutdown_handle();
    let run = tokio::spawn(replicator.run());
    settle().await;

    // Snapshot inserts were applied; their batch carries the zero
    // coordinate, so the tracker has not advanced yet.
    let batches = harness.sink.batches().await;
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 2);
    assert_eq!(batches[0].actions[0].kind, ActionKind::Index);
    assert!(batches[0].position.is_zero());
    assert!(tracker.position().await.is_zero());

    // Streaming resumed from the dump coordinate.
    assert_eq!(
        harness.source.registrations(),
        vec![(1001, BinlogPosition::new("binlog.000001", 900))]
    );

    // A streamed event now advances the coordinate.
    stream.send(Ok(insert_change(950, 10..11))).await.unwrap();
    settle().await;
    assert_eq!(
        tracker.position().await,
        BinlogPosition::new("binlog.000001", 950)
    );

    shutdown.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn tracker_is_monotonic_across_batches() {
    let harness = Harness::new();
    let stream = harness.source.push_stream();
    let replicator = harness.replicator(config(), None).await;
    let tracker = replicator.tracker();
    tracker.save(BinlogPosition::new("binlog.000001", 4)).await;

    let shutdown = replicator.shutdown_handle();
    let run = tokio::spawn(replicator.run());

    let mut observed = Vec::new();
    for pos in [100u32, 200, 300] {
        stream.send(Ok(insert_change(pos, 0..1))).await.unwrap();
        settle().await;
        observed.push(tracker.position().await);
    }

    assert!(observed.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(
        observed.last().unwrap(),
        &BinlogPosition::new("binlog.000001", 300)
    );

    shutdown.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn supervisor_escalates_to_fuse_through_the_replicator() {
    let harness = Harness::new();
    let _stream = harness.source.push_stream();
    harness
        .source
        .set_tip(BinlogPosition::new("binlog.000001", 1_000_000));
    harness
        .counters
        .set("estuary-suicide-count", 2)
        .await
        .unwrap();

    let mut config = config();
    config.unsynced_threshold = 1000;
    config.seconds_threshold = 5;
    config.verificator_interval_secs = 1;

    let replicator = harness.replicator(config, None).await;
    let tracker = replicator.tracker();
    tracker.save(BinlogPosition::new("binlog.000001", 100)).await;

    let shutdown = replicator.shutdown_handle();
    let run = tokio::spawn(replicator.run());

    // A first tick observes the drift and starts the unsynced window.
    settle().await;
    // The window outgrows seconds_threshold; the next tick escalates, and
    // with a durable suicide count of 2 the ladder's final rung fires.
    harness.clock.advance(Duration::from_secs(6));
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(harness.process.exit_code(), Some(1));
    assert_eq!(
        harness
            .counters
            .get("estuary-allowed-to-run")
            .await
            .unwrap(),
        Some(0)
    );
    assert_eq!(
        harness.counters.get("estuary-suicide-count").await.unwrap(),
        Some(3)
    );
    let messages = harness.alerter.messages();
    assert!(!messages.is_empty());
    assert!(messages[0].0.starts_with("Shutting down"));

    shutdown.cancel();
    run.await.unwrap().unwrap();
}
