//! Root orchestration: wiring, startup, ordered shutdown.
//!
//! The replicator owns the four long-lived tasks (pump, pipeline,
//! dispatcher, supervisor) and the channels between them: row events on a
//! bounded queue, batches on a queue of capacity one so a single batch is
//! in flight. The first task failure, or an external shutdown request,
//! cancels the root token; the chain then drains front to back so every
//! already-read event reaches the sink before the tracker is closed.

use crate::config::{Config, DataStorage};
use crate::dispatcher::BulkDispatcher;
use crate::error::{EstuaryError, Result};
use crate::latency::{LatencyRing, StatsSnapshot};
use crate::pipeline::MutationPipeline;
use crate::pump::ReplicationPump;
use crate::rule::RuleSet;
use crate::supervisor::{DriftSupervisor, SupervisorConfig};
use crate::tracker::{FilePositionStore, KeyedPositionStore, PositionTracker};
use crate::traits::{
    Alerter, BinlogSource, BulkSink, Clock, DumpSource, DurableCounter, HashStore, HostExit,
    LogAlerter, PositionStore, ProcessControl, SystemClock,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const EVENT_QUEUE_DEPTH: usize = 1024;

/// Builder collecting the capability implementations a [`Replicator`]
/// plugs into.
pub struct ReplicatorBuilder {
    config: Config,
    source: Option<Arc<dyn BinlogSource>>,
    dump: Option<Arc<dyn DumpSource>>,
    sink: Option<Arc<dyn BulkSink>>,
    hash_store: Option<Arc<dyn HashStore>>,
    counters: Option<Arc<dyn DurableCounter>>,
    alerter: Arc<dyn Alerter>,
    process: Arc<dyn ProcessControl>,
    clock: Arc<dyn Clock>,
}

impl ReplicatorBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            source: None,
            dump: None,
            sink: None,
            hash_store: None,
            counters: None,
            alerter: Arc::new(LogAlerter),
            process: Arc::new(HostExit),
            clock: Arc::new(SystemClock),
        }
    }

    /// Upstream database capability. Required.
    pub fn binlog_source(mut self, source: Arc<dyn BinlogSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// External dump tool adapter for the initial snapshot.
    pub fn dump_source(mut self, dump: Arc<dyn DumpSource>) -> Self {
        self.dump = Some(dump);
        self
    }

    /// Bulk endpoint capability. Required.
    pub fn bulk_sink(mut self, sink: Arc<dyn BulkSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Hash store backing the keyed position tracker. Required when
    /// `data_storage = "keyed"`.
    pub fn hash_store(mut self, store: Arc<dyn HashStore>) -> Self {
        self.hash_store = Some(store);
        self
    }

    /// Durable counter store for the drift supervisor. Required.
    pub fn durable_counter(mut self, counters: Arc<dyn DurableCounter>) -> Self {
        self.counters = Some(counters);
        self
    }

    /// Alert channel; defaults to the log.
    pub fn alerter(mut self, alerter: Arc<dyn Alerter>) -> Self {
        self.alerter = alerter;
        self
    }

    /// Process control; defaults to exiting the host process.
    pub fn process_control(mut self, process: Arc<dyn ProcessControl>) -> Self {
        self.process = process;
        self
    }

    /// Clock; defaults to the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validate the configuration and open the position tracker.
    pub async fn build(self) -> Result<Replicator> {
        self.config.validate()?;

        let source = self
            .source
            .ok_or_else(|| EstuaryError::config("a binlog source is required"))?;
        let sink = self
            .sink
            .ok_or_else(|| EstuaryError::config("a bulk sink is required"))?;
        let counters = self
            .counters
            .ok_or_else(|| EstuaryError::config("a durable counter store is required"))?;

        let rules = Arc::new(RuleSet::new(self.config.rules.clone())?);

        let store: Box<dyn PositionStore> = match self.config.data_storage {
            DataStorage::File => {
                Box::new(FilePositionStore::new(&self.config.data_dir).await?)
            }
            DataStorage::Keyed => {
                let hash_store = self.hash_store.ok_or_else(|| {
                    EstuaryError::config("data_storage = \"keyed\" requires a hash store")
                })?;
                Box::new(KeyedPositionStore::new(hash_store, &self.config.key_suffix).await?)
            }
        };
        let tracker = Arc::new(PositionTracker::new(store, self.clock.clone()).await?);
        let latency = Arc::new(LatencyRing::new(self.config.bulks_to_track));

        Ok(Replicator {
            config: self.config,
            rules,
            source,
            dump: self.dump,
            sink,
            counters,
            alerter: self.alerter,
            process: self.process,
            clock: self.clock,
            tracker,
            latency,
            cancel: CancellationToken::new(),
        })
    }
}

/// The assembled pipeline, ready to run.
pub struct Replicator {
    config: Config,
    rules: Arc<RuleSet>,
    source: Arc<dyn BinlogSource>,
    dump: Option<Arc<dyn DumpSource>>,
    sink: Arc<dyn BulkSink>,
    counters: Arc<dyn DurableCounter>,
    alerter: Arc<dyn Alerter>,
    process: Arc<dyn ProcessControl>,
    clock: Arc<dyn Clock>,
    tracker: Arc<PositionTracker>,
    latency: Arc<LatencyRing>,
    cancel: CancellationToken,
}

impl Replicator {
    /// Start building a replicator around a configuration.
    pub fn builder(config: Config) -> ReplicatorBuilder {
        ReplicatorBuilder::new(config)
    }

    /// The shared applied-position tracker.
    pub fn tracker(&self) -> Arc<PositionTracker> {
        self.tracker.clone()
    }

    /// Latency statistics for the external stats endpoint.
    pub fn stats(&self) -> StatsSnapshot {
        self.latency.snapshot()
    }

    /// Token that triggers ordered shutdown when cancelled.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the pipeline until a task fails or shutdown is requested,
    /// then drain the chain and close the tracker.
    pub async fn run(self) -> Result<()> {
        info!(
            "starting replication (server_id={}, bulk_size={}, {} rules)",
            self.config.server_id,
            self.config.bulk_size,
            self.rules.len()
        );

        let start = self.tracker.position().await;
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (batches_tx, batches_rx) = mpsc::channel(1);

        let pump = ReplicationPump::new(
            self.source.clone(),
            self.dump.clone(),
            events_tx,
            self.config.server_id,
            self.config.skip_master_data,
            start,
            self.cancel.clone(),
        );
        let pipeline = MutationPipeline::new(
            self.rules.clone(),
            self.config.bulk_size,
            self.config.flush_bulk_time(),
            events_rx,
            batches_tx,
            self.cancel.clone(),
        );
        let dispatcher = BulkDispatcher::new(
            self.sink.clone(),
            self.tracker.clone(),
            self.latency.clone(),
            batches_rx,
        );
        let supervisor = DriftSupervisor::new(
            self.source.clone(),
            self.tracker.clone(),
            self.counters.clone(),
            self.alerter.clone(),
            self.process.clone(),
            self.clock.clone(),
            SupervisorConfig {
                byte_threshold: self.config.unsynced_threshold,
                seconds_threshold: self.config.seconds_threshold,
                tick_interval: self.config.verificator_interval(),
                key_suffix: self.config.key_suffix.clone(),
            },
            self.cancel.clone(),
        );

        let mut pump_task = tokio::spawn(pump.run());
        let mut pipeline_task = tokio::spawn(pipeline.run());
        let mut dispatcher_task = tokio::spawn(dispatcher.run());
        let mut supervisor_task = tokio::spawn(supervisor.run());

        // The first task to return decides the outcome; everything else
        // is drained in chain order afterwards.
        let (finished, first) = tokio::select! {
            r = &mut pump_task => (0, flatten("replication pump", r)),
            r = &mut pipeline_task => (1, flatten("mutation pipeline", r)),
            r = &mut dispatcher_task => (2, flatten("bulk dispatcher", r)),
            r = &mut supervisor_task => (3, flatten("drift supervisor", r)),
        };
        if let Err(e) = &first {
            error!("{}, shutting down", e);
        }
        self.cancel.cancel();

        let mut outcome = first;
        let remaining = [
            (0, "replication pump", pump_task),
            (1, "mutation pipeline", pipeline_task),
            (2, "bulk dispatcher", dispatcher_task),
            (3, "drift supervisor", supervisor_task),
        ];
        for (index, name, task) in remaining {
            if index == finished {
                continue;
            }
            let result = flatten(name, task.await);
            if outcome.is_ok() {
                outcome = result;
            }
        }

        let closed = self.tracker.close().await;
        if outcome.is_ok() {
            outcome = closed;
        }

        match &outcome {
            Ok(()) => info!("replication stopped cleanly"),
            Err(e) => error!("replication stopped: {}", e),
        }
        outcome
    }

    /// Run and additionally treat ctrl-c / SIGTERM as a shutdown request.
    pub async fn run_until_shutdown(self) -> Result<()> {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            info!("received shutdown signal, draining");
            cancel.cancel();
        });
        self.run().await
    }
}

fn flatten(name: &str, joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(EstuaryError::other(format!("{} task failed: {}", name, e))),
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(term) => term,
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
