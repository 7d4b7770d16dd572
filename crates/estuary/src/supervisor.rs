//! The drift supervisor.
//!
//! A periodic check comparing the upstream's binlog tip against the
//! tracker's applied coordinate. Persistent divergence escalates through
//! restart and, past two restarts inside one drift episode, permanent
//! disablement via a durable allowed-to-run fuse. A sustained period back
//! in sync rehabilitates the installation by resetting the durable
//! restart counter.
//!
//! The supervisor only reads pipeline state; the durable counter store is
//! the one place its escalation writes to. Process termination is
//! delegated to the host through [`ProcessControl`].

use crate::error::Result;
use crate::tracker::PositionTracker;
use crate::traits::{Alerter, BinlogSource, Clock, DurableCounter, ProcessControl};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const SUICIDE_COUNT_KEY: &str = "estuary-suicide-count";
const ALLOWED_TO_RUN_KEY: &str = "estuary-allowed-to-run";

/// Supervisor tuning, straight from the configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Byte drift above which a tick counts as out of sync
    pub byte_threshold: u32,
    /// Seconds of continuous drift before the ladder engages
    pub seconds_threshold: u64,
    /// Tick cadence
    pub tick_interval: Duration,
    /// Installation namespace appended to durable keys
    pub key_suffix: String,
}

/// Periodic divergence detector with a persistent escalation ladder.
pub struct DriftSupervisor {
    source: Arc<dyn BinlogSource>,
    tracker: Arc<PositionTracker>,
    counters: Arc<dyn DurableCounter>,
    alerter: Arc<dyn Alerter>,
    process: Arc<dyn ProcessControl>,
    clock: Arc<dyn Clock>,
    config: SupervisorConfig,
    cancel: CancellationToken,
    suicide_key: String,
    allowed_key: String,
    over_threshold_ticks: u32,
    last_in_sync_at: Instant,
    last_drift: u32,
}

impl DriftSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<dyn BinlogSource>,
        tracker: Arc<PositionTracker>,
        counters: Arc<dyn DurableCounter>,
        alerter: Arc<dyn Alerter>,
        process: Arc<dyn ProcessControl>,
        clock: Arc<dyn Clock>,
        config: SupervisorConfig,
        cancel: CancellationToken,
    ) -> Self {
        let suicide_key = format!("{}{}", SUICIDE_COUNT_KEY, config.key_suffix);
        let allowed_key = format!("{}{}", ALLOWED_TO_RUN_KEY, config.key_suffix);
        let last_in_sync_at = clock.now();
        Self {
            source,
            tracker,
            counters,
            alerter,
            process,
            clock,
            config,
            cancel,
            suicide_key,
            allowed_key,
            over_threshold_ticks: 0,
            last_in_sync_at,
            last_drift: 0,
        }
    }

    /// Tick on the configured cadence until cancelled. The first check
    /// runs immediately. A failed check (store or upstream hiccup) is
    /// logged and retried on the next tick, never escalated.
    pub async fn run(mut self) -> Result<()> {
        let mut ticks = interval(self.config.tick_interval);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("drift supervisor stopped");
                    return Ok(());
                }
                _ = ticks.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!("drift check failed: {}", e);
                    }
                }
            }
        }
    }

    /// One pass of the drift state machine.
    pub async fn tick(&mut self) -> Result<()> {
        if !self.allowed_to_run().await? {
            warn!("allowed-to-run fuse is blown, skipping drift check");
            return Ok(());
        }

        let upstream = self.source.current_tip().await?;
        let applied = self.tracker.position().await;
        let now = self.clock.now();

        // Across a log roll the offset difference is meaningless; treat
        // drift as unknown and restart the out-of-sync timer.
        let drift = if upstream.name == applied.name {
            Some(upstream.pos.saturating_sub(applied.pos))
        } else {
            None
        };

        match drift {
            None => {
                debug!(
                    "log name mismatch (upstream {}, applied {}), drift unknown",
                    upstream, applied
                );
                self.last_in_sync_at = now;
            }
            Some(0) => {
                self.over_threshold_ticks = 0;
                self.last_in_sync_at = now;
            }
            Some(d) if d > self.config.byte_threshold => {
                self.over_threshold_ticks += 1;
                self.last_drift = d;
                debug!(
                    "drift {} bytes over threshold, {} consecutive ticks",
                    d, self.over_threshold_ticks
                );
            }
            Some(_) => {}
        }

        // Time spent in sync rehabilitates the installation.
        if self.over_threshold_ticks == 0 {
            self.counters.set(&self.suicide_key, 0).await?;
        }

        if applied.pos == 0 {
            info!("applied position is zero, snapshot still running");
            return Ok(());
        }

        if self.over_threshold_ticks == 0 {
            return Ok(());
        }
        let unsynced_secs = now.duration_since(self.last_in_sync_at).as_secs_f64();
        if unsynced_secs <= self.config.seconds_threshold as f64 {
            return Ok(());
        }

        self.escalate(unsynced_secs).await
    }

    async fn escalate(&mut self, unsynced_secs: f64) -> Result<()> {
        let suicide_count = match self.counters.get(&self.suicide_key).await? {
            Some(count) => count,
            None => {
                self.counters.set(&self.suicide_key, 0).await?;
                0
            }
        };

        let fields = self.alert_fields(unsynced_secs);
        let message = if suicide_count >= 2 {
            "Shutting down replication, setting allowed-to-run to false"
        } else if suicide_count == 1 {
            "Restarting replication, repeated drift episode"
        } else {
            "Restarting replication"
        };

        // The alert is best effort; termination happens regardless.
        if let Err(e) = self.alerter.notify(message, &fields).await {
            warn!("alert delivery failed: {}", e);
        }

        if suicide_count >= 2 {
            self.counters.set(&self.allowed_key, 0).await?;
        }
        self.counters.incr(&self.suicide_key).await?;

        error!(
            "drift supervisor terminating process (suicide count {}, {:.0}s unsynced)",
            suicide_count, unsynced_secs
        );
        self.process.terminate(1);
        Ok(())
    }

    fn alert_fields(&self, unsynced_secs: f64) -> Vec<(String, String)> {
        vec![
            (
                "drift threshold".to_string(),
                format!("{} bytes", self.config.byte_threshold),
            ),
            (
                "current drift".to_string(),
                format!("{} bytes", self.last_drift),
            ),
            (
                "seconds unsynced".to_string(),
                format!("{:.0}", unsynced_secs),
            ),
        ]
    }

    async fn allowed_to_run(&self) -> Result<bool> {
        match self.counters.get(&self.allowed_key).await? {
            Some(value) => Ok(value != 0),
            None => {
                self.counters.set(&self.allowed_key, 1).await?;
                Ok(true)
            }
        }
    }
}
