//! # estuary - MySQL to Elasticsearch replication
//!
//! A one-way change-data-capture pipeline. estuary presents itself to a
//! MySQL primary as a replica: it takes an initial consistent snapshot
//! through an external dump tool, then consumes the binlog event stream,
//! turns row changes into document mutations through declarative
//! per-table rules, and applies them to the search engine in batched
//! bulk requests. Delivery is at-least-once with idempotent writes.
//!
//! ## Architecture
//!
//! ```text
//! BinlogSource --> [Replication Pump] --> events --> [Mutation Pipeline]
//!                        |                                   |
//!                        |                              batches (cap 1)
//!                        |                                   v
//!                        +------ Position Tracker <-- [Bulk Dispatcher] --> BulkSink
//!                                      ^
//!                                      | read-only
//!                               [Drift Supervisor] -- DurableCounter, Alerter
//! ```
//!
//! Acknowledgements flow right to left: a batch's coordinate only becomes
//! durable once the sink has confirmed the batch. The drift supervisor
//! periodically compares the upstream tip against the applied coordinate
//! and escalates through restart and permanent disablement when the
//! pipeline cannot keep up.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use estuary::{Config, Replicator};
//!
//! let config = Config::from_toml_str(&std::fs::read_to_string("river.toml")?)?;
//!
//! let replicator = Replicator::builder(config)
//!     .binlog_source(source)       // replication protocol adapter
//!     .dump_source(dump)           // mysqldump adapter
//!     .bulk_sink(sink)             // Elasticsearch bulk adapter
//!     .hash_store(redis)           // keyed position storage
//!     .durable_counter(counters)   // supervisor state
//!     .build()
//!     .await?;
//!
//! replicator.run_until_shutdown().await?;
//! ```

mod action;
mod config;
mod dispatcher;
mod error;
mod event;
mod latency;
mod pipeline;
mod position;
mod pump;
mod replicator;
mod rule;
mod supervisor;
mod tracker;
mod traits;

pub mod testing;

pub use action::{ActionKind, Batch, BulkAction};
pub use config::{Config, DataStorage};
pub use dispatcher::BulkDispatcher;
pub use error::{EstuaryError, Result};
pub use event::{ChangeRows, DumpRow, RowEvent, RowOp, RowsChange, SourceEvent};
pub use latency::{LatencyRing, StatsSnapshot};
pub use pipeline::MutationPipeline;
pub use position::BinlogPosition;
pub use pump::ReplicationPump;
pub use replicator::{Replicator, ReplicatorBuilder};
pub use rule::{Rule, RuleSet, WILDCARD};
pub use supervisor::{DriftSupervisor, SupervisorConfig};
pub use tracker::{FilePositionStore, KeyedPositionStore, PositionTracker};
pub use traits::{
    Alerter, BinlogSource, BulkItemReply, BulkReply, BulkSink, Clock, DumpSource, DurableCounter,
    EventStream, HashStore, HostExit, LogAlerter, PositionStore, ProcessControl, SystemClock,
};
