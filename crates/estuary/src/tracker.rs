//! Durable applied-position tracking.
//!
//! The tracker holds the most recent coordinate acknowledged by the bulk
//! dispatcher and persists it through a [`PositionStore`]. Persistence is
//! throttled to at most one store write per wall-clock second; the most
//! recent in-memory value wins and a final unconditional flush happens on
//! close. A single missed write is never fatal: replay from the last
//! durable coordinate is safe because document writes are idempotent on
//! id.

use crate::error::{EstuaryError, Result};
use crate::position::BinlogPosition;
use crate::traits::{Clock, HashStore, PositionStore};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

const PERSIST_INTERVAL: Duration = Duration::from_secs(1);

/// Shared record of the last coordinate applied downstream.
///
/// The dispatcher writes, the drift supervisor reads; access follows a
/// readers-writer discipline.
pub struct PositionTracker {
    store: Box<dyn PositionStore>,
    clock: Arc<dyn Clock>,
    state: RwLock<TrackerState>,
}

struct TrackerState {
    position: BinlogPosition,
    last_persisted_at: Instant,
    deferred_error: Option<EstuaryError>,
}

impl PositionTracker {
    /// Open the tracker, loading the persisted coordinate.
    pub async fn new(store: Box<dyn PositionStore>, clock: Arc<dyn Clock>) -> Result<Self> {
        let position = store.load().await?;
        info!("position tracker starting at {}", position);
        let now = clock.now();
        Ok(Self {
            store,
            clock,
            state: RwLock::new(TrackerState {
                position,
                last_persisted_at: now,
                deferred_error: None,
            }),
        })
    }

    /// Record a newly acknowledged coordinate.
    ///
    /// Saves are monotonic: a coordinate below the current value is
    /// ignored, an equal one is accepted (acknowledgement re-sends are
    /// legitimate). Persistence failures are logged here and surfaced by
    /// the next [`close`](Self::close).
    pub async fn save(&self, position: BinlogPosition) {
        let mut state = self.state.write().await;

        if position < state.position {
            debug!(
                "ignoring stale position {} (current {})",
                position, state.position
            );
            return;
        }
        state.position = position;

        let now = self.clock.now();
        if now.duration_since(state.last_persisted_at) < PERSIST_INTERVAL {
            return;
        }
        state.last_persisted_at = now;

        let snapshot = state.position.clone();
        debug!("persisting position {}", snapshot);
        if let Err(e) = self.store.store(&snapshot).await {
            error!("failed to persist position {}: {}", snapshot, e);
            state.deferred_error = Some(e);
        }
    }

    /// The current in-memory coordinate.
    pub async fn position(&self) -> BinlogPosition {
        self.state.read().await.position.clone()
    }

    /// Flush unconditionally and surface any deferred persistence error.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.state.write().await;

        let position = state.position.clone();
        self.store.store(&position).await?;
        state.last_persisted_at = self.clock.now();
        info!("position tracker closed at {}", position);

        match state.deferred_error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

// ============================================================================
// Local file store
// ============================================================================

/// Position store backed by a small local file, written atomically.
///
/// Layout of `<data_dir>/master.info`:
///
/// ```text
/// bin_name = "binlog.000042"
/// bin_pos  = 1734912
/// ```
pub struct FilePositionStore {
    path: PathBuf,
}

#[derive(serde::Deserialize)]
struct FileData {
    bin_name: String,
    bin_pos: u32,
}

impl FilePositionStore {
    /// Create the store, making sure the data directory exists.
    pub async fn new(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = data_dir.into();
        fs::create_dir_all(&dir).await.map_err(|e| {
            EstuaryError::config(format!("failed to create data directory {:?}: {}", dir, e))
        })?;
        Ok(Self {
            path: dir.join("master.info"),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl PositionStore for FilePositionStore {
    async fn load(&self) -> Result<BinlogPosition> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(BinlogPosition::zero())
            }
            Err(e) => return Err(e.into()),
        };

        let data: FileData = toml::from_str(&content).map_err(|e| {
            EstuaryError::storage(format!("unparseable position file {:?}: {}", self.path, e))
        })?;
        Ok(BinlogPosition::new(data.bin_name, data.bin_pos))
    }

    async fn store(&self, position: &BinlogPosition) -> Result<()> {
        let content = format!(
            "bin_name = {:?}\nbin_pos  = {}\n",
            position.name, position.pos
        );

        // Temp file + rename in the same directory keeps the swap atomic.
        let temp_path = self.path.with_extension("info.tmp");
        fs::write(&temp_path, content).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(0o644)).await?;
        }
        fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }
}

// ============================================================================
// Keyed store
// ============================================================================

const MASTER_INFO_KEY: &str = "estuary-master-info";
const BIN_NAME_FIELD: &str = "bin_name";
const BIN_POS_FIELD: &str = "bin_pos";

/// Position store backed by two fields of one key in an external
/// [`HashStore`]. The key carries the installation suffix so several
/// pipelines can share a store.
pub struct KeyedPositionStore {
    store: Arc<dyn HashStore>,
    key: String,
}

impl KeyedPositionStore {
    /// Create the store, initialising a missing key to the zero position.
    pub async fn new(store: Arc<dyn HashStore>, key_suffix: &str) -> Result<Self> {
        let key = format!("{}:{}", MASTER_INFO_KEY, key_suffix);
        let this = Self { store, key };

        let fields = this
            .store
            .read_fields(&this.key, &[BIN_NAME_FIELD, BIN_POS_FIELD])
            .await?;
        if fields.iter().any(Option::is_none) {
            this.store
                .write_fields(
                    &this.key,
                    &[
                        (BIN_NAME_FIELD, String::new()),
                        (BIN_POS_FIELD, "0".to_string()),
                    ],
                )
                .await?;
        }

        Ok(this)
    }

    /// The full key the position lives under.
    pub fn key(&self) -> &str {
        &self.key
    }
}

#[async_trait]
impl PositionStore for KeyedPositionStore {
    async fn load(&self) -> Result<BinlogPosition> {
        let mut fields = self
            .store
            .read_fields(&self.key, &[BIN_NAME_FIELD, BIN_POS_FIELD])
            .await?;
        let pos = fields.pop().flatten();
        let name = fields.pop().flatten();

        let (Some(name), Some(pos)) = (name, pos) else {
            return Ok(BinlogPosition::zero());
        };
        let pos: u32 = pos.trim().parse().map_err(|_| {
            EstuaryError::storage(format!("invalid {} value under {}", BIN_POS_FIELD, self.key))
        })?;
        Ok(BinlogPosition::new(name, pos))
    }

    async fn store(&self, position: &BinlogPosition) -> Result<()> {
        self.store
            .write_fields(
                &self.key,
                &[
                    (BIN_NAME_FIELD, position.name.clone()),
                    (BIN_POS_FIELD, position.pos.to_string()),
                ],
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ManualClock, MemoryHashStore, MemoryPositionStore};
    use tempfile::TempDir;

    async fn tracker_with(
        store: Box<dyn PositionStore>,
        clock: Arc<dyn Clock>,
    ) -> PositionTracker {
        PositionTracker::new(store, clock).await.unwrap()
    }

    #[tokio::test]
    async fn test_save_is_monotonic() {
        let clock = Arc::new(ManualClock::new());
        let tracker = tracker_with(Box::new(MemoryPositionStore::new()), clock).await;

        tracker
            .save(BinlogPosition::new("binlog.000002", 100))
            .await;
        tracker.save(BinlogPosition::new("binlog.000001", 999)).await;

        assert_eq!(
            tracker.position().await,
            BinlogPosition::new("binlog.000002", 100)
        );

        // Equal coordinate re-sends are accepted.
        tracker
            .save(BinlogPosition::new("binlog.000002", 100))
            .await;
        assert_eq!(
            tracker.position().await,
            BinlogPosition::new("binlog.000002", 100)
        );
    }

    #[tokio::test]
    async fn test_persistence_is_throttled() {
        let clock = Arc::new(ManualClock::new());
        let store = MemoryPositionStore::new();
        let writes = store.writes();
        let tracker = tracker_with(Box::new(store), clock.clone()).await;

        tracker.save(BinlogPosition::new("binlog.000001", 10)).await;
        tracker.save(BinlogPosition::new("binlog.000001", 20)).await;
        assert_eq!(writes.load(std::sync::atomic::Ordering::SeqCst), 0);

        clock.advance(Duration::from_secs(1));
        tracker.save(BinlogPosition::new("binlog.000001", 30)).await;
        assert_eq!(writes.load(std::sync::atomic::Ordering::SeqCst), 1);

        // Still inside the new window.
        tracker.save(BinlogPosition::new("binlog.000001", 40)).await;
        assert_eq!(writes.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_flushes_unconditionally() {
        let clock = Arc::new(ManualClock::new());
        let store = MemoryPositionStore::new();
        let stored = store.shared_position();
        let tracker = tracker_with(Box::new(store), clock).await;

        tracker.save(BinlogPosition::new("binlog.000001", 10)).await;
        tracker.close().await.unwrap();

        assert_eq!(
            stored.lock().unwrap().clone(),
            BinlogPosition::new("binlog.000001", 10)
        );
    }

    #[tokio::test]
    async fn test_persistence_failure_surfaces_on_close() {
        struct FlakyStore {
            fail: std::sync::atomic::AtomicBool,
        }

        #[async_trait]
        impl PositionStore for FlakyStore {
            async fn load(&self) -> Result<BinlogPosition> {
                Ok(BinlogPosition::zero())
            }
            async fn store(&self, _position: &BinlogPosition) -> Result<()> {
                if self.fail.swap(false, std::sync::atomic::Ordering::SeqCst) {
                    Err(EstuaryError::storage("store timeout"))
                } else {
                    Ok(())
                }
            }
        }

        let clock = Arc::new(ManualClock::new());
        let store = FlakyStore {
            fail: std::sync::atomic::AtomicBool::new(true),
        };
        let tracker = tracker_with(Box::new(store), clock.clone()).await;

        clock.advance(Duration::from_secs(2));
        // The failed write is logged, not returned.
        tracker.save(BinlogPosition::new("binlog.000001", 10)).await;

        // The final flush succeeds but the deferred error surfaces.
        let err = tracker.close().await.unwrap_err();
        assert!(matches!(err, EstuaryError::Storage(_)));

        // A second close is clean.
        tracker.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = FilePositionStore::new(dir.path()).await.unwrap();

        assert!(store.load().await.unwrap().is_zero());

        store
            .store(&BinlogPosition::new("binlog.000042", 1734912))
            .await
            .unwrap();
        assert_eq!(
            store.load().await.unwrap(),
            BinlogPosition::new("binlog.000042", 1734912)
        );

        let content = std::fs::read_to_string(store.path()).unwrap();
        assert!(content.contains("bin_name = \"binlog.000042\""));
        assert!(content.contains("bin_pos  = 1734912"));

        // No temp file left behind.
        assert!(!store.path().with_extension("info.tmp").exists());
    }

    #[tokio::test]
    async fn test_keyed_store_initialises_missing_key() {
        let hash = Arc::new(MemoryHashStore::new());
        let store = KeyedPositionStore::new(hash.clone(), "brand7").await.unwrap();

        assert_eq!(store.key(), "estuary-master-info:brand7");
        assert!(store.load().await.unwrap().is_zero());

        store
            .store(&BinlogPosition::new("binlog.000003", 77))
            .await
            .unwrap();
        assert_eq!(
            store.load().await.unwrap(),
            BinlogPosition::new("binlog.000003", 77)
        );
    }
}
