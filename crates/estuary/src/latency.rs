//! Bulk request latency tracking.
//!
//! A fixed-capacity, newest-first ring of the most recent bulk request
//! durations. The ring always has exactly its configured length; slots
//! that have not received a sample yet read as zero, and a new sample
//! pushes the oldest one out.

use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;

/// Thread-safe ring of recent bulk latencies.
pub struct LatencyRing {
    inner: Mutex<Ring>,
}

struct Ring {
    /// Newest first, always `capacity` entries
    slots: Vec<Duration>,
    /// Number of real samples recorded, saturating at capacity
    filled: usize,
}

/// Read-only latency statistics, served by the external stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub recent_durations_ms: Vec<u64>,
    pub average_latency_ms: u64,
    pub thirds_diff_percent: i64,
}

impl LatencyRing {
    /// Create a ring of `capacity` slots (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Ring {
                slots: vec![Duration::ZERO; capacity],
                filled: 0,
            }),
        }
    }

    /// Record a new sample, evicting the oldest.
    pub fn record(&self, duration: Duration) {
        let mut ring = self.lock();
        ring.slots.insert(0, duration);
        ring.slots.pop();
        ring.filled = (ring.filled + 1).min(ring.slots.len());
    }

    /// Average over all slots, empty slots counting as zero.
    pub fn avg(&self) -> Duration {
        let ring = self.lock();
        let sum: Duration = ring.slots.iter().sum();
        sum / ring.slots.len() as u32
    }

    /// Signed percentage difference between the newest and oldest thirds
    /// of the ring: `(new_avg - old_avg) * 100 / old_avg`. Positive means
    /// latency is increasing. Returns 0 until the ring is fully populated.
    pub fn thirds_diff(&self) -> i64 {
        let ring = self.lock();
        if ring.filled < ring.slots.len() {
            return 0;
        }
        let third = ring.slots.len() / 3;
        if third == 0 {
            return 0;
        }

        let new_avg = mean_millis(&ring.slots[..third]);
        let old_avg = mean_millis(&ring.slots[ring.slots.len() - third..]);
        if old_avg == 0 {
            return 0;
        }

        ((new_avg - old_avg) * 100 / old_avg) as i64
    }

    /// All slots, newest first.
    pub fn durations(&self) -> Vec<Duration> {
        self.lock().slots.clone()
    }

    /// Snapshot for the stats endpoint.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            recent_durations_ms: self
                .durations()
                .iter()
                .map(|d| d.as_millis() as u64)
                .collect(),
            average_latency_ms: self.avg().as_millis() as u64,
            thirds_diff_percent: self.thirds_diff(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Ring> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn mean_millis(slice: &[Duration]) -> i128 {
    let sum: i128 = slice.iter().map(|d| d.as_millis() as i128).sum();
    sum / slice.len() as i128
}
