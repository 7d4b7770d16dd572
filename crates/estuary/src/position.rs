//! Binlog replication coordinates.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A position in the upstream binlog: log file name plus byte offset.
///
/// Ordered lexicographically by log name, then numerically by offset.
/// The zero position (`""`, `0`) means nothing has been applied yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BinlogPosition {
    /// Binlog file name, e.g. `binlog.000042`
    pub name: String,
    /// Byte offset within the file
    pub pos: u32,
}

impl BinlogPosition {
    /// Create a new position.
    pub fn new(name: impl Into<String>, pos: u32) -> Self {
        Self {
            name: name.into(),
            pos,
        }
    }

    /// The zero position: nothing applied yet.
    pub fn zero() -> Self {
        Self::default()
    }

    /// Check whether this is the zero position.
    pub fn is_zero(&self) -> bool {
        self.name.is_empty() && self.pos == 0
    }
}

impl PartialOrd for BinlogPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BinlogPosition {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name
            .cmp(&other.name)
            .then_with(|| self.pos.cmp(&other.pos))
    }
}

impl fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.pos)
    }
}
