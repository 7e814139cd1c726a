//! Store Client Interface
//!
//! A sorted, sharded key-value store with versioned cells. Shards are called
//! regions by some stores; a range delete reports one result per shard it
//! touched.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tidestore_core::{PendingWrite, ScanRange};

use crate::error::Result;

/// Per-write outcome of a batch. `None` means the store returned no result
/// for that write, which counts as a failure.
pub type WriteStatus = Option<std::result::Result<(), String>>;

/// Half-open range `[min, max)` of cell version timestamps, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub min: i64,
    pub max: i64,
}

impl TimeRange {
    pub fn all() -> Self {
        Self {
            min: i64::MIN,
            max: i64::MAX,
        }
    }

    /// Versions written at least `min_age_ms` before `now_ms`.
    pub fn older_than(now_ms: i64, min_age_ms: i64) -> Self {
        Self {
            min: 0,
            max: now_ms - min_age_ms + 1,
        }
    }

    pub fn contains(&self, ts: i64) -> bool {
        ts >= self.min && ts < self.max
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardDeleteResult {
    pub shard: String,
    pub rows_deleted: u64,
    pub versions_deleted: u64,
}

#[async_trait]
pub trait StoreTable: Send + Sync {
    fn name(&self) -> &str;

    /// Write a batch; the result has one status per input write, in order.
    async fn batch_write(&self, writes: &[PendingWrite]) -> Result<Vec<WriteStatus>>;

    /// Delete every version in `time_range` of the cells whose row falls in `range`.
    async fn range_delete_versions(
        &self,
        range: &ScanRange,
        time_range: TimeRange,
        batch_hint: usize,
    ) -> Result<Vec<ShardDeleteResult>>;
}

#[async_trait]
pub trait StoreConnection: Send + Sync {
    async fn table(&self, name: &str, column_family: &str) -> Result<Arc<dyn StoreTable>>;

    fn is_closed(&self) -> bool;

    async fn close(&self);
}

#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self, properties: &BTreeMap<String, String>)
        -> Result<Arc<dyn StoreConnection>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_older_than_range() {
        let range = TimeRange::older_than(10_000, 3_000);
        assert!(range.contains(0));
        assert!(range.contains(7_000));
        assert!(!range.contains(7_001));
        assert!(!range.contains(-1));
    }

    #[test]
    fn test_all_range() {
        let range = TimeRange::all();
        assert!(range.contains(i64::MIN));
        assert!(range.contains(0));
        assert!(!range.contains(i64::MAX));
    }
}
