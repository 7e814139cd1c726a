//! Log Client Interface
//!
//! The ingest path reads a partitioned, append-only log through a consumer
//! group. Offsets are only ever committed explicitly by the commit
//! coordinator, never automatically.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Where a stream starts when its group has no committed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    /// Start from the oldest retained record
    Earliest,
    /// Start after the newest record
    Latest,
    /// Fail if no committed offset exists
    None,
}

/// One record read from a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub partition: u32,
    pub offset: u64,
    pub payload: Bytes,
    /// Offset the next appended record will get, when the log reports it
    pub high_watermark: Option<u64>,
}

/// Committed position of a partition: the next offset to consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PartitionOffset {
    pub partition: u32,
    pub offset: u64,
}

impl PartitionOffset {
    /// Position following the last flushed record.
    pub fn after(partition: u32, flushed: u64) -> Self {
        Self {
            partition,
            offset: flushed + 1,
        }
    }
}

#[async_trait]
pub trait LogStream: Send + Sync {
    fn partition(&self) -> u32;

    /// Wait up to `timeout` for the next record.
    async fn poll(&mut self, timeout: Duration) -> Result<Option<LogRecord>>;
}

#[async_trait]
pub trait LogClient: Send + Sync {
    /// Join the consumer group and open one stream per partition.
    async fn create_streams(
        &self,
        topic: &str,
        partitions: u32,
        reset: OffsetReset,
    ) -> Result<Vec<Box<dyn LogStream>>>;

    async fn commit_offsets(&self, offsets: &[PartitionOffset]) -> Result<()>;

    /// Leave the group. Streams opened before the call stop yielding records.
    async fn shutdown(&self);
}
