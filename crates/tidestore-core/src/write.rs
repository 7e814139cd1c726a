//! Store mutations produced by the ingest path.

use bytes::Bytes;

use crate::rowkey::RowKey;

/// A single cell write, immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
    pub row_key: Bytes,
    pub qualifier: Option<Bytes>,
    pub value: Bytes,
}

impl PendingWrite {
    pub fn new(row: RowKey, value: Bytes) -> Self {
        Self {
            row_key: row.key,
            qualifier: row.qualifier,
            value,
        }
    }

    /// Bytes this write adds to the buffer's pending size (the value only).
    pub fn size(&self) -> usize {
        self.value.len()
    }
}
