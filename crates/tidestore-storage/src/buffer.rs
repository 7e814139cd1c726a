//! Per-partition Write Buffer
//!
//! The partition consumer appends writes; the flush synchronizer drains them.
//! One async mutex guards the write list, its byte size, the time of the last
//! append and the consumed offset, so those always change together.
//!
//! ## Consumed offset
//!
//! After every write derived from a log record has been appended, the
//! consumer marks the record's offset as consumed. A snapshot captures that
//! offset together with the writes, so once the snapshot is durably written
//! every record up to and including it is persisted. That is the only offset
//! the coordinator is allowed to commit.
//!
//! Flushing never holds the lock across store I/O: the synchronizer takes a
//! snapshot (clearing the buffer) and writes it afterwards.

use std::time::{Duration, Instant};

use tidestore_core::PendingWrite;
use tokio::sync::Mutex;

use crate::abort::AbortListener;
use crate::error::{Result, StorageError};

#[derive(Debug, Default)]
struct BufferState {
    writes: Vec<PendingWrite>,
    bytes: usize,
    last_add: Option<Instant>,
    consumed_offset: Option<u64>,
}

/// Writes removed from the buffer by a flush.
#[derive(Debug, Default)]
pub struct BufferSnapshot {
    pub writes: Vec<PendingWrite>,
    pub bytes: usize,
    /// Highest offset whose writes are all in this or an earlier snapshot
    pub consumed_offset: Option<u64>,
}

pub struct WriteBuffer {
    partition: u32,
    state: Mutex<BufferState>,
}

impl WriteBuffer {
    pub fn new(partition: u32) -> Self {
        Self {
            partition,
            state: Mutex::new(BufferState::default()),
        }
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    /// Append a write. Fails with `Interrupted` if the generation aborts
    /// while waiting for the lock.
    pub async fn append(&self, write: PendingWrite, abort: &mut AbortListener) -> Result<()> {
        let mut state = tokio::select! {
            biased;
            _ = abort.aborted() => return Err(StorageError::Interrupted),
            state = self.state.lock() => state,
        };
        state.bytes += write.size();
        state.writes.push(write);
        state.last_add = Some(Instant::now());
        Ok(())
    }

    /// Record that every write derived from `offset` has been appended.
    pub async fn mark_consumed(&self, offset: u64, abort: &mut AbortListener) -> Result<()> {
        let mut state = tokio::select! {
            biased;
            _ = abort.aborted() => return Err(StorageError::Interrupted),
            state = self.state.lock() => state,
        };
        state.consumed_offset = Some(match state.consumed_offset {
            Some(current) => current.max(offset),
            None => offset,
        });
        Ok(())
    }

    /// Remove every buffered write.
    pub async fn take_snapshot(&self) -> BufferSnapshot {
        let mut state = self.state.lock().await;
        let writes = std::mem::take(&mut state.writes);
        let bytes = std::mem::replace(&mut state.bytes, 0);
        state.last_add = None;
        BufferSnapshot {
            writes,
            bytes,
            consumed_offset: state.consumed_offset,
        }
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.writes.is_empty()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.writes.len()
    }

    pub async fn pending_bytes(&self) -> usize {
        self.state.lock().await.bytes
    }

    pub async fn consumed_offset(&self) -> Option<u64> {
        self.state.lock().await.consumed_offset
    }

    /// Eager flush policy: the last append is older than `max_age`, or more
    /// than `max_bytes` are pending.
    pub async fn needs_eager_flush(&self, max_age: Duration, max_bytes: usize) -> bool {
        let state = self.state.lock().await;
        if state.writes.is_empty() {
            return false;
        }
        let stale = state
            .last_add
            .map(|at| at.elapsed() > max_age)
            .unwrap_or(false);
        stale || state.bytes > max_bytes
    }
}
