//! Flush Synchronizer
//!
//! One task per partition that drains the partition's [`WriteBuffer`] into
//! the store. It flushes on three triggers:
//!
//! 1. **Periodic**: every `commit_period`, then joins the commit barrier with
//!    the offset it has durably flushed
//! 2. **Eager**: when the last buffered write is older than `eager_flush_age`
//!    or more than `max_pending_bytes` are buffered
//! 3. **Forced**: on request of the delete executor, through a
//!    [`ForceFlushHandle`]; the requester waits for the outcome
//!
//! ```text
//!   DeleteExecutor ─→ [mpsc] ─→ FlushSynchronizer ─→ batch_write ─→ store
//!        ▲                            │
//!        └────── oneshot result ──────┘
//! ```
//!
//! A failed batch is never retried here. The error aborts the generation and
//! the writes are replayed from the log by the next one.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tidestore_observability::metrics;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use crate::abort::{AbortReason, AbortSignal};
use crate::barrier::{BarrierWait, CommitBarrier};
use crate::buffer::WriteBuffer;
use crate::config::IngestConfig;
use crate::error::{Result, StorageError};
use crate::store::StoreTable;

type FlushReply = oneshot::Sender<std::result::Result<(), String>>;

/// Flush triggers and timings.
#[derive(Debug, Clone)]
pub struct FlushSettings {
    pub commit_period: Duration,
    pub barrier_timeout: Duration,
    pub eager_flush_age: Duration,
    pub max_pending_bytes: usize,
    pub poll_interval: Duration,
    pub skip_write: bool,
}

impl FlushSettings {
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            commit_period: config.commit_period(),
            barrier_timeout: config.max_time_between_commits(),
            eager_flush_age: config.eager_flush_age(),
            max_pending_bytes: config.store.max_pending_bytes,
            poll_interval: config.sync_poll(),
            skip_write: config.store.skip_write,
        }
    }
}

/// Requests an out-of-band flush from a partition's synchronizer.
#[derive(Clone)]
pub struct ForceFlushHandle {
    tx: mpsc::Sender<FlushReply>,
}

impl ForceFlushHandle {
    /// Flush everything buffered so far and wait until it is in the store.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(tx)
            .await
            .map_err(|_| StorageError::ForceFlush("synchronizer stopped".to_string()))?;
        rx.await
            .map_err(|_| StorageError::ForceFlush("synchronizer dropped the request".to_string()))?
            .map_err(StorageError::ForceFlush)
    }
}

pub struct FlushSynchronizer {
    partition: u32,
    buffer: Arc<WriteBuffer>,
    table: Arc<dyn StoreTable>,
    barrier: Arc<CommitBarrier>,
    abort: Arc<AbortSignal>,
    settings: FlushSettings,
    requests: mpsc::Receiver<FlushReply>,
    flushed_offset: Option<u64>,
}

impl FlushSynchronizer {
    pub fn new(
        buffer: Arc<WriteBuffer>,
        table: Arc<dyn StoreTable>,
        barrier: Arc<CommitBarrier>,
        abort: Arc<AbortSignal>,
        settings: FlushSettings,
    ) -> (Self, ForceFlushHandle) {
        let (tx, requests) = mpsc::channel(16);
        let synchronizer = Self {
            partition: buffer.partition(),
            buffer,
            table,
            barrier,
            abort,
            settings,
            requests,
            flushed_offset: None,
        };
        (synchronizer, ForceFlushHandle { tx })
    }

    /// Offset up to which every record is in the store.
    pub fn flushed_offset(&self) -> Option<u64> {
        self.flushed_offset
    }

    /// Run until the generation aborts. Failures raise the abort signal.
    pub async fn run(mut self) {
        if let Err(e) = self.run_loop().await {
            tracing::error!(partition = self.partition, error = %e, "Flush synchronizer failed");
            self.abort.abort(AbortReason::worker(self.partition, &e));
        }
        tracing::debug!(partition = self.partition, "Flush synchronizer stopped");
    }

    async fn run_loop(&mut self) -> Result<()> {
        let mut abort = self.abort.listener();
        let mut tick = tokio::time::interval(self.settings.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_sync = Instant::now();

        loop {
            tokio::select! {
                _ = abort.aborted() => return Ok(()),
                Some(reply) = self.requests.recv() => self.serve(reply).await?,
                _ = tick.tick() => {
                    if last_sync.elapsed() >= self.settings.commit_period {
                        self.flush().await?;

                        // The barrier keeps the offset reported on arrival, so
                        // forced flushes can still be served while parked.
                        let barrier = self.barrier.clone();
                        let arrival = barrier.arrive(
                            self.partition,
                            self.flushed_offset,
                            self.settings.barrier_timeout,
                        );
                        tokio::pin!(arrival);
                        let wait = loop {
                            tokio::select! {
                                _ = abort.aborted() => return Ok(()),
                                wait = &mut arrival => break wait,
                                Some(reply) = self.requests.recv() => self.serve(reply).await?,
                            }
                        };
                        match wait {
                            BarrierWait::Released => last_sync = Instant::now(),
                            BarrierWait::Broken => return Ok(()),
                            BarrierWait::TimedOut => {
                                return Err(StorageError::BarrierTimeout(self.settings.barrier_timeout))
                            }
                        }
                    } else if self
                        .buffer
                        .needs_eager_flush(self.settings.eager_flush_age, self.settings.max_pending_bytes)
                        .await
                    {
                        self.flush().await?;
                    }
                }
            }
        }
    }

    async fn serve(&mut self, reply: FlushReply) -> Result<()> {
        let result = self.flush().await;
        let _ = reply.send(result.as_ref().map(|_| ()).map_err(|e| e.to_string()));
        result
    }

    /// Write out everything buffered. On success the snapshot's consumed
    /// offset becomes the flushed offset.
    pub async fn flush(&mut self) -> Result<()> {
        let snapshot = self.buffer.take_snapshot().await;
        let count = snapshot.writes.len();

        if count > 0 {
            if self.settings.skip_write {
                metrics::DATAPOINTS_SKIPPED_TOTAL.inc_by(count as u64);
            } else {
                let started = Instant::now();
                let statuses = self.table.batch_write(&snapshot.writes).await?;
                let failed = statuses
                    .iter()
                    .filter(|status| !matches!(status, Some(Ok(()))))
                    .count()
                    + count.saturating_sub(statuses.len());
                if failed > 0 {
                    metrics::BATCH_WRITE_FAILURES_TOTAL.inc();
                    tracing::error!(
                        partition = self.partition,
                        failed,
                        total = count,
                        "At least one write of the batch failed"
                    );
                    return Err(StorageError::BatchRejected {
                        failed,
                        total: count,
                    });
                }
                metrics::BATCH_WRITE_LATENCY.observe(started.elapsed().as_secs_f64());
                metrics::BATCH_WRITES_TOTAL.inc();
                metrics::DATAPOINTS_WRITTEN_TOTAL.inc_by(count as u64);
            }
            tracing::debug!(
                partition = self.partition,
                writes = count,
                bytes = snapshot.bytes,
                "Flushed write buffer"
            );
        }

        if snapshot.consumed_offset.is_some() {
            self.flushed_offset = snapshot.consumed_offset;
        }
        Ok(())
    }
}
