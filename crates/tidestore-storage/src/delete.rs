//! Delete Executor
//!
//! Runs range deletes for one partition. A delete must not race with writes
//! for the same series that are still sitting in the partition's buffer, so
//! the partition's synchronizer is asked for a flush first and the delete only
//! starts once it reports back. Requests are served between flushes, so a
//! batch already being written lands before the delete as well.
//!
//! The deleted range is expressed as a row key scan over the series:
//!
//! ```text
//! start = prefix || be(MAX - end)
//! stop  = prefix || be(MAX - start) || 0x00
//! ```
//!
//! and, with `min_age_ms > 0`, restricted to cell versions written before
//! `now - min_age_ms`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tidestore_core::{DeleteMessage, RowKeyCodec};
use tidestore_observability::metrics;

use crate::abort::AbortListener;
use crate::error::{Result, StorageError};
use crate::store::{StoreTable, TimeRange};
use crate::synchronizer::ForceFlushHandle;

/// Rows per store round trip when scanning for deletes.
pub const DELETE_BATCH_HINT: usize = 1000;

/// Label carrying the owner of a series.
pub const OWNER_LABEL: &str = ".owner";
/// Label carrying the application of a series.
pub const APP_LABEL: &str = ".app";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteOutcome {
    /// Store shards that took part in the delete
    pub regions: usize,
    pub rows_deleted: u64,
    pub versions_deleted: u64,
    pub elapsed: Duration,
}

pub struct DeleteExecutor {
    partition: u32,
    flusher: ForceFlushHandle,
    table: Arc<dyn StoreTable>,
    rowkeys: RowKeyCodec,
}

impl DeleteExecutor {
    pub fn new(
        partition: u32,
        flusher: ForceFlushHandle,
        table: Arc<dyn StoreTable>,
        rowkeys: RowKeyCodec,
    ) -> Self {
        Self {
            partition,
            flusher,
            table,
            rowkeys,
        }
    }

    pub async fn execute(
        &self,
        delete: &DeleteMessage,
        abort: &mut AbortListener,
    ) -> Result<DeleteOutcome> {
        if self.rowkeys.modulus() != 1 {
            return Err(StorageError::DeleteUnsupportedModulus(self.rowkeys.modulus()));
        }

        // Always go through the synchronizer: an empty buffer may still have
        // a batch in flight that would land after the delete.
        tokio::select! {
            biased;
            _ = abort.aborted() => return Err(StorageError::Interrupted),
            flushed = self.flusher.flush() => flushed?,
        }

        let started = Instant::now();
        let range = self
            .rowkeys
            .scan_range(delete.class_id, delete.labels_id, delete.start, delete.end);
        let time_range = if delete.min_age_ms > 0 {
            TimeRange::older_than(now_ms(), delete.min_age_ms)
        } else {
            TimeRange::all()
        };

        let results = self
            .table
            .range_delete_versions(&range, time_range, DELETE_BATCH_HINT)
            .await?;

        let outcome = DeleteOutcome {
            regions: results.len(),
            rows_deleted: results.iter().map(|r| r.rows_deleted).sum(),
            versions_deleted: results.iter().map(|r| r.versions_deleted).sum(),
            elapsed: started.elapsed(),
        };

        metrics::DELETE_OPS_TOTAL.inc();
        metrics::DELETE_LATENCY.observe(outcome.elapsed.as_secs_f64());
        metrics::DELETE_REGIONS_TOTAL.inc_by(outcome.regions as u64);
        metrics::DELETE_DATAPOINTS_TOTAL.inc_by(outcome.versions_deleted);

        if let Some(metadata) = &delete.metadata {
            if let Some(owner) = metadata.labels.get(OWNER_LABEL) {
                metrics::DELETE_OWNER_OPS_TOTAL.with_label_values(&[owner.as_str()]).inc();
                metrics::DELETE_OWNER_DATAPOINTS_TOTAL
                    .with_label_values(&[owner.as_str()])
                    .inc_by(outcome.versions_deleted);
            }
            if let Some(app) = metadata.labels.get(APP_LABEL) {
                metrics::DELETE_APP_OPS_TOTAL.with_label_values(&[app.as_str()]).inc();
                metrics::DELETE_APP_DATAPOINTS_TOTAL
                    .with_label_values(&[app.as_str()])
                    .inc_by(outcome.versions_deleted);
            }
        }

        tracing::info!(
            partition = self.partition,
            class_id = delete.class_id,
            labels_id = delete.labels_id,
            regions = outcome.regions,
            rows = outcome.rows_deleted,
            versions = outcome.versions_deleted,
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "Range delete completed"
        );

        Ok(outcome)
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abort::{AbortReason, AbortSignal};
    use crate::barrier::CommitBarrier;
    use crate::buffer::WriteBuffer;
    use crate::memory::{InMemoryStore, WriteFault};
    use crate::store::StoreConnector;
    use crate::synchronizer::{FlushSettings, FlushSynchronizer};
    use bytes::Bytes;
    use std::collections::BTreeMap;
    use tidestore_core::{PendingWrite, SeriesMetadata};

    struct Fixture {
        store: Arc<InMemoryStore>,
        buffer: Arc<WriteBuffer>,
        abort: Arc<AbortSignal>,
        executor: DeleteExecutor,
        sync_task: tokio::task::JoinHandle<()>,
    }

    fn lazy_settings() -> FlushSettings {
        FlushSettings {
            commit_period: Duration::from_secs(3600),
            barrier_timeout: Duration::from_secs(7200),
            eager_flush_age: Duration::from_secs(3600),
            max_pending_bytes: usize::MAX,
            poll_interval: Duration::from_millis(1),
            skip_write: false,
        }
    }

    async fn fixture(modulus: i64) -> Fixture {
        fixture_with(modulus, lazy_settings()).await
    }

    async fn fixture_with(modulus: i64, settings: FlushSettings) -> Fixture {
        let store = InMemoryStore::new();
        let connection = store.connector().connect(&BTreeMap::new()).await.unwrap();
        let table = connection.table("t", "v").await.unwrap();
        let buffer = Arc::new(WriteBuffer::new(0));
        let abort = Arc::new(AbortSignal::new());
        let (sync, handle) = FlushSynchronizer::new(
            buffer.clone(),
            table.clone(),
            Arc::new(CommitBarrier::new(1)),
            abort.clone(),
            settings,
        );
        let sync_task = tokio::spawn(sync.run());
        let executor = DeleteExecutor::new(
            buffer.partition(),
            handle,
            table,
            RowKeyCodec::new(modulus).unwrap(),
        );
        Fixture {
            store,
            buffer,
            abort,
            executor,
            sync_task,
        }
    }

    fn delete(start: i64, end: i64) -> DeleteMessage {
        DeleteMessage {
            class_id: 1,
            labels_id: 2,
            start,
            end,
            min_age_ms: 0,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_buffered_writes_are_flushed_before_delete() {
        let f = fixture(1).await;
        let codec = RowKeyCodec::new(1).unwrap();
        let mut listener = f.abort.listener();
        for ts in [100, 200, 300] {
            let write = PendingWrite::new(codec.encode(1, 2, ts), Bytes::from_static(b"v"));
            f.buffer.append(write, &mut listener).await.unwrap();
        }

        // The writes only exist in the buffer; the delete must still see them
        let outcome = f
            .executor
            .execute(&delete(i64::MIN, i64::MAX), &mut listener)
            .await
            .unwrap();

        assert_eq!(outcome.versions_deleted, 3);
        assert_eq!(outcome.rows_deleted, 3);
        assert_eq!(outcome.regions, 1);
        assert!(f.buffer.is_empty().await);
        assert_eq!(f.store.cell_count("t"), 0);

        f.abort.abort(AbortReason::Shutdown);
        f.sync_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_waits_for_in_flight_flush() {
        let mut eager = lazy_settings();
        eager.max_pending_bytes = 0;
        let f = fixture_with(1, eager).await;
        f.store.inject_write_fault(WriteFault::Hang(Duration::from_millis(200)));

        let codec = RowKeyCodec::new(1).unwrap();
        let mut listener = f.abort.listener();
        for ts in [100, 200, 300] {
            let write = PendingWrite::new(codec.encode(1, 2, ts), Bytes::from_static(b"v"));
            f.buffer.append(write, &mut listener).await.unwrap();
        }

        // The eager flush has taken the writes and is stuck in batch_write
        tokio::time::timeout(Duration::from_secs(5), async {
            while !f.buffer.is_empty().await {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(f.store.cell_count("t"), 0);

        let outcome = f
            .executor
            .execute(&delete(i64::MIN, i64::MAX), &mut listener)
            .await
            .unwrap();
        assert_eq!(outcome.versions_deleted, 3);

        // Nothing lands after the delete
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(f.store.cell_count("t"), 0);

        f.abort.abort(AbortReason::Shutdown);
        f.sync_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_bounded_delete_keeps_outside_rows() {
        let f = fixture(1).await;
        let codec = RowKeyCodec::new(1).unwrap();
        let mut listener = f.abort.listener();
        for ts in [100, 200, 300] {
            let write = PendingWrite::new(codec.encode(1, 2, ts), Bytes::from_static(b"v"));
            f.buffer.append(write, &mut listener).await.unwrap();
        }

        let mut labels = BTreeMap::new();
        labels.insert(OWNER_LABEL.to_string(), "delete-test-owner".to_string());
        let mut message = delete(150, 300);
        message.metadata = Some(SeriesMetadata {
            name: "cpu".to_string(),
            labels,
        });

        let outcome = f.executor.execute(&message, &mut listener).await.unwrap();
        assert_eq!(outcome.versions_deleted, 2);
        assert_eq!(f.store.cell_count("t"), 1);
        assert_eq!(
            metrics::DELETE_OWNER_OPS_TOTAL
                .with_label_values(&["delete-test-owner"])
                .get(),
            1
        );

        f.abort.abort(AbortReason::Shutdown);
        f.sync_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_min_age_spares_recent_versions() {
        let f = fixture(1).await;
        let codec = RowKeyCodec::new(1).unwrap();
        let mut listener = f.abort.listener();
        let write = PendingWrite::new(codec.encode(1, 2, 5), Bytes::from_static(b"v"));
        f.buffer.append(write, &mut listener).await.unwrap();

        let mut message = delete(i64::MIN, i64::MAX);
        message.min_age_ms = 3_600_000;
        let outcome = f.executor.execute(&message, &mut listener).await.unwrap();

        assert_eq!(outcome.versions_deleted, 0);
        assert_eq!(f.store.cell_count("t"), 1);

        f.abort.abort(AbortReason::Shutdown);
        f.sync_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_modulus_above_one_is_rejected() {
        let f = fixture(60).await;
        let mut listener = f.abort.listener();
        let err = f
            .executor
            .execute(&delete(0, 10), &mut listener)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::DeleteUnsupportedModulus(60)));

        f.abort.abort(AbortReason::Shutdown);
        f.sync_task.await.unwrap();
    }
}
