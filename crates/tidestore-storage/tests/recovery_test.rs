//! Fault-injection tests for generation recovery.
//!
//! Each test breaks the store in one specific way and checks that the
//! coordinator tears the generation down, recreates the store connection,
//! never commits past what was durably flushed, and resumes from the last
//! committed offsets.

use std::sync::Arc;
use std::time::Duration;

use tidestore_core::{Datapoint, DatapointCodec, LogMessage, StoreMessage, Value, VarintBlockCodec};
use tidestore_storage::memory::{InMemoryLog, InMemoryStore, WriteFault};
use tidestore_storage::{
    AbortReason, CommitCoordinator, CoordinatorHandle, FailureClass, GenerationState,
    IngestConfig, IngestContext,
};

const TABLE: &str = "continuum";

fn config() -> IngestConfig {
    let mut config = IngestConfig::default();
    config.log.topic = "t".to_string();
    config.log.partitions = 2;
    config.log.commit_period_ms = 20;
    config.log.max_time_between_commits_ms = 400;
    config.log.poll_timeout_ms = 10;
    config.lifecycle.respawn_delay_ms = 10;
    config.lifecycle.join_retry_interval_ms = 50;
    config
}

async fn start(log: &Arc<InMemoryLog>, store: &Arc<InMemoryStore>) -> CoordinatorHandle {
    let ctx = IngestContext::build(config(), Arc::new(log.client("g")), store.connector())
        .await
        .unwrap();
    CommitCoordinator::spawn(ctx)
}

fn message(ts: i64) -> bytes::Bytes {
    LogMessage::Store(StoreMessage {
        class_id: 1,
        labels_id: 1,
        data: VarintBlockCodec.encode_block(&[Datapoint::new(ts, Value::Long(ts))]),
    })
    .encode()
}

async fn wait_committed(log: &InMemoryLog, partition: u32, offset: u64) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while log.committed("g", "t", partition) < Some(offset) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("partition {} never committed {}", partition, offset));
}

/// Committed offsets per partition only ever move forward.
fn assert_monotonic_commits(log: &InMemoryLog, partition: u32) -> Vec<u64> {
    let history: Vec<u64> = log
        .commit_history("g")
        .into_iter()
        .flatten()
        .filter(|o| o.partition == partition)
        .map(|o| o.offset)
        .collect();
    assert!(
        history.windows(2).all(|w| w[0] <= w[1]),
        "commits went backwards: {:?}",
        history
    );
    history
}

#[tokio::test]
async fn test_null_batch_result_rebuilds_generation() {
    let log = InMemoryLog::new();
    log.create_topic("t", 2);
    let store = InMemoryStore::new();
    let handle = start(&log, &store).await;

    log.append("t", 0, message(1)).unwrap();
    wait_committed(&log, 0, 1).await;
    assert_eq!(store.connections_opened(), 1);

    store.inject_write_fault(WriteFault::NullResult);
    log.append("t", 0, message(2)).unwrap();

    let status = tokio::time::timeout(
        Duration::from_secs(10),
        handle.wait_for(|s| s.generation >= 1),
    )
    .await
    .unwrap();
    match status.last_abort {
        Some(AbortReason::WorkerFailure { partition, class, .. }) => {
            assert_eq!(partition, 0);
            assert_eq!(class, FailureClass::StoreFatal);
        }
        other => panic!("unexpected abort reason: {:?}", other),
    }

    // Nothing past the first record was committed by the failed generation
    let history = assert_monotonic_commits(&log, 0);
    assert!(history.iter().all(|&offset| offset <= 2));

    // The new generation replays the rejected record and commits it
    wait_committed(&log, 0, 2).await;
    assert_eq!(store.connections_opened(), 2);
    assert_eq!(store.cell_count(TABLE), 2);
    assert_eq!(handle.generation(), 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_failed_generation_commits_only_flushed_offsets() {
    let log = InMemoryLog::new();
    log.create_topic("t", 2);
    let store = InMemoryStore::new();
    let handle = start(&log, &store).await;

    log.append("t", 1, message(1)).unwrap();
    wait_committed(&log, 1, 1).await;

    // Every record after the fault is rejected until the generation dies
    store.inject_write_fault(WriteFault::IoError("region server down".to_string()));
    for ts in 2..6 {
        log.append("t", 1, message(ts)).unwrap();
    }

    tokio::time::timeout(
        Duration::from_secs(10),
        handle.wait_for(|s| s.generation >= 1),
    )
    .await
    .unwrap();
    wait_committed(&log, 1, 5).await;

    let history = assert_monotonic_commits(&log, 1);
    assert_eq!(history.last(), Some(&5));
    assert_eq!(store.cell_count(TABLE), 5);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_overdue_barrier_increments_generation_once() {
    let log = InMemoryLog::new();
    log.create_topic("t", 2);
    let store = InMemoryStore::new();
    let handle = start(&log, &store).await;

    tokio::time::timeout(Duration::from_secs(10), handle.wait_for(|s| s.commits > 0))
        .await
        .unwrap();

    // The store stops answering: partition 0 never reaches the barrier
    store.inject_write_fault(WriteFault::Hang(Duration::from_secs(60)));
    log.append("t", 0, message(7)).unwrap();

    let status = tokio::time::timeout(
        Duration::from_secs(10),
        handle.wait_for(|s| s.generation >= 1),
    )
    .await
    .unwrap();
    let reason = status.last_abort.unwrap();
    assert!(reason.resets_store(), "unexpected abort reason: {:?}", reason);

    // The next generation writes the record through a fresh connection
    wait_committed(&log, 0, 1).await;
    assert_eq!(store.cell_count(TABLE), 1);
    assert_eq!(store.connections_opened(), 2);

    // and keeps committing without further aborts
    let commits = handle.status().commits;
    tokio::time::timeout(
        Duration::from_secs(10),
        handle.wait_for(|s| s.commits > commits + 10),
    )
    .await
    .unwrap();
    assert_eq!(handle.generation(), 1);
    assert_eq!(handle.state(), GenerationState::Running);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_archive_message_aborts_generation() {
    let log = InMemoryLog::new();
    log.create_topic("t", 2);
    let store = InMemoryStore::new();
    let handle = start(&log, &store).await;

    let archive = LogMessage::Archive(tidestore_core::ArchiveMessage {
        class_id: 1,
        labels_id: 1,
        data: bytes::Bytes::from_static(b"block"),
    });
    log.append("t", 1, archive.encode()).unwrap();

    let status = tokio::time::timeout(
        Duration::from_secs(10),
        handle.wait_for(|s| s.generation >= 1),
    )
    .await
    .unwrap();
    match status.last_abort {
        Some(AbortReason::WorkerFailure { class, .. }) => {
            assert_eq!(class, FailureClass::PartitionFatal)
        }
        other => panic!("unexpected abort reason: {:?}", other),
    }
    // Not a store failure: the connection is kept
    assert_eq!(store.connections_opened(), 1);
    assert_eq!(log.committed("g", "t", 1), None);

    handle.shutdown().await;
}
