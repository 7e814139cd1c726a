//! Tidestore Storage
//!
//! The durable write path: datapoints arrive on a partitioned log, are
//! verified, decrypted and decoded, buffered per partition and written to a
//! sorted, versioned wide-column store. Log offsets are committed only after
//! the writes they cover are in the store.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────┐   poll    ┌───────────────────┐  append  ┌─────────────┐
//! │ LogStream p  │ ────────► │ PartitionConsumer │ ───────► │ WriteBuffer │
//! └──────────────┘           │  - envelope.open  │          └──────┬──────┘
//!                            │  - decode         │                 │ snapshot
//!                            │  - DeleteExecutor │ ─ force ─┐      ▼
//!                            └───────────────────┘  flush   │ ┌───────────────────┐ batch_write ┌────────────┐
//!                                                           └►│ FlushSynchronizer │ ──────────► │ StoreTable │
//!                                                             └─────────┬─────────┘             └────────────┘
//!                                                                       │ arrive(flushed offset)
//!                                                                       ▼
//!                            ┌───────────────────┐  release  ┌───────────────┐
//!                            │ CommitCoordinator │ ◄───────► │ CommitBarrier │
//!                            └─────────┬─────────┘           └───────────────┘
//!                                      │ commit_offsets
//!                                      ▼
//!                                 LogClient
//! ```
//!
//! ## Failure Handling
//!
//! Messages that fail authentication or decryption are counted and dropped.
//! Every other failure aborts the current *generation*: all workers are
//! stopped, the store connection is recreated when the store was at fault,
//! and a fresh generation resumes from the last committed offsets. Writes are
//! idempotent, so replaying the uncommitted tail is harmless.
//!
//! ## Usage Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tidestore_storage::memory::{InMemoryLog, InMemoryStore};
//! use tidestore_storage::{CommitCoordinator, IngestConfig, IngestContext};
//!
//! let log = InMemoryLog::new();
//! log.create_topic("tidestore-data", 4);
//! let store = InMemoryStore::new();
//!
//! let ctx = IngestContext::build(
//!     IngestConfig::default(),
//!     Arc::new(log.client("tidestore-ingest")),
//!     store.connector(),
//! )
//! .await?;
//! let handle = CommitCoordinator::spawn(ctx);
//! // ...
//! handle.shutdown().await;
//! ```

pub mod abort;
pub mod barrier;
pub mod buffer;
pub mod config;
pub mod consumer;
pub mod coordinator;
pub mod counters;
pub mod delete;
pub mod error;
pub mod log;
pub mod memory;
pub mod pool;
pub mod store;
pub mod synchronizer;

pub use abort::{AbortListener, AbortReason, AbortSignal};
pub use barrier::{BarrierWait, CommitBarrier};
pub use buffer::{BufferSnapshot, WriteBuffer};
pub use config::{IngestConfig, KeysConfig, LifecycleConfig, LogConfig, StoreConfig};
pub use consumer::{MessageDecoder, PartitionConsumer};
pub use coordinator::{
    CommitCoordinator, CoordinatorHandle, CoordinatorStatus, GenerationState, IngestContext,
};
pub use counters::{OffsetCounters, PartitionCounter};
pub use delete::{DeleteExecutor, DeleteOutcome};
pub use error::{FailureClass, Result, StorageError};
pub use log::{LogClient, LogRecord, LogStream, OffsetReset, PartitionOffset};
pub use pool::{connection_identity, StoreConnectionPool};
pub use store::{
    ShardDeleteResult, StoreConnection, StoreConnector, StoreTable, TimeRange, WriteStatus,
};
pub use synchronizer::{FlushSettings, FlushSynchronizer, ForceFlushHandle};
