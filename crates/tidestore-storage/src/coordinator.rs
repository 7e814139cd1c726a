//! Commit Coordinator
//!
//! Owns the generation lifecycle of the ingest pipeline. A generation is one
//! set of workers over the partitions of the topic:
//!
//! ```text
//!                      ┌──────────────────── generation N ────────────────────┐
//!  log ─ stream 0 ───► │ PartitionConsumer 0 ─► WriteBuffer 0 ─► Synchronizer 0 ─┐
//!  log ─ stream 1 ───► │ PartitionConsumer 1 ─► WriteBuffer 1 ─► Synchronizer 1 ─┼─► CommitBarrier
//!  log ─ stream N ───► │ PartitionConsumer N ─► WriteBuffer N ─► Synchronizer N ─┘        │
//!                      └────────────────────────────────────────────────────────┘        ▼
//!                                                                     coordinator: commit offsets, release
//! ```
//!
//! ## Lifecycle
//!
//! ```text
//! Spawning ─► Running ─► Aborting ─► TornDown ─► Spawning (generation + 1)
//!                             │
//!                             └─ shutdown requested ─► Stopped
//! ```
//!
//! - **Spawning**: open the partition streams, fetch store table handles and
//!   start one consumer and one synchronizer per partition
//! - **Running**: once every synchronizer waits at the barrier, commit the
//!   offsets they flushed and release them. A barrier not released within
//!   `max_time_between_commits` is treated as a hung store
//! - **Aborting**: leave the consumer group, raise the abort signal, break the
//!   barrier and join every worker (forcing stragglers to stop)
//! - **TornDown**: recreate the store connection if a reset was requested,
//!   bump the generation and respawn after `respawn_delay`
//!
//! Offsets only ever move to what a synchronizer durably flushed, so a
//! torn-down generation loses nothing: the next one replays from the last
//! commit and the store absorbs the duplicates.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tidestore_core::{
    CryptoEnvelope, DatapointCodec, RowKeyCodec, StorageSealer, VarintBlockCodec,
};
use tidestore_observability::metrics;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::abort::{AbortReason, AbortSignal};
use crate::barrier::CommitBarrier;
use crate::buffer::WriteBuffer;
use crate::config::IngestConfig;
use crate::consumer::{MessageDecoder, PartitionConsumer};
use crate::counters::OffsetCounters;
use crate::delete::DeleteExecutor;
use crate::error::Result;
use crate::log::{LogClient, LogStream};
use crate::pool::StoreConnectionPool;
use crate::store::{StoreConnector, StoreTable};
use crate::synchronizer::{FlushSettings, FlushSynchronizer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    Spawning,
    Running,
    Aborting,
    TornDown,
    Stopped,
}

/// Published on every state change and commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorStatus {
    pub generation: u64,
    pub state: GenerationState,
    /// Successful barrier commits since start
    pub commits: u64,
    /// Reason the previous generation was torn down
    pub last_abort: Option<AbortReason>,
}

/// Everything the coordinator needs to build generations.
pub struct IngestContext {
    pub config: Arc<IngestConfig>,
    pub log: Arc<dyn LogClient>,
    pub pool: Arc<StoreConnectionPool>,
    pub decoder: MessageDecoder,
}

impl IngestContext {
    /// Validate the configuration, load keys and connect to the store.
    pub async fn build(
        config: IngestConfig,
        log: Arc<dyn LogClient>,
        connector: Arc<dyn StoreConnector>,
    ) -> Result<Self> {
        config.validate()?;

        let keys = config.keys.provider()?;
        let envelope = CryptoEnvelope::from_keys(&keys)?;
        let sealer = StorageSealer::from_keys(&keys)?;
        let rowkeys = RowKeyCodec::new(config.store.modulus)?;
        let codec: Arc<dyn DatapointCodec> = Arc::new(VarintBlockCodec);

        let pool = StoreConnectionPool::connect(connector, config.store.connection.clone()).await?;

        tracing::info!(
            topic = %config.log.topic,
            group = %config.log.group_id,
            partitions = config.log.partitions,
            mac = envelope.has_mac(),
            log_cipher = envelope.has_cipher(),
            storage_cipher = sealer.is_encrypting(),
            modulus = config.store.modulus,
            "Ingest context ready"
        );

        Ok(Self {
            config: Arc::new(config),
            log,
            pool: Arc::new(pool),
            decoder: MessageDecoder {
                envelope: Arc::new(envelope),
                sealer: Arc::new(sealer),
                codec,
                rowkeys,
            },
        })
    }
}

/// Store table handle cached per partition across generations.
struct TableSlot {
    table: Arc<dyn StoreTable>,
    pool_version: u64,
    reset: bool,
}

/// Workers of the running generation.
struct Generation {
    abort: Arc<AbortSignal>,
    barrier: Arc<CommitBarrier>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct CommitCoordinator {
    ctx: IngestContext,
    generation: u64,
    commits: u64,
    slots: BTreeMap<u32, TableSlot>,
    counters: Arc<OffsetCounters>,
    status: watch::Sender<CoordinatorStatus>,
}

impl CommitCoordinator {
    /// Start the coordinator task.
    pub fn spawn(ctx: IngestContext) -> CoordinatorHandle {
        let (status, status_rx) = watch::channel(CoordinatorStatus {
            generation: 0,
            state: GenerationState::Spawning,
            commits: 0,
            last_abort: None,
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let coordinator = Self {
            ctx,
            generation: 0,
            commits: 0,
            slots: BTreeMap::new(),
            counters: Arc::new(OffsetCounters::new()),
            status,
        };
        let task = tokio::spawn(coordinator.run(shutdown_rx));

        CoordinatorHandle {
            status: status_rx,
            shutdown: shutdown_tx,
            task,
        }
    }

    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        metrics::GENERATION.set(self.generation as i64);

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.set_state(GenerationState::Spawning);
            let abort = Arc::new(AbortSignal::new());
            let generation = match self.spawn_generation(abort.clone()).await {
                Ok(generation) => {
                    self.set_state(GenerationState::Running);
                    self.supervise(&generation, &mut shutdown).await;
                    generation
                }
                Err(e) => {
                    tracing::error!(
                        generation = self.generation,
                        error = %e,
                        "Failed to spawn generation"
                    );
                    abort.abort(AbortReason::SpawnFailed {
                        class: e.class(),
                        message: e.to_string(),
                    });
                    Generation {
                        abort,
                        barrier: Arc::new(CommitBarrier::new(0)),
                        tasks: Vec::new(),
                    }
                }
            };

            let reason = self.teardown(generation).await;
            if reason == AbortReason::Shutdown {
                break;
            }

            self.generation += 1;
            metrics::GENERATION.set(self.generation as i64);
            self.status.send_modify(|status| {
                status.generation = self.generation;
                status.state = GenerationState::TornDown;
                status.last_abort = Some(reason);
            });

            tokio::select! {
                _ = tokio::time::sleep(self.ctx.config.respawn_delay()) => {}
                _ = shutdown.changed() => {}
            }
        }

        self.set_state(GenerationState::Stopped);
        tracing::info!(
            generation = self.generation,
            commits = self.commits,
            "Commit coordinator stopped"
        );
    }

    /// Open streams, prepare table handles, then start the workers. Nothing
    /// is spawned unless every fallible step succeeded.
    async fn spawn_generation(&mut self, abort: Arc<AbortSignal>) -> Result<Generation> {
        let config = self.ctx.config.clone();
        let streams = self
            .ctx
            .log
            .create_streams(
                &config.log.topic,
                config.log.partitions,
                config.log.offset_reset,
            )
            .await?;

        let mut workers: Vec<(Box<dyn LogStream>, Arc<dyn StoreTable>)> =
            Vec::with_capacity(streams.len());
        for stream in streams {
            let table = self.table_for(stream.partition()).await?;
            workers.push((stream, table));
        }

        self.counters.reset();
        let barrier = Arc::new(CommitBarrier::new(workers.len()));
        let settings = FlushSettings::from_config(&config);
        let mut tasks = Vec::with_capacity(workers.len() * 2);

        for (stream, table) in workers {
            let partition = stream.partition();
            let buffer = Arc::new(WriteBuffer::new(partition));
            let (synchronizer, flusher) = FlushSynchronizer::new(
                buffer.clone(),
                table.clone(),
                barrier.clone(),
                abort.clone(),
                settings.clone(),
            );
            let deletes = DeleteExecutor::new(
                partition,
                flusher,
                table,
                self.ctx.decoder.rowkeys,
            );
            let consumer = PartitionConsumer::new(
                stream,
                buffer,
                deletes,
                self.ctx.decoder.clone(),
                self.counters.clone(),
                abort.clone(),
                config.poll_timeout(),
            );

            let generation = self.generation;
            tasks.push(tokio::spawn(consumer.run().instrument(tracing::info_span!(
                "partition_consumer",
                generation,
                partition
            ))));
            tasks.push(tokio::spawn(synchronizer.run().instrument(tracing::info_span!(
                "flush_synchronizer",
                generation,
                partition
            ))));
        }

        tracing::info!(
            generation = self.generation,
            partitions = barrier.parties(),
            pool_version = self.ctx.pool.version(),
            "Generation started"
        );

        Ok(Generation {
            abort,
            barrier,
            tasks,
        })
    }

    /// Cached table handle for `partition`, refreshed when flagged or when
    /// the pool has moved to a new connection.
    async fn table_for(&mut self, partition: u32) -> Result<Arc<dyn StoreTable>> {
        let version = self.ctx.pool.version();
        if let Some(slot) = self.slots.get(&partition) {
            if !slot.reset && slot.pool_version == version {
                return Ok(slot.table.clone());
            }
        }

        let store = &self.ctx.config.store;
        let table = self
            .ctx
            .pool
            .table(&store.table, &store.column_family)
            .await?;
        self.slots.insert(
            partition,
            TableSlot {
                table: table.clone(),
                pool_version: version,
                reset: false,
            },
        );
        Ok(table)
    }

    /// Commit whenever all synchronizers are at the barrier. Returns once the
    /// generation's abort signal is raised.
    async fn supervise(&mut self, generation: &Generation, shutdown: &mut watch::Receiver<bool>) {
        let mut abort = generation.abort.listener();
        let max_wait = self.ctx.config.max_time_between_commits();
        let poll = self.ctx.config.coordinator_poll();
        let mut last_release = Instant::now();

        loop {
            if abort.is_aborted() {
                return;
            }

            if generation.barrier.all_arrived() {
                if self.commit(generation).await {
                    last_release = Instant::now();
                }
                continue;
            }

            let elapsed = last_release.elapsed();
            if elapsed > max_wait {
                metrics::OVERDUE_COMMITS_TOTAL.inc();
                tracing::warn!(
                    generation = self.generation,
                    elapsed_ms = elapsed.as_millis() as u64,
                    waiting = generation.barrier.waiting(),
                    parties = generation.barrier.parties(),
                    "Commit overdue, assuming a hung store"
                );
                generation.abort.abort(AbortReason::CommitOverdue { elapsed });
                return;
            }

            tokio::select! {
                _ = abort.aborted() => return,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        generation.abort.abort(AbortReason::Shutdown);
                        return;
                    }
                }
                _ = generation.barrier.wait_for_arrivals(poll) => {}
            }
        }
    }

    /// Commit the offsets reported at the barrier and release it.
    async fn commit(&mut self, generation: &Generation) -> bool {
        let offsets = generation.barrier.arrived_offsets();
        if !offsets.is_empty() {
            if let Err(e) = self.ctx.log.commit_offsets(&offsets).await {
                tracing::error!(
                    generation = self.generation,
                    error = %e,
                    "Failed to commit offsets"
                );
                generation
                    .abort
                    .abort(AbortReason::CommitFailed(e.to_string()));
                return false;
            }
        }

        self.counters.publish();
        metrics::LOG_COMMITS_TOTAL.inc();
        self.commits += 1;
        self.status.send_modify(|status| status.commits = self.commits);
        generation.barrier.release();

        tracing::debug!(
            generation = self.generation,
            partitions = offsets.len(),
            commits = self.commits,
            "Committed offsets"
        );
        true
    }

    /// Stop every worker of the generation and prepare the store for the
    /// next one. Returns why the generation ended.
    async fn teardown(&mut self, generation: Generation) -> AbortReason {
        self.set_state(GenerationState::Aborting);
        let reason = generation
            .abort
            .reason()
            .unwrap_or(AbortReason::Shutdown);

        self.ctx.log.shutdown().await;
        generation.abort.abort(reason.clone());
        generation.barrier.break_barrier();
        self.join_workers(generation.tasks).await;

        if reason != AbortReason::Shutdown {
            metrics::GENERATION_ABORTS_TOTAL
                .with_label_values(&[reason.label()])
                .inc();
            tracing::warn!(
                generation = self.generation,
                reason = reason.label(),
                detail = ?reason,
                "Generation aborted"
            );
        }

        if reason.resets_store() {
            for slot in self.slots.values_mut() {
                slot.reset = true;
            }
            self.ctx.pool.request_reset();
        }
        if let Err(e) = self.ctx.pool.reset_if_requested().await {
            tracing::error!(
                generation = self.generation,
                error = %e,
                "Failed to recreate store connection, retrying next teardown"
            );
        }

        reason
    }

    /// Join with bounded retries; tasks that do not stop in time are cancelled.
    async fn join_workers(&self, tasks: Vec<JoinHandle<()>>) {
        let retry = self.ctx.config.join_retry_interval();
        let max_attempts = self.ctx.config.lifecycle.join_max_attempts;

        for mut task in tasks {
            let mut attempts = 0;
            loop {
                attempts += 1;
                match tokio::time::timeout(retry, &mut task).await {
                    Ok(_) => break,
                    Err(_) if attempts >= max_attempts => {
                        tracing::error!(
                            generation = self.generation,
                            attempts,
                            "Worker did not stop, abandoning it"
                        );
                        break;
                    }
                    Err(_) => {
                        tracing::debug!(
                            generation = self.generation,
                            attempts,
                            "Worker still running, cancelling"
                        );
                        task.abort();
                    }
                }
            }
        }
    }

    fn set_state(&self, state: GenerationState) {
        self.status.send_modify(|status| status.state = state);
    }
}

/// Owner's handle on a running coordinator.
pub struct CoordinatorHandle {
    status: watch::Receiver<CoordinatorStatus>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl CoordinatorHandle {
    pub fn generation(&self) -> u64 {
        self.status.borrow().generation
    }

    pub fn state(&self) -> GenerationState {
        self.status.borrow().state
    }

    pub fn status(&self) -> CoordinatorStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CoordinatorStatus> {
        self.status.clone()
    }

    /// Wait until `predicate` holds for the published status.
    pub async fn wait_for<F>(&self, predicate: F) -> CoordinatorStatus
    where
        F: FnMut(&CoordinatorStatus) -> bool,
    {
        let mut rx = self.status.clone();
        if let Ok(status) = rx.wait_for(predicate).await {
            return status.clone();
        }
        let status = rx.borrow().clone();
        status
    }

    /// Drain the current generation and stop.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Commit coordinator task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryLog, InMemoryStore};
    use std::time::Duration;
    use tidestore_core::{Datapoint, LogMessage, StoreMessage, Value};

    fn config() -> IngestConfig {
        let mut config = IngestConfig::default();
        config.log.topic = "t".to_string();
        config.log.partitions = 2;
        config.log.commit_period_ms = 20;
        config.log.max_time_between_commits_ms = 500;
        config.log.poll_timeout_ms = 10;
        config.lifecycle.respawn_delay_ms = 10;
        config.lifecycle.join_retry_interval_ms = 50;
        config
    }

    #[tokio::test]
    async fn test_commits_flushed_offsets() {
        let log = InMemoryLog::new();
        log.create_topic("t", 2);
        let store = InMemoryStore::new();
        let ctx = IngestContext::build(config(), Arc::new(log.client("g")), store.connector())
            .await
            .unwrap();
        let handle = CommitCoordinator::spawn(ctx);

        let message = LogMessage::Store(StoreMessage {
            class_id: 1,
            labels_id: 1,
            data: VarintBlockCodec.encode_block(&[Datapoint::new(5, Value::Double(0.5))]),
        });
        log.append("t", 1, message.encode()).unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while log.committed("g", "t", 1) != Some(1) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(store.cell_count("continuum"), 1);
        assert_eq!(log.committed("g", "t", 0), None);
        assert_eq!(handle.generation(), 0);
        assert_eq!(handle.state(), GenerationState::Running);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_retries_with_new_generation() {
        let log = InMemoryLog::new();
        let store = InMemoryStore::new();
        let ctx = IngestContext::build(config(), Arc::new(log.client("g")), store.connector())
            .await
            .unwrap();
        let handle = CommitCoordinator::spawn(ctx);

        // Topic is missing at first
        let status = tokio::time::timeout(
            Duration::from_secs(5),
            handle.wait_for(|s| s.generation >= 1),
        )
        .await
        .unwrap();
        assert!(matches!(
            status.last_abort,
            Some(AbortReason::SpawnFailed { .. })
        ));

        log.create_topic("t", 2);
        tokio::time::timeout(
            Duration::from_secs(5),
            handle.wait_for(|s| s.state == GenerationState::Running && s.commits > 0),
        )
        .await
        .unwrap();

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_does_not_count_as_abort() {
        let log = InMemoryLog::new();
        log.create_topic("t", 2);
        let store = InMemoryStore::new();
        let ctx = IngestContext::build(config(), Arc::new(log.client("g")), store.connector())
            .await
            .unwrap();
        let handle = CommitCoordinator::spawn(ctx);
        let status_rx = handle.subscribe();

        tokio::time::timeout(
            Duration::from_secs(5),
            handle.wait_for(|s| s.commits > 0),
        )
        .await
        .unwrap();
        handle.shutdown().await;

        let status = status_rx.borrow().clone();
        assert_eq!(status.state, GenerationState::Stopped);
        assert_eq!(status.generation, 0);
        assert_eq!(status.last_abort, None);
    }
}
