//! In-memory partitioned log with consumer group offsets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;

use crate::error::{Result, StorageError};
use crate::log::{LogClient, LogRecord, LogStream, OffsetReset, PartitionOffset};

#[derive(Default)]
struct LogState {
    topics: HashMap<String, Vec<Vec<Bytes>>>,
    committed: HashMap<(String, String, u32), u64>,
    commits: Vec<(String, Vec<PartitionOffset>)>,
}

/// Shared log "cluster". Clients for different groups see the same records.
#[derive(Default)]
pub struct InMemoryLog {
    state: Mutex<LogState>,
    appended: Notify,
}

impl InMemoryLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn create_topic(&self, topic: &str, partitions: u32) {
        let mut state = self.lock();
        state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions as usize]);
    }

    /// Append a record and return its offset.
    pub fn append(&self, topic: &str, partition: u32, payload: Bytes) -> Result<u64> {
        let offset = {
            let mut state = self.lock();
            let partitions = state
                .topics
                .get_mut(topic)
                .ok_or_else(|| StorageError::Log(format!("unknown topic {}", topic)))?;
            let records = partitions.get_mut(partition as usize).ok_or_else(|| {
                StorageError::Log(format!("unknown partition {}/{}", topic, partition))
            })?;
            records.push(payload);
            (records.len() - 1) as u64
        };
        self.appended.notify_waiters();
        Ok(offset)
    }

    pub fn committed(&self, group: &str, topic: &str, partition: u32) -> Option<u64> {
        self.lock()
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// Every commit call made by `group`, in order.
    pub fn commit_history(&self, group: &str) -> Vec<Vec<PartitionOffset>> {
        self.lock()
            .commits
            .iter()
            .filter(|(g, _)| g == group)
            .map(|(_, offsets)| offsets.clone())
            .collect()
    }

    pub fn end_offset(&self, topic: &str, partition: u32) -> u64 {
        self.lock()
            .topics
            .get(topic)
            .and_then(|p| p.get(partition as usize))
            .map(|records| records.len() as u64)
            .unwrap_or(0)
    }

    /// A consumer group member on this log.
    pub fn client(self: &Arc<Self>, group: &str) -> InMemoryLogClient {
        InMemoryLogClient {
            log: self.clone(),
            group: group.to_string(),
            session: Mutex::new(None),
        }
    }

    fn read(&self, topic: &str, partition: u32, offset: u64) -> Option<LogRecord> {
        let state = self.lock();
        let records = state.topics.get(topic)?.get(partition as usize)?;
        records.get(offset as usize).map(|payload| LogRecord {
            partition,
            offset,
            payload: payload.clone(),
            high_watermark: Some(records.len() as u64),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct Session {
    topic: String,
    closed: Arc<AtomicBool>,
}

pub struct InMemoryLogClient {
    log: Arc<InMemoryLog>,
    group: String,
    session: Mutex<Option<Session>>,
}

impl InMemoryLogClient {
    fn lock_session(&self) -> std::sync::MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl LogClient for InMemoryLogClient {
    async fn create_streams(
        &self,
        topic: &str,
        partitions: u32,
        reset: OffsetReset,
    ) -> Result<Vec<Box<dyn LogStream>>> {
        let available = {
            let state = self.log.lock();
            state
                .topics
                .get(topic)
                .map(|p| p.len() as u32)
                .ok_or_else(|| StorageError::Log(format!("unknown topic {}", topic)))?
        };
        if partitions > available {
            return Err(StorageError::Log(format!(
                "topic {} has {} partitions, {} requested",
                topic, available, partitions
            )));
        }

        let closed = Arc::new(AtomicBool::new(false));
        let mut streams: Vec<Box<dyn LogStream>> = Vec::with_capacity(partitions as usize);
        for partition in 0..partitions {
            let next = match self.log.committed(&self.group, topic, partition) {
                Some(offset) => offset,
                None => match reset {
                    OffsetReset::Earliest => 0,
                    OffsetReset::Latest => self.log.end_offset(topic, partition),
                    OffsetReset::None => {
                        return Err(StorageError::Log(format!(
                            "no committed offset for {}/{}",
                            topic, partition
                        )))
                    }
                },
            };
            streams.push(Box::new(InMemoryStream {
                log: self.log.clone(),
                topic: topic.to_string(),
                partition,
                next,
                closed: closed.clone(),
            }));
        }

        let previous = self.lock_session().replace(Session {
            topic: topic.to_string(),
            closed,
        });
        if let Some(previous) = previous {
            previous.closed.store(true, Ordering::Release);
        }

        Ok(streams)
    }

    async fn commit_offsets(&self, offsets: &[PartitionOffset]) -> Result<()> {
        let topic = self
            .lock_session()
            .as_ref()
            .map(|s| s.topic.clone())
            .ok_or_else(|| StorageError::Log("commit without an open session".to_string()))?;

        let mut state = self.log.lock();
        for offset in offsets {
            state.committed.insert(
                (self.group.clone(), topic.clone(), offset.partition),
                offset.offset,
            );
        }
        state.commits.push((self.group.clone(), offsets.to_vec()));
        Ok(())
    }

    async fn shutdown(&self) {
        if let Some(session) = self.lock_session().take() {
            session.closed.store(true, Ordering::Release);
        }
        self.log.appended.notify_waiters();
    }
}

struct InMemoryStream {
    log: Arc<InMemoryLog>,
    topic: String,
    partition: u32,
    next: u64,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl LogStream for InMemoryStream {
    fn partition(&self) -> u32 {
        self.partition
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Option<LogRecord>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let appended = self.log.appended.notified();
            if self.closed.load(Ordering::Acquire) {
                return Ok(None);
            }
            if let Some(record) = self.log.read(&self.topic, self.partition, self.next) {
                self.next += 1;
                return Ok(Some(record));
            }
            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(None);
            }
        }
    }
}
