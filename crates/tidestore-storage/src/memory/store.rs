//! In-memory sorted store with versioned cells, shards and fault injection.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tidestore_core::{PendingWrite, ScanRange};

use crate::error::{Result, StorageError};
use crate::store::{
    ShardDeleteResult, StoreConnection, StoreConnector, StoreTable, TimeRange, WriteStatus,
};

/// One-shot failure applied to the next `batch_write`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteFault {
    /// The store returns no result for the last write of the batch
    NullResult,
    /// The last write of the batch fails
    ItemFailure(String),
    /// The whole call fails
    IoError(String),
    /// The call blocks this long before writing
    Hang(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CellKey {
    pub row: Bytes,
    pub family: String,
    pub qualifier: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellVersion {
    pub timestamp_ms: i64,
    pub value: Bytes,
}

type Cells = BTreeMap<CellKey, Vec<CellVersion>>;

#[derive(Default)]
struct StoreState {
    tables: HashMap<String, Cells>,
    faults: VecDeque<WriteFault>,
    batches: u64,
    clock_override: Option<i64>,
}

pub struct InMemoryStore {
    state: Mutex<StoreState>,
    split_points: Vec<Bytes>,
    max_versions: usize,
    connections: AtomicU64,
}

impl InMemoryStore {
    /// Single shard, one version per cell.
    pub fn new() -> Arc<Self> {
        Self::with_split_points(Vec::new())
    }

    /// Shard `i` holds rows in `[split_points[i-1], split_points[i])`.
    pub fn with_split_points(mut split_points: Vec<Bytes>) -> Arc<Self> {
        split_points.sort();
        split_points.dedup();
        Arc::new(Self {
            state: Mutex::new(StoreState::default()),
            split_points,
            max_versions: 1,
            connections: AtomicU64::new(0),
        })
    }

    pub fn connector(self: &Arc<Self>) -> Arc<dyn StoreConnector> {
        Arc::new(InMemoryConnector {
            store: self.clone(),
        })
    }

    pub fn inject_write_fault(&self, fault: WriteFault) {
        self.lock().faults.push_back(fault);
    }

    /// Fix the version timestamp given to new writes.
    pub fn set_clock(&self, now_ms: i64) {
        self.lock().clock_override = Some(now_ms);
    }

    pub fn connections_opened(&self) -> u64 {
        self.connections.load(Ordering::Acquire)
    }

    /// Batches that reached the store successfully.
    pub fn batches_written(&self) -> u64 {
        self.lock().batches
    }

    /// Latest version of every cell of `table`, in key order.
    pub fn cells(&self, table: &str) -> Vec<(CellKey, Bytes)> {
        self.lock()
            .tables
            .get(table)
            .map(|cells| {
                cells
                    .iter()
                    .filter_map(|(key, versions)| {
                        versions.first().map(|v| (key.clone(), v.value.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn cell_count(&self, table: &str) -> usize {
        self.lock().tables.get(table).map(|c| c.len()).unwrap_or(0)
    }

    fn shard_of(&self, row: &[u8]) -> usize {
        self.split_points
            .iter()
            .take_while(|split| split.as_ref() <= row)
            .count()
    }

    fn shard_bounds(&self, shard: usize) -> (Option<&Bytes>, Option<&Bytes>) {
        let lower = shard.checked_sub(1).and_then(|i| self.split_points.get(i));
        (lower, self.split_points.get(shard))
    }

    fn now_ms(&self, state: &StoreState) -> i64 {
        state.clock_override.unwrap_or_else(now_ms)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

struct InMemoryConnector {
    store: Arc<InMemoryStore>,
}

#[async_trait]
impl StoreConnector for InMemoryConnector {
    async fn connect(
        &self,
        _properties: &BTreeMap<String, String>,
    ) -> Result<Arc<dyn StoreConnection>> {
        self.store.connections.fetch_add(1, Ordering::AcqRel);
        Ok(Arc::new(InMemoryConnection {
            store: self.store.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

struct InMemoryConnection {
    store: Arc<InMemoryStore>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl StoreConnection for InMemoryConnection {
    async fn table(&self, name: &str, column_family: &str) -> Result<Arc<dyn StoreTable>> {
        if self.is_closed() {
            return Err(StorageError::Store("connection closed".to_string()));
        }
        self.store
            .lock()
            .tables
            .entry(name.to_string())
            .or_default();
        Ok(Arc::new(InMemoryTable {
            store: self.store.clone(),
            name: name.to_string(),
            family: column_family.to_string(),
            closed: self.closed.clone(),
        }))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

struct InMemoryTable {
    store: Arc<InMemoryStore>,
    name: String,
    family: String,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl StoreTable for InMemoryTable {
    fn name(&self) -> &str {
        &self.name
    }

    async fn batch_write(&self, writes: &[PendingWrite]) -> Result<Vec<WriteStatus>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Store("connection closed".to_string()));
        }

        let fault = self.store.lock().faults.pop_front();
        if let Some(WriteFault::Hang(duration)) = &fault {
            tokio::time::sleep(*duration).await;
        }
        if let Some(WriteFault::IoError(message)) = &fault {
            return Err(StorageError::Store(message.clone()));
        }

        let mut state = self.store.lock();
        let now = self.store.now_ms(&state);
        let max_versions = self.store.max_versions;
        let cells = state.tables.entry(self.name.clone()).or_default();

        let mut statuses: Vec<WriteStatus> = Vec::with_capacity(writes.len());
        for write in writes {
            let key = CellKey {
                row: write.row_key.clone(),
                family: self.family.clone(),
                qualifier: write.qualifier.clone().unwrap_or_default(),
            };
            let versions = cells.entry(key).or_default();
            versions.insert(
                0,
                CellVersion {
                    timestamp_ms: now,
                    value: write.value.clone(),
                },
            );
            versions.truncate(max_versions);
            statuses.push(Some(Ok(())));
        }

        match fault {
            Some(WriteFault::NullResult) => {
                if let Some(last) = statuses.last_mut() {
                    *last = None;
                }
            }
            Some(WriteFault::ItemFailure(message)) => {
                if let Some(last) = statuses.last_mut() {
                    *last = Some(Err(message));
                }
            }
            _ => state.batches += 1,
        }

        Ok(statuses)
    }

    async fn range_delete_versions(
        &self,
        range: &ScanRange,
        time_range: TimeRange,
        _batch_hint: usize,
    ) -> Result<Vec<ShardDeleteResult>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Store("connection closed".to_string()));
        }

        let mut state = self.store.lock();
        let cells = state.tables.entry(self.name.clone()).or_default();

        let shard_count = self.store.split_points.len() + 1;
        let mut rows: Vec<BTreeSet<Bytes>> = vec![BTreeSet::new(); shard_count];
        let mut versions_deleted = vec![0u64; shard_count];

        let start = CellKey {
            row: range.start_key.clone(),
            family: String::new(),
            qualifier: Bytes::new(),
        };
        let mut emptied = Vec::new();
        for (key, versions) in cells.range_mut((Bound::Included(start), Bound::Unbounded)) {
            if key.row.as_ref() >= range.stop_key.as_ref() {
                break;
            }
            if key.family != self.family {
                continue;
            }
            let before = versions.len();
            versions.retain(|v| !time_range.contains(v.timestamp_ms));
            let removed = (before - versions.len()) as u64;
            if removed > 0 {
                let shard = self.store.shard_of(&key.row);
                rows[shard].insert(key.row.clone());
                versions_deleted[shard] += removed;
            }
            if versions.is_empty() {
                emptied.push(key.clone());
            }
        }
        for key in emptied {
            cells.remove(&key);
        }

        let results = (0..shard_count)
            .filter(|&shard| {
                let (lower, upper) = self.store.shard_bounds(shard);
                let starts_before_stop = lower.map_or(true, |l| l.as_ref() < range.stop_key.as_ref());
                let ends_after_start = upper.map_or(true, |u| u.as_ref() > range.start_key.as_ref());
                starts_before_stop && ends_after_start
            })
            .map(|shard| ShardDeleteResult {
                shard: format!("{}-{}", self.name, shard),
                rows_deleted: rows[shard].len() as u64,
                versions_deleted: versions_deleted[shard],
            })
            .collect();

        Ok(results)
    }
}
