//! Per-partition offset counters, reset on every generation and published
//! to Prometheus after each commit.

use std::collections::BTreeMap;
use std::sync::Mutex;

use tidestore_observability::metrics;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionCounter {
    pub offset: u64,
    pub high_watermark: Option<u64>,
}

impl PartitionCounter {
    /// Records appended after the last seen one, if the log reports a watermark.
    pub fn lag(&self) -> Option<u64> {
        self.high_watermark
            .map(|hw| hw.saturating_sub(self.offset.saturating_add(1)))
    }
}

#[derive(Debug, Default)]
pub struct OffsetCounters {
    partitions: Mutex<BTreeMap<u32, PartitionCounter>>,
}

impl OffsetCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, partition: u32, offset: u64, high_watermark: Option<u64>) {
        let mut partitions = self.lock();
        let counter = partitions.entry(partition).or_default();
        counter.offset = offset;
        if high_watermark.is_some() {
            counter.high_watermark = high_watermark;
        }
    }

    pub fn reset(&self) {
        self.lock().clear();
    }

    pub fn snapshot(&self) -> BTreeMap<u32, PartitionCounter> {
        self.lock().clone()
    }

    pub fn publish(&self) {
        for (partition, counter) in self.snapshot() {
            let label = partition.to_string();
            metrics::PARTITION_OFFSET
                .with_label_values(&[&label])
                .set(counter.offset as i64);
            if let Some(lag) = counter.lag() {
                metrics::PARTITION_LAG
                    .with_label_values(&[&label])
                    .set(lag as i64);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<u32, PartitionCounter>> {
        self.partitions.lock().unwrap_or_else(|e| e.into_inner())
    }
}
