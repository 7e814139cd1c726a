//! Synthetic Traffic Generator
//!
//! Feeds the in-memory log when the binary runs without external
//! collaborators, so the whole ingest path (envelope, decode, buffer, flush,
//! barrier commit, deletes) is exercised end to end.
//!
//! ## What it produces
//!
//! Every tick one store message per partition, each carrying a block of
//! datapoints for one of `series` series. Every `delete_every` ticks it also
//! emits a delete message for one series that removes everything older than
//! `delete_min_age`. Messages go through the same [`CryptoEnvelope`] the
//! consumers use, so configured MAC and cipher keys apply.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tidestore_core::{
    CryptoEnvelope, Datapoint, DatapointCodec, DeleteMessage, LogMessage, SeriesMetadata,
    StoreMessage, Value, VarintBlockCodec,
};
use tidestore_storage::memory::InMemoryLog;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info};

/// Traffic generator configuration
#[derive(Debug, Clone)]
pub struct TrafficConfig {
    pub topic: String,
    pub partitions: u32,
    /// Time between ticks (default: 100ms)
    pub tick: Duration,
    /// Datapoints per store message (default: 16)
    pub points_per_message: usize,
    /// Distinct series per partition (default: 8)
    pub series: u64,
    /// Emit a delete every this many ticks; 0 disables deletes (default: 600)
    pub delete_every: u64,
    /// Deletes only remove versions older than this (default: 1 minute)
    pub delete_min_age: Duration,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            topic: "tidestore-data".to_string(),
            partitions: 4,
            tick: Duration::from_millis(100),
            points_per_message: 16,
            series: 8,
            delete_every: 600,
            delete_min_age: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TrafficStats {
    pub ticks: u64,
    pub store_messages: u64,
    pub delete_messages: u64,
    pub datapoints: u64,
}

pub struct TrafficGenerator {
    log: Arc<InMemoryLog>,
    envelope: Arc<CryptoEnvelope>,
    config: TrafficConfig,
    stats: TrafficStats,
}

impl TrafficGenerator {
    pub fn new(log: Arc<InMemoryLog>, envelope: Arc<CryptoEnvelope>, config: TrafficConfig) -> Self {
        Self {
            log,
            envelope,
            config,
            stats: TrafficStats::default(),
        }
    }

    pub fn stats(&self) -> &TrafficStats {
        &self.stats
    }

    /// Run until `shutdown_rx` fires.
    pub fn start(mut self, shutdown_rx: oneshot::Receiver<()>) -> JoinHandle<TrafficStats> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.tick);
            let mut shutdown_rx = shutdown_rx;

            info!(
                topic = %self.config.topic,
                partitions = self.config.partitions,
                tick_ms = self.config.tick.as_millis() as u64,
                "Traffic generator started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.tick(now_micros()) {
                            error!(error = %e, "Traffic generator tick failed");
                        }
                    }
                    _ = &mut shutdown_rx => {
                        info!(
                            ticks = self.stats.ticks,
                            datapoints = self.stats.datapoints,
                            "Traffic generator shutting down"
                        );
                        break;
                    }
                }
            }

            self.stats
        })
    }

    /// Append one tick worth of messages with timestamps ending at `now`.
    pub fn tick(&mut self, now: i64) -> anyhow::Result<()> {
        let tick = self.stats.ticks;
        self.stats.ticks += 1;

        for partition in 0..self.config.partitions {
            let labels_id = (tick + partition as u64) % self.config.series.max(1);
            let points: Vec<Datapoint> = (0..self.config.points_per_message)
                .map(|i| {
                    let ts = now - (self.config.points_per_message - i) as i64;
                    Datapoint::new(ts, Value::Double(((tick as f64) + i as f64 / 10.0).sin()))
                })
                .collect();

            let message = LogMessage::Store(StoreMessage {
                class_id: partition as u64 + 1,
                labels_id,
                data: VarintBlockCodec.encode_block(&points),
            });
            self.append(partition, &message)?;
            self.stats.store_messages += 1;
            self.stats.datapoints += points.len() as u64;
        }

        if self.config.delete_every > 0 && tick > 0 && tick % self.config.delete_every == 0 {
            let partition = (tick / self.config.delete_every) as u32 % self.config.partitions;
            let mut labels = std::collections::BTreeMap::new();
            labels.insert(".owner".to_string(), "traffic".to_string());
            labels.insert(".app".to_string(), "tidestore-ingest".to_string());

            let message = LogMessage::Delete(DeleteMessage {
                class_id: partition as u64 + 1,
                labels_id: tick % self.config.series.max(1),
                start: i64::MIN,
                end: i64::MAX,
                min_age_ms: self.config.delete_min_age.as_millis() as i64,
                metadata: Some(SeriesMetadata {
                    name: "synthetic".to_string(),
                    labels,
                }),
            });
            self.append(partition, &message)?;
            self.stats.delete_messages += 1;
        }

        Ok(())
    }

    fn append(&self, partition: u32, message: &LogMessage) -> anyhow::Result<()> {
        let payload = self.envelope.close(message.encode())?;
        let offset = self.log.append(&self.config.topic, partition, payload)?;
        debug!(partition, offset, kind = message.kind_name(), "Appended synthetic message");
        Ok(())
    }
}

fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}
