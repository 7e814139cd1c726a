use lazy_static::lazy_static;
use prometheus::core::Collector;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};
use std::sync::Once;

static INIT: Once = Once::new();

lazy_static! {
    /// Global Prometheus metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Log Consumption Metrics
    // ============================================================================

    /// Messages read from the log
    pub static ref MESSAGES_CONSUMED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tidestore_messages_consumed_total", "Total log messages consumed"),
        &["partition"]
    ).expect("metric can be created");

    /// Raw bytes read from the log (before envelope removal)
    pub static ref BYTES_CONSUMED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tidestore_bytes_consumed_total", "Total log bytes consumed"),
        &["partition"]
    ).expect("metric can be created");

    /// Messages dropped because their MAC did not verify
    pub static ref FAILED_MACS_TOTAL: IntCounter = IntCounter::new(
        "tidestore_failed_macs_total",
        "Messages dropped after MAC verification failure"
    ).expect("metric can be created");

    /// Messages dropped because their payload did not decrypt
    pub static ref FAILED_DECRYPTS_TOTAL: IntCounter = IntCounter::new(
        "tidestore_failed_decrypts_total",
        "Messages dropped after decryption failure"
    ).expect("metric can be created");

    pub static ref BLOCKS_DECODED_TOTAL: IntCounter = IntCounter::new(
        "tidestore_blocks_decoded_total",
        "Datapoint blocks decoded from store messages"
    ).expect("metric can be created");

    pub static ref DATAPOINTS_BUFFERED_TOTAL: IntCounter = IntCounter::new(
        "tidestore_datapoints_buffered_total",
        "Datapoints appended to write buffers"
    ).expect("metric can be created");

    // ============================================================================
    // Store Write Metrics
    // ============================================================================

    /// Batches accepted by the store
    pub static ref BATCH_WRITES_TOTAL: IntCounter = IntCounter::new(
        "tidestore_batch_writes_total",
        "Batch writes committed to the store"
    ).expect("metric can be created");

    pub static ref DATAPOINTS_WRITTEN_TOTAL: IntCounter = IntCounter::new(
        "tidestore_datapoints_written_total",
        "Datapoints written to the store"
    ).expect("metric can be created");

    /// Datapoints flushed while store writes are disabled
    pub static ref DATAPOINTS_SKIPPED_TOTAL: IntCounter = IntCounter::new(
        "tidestore_datapoints_skipped_total",
        "Datapoints flushed in skip-write mode"
    ).expect("metric can be created");

    pub static ref BATCH_WRITE_FAILURES_TOTAL: IntCounter = IntCounter::new(
        "tidestore_batch_write_failures_total",
        "Batch writes rejected by the store"
    ).expect("metric can be created");

    /// Batch write latency
    pub static ref BATCH_WRITE_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new("tidestore_batch_write_latency_seconds", "Batch write latency in seconds")
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
    ).expect("metric can be created");

    // ============================================================================
    // Commit Coordination Metrics
    // ============================================================================

    pub static ref BARRIER_SYNCS_TOTAL: IntCounter = IntCounter::new(
        "tidestore_barrier_syncs_total",
        "Synchronizer arrivals at the commit barrier"
    ).expect("metric can be created");

    pub static ref LOG_COMMITS_TOTAL: IntCounter = IntCounter::new(
        "tidestore_log_commits_total",
        "Offset commits to the log"
    ).expect("metric can be created");

    pub static ref OVERDUE_COMMITS_TOTAL: IntCounter = IntCounter::new(
        "tidestore_overdue_commits_total",
        "Commits that missed the maximum time between commits"
    ).expect("metric can be created");

    /// Generation aborts by reason (commit_overdue, worker_failure, ...)
    pub static ref GENERATION_ABORTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tidestore_generation_aborts_total", "Aborted consumer generations"),
        &["reason"]
    ).expect("metric can be created");

    pub static ref CONNECTION_RESETS_TOTAL: IntCounter = IntCounter::new(
        "tidestore_connection_resets_total",
        "Store connections recreated"
    ).expect("metric can be created");

    /// Current consumer generation
    pub static ref GENERATION: IntGauge = IntGauge::new(
        "tidestore_generation",
        "Current consumer generation"
    ).expect("metric can be created");

    /// Last offset seen per partition
    pub static ref PARTITION_OFFSET: IntGaugeVec = IntGaugeVec::new(
        Opts::new("tidestore_partition_offset", "Last consumed offset"),
        &["partition"]
    ).expect("metric can be created");

    /// High watermark minus last seen offset
    pub static ref PARTITION_LAG: IntGaugeVec = IntGaugeVec::new(
        Opts::new("tidestore_partition_lag", "Consumer lag in messages"),
        &["partition"]
    ).expect("metric can be created");

    // ============================================================================
    // Delete Metrics
    // ============================================================================

    pub static ref DELETE_OPS_TOTAL: IntCounter = IntCounter::new(
        "tidestore_delete_ops_total",
        "Range deletes executed"
    ).expect("metric can be created");

    pub static ref DELETE_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new("tidestore_delete_latency_seconds", "Range delete latency in seconds")
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
    ).expect("metric can be created");

    pub static ref DELETE_REGIONS_TOTAL: IntCounter = IntCounter::new(
        "tidestore_delete_regions_total",
        "Store shards touched by range deletes"
    ).expect("metric can be created");

    pub static ref DELETE_DATAPOINTS_TOTAL: IntCounter = IntCounter::new(
        "tidestore_delete_datapoints_total",
        "Datapoint versions removed by range deletes"
    ).expect("metric can be created");

    pub static ref DELETE_OWNER_OPS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tidestore_delete_owner_ops_total", "Range deletes per owner"),
        &["owner"]
    ).expect("metric can be created");

    pub static ref DELETE_OWNER_DATAPOINTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tidestore_delete_owner_datapoints_total", "Deleted datapoints per owner"),
        &["owner"]
    ).expect("metric can be created");

    pub static ref DELETE_APP_OPS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tidestore_delete_app_ops_total", "Range deletes per application"),
        &["app"]
    ).expect("metric can be created");

    pub static ref DELETE_APP_DATAPOINTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tidestore_delete_app_datapoints_total", "Deleted datapoints per application"),
        &["app"]
    ).expect("metric can be created");
}

/// Register every metric with [`REGISTRY`]. Safe to call more than once.
pub fn init() {
    INIT.call_once(|| {
        let collectors: Vec<Box<dyn Collector>> = vec![
            // Log consumption
            Box::new(MESSAGES_CONSUMED_TOTAL.clone()),
            Box::new(BYTES_CONSUMED_TOTAL.clone()),
            Box::new(FAILED_MACS_TOTAL.clone()),
            Box::new(FAILED_DECRYPTS_TOTAL.clone()),
            Box::new(BLOCKS_DECODED_TOTAL.clone()),
            Box::new(DATAPOINTS_BUFFERED_TOTAL.clone()),
            // Store writes
            Box::new(BATCH_WRITES_TOTAL.clone()),
            Box::new(DATAPOINTS_WRITTEN_TOTAL.clone()),
            Box::new(DATAPOINTS_SKIPPED_TOTAL.clone()),
            Box::new(BATCH_WRITE_FAILURES_TOTAL.clone()),
            Box::new(BATCH_WRITE_LATENCY.clone()),
            // Commit coordination
            Box::new(BARRIER_SYNCS_TOTAL.clone()),
            Box::new(LOG_COMMITS_TOTAL.clone()),
            Box::new(OVERDUE_COMMITS_TOTAL.clone()),
            Box::new(GENERATION_ABORTS_TOTAL.clone()),
            Box::new(CONNECTION_RESETS_TOTAL.clone()),
            Box::new(GENERATION.clone()),
            Box::new(PARTITION_OFFSET.clone()),
            Box::new(PARTITION_LAG.clone()),
            // Deletes
            Box::new(DELETE_OPS_TOTAL.clone()),
            Box::new(DELETE_LATENCY.clone()),
            Box::new(DELETE_REGIONS_TOTAL.clone()),
            Box::new(DELETE_DATAPOINTS_TOTAL.clone()),
            Box::new(DELETE_OWNER_OPS_TOTAL.clone()),
            Box::new(DELETE_OWNER_DATAPOINTS_TOTAL.clone()),
            Box::new(DELETE_APP_OPS_TOTAL.clone()),
            Box::new(DELETE_APP_DATAPOINTS_TOTAL.clone()),
        ];

        for collector in collectors {
            REGISTRY
                .register(collector)
                .expect("metric can be registered");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        init();
        init();
        let names: Vec<String> = REGISTRY
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"tidestore_generation".to_string()));
    }

    #[test]
    fn test_partition_gauges() {
        PARTITION_OFFSET.with_label_values(&["test-7"]).set(1000);
        PARTITION_LAG.with_label_values(&["test-7"]).set(12);

        assert_eq!(PARTITION_OFFSET.with_label_values(&["test-7"]).get(), 1000);
        assert_eq!(PARTITION_LAG.with_label_values(&["test-7"]).get(), 12);
    }

    #[test]
    fn test_delete_owner_counters() {
        DELETE_OWNER_OPS_TOTAL.with_label_values(&["test-owner"]).inc();
        DELETE_OWNER_DATAPOINTS_TOTAL
            .with_label_values(&["test-owner"])
            .inc_by(42);

        assert_eq!(DELETE_OWNER_OPS_TOTAL.with_label_values(&["test-owner"]).get(), 1);
        assert_eq!(
            DELETE_OWNER_DATAPOINTS_TOTAL
                .with_label_values(&["test-owner"])
                .get(),
            42
        );
    }
}
