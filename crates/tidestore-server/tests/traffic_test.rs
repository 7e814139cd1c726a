//! Soak-style test: synthetic traffic through the full pipeline with keys
//! configured, as the binary runs it.

use std::sync::Arc;
use std::time::Duration;

use tidestore_core::CryptoEnvelope;
use tidestore_server::{settings, TrafficConfig, TrafficGenerator};
use tidestore_storage::memory::{InMemoryLog, InMemoryStore};
use tidestore_storage::{CommitCoordinator, IngestConfig, IngestContext};

#[tokio::test]
async fn test_synthetic_traffic_is_ingested() {
    let mut config = IngestConfig::default();
    settings::apply_env_overrides(&mut config, |name| match name {
        "TIDESTORE_TOPIC" => Some("soak".to_string()),
        "TIDESTORE_PARTITIONS" => Some("3".to_string()),
        "TIDESTORE_COMMIT_PERIOD_MS" => Some("20".to_string()),
        "TIDESTORE_LOG_MAC_KEY" => Some("0f0e0d0c0b0a09080706050403020100".to_string()),
        "TIDESTORE_STORAGE_CIPHER_KEY" => Some("00112233445566778899aabbccddeeff".to_string()),
        _ => None,
    })
    .unwrap();
    config.log.poll_timeout_ms = 10;

    let log = InMemoryLog::new();
    log.create_topic("soak", 3);
    let store = InMemoryStore::new();

    let envelope = CryptoEnvelope::from_keys(&config.keys.provider().unwrap()).unwrap();
    let traffic = TrafficGenerator::new(
        log.clone(),
        Arc::new(envelope),
        TrafficConfig {
            topic: "soak".to_string(),
            partitions: 3,
            tick: Duration::from_millis(5),
            points_per_message: 4,
            series: 2,
            delete_every: 0,
            ..TrafficConfig::default()
        },
    );

    let ctx = IngestContext::build(config, Arc::new(log.client("soak-group")), store.connector())
        .await
        .unwrap();
    let coordinator = CommitCoordinator::spawn(ctx);

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel();
    let traffic = traffic.start(stop_rx);
    tokio::time::sleep(Duration::from_millis(200)).await;
    stop_tx.send(()).unwrap();
    let stats = traffic.await.unwrap();
    assert!(stats.store_messages > 0);

    // Everything produced is eventually committed
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let done = (0..3).all(|p| {
                log.committed("soak-group", "soak", p) == Some(log.end_offset("soak", p))
            });
            if done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert!(store.cell_count("continuum") > 0);
    assert_eq!(coordinator.generation(), 0);
    coordinator.shutdown().await;
}
