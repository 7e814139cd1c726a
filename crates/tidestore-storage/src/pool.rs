//! Store Connection Pool
//!
//! Holds the one shared store connection all workers use. The connection is
//! identified by a SHA-256 digest of its sorted properties, so two pools built
//! from the same properties log the same identity.
//!
//! Workers that hit a store failure only *request* a reset. The coordinator
//! performs it during teardown, once every worker of the generation has
//! stopped: a new connection is opened, swapped in atomically, the old one is
//! closed and the version counter moves on.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tidestore_observability::metrics;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::store::{StoreConnection, StoreConnector, StoreTable};

pub struct StoreConnectionPool {
    connector: Arc<dyn StoreConnector>,
    properties: BTreeMap<String, String>,
    identity: String,
    current: RwLock<Arc<dyn StoreConnection>>,
    version: AtomicU64,
    reset_requested: AtomicBool,
}

impl StoreConnectionPool {
    pub async fn connect(
        connector: Arc<dyn StoreConnector>,
        properties: BTreeMap<String, String>,
    ) -> Result<Self> {
        let identity = connection_identity(&properties);
        let connection = connector.connect(&properties).await?;

        tracing::info!(identity = %identity, "Store connection established");

        Ok(Self {
            connector,
            properties,
            identity,
            current: RwLock::new(connection),
            version: AtomicU64::new(0),
            reset_requested: AtomicBool::new(false),
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Incremented every time the connection is replaced.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub async fn current(&self) -> Arc<dyn StoreConnection> {
        self.current.read().await.clone()
    }

    pub async fn table(&self, name: &str, column_family: &str) -> Result<Arc<dyn StoreTable>> {
        self.current().await.table(name, column_family).await
    }

    pub fn request_reset(&self) {
        self.reset_requested.store(true, Ordering::Release);
    }

    pub fn reset_requested(&self) -> bool {
        self.reset_requested.load(Ordering::Acquire)
    }

    /// Replace the connection if a reset was requested. Returns whether it was.
    ///
    /// On failure the flag stays set so the next teardown tries again.
    pub async fn reset_if_requested(&self) -> Result<bool> {
        if !self.reset_requested() {
            return Ok(false);
        }

        let fresh = self.connector.connect(&self.properties).await?;
        let old = {
            let mut current = self.current.write().await;
            std::mem::replace(&mut *current, fresh)
        };
        old.close().await;

        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        self.reset_requested.store(false, Ordering::Release);
        metrics::CONNECTION_RESETS_TOTAL.inc();

        tracing::warn!(
            identity = %self.identity,
            version,
            "Store connection recreated"
        );

        Ok(true)
    }
}

/// Hex SHA-256 over the properties in key order.
pub fn connection_identity(properties: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in properties {
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
        hasher.update(value.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}
