//! Pool registration.
//!
//! Frontends and backends advertise themselves as entries in a pool hash
//! (`entry id → {"address","lastUpdated"}`). An entry is live while its
//! `lastUpdated` is newer than the staleness threshold; the updater simply
//! rewrites it on a fixed interval and removes it on shutdown.

use std::time::Duration;

use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::{StoreError, now_ms};

/// One pool hash value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolEntry {
    pub address: String,
    #[serde(rename = "lastUpdated", default)]
    pub last_updated: i64,
}

impl PoolEntry {
    pub fn now(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            last_updated: now_ms(),
        }
    }
}

/// Keeps one entry in a pool hash fresh.
pub struct PoolEntryUpdater {
    conn: ConnectionManager,
    pool: String,
    entry_id: String,
    address: String,
    interval: Duration,
}

impl PoolEntryUpdater {
    pub fn new(
        conn: ConnectionManager,
        pool: impl Into<String>,
        entry_id: impl Into<String>,
        address: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            conn,
            pool: pool.into(),
            entry_id: entry_id.into(),
            address: address.into(),
            interval,
        }
    }

    async fn write(&mut self) -> Result<(), StoreError> {
        let entry = serde_json::to_string(&PoolEntry::now(self.address.clone()))?;
        let _: () = redis::cmd("HSET")
            .arg(&self.pool)
            .arg(&self.entry_id)
            .arg(entry)
            .query_async(&mut self.conn)
            .await?;
        Ok(())
    }

    async fn remove(&mut self) -> Result<(), StoreError> {
        let _: () = redis::cmd("HDEL")
            .arg(&self.pool)
            .arg(&self.entry_id)
            .query_async(&mut self.conn)
            .await?;
        Ok(())
    }

    /// Start refreshing the entry in the background.
    pub fn start(mut self) -> PoolEntryHandle {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.write().await {
                            tracing::warn!(pool = %self.pool, entry = %self.entry_id, "Pool entry update failed: {e}");
                        }
                    }
                    _ = &mut stop_rx => break,
                }
            }
            match self.remove().await {
                Ok(()) => tracing::info!(pool = %self.pool, entry = %self.entry_id, "Pool entry removed"),
                Err(e) => tracing::warn!(pool = %self.pool, entry = %self.entry_id, "Pool entry removal failed: {e}"),
            }
        });
        PoolEntryHandle {
            stop: Some(stop_tx),
            task,
        }
    }
}

/// Handle to a running [`PoolEntryUpdater`].
pub struct PoolEntryHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl PoolEntryHandle {
    /// Stop refreshing and delete the entry from the pool.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_wire_shape_matches_resolver_script() {
        let entry = PoolEntry {
            address: "10.0.0.5:7000".into(),
            last_updated: 42,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert_eq!(json, r#"{"address":"10.0.0.5:7000","lastUpdated":42}"#);
    }

    #[test]
    fn fresh_entry_is_stamped_now() {
        let before = now_ms();
        let entry = PoolEntry::now("a:1");
        assert!(entry.last_updated >= before);
        assert!(entry.last_updated <= now_ms());
    }
}
