//! Channel → backend ownership resolution.
//!
//! Ownership lives in one store hash keyed by channel name. Resolution is a
//! single server-side script so that two frontends racing on a fresh channel
//! always agree on the owner: the first script run claims a backend and every
//! later run returns the claimed address until the record goes stale.
//!
//! The owning backend normally keeps its records fresh. Frontends also renew
//! the records for channels they actively route (compare-and-set on the
//! address), so an active channel is never reassigned while its backend is
//! still registered.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use serde::{Deserialize, Serialize};

use super::pool::PoolEntry;
use super::{StoreError, now_ms};

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("no backend available to own channel {0}")]
    NoBackendAvailable(String),
    #[error("channel {channel} not resolved within {after:?}")]
    TimedOut { channel: String, after: Duration },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<redis::RedisError> for ResolveError {
    fn from(e: redis::RedisError) -> Self {
        Self::Store(StoreError::Redis(e))
    }
}

/// One ownership record, as stored in the ownership hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipRecord {
    pub address: String,
    #[serde(rename = "renewedAt", default)]
    pub renewed_at: i64,
}

/// What resolution decides for one channel, given the current ownership
/// record and the backend pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The recorded owner is still fresh.
    Existing(String),
    /// No fresh owner; this record gets written.
    Claimed(OwnershipRecord),
    /// No fresh backend in the pool.
    NoCandidate,
}

/// Oldest `renewedAt`/`lastUpdated` still considered fresh at `now`.
pub fn stale_threshold(stale_after: Duration, now: i64) -> i64 {
    now - stale_after.as_millis() as i64
}

/// The decision `resolve_channel.lua` makes, over raw hash values.
///
/// Undecodable records and pool entries are skipped. Candidates are the
/// distinct fresh backend addresses in byte order; the channel hash picks one.
pub fn resolve_snapshot(
    current: Option<&str>,
    pool: &[String],
    hash: u64,
    threshold: i64,
    now: i64,
) -> Resolution {
    let owner = current.and_then(|raw| serde_json::from_str::<OwnershipRecord>(raw).ok());
    if let Some(record) = owner.filter(|record| record.renewed_at >= threshold) {
        return Resolution::Existing(record.address);
    }

    let mut candidates: Vec<String> = pool
        .iter()
        .filter_map(|raw| serde_json::from_str::<PoolEntry>(raw).ok())
        .filter(|entry| entry.last_updated >= threshold)
        .map(|entry| entry.address)
        .collect();
    candidates.sort();
    candidates.dedup();
    if candidates.is_empty() {
        return Resolution::NoCandidate;
    }
    let address = candidates[(hash % candidates.len() as u64) as usize].clone();
    Resolution::Claimed(OwnershipRecord { address, renewed_at: now })
}

/// The decision `renew_ownership.lua` makes: the refreshed record, or `None`
/// when the record is gone, undecodable or names another address.
pub fn renew_snapshot(current: Option<&str>, address: &str, now: i64) -> Option<OwnershipRecord> {
    let mut record: OwnershipRecord = serde_json::from_str(current?).ok()?;
    if record.address != address {
        return None;
    }
    record.renewed_at = now;
    Some(record)
}

/// Maps channel names to backend addresses.
#[async_trait]
pub trait ChannelResolver: Send + Sync + 'static {
    /// Return the address of the backend that owns `channel`, claiming one
    /// if the channel has no fresh owner.
    async fn resolve(&self, channel: &str) -> Result<String, ResolveError>;

    /// Refresh ownership of `(channel, address)` pairs this node routes.
    /// Returns how many records were still owned by the given address.
    async fn renew(&self, routes: &[(String, String)]) -> Result<usize, ResolveError>;
}

/// Deterministic channel hash used to spread fresh channels over backends.
///
/// `1 + Σ 31·c` over the UTF-16 code units of the name; order-insensitive,
/// which is fine because it only picks among equally eligible candidates.
pub fn channel_hash(name: &str) -> u64 {
    name.encode_utf16()
        .fold(1u64, |acc, unit| acc.wrapping_add(31 * u64::from(unit)))
}

/// Store-backed resolver.
pub struct ChannelConnectionResolver {
    conn: ConnectionManager,
    resolve_script: Script,
    renew_script: Script,
    ownership_key: String,
    backend_pool: String,
    stale_after: Duration,
}

impl ChannelConnectionResolver {
    pub fn new(
        conn: ConnectionManager,
        ownership_key: impl Into<String>,
        backend_pool: impl Into<String>,
        stale_after: Duration,
    ) -> Self {
        Self {
            conn,
            resolve_script: Script::new(include_str!("lua/resolve_channel.lua")),
            renew_script: Script::new(include_str!("lua/renew_ownership.lua")),
            ownership_key: ownership_key.into(),
            backend_pool: backend_pool.into(),
            stale_after,
        }
    }

    fn stale_threshold(&self, now: i64) -> i64 {
        stale_threshold(self.stale_after, now)
    }
}

#[async_trait]
impl ChannelResolver for ChannelConnectionResolver {
    async fn resolve(&self, channel: &str) -> Result<String, ResolveError> {
        let now = now_ms();
        let mut conn = self.conn.clone();
        // `Script::invoke_async` sends EVALSHA and falls back to EVAL (which
        // loads the script) when the server does not have it cached yet.
        let address: Option<String> = self
            .resolve_script
            .key(&self.ownership_key)
            .key(&self.backend_pool)
            .arg(channel)
            .arg(channel_hash(channel))
            .arg(self.stale_threshold(now))
            .arg(now)
            .invoke_async(&mut conn)
            .await?;
        match address {
            Some(address) => {
                tracing::debug!(channel, %address, "Resolved channel owner");
                Ok(address)
            }
            None => Err(ResolveError::NoBackendAvailable(channel.to_string())),
        }
    }

    async fn renew(&self, routes: &[(String, String)]) -> Result<usize, ResolveError> {
        let now = now_ms();
        let mut conn = self.conn.clone();
        let mut renewed = 0;
        for (channel, address) in routes {
            let still_owned: i64 = self
                .renew_script
                .key(&self.ownership_key)
                .arg(channel)
                .arg(address)
                .arg(now)
                .invoke_async(&mut conn)
                .await?;
            if still_owned == 1 {
                renewed += 1;
            } else {
                tracing::debug!(channel, %address, "Ownership record moved or expired; not renewed");
            }
        }
        Ok(renewed)
    }
}
