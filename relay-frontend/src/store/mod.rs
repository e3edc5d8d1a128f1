//! Shared coordination store (Redis).
//!
//! Workers never share memory; everything cross-process goes through here:
//! channel ownership ([`resolver`]), pool registration ([`pool`]) and node
//! liveness ([`liveness`]).

pub mod liveness;
pub mod pool;
pub mod resolver;

use redis::aio::ConnectionManager;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("record encoding: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Open a reconnecting connection to the store.
pub async fn connect(url: &str) -> Result<ConnectionManager, StoreError> {
    let client = redis::Client::open(url)?;
    Ok(client.get_connection_manager().await?)
}

/// Wall-clock milliseconds since the epoch, the unit of every store timestamp.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
