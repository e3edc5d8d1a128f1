//! Node liveness heartbeat.
//!
//! Each worker renews `<nodeId>:alive` with a TTL on a fixed interval. The
//! key doubles as a failure detector in both directions:
//!
//! - renewal succeeds but the key had already expired → the store thought
//!   this node was dead (**soft timeout**);
//! - renewal keeps failing for two intervals → this node can no longer
//!   reach the store (**hard timeout**), reported once per outage.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::StoreError;

/// What a heartbeat tick observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessSignal {
    /// The key was renewed while still alive.
    Renewed,
    /// The key was renewed, but had expired in the meantime.
    SoftTimeout,
    /// No successful renewal for two intervals.
    HardTimeout,
}

/// Storage for liveness keys.
#[async_trait]
pub trait LivenessStore: Send + Sync + 'static {
    /// Set `key` with `ttl`, returning whether it existed beforehand.
    async fn renew(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;
}

pub struct RedisLiveness {
    conn: ConnectionManager,
}

impl RedisLiveness {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl LivenessStore for RedisLiveness {
    async fn renew(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let (existed, ()): (bool, ()) = redis::pipe()
            .atomic()
            .exists(key)
            .pset_ex(key, 1, ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(existed)
    }
}

pub fn liveness_key(node_id: &str) -> String {
    format!("{node_id}:alive")
}

/// Turns renewal outcomes into [`LivenessSignal`]s.
#[derive(Debug)]
pub struct LivenessTracker {
    hard_after: Duration,
    last_success: Instant,
    renewed_once: bool,
    hard_reported: bool,
}

impl LivenessTracker {
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            hard_after: interval * 2,
            last_success: now,
            renewed_once: false,
            hard_reported: false,
        }
    }

    pub fn on_renewed(&mut self, existed: bool, now: Instant) -> LivenessSignal {
        let first = !self.renewed_once;
        self.renewed_once = true;
        self.last_success = now;
        self.hard_reported = false;
        // The very first renewal creates the key.
        if existed || first {
            LivenessSignal::Renewed
        } else {
            LivenessSignal::SoftTimeout
        }
    }

    pub fn on_failed(&mut self, now: Instant) -> Option<LivenessSignal> {
        if self.hard_reported || now.duration_since(self.last_success) < self.hard_after {
            return None;
        }
        self.hard_reported = true;
        Some(LivenessSignal::HardTimeout)
    }
}

/// Periodically renews a node's liveness key.
pub struct Heartbeat<S> {
    store: S,
    key: String,
    interval: Duration,
    ttl: Duration,
}

impl<S: LivenessStore> Heartbeat<S> {
    pub fn new(store: S, node_id: &str, interval: Duration, ttl: Duration) -> Self {
        Self {
            store,
            key: liveness_key(node_id),
            interval,
            ttl,
        }
    }

    /// Run the heartbeat in the background, reporting every observation to
    /// `on_signal`.
    pub fn spawn(self, on_signal: impl Fn(LivenessSignal) + Send + 'static) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            let mut tracker = LivenessTracker::new(self.interval, Instant::now());
            loop {
                ticker.tick().await;
                // A store that swallows commands must count as down, so a
                // renewal may not outlive its tick.
                let renewal = tokio::time::timeout(self.interval, self.store.renew(&self.key, self.ttl)).await;
                let signal = match renewal {
                    Ok(Ok(existed)) => Some(tracker.on_renewed(existed, Instant::now())),
                    Ok(Err(e)) => {
                        tracing::warn!(key = %self.key, "Liveness renewal failed: {e}");
                        tracker.on_failed(Instant::now())
                    }
                    Err(_) => {
                        tracing::warn!(key = %self.key, timeout = ?self.interval, "Liveness renewal timed out");
                        tracker.on_failed(Instant::now())
                    }
                };
                match signal {
                    Some(LivenessSignal::SoftTimeout) => {
                        tracing::warn!(key = %self.key, "Liveness key had expired before renewal")
                    }
                    Some(LivenessSignal::HardTimeout) => {
                        tracing::error!(key = %self.key, "Liveness store unreachable for two intervals")
                    }
                    _ => {}
                }
                if let Some(signal) = signal {
                    on_signal(signal);
                }
            }
        })
    }
}
