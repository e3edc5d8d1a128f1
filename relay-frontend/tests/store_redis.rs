//! Ownership scripts against a live Redis.
//!
//! Ignored by default; run with a server available:
//! `RELAY_TEST_REDIS_URL=redis://127.0.0.1:6379 cargo test -- --ignored`

use std::time::Duration;

use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use relay_frontend::ids;
use relay_frontend::store::pool::PoolEntry;
use relay_frontend::store::resolver::{
    ChannelConnectionResolver, ChannelResolver, OwnershipRecord, ResolveError, Resolution,
    channel_hash, resolve_snapshot, stale_threshold,
};
use relay_frontend::store::{self, now_ms};

const STALE: Duration = Duration::from_secs(10);

struct Keys {
    conn: ConnectionManager,
    ownership: String,
    pool: String,
}

impl Keys {
    async fn open() -> Self {
        let url = std::env::var("RELAY_TEST_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let conn = store::connect(&url).await.unwrap();
        let run = ids::socket_id();
        Self {
            conn,
            ownership: format!("test-ownership-{run}"),
            pool: format!("test-backends-{run}"),
        }
    }

    fn resolver(&self) -> ChannelConnectionResolver {
        ChannelConnectionResolver::new(self.conn.clone(), &self.ownership, &self.pool, STALE)
    }

    async fn register(&self, entry_id: &str, address: &str, last_updated: i64) {
        let entry = PoolEntry { address: address.into(), last_updated };
        let raw = serde_json::to_string(&entry).unwrap();
        let _: () = self.conn.clone().hset(&self.pool, entry_id, raw).await.unwrap();
    }

    async fn set_owner(&self, channel: &str, address: &str, renewed_at: i64) {
        let raw = serde_json::to_string(&OwnershipRecord { address: address.into(), renewed_at })
            .unwrap();
        let _: () = self.conn.clone().hset(&self.ownership, channel, raw).await.unwrap();
    }

    async fn owner(&self, channel: &str) -> Option<OwnershipRecord> {
        let raw: Option<String> = self.conn.clone().hget(&self.ownership, channel).await.unwrap();
        raw.map(|raw| serde_json::from_str(&raw).unwrap())
    }

    async fn pool_values(&self) -> Vec<String> {
        self.conn.clone().hvals(&self.pool).await.unwrap()
    }

    async fn cleanup(self) {
        let _: () = self.conn.clone().del(vec![self.ownership.clone(), self.pool.clone()]).await.unwrap();
    }
}

#[tokio::test]
#[ignore = "needs a Redis server"]
async fn fresh_channel_claims_the_same_backend_as_the_snapshot_rule() {
    let keys = Keys::open().await;
    let now = now_ms();
    keys.register("b2", "10.0.0.2:7000", now).await;
    keys.register("b1", "10.0.0.1:7000", now).await;
    keys.register("b1-dup", "10.0.0.1:7000", now).await;
    keys.register("old", "10.0.0.9:7000", now - 60_000).await;

    let expected = resolve_snapshot(
        None,
        &keys.pool_values().await,
        channel_hash("lobby"),
        stale_threshold(STALE, now),
        now,
    );
    let Resolution::Claimed(expected) = expected else {
        panic!("expected a claim, got {expected:?}");
    };

    let resolver = keys.resolver();
    let address = resolver.resolve("lobby").await.unwrap();
    assert_eq!(address, expected.address);
    assert_eq!(keys.owner("lobby").await.map(|r| r.address), Some(address.clone()));

    // A new backend joining the pool does not move a claimed channel, and
    // concurrent resolutions agree.
    keys.register("b0", "10.0.0.0:7000", now_ms()).await;
    let other = keys.resolver();
    let (a, b) = tokio::join!(resolver.resolve("lobby"), other.resolve("lobby"));
    assert_eq!(a.unwrap(), address);
    assert_eq!(b.unwrap(), address);

    keys.cleanup().await;
}

#[tokio::test]
#[ignore = "needs a Redis server"]
async fn stale_owner_is_reassigned_and_missing_backends_are_reported() {
    let keys = Keys::open().await;
    let now = now_ms();
    keys.set_owner("lobby", "10.0.0.9:7000", now - 60_000).await;

    let resolver = keys.resolver();
    assert!(matches!(
        resolver.resolve("lobby").await,
        Err(ResolveError::NoBackendAvailable(channel)) if channel == "lobby"
    ));

    keys.register("b1", "10.0.0.1:7000", now).await;
    assert_eq!(resolver.resolve("lobby").await.unwrap(), "10.0.0.1:7000");
    let record = keys.owner("lobby").await.unwrap();
    assert!(record.renewed_at >= now);

    keys.cleanup().await;
}

#[tokio::test]
#[ignore = "needs a Redis server"]
async fn renewal_only_refreshes_matching_owner() {
    let keys = Keys::open().await;
    let then = now_ms() - 3_000;
    keys.set_owner("lobby", "10.0.0.1:7000", then).await;
    keys.set_owner("moved", "10.0.0.2:7000", then).await;

    let routes = vec![
        ("lobby".to_string(), "10.0.0.1:7000".to_string()),
        ("moved".to_string(), "10.0.0.1:7000".to_string()),
        ("unknown".to_string(), "10.0.0.1:7000".to_string()),
    ];
    assert_eq!(keys.resolver().renew(&routes).await.unwrap(), 1);

    assert!(keys.owner("lobby").await.unwrap().renewed_at > then);
    let moved = keys.owner("moved").await.unwrap();
    assert_eq!(moved, OwnershipRecord { address: "10.0.0.2:7000".into(), renewed_at: then });
    assert_eq!(keys.owner("unknown").await, None);

    keys.cleanup().await;
}
