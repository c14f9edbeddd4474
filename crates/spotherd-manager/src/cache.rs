//! TTL key-value cache
//!
//! The ephemeral state shared between reconciliation ticks lives in a plain
//! key-value store with per-key TTLs: recent spot price snapshots, the
//! short-lived (zone, instance type) blacklist, and resolved image ids.
//! Keys are namespaced by provider name:
//!
//! ```text
//! <provider>:price:<instance_type>
//! <provider>:blacklist:<zone>:<instance_type>
//! <provider>:image:<region>:<image_name>
//! ```
//!
//! Values are opaque strings; for blacklist keys the existence of the key is
//! the whole signal. Operations are individual atomic get/set with TTL; all
//! cross-key invariants are re-established by the next reconciliation tick.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::AsyncCommands;
use spotherd_core::{Result, SpotherdError};

/// TTL of cached price snapshots. The collector refreshes on a shorter
/// cadence; stale data survives a few missed refreshes, then disappears.
pub const PRICE_TTL_SECS: u64 = 3600;

/// TTL of a (zone, instance type) blacklist mark
pub const BLACKLIST_TTL_SECS: u64 = 12 * 3600;

/// TTL of a resolved image id
pub const IMAGE_TTL_SECS: u64 = 24 * 3600;

/// Key of the cached price snapshot for one instance type
pub fn price_key(provider: &str, instance_type: &str) -> String {
    format!("{provider}:price:{instance_type}")
}

/// Key marking a (zone, instance type) pair that recently refused requests
pub fn blacklist_key(provider: &str, zone: &str, instance_type: &str) -> String {
    format!("{provider}:blacklist:{zone}:{instance_type}")
}

/// Key of a resolved image id
pub fn image_key(provider: &str, region: &str, image_name: &str) -> String {
    format!("{provider}:image:{region}:{image_name}")
}

/// Minimal TTL key-value store interface.
#[async_trait]
pub trait KvCache: Send + Sync {
    /// Fetch a key; `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a key with a TTL in seconds.
    async fn set(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;
}

/// Redis-backed cache, shared by every worker process.
pub struct RedisCache {
    conn: redis::aio::MultiplexedConnection,
}

impl RedisCache {
    /// Connect to a Redis endpoint, e.g. `redis://127.0.0.1:6379/0`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client =
            redis::Client::open(url).map_err(|e| SpotherdError::Cache(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| SpotherdError::Cache(e.to_string()))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl KvCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(key)
            .await
            .map_err(|e| SpotherdError::Cache(e.to_string()))
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl_secs)
            .await
            .map_err(|e| SpotherdError::Cache(e.to_string()))
    }
}

/// In-process cache for tests and single-node runs.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let expires = Instant::now() + Duration::from_secs(ttl_secs);
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), (value.to_string(), expires));
        Ok(())
    }
}
