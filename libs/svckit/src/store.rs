//! Shared key/value store backing sessions and token revocation.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use redis::{aio::ConnectionManager, AsyncCommands, SetExpiry, SetOptions};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("stored value is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),
}

#[async_trait]
pub trait GeneralStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Store `value`; `ttl` of `None` keeps it until removed.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError>;

    async fn remove(&self, key: &str) -> Result<(), StoreError>;

    async fn get_json(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        match self.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set_json(
        &self,
        key: &str,
        value: &serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.set(key, value.to_string(), ttl).await
    }
}

/// How often `set` sweeps expired entries out of a [`MemoryStore`].
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Process-local store. Expired entries are dropped on read and swept on
/// write, at most once per sweep interval.
#[derive(Debug)]
pub struct MemoryStore {
    entries: DashMap<String, (String, Option<Instant>)>,
    sweep_interval: Duration,
    next_sweep: Mutex<Instant>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_sweep_interval(DEFAULT_SWEEP_INTERVAL)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sweep_interval(sweep_interval: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            sweep_interval,
            next_sweep: Mutex::new(Instant::now() + sweep_interval),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, (_, deadline)| deadline.map_or(true, |d| d > now));
        let purged = before.saturating_sub(self.entries.len());
        if purged > 0 {
            tracing::debug!(purged, "memory store: expired entries swept");
        }
    }

    fn maybe_sweep(&self) {
        let now = Instant::now();
        {
            let mut next = self.next_sweep.lock();
            if now < *next {
                return;
            }
            *next = now + self.sweep_interval;
        }
        self.purge_expired();
    }
}

fn expired(deadline: Option<Instant>) -> bool {
    matches!(deadline, Some(d) if d <= Instant::now())
}

#[async_trait]
impl GeneralStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.entries.get(key) {
            None => return Ok(None),
            Some(entry) if !expired(entry.1) => return Ok(Some(entry.0.clone())),
            Some(_) => {}
        }
        // re-checked under the shard lock so a fresh concurrent `set` survives
        self.entries.remove_if(key, |_, (_, deadline)| expired(*deadline));
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.maybe_sweep();
        // a ttl past the end of the clock never expires
        let deadline = ttl.and_then(|t| Instant::now().checked_add(t));
        self.entries.insert(key.to_string(), (value, deadline));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Redis-backed store over a reconnecting connection manager.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    namespace: Option<String>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("conn", &"<ConnectionManager>")
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl RedisStore {
    pub fn new(conn: ConnectionManager, namespace: Option<String>) -> Self {
        Self { conn, namespace }
    }

    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn, None))
    }

    fn redis_key(&self, key: &str) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}:{key}"),
            None => key.to_string(),
        }
    }
}

#[async_trait]
impl GeneralStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value: Option<String> = self.conn.clone().get(self.redis_key(key)).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut options = SetOptions::default();
        if let Some(ttl) = ttl {
            options = options.with_expiration(SetExpiry::EX(ttl.as_secs().max(1)));
        }
        let _: redis::Value = self
            .conn
            .clone()
            .set_options(self.redis_key(key), value, options)
            .await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let _: i64 = self.conn.clone().del(self.redis_key(key)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryStore::new();
        assert_eq!(store.get("k").await.unwrap(), None);

        store.set("k", "v".into(), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        store.remove("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_store_expires_entries() {
        let store = MemoryStore::new();
        store
            .set("short", "v".into(), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("short").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn writes_sweep_expired_entries_that_are_never_read() {
        let store = MemoryStore::with_sweep_interval(Duration::from_millis(100));
        for i in 0..50 {
            store
                .set(&format!("sess:{i}"), "{}".into(), Some(Duration::from_millis(100)))
                .await
                .unwrap();
        }
        store.set("keep", "v".into(), None).await.unwrap();
        assert_eq!(store.len(), 51);

        tokio::time::sleep(Duration::from_millis(250)).await;
        store.set("fresh", "v".into(), Some(Duration::from_secs(60))).await.unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("keep").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn expired_read_keeps_a_value_set_again() {
        let store = MemoryStore::new();
        store.set("k", "old".into(), Some(Duration::from_millis(5))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(15)).await;
        store.set("k", "new".into(), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("new"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn json_helpers() {
        let store = MemoryStore::new();
        let value = serde_json::json!({"user": {"id": 1}});
        store.set_json("sess:1", &value, None).await.unwrap();
        assert_eq!(store.get_json("sess:1").await.unwrap(), Some(value));

        store.set("bad", "{".into(), None).await.unwrap();
        assert!(matches!(store.get_json("bad").await, Err(StoreError::Decode(_))));
    }
}
