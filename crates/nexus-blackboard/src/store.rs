use async_trait::async_trait;
use nexus_core::NexusResult;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::Instant;

/// Wire contract of the shared key-value / pub-sub store.
///
/// Every mutating method is a single atomic operation on the store side.
/// Callers build higher-level transitions from these primitives and never
/// from a client-side read-then-write pair. Transport failures surface as
/// [`NexusError::StoreUnavailable`](nexus_core::NexusError::StoreUnavailable).
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read a live (non-expired) value.
    async fn get(&self, key: &str) -> NexusResult<Option<Value>>;

    /// Unconditionally write a value, optionally with a time-to-live.
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> NexusResult<()>;

    /// Write only if no live value exists. Returns whether the write happened.
    async fn set_if_absent(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> NexusResult<bool>;

    /// Replace the value only if the current live value equals `expected`
    /// (`None` meaning absent). Any TTL on the key is cleared.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&Value>,
        new: Value,
    ) -> NexusResult<bool>;

    /// Delete the key only if its live value equals `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &Value) -> NexusResult<bool>;

    /// Reset the key's TTL only if its live value equals `expected`.
    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &Value,
        ttl: Duration,
    ) -> NexusResult<bool>;

    /// Live keys starting with `prefix`, sorted.
    async fn keys(&self, prefix: &str) -> NexusResult<Vec<String>>;

    /// Delete every key starting with `prefix`. Returns how many were removed.
    async fn delete_prefix(&self, prefix: &str) -> NexusResult<usize>;

    /// Publish a payload. Returns the number of subscribers reached.
    async fn publish(&self, channel: &str, payload: Value) -> NexusResult<usize>;

    /// Subscribe to a channel.
    async fn subscribe(&self, channel: &str) -> NexusResult<broadcast::Receiver<Value>>;

    /// Health probe.
    async fn ping(&self) -> NexusResult<()>;
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(at) => at > now,
            None => true,
        }
    }
}

/// In-process store backed by a `HashMap` behind a `RwLock`.
///
/// Expiry is evaluated against `tokio::time::Instant`, so tests can pause and
/// advance the clock. Expired entries are hidden from reads and dropped on
/// the next conditional insert or key scan. Pub/sub uses one broadcast
/// channel per name.
pub struct InMemoryStore {
    data: RwLock<HashMap<String, Entry>>,
    channels: Mutex<HashMap<String, broadcast::Sender<Value>>>,
    channel_capacity: usize,
}

impl InMemoryStore {
    /// Create an empty store with the default channel capacity (256).
    pub fn new() -> Self {
        Self::with_channel_capacity(256)
    }

    /// Create an empty store with a custom per-channel buffer.
    pub fn with_channel_capacity(capacity: usize) -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            channel_capacity: capacity.max(1),
        }
    }

    fn purge_expired(data: &mut HashMap<String, Entry>, now: Instant) {
        data.retain(|_, e| e.is_live(now));
    }

    fn live<'a>(data: &'a HashMap<String, Entry>, key: &str, now: Instant) -> Option<&'a Value> {
        data.get(key)
            .filter(|e| e.is_live(now))
            .map(|e| &e.value)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for InMemoryStore {
    async fn get(&self, key: &str) -> NexusResult<Option<Value>> {
        let guard = self.data.read().await;
        Ok(Self::live(&guard, key, Instant::now()).cloned())
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> NexusResult<()> {
        let mut guard = self.data.write().await;
        let expires_at = ttl.map(|d| Instant::now() + d);
        guard.insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> NexusResult<bool> {
        let mut guard = self.data.write().await;
        let now = Instant::now();
        Self::purge_expired(&mut guard, now);
        if guard.contains_key(key) {
            return Ok(false);
        }
        let expires_at = ttl.map(|d| now + d);
        guard.insert(key.to_string(), Entry { value, expires_at });
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&Value>,
        new: Value,
    ) -> NexusResult<bool> {
        let mut guard = self.data.write().await;
        if Self::live(&guard, key, Instant::now()) != expected {
            return Ok(false);
        }
        guard.insert(
            key.to_string(),
            Entry {
                value: new,
                expires_at: None,
            },
        );
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &Value) -> NexusResult<bool> {
        let mut guard = self.data.write().await;
        if Self::live(&guard, key, Instant::now()) != Some(expected) {
            return Ok(false);
        }
        guard.remove(key);
        Ok(true)
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &Value,
        ttl: Duration,
    ) -> NexusResult<bool> {
        let mut guard = self.data.write().await;
        let now = Instant::now();
        match guard.get_mut(key) {
            Some(entry) if entry.is_live(now) && entry.value == *expected => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn keys(&self, prefix: &str) -> NexusResult<Vec<String>> {
        let mut guard = self.data.write().await;
        Self::purge_expired(&mut guard, Instant::now());
        let mut keys: Vec<String> = guard
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete_prefix(&self, prefix: &str) -> NexusResult<usize> {
        let mut guard = self.data.write().await;
        let before = guard.len();
        guard.retain(|k, _| !k.starts_with(prefix));
        Ok(before - guard.len())
    }

    async fn publish(&self, channel: &str, payload: Value) -> NexusResult<usize> {
        let channels = self.channels.lock().await;
        // No receivers is not an error.
        Ok(channels
            .get(channel)
            .and_then(|tx| tx.send(payload).ok())
            .unwrap_or(0))
    }

    async fn subscribe(&self, channel: &str) -> NexusResult<broadcast::Receiver<Value>> {
        let mut channels = self.channels.lock().await;
        let tx = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.channel_capacity).0);
        Ok(tx.subscribe())
    }

    async fn ping(&self) -> NexusResult<()> {
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_get_set() {
        let store = InMemoryStore::new();
        store.set("k", json!(42), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(json!(42)));
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let store = InMemoryStore::new();
        store
            .set("k", json!("v"), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(store.get("k").await.unwrap().is_some());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_if_absent_after_expiry() {
        let store = InMemoryStore::new();
        let ttl = Some(Duration::from_secs(1));
        assert!(store.set_if_absent("k", json!(1), ttl).await.unwrap());
        assert!(!store.set_if_absent("k", json!(2), ttl).await.unwrap());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.set_if_absent("k", json!(3), ttl).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some(json!(3)));
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let store = InMemoryStore::new();
        assert!(store.compare_and_swap("k", None, json!(1)).await.unwrap());
        assert!(!store.compare_and_swap("k", None, json!(2)).await.unwrap());
        assert!(!store
            .compare_and_swap("k", Some(&json!(5)), json!(2))
            .await
            .unwrap());
        assert!(store
            .compare_and_swap("k", Some(&json!(1)), json!(2))
            .await
            .unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_compare_and_expire_and_delete() {
        let store = InMemoryStore::new();
        let v = json!({"lease": "a"});
        store
            .set("claim", v.clone(), Some(Duration::from_secs(2)))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(store
            .compare_and_expire("claim", &v, Duration::from_secs(2))
            .await
            .unwrap());
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert!(store.get("claim").await.unwrap().is_some());

        assert!(!store
            .compare_and_delete("claim", &json!({"lease": "b"}))
            .await
            .unwrap());
        assert!(store.compare_and_delete("claim", &v).await.unwrap());
        assert!(store.get("claim").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_keys_and_delete_prefix() {
        let store = InMemoryStore::new();
        store.set("a:1", json!(1), None).await.unwrap();
        store.set("a:2", json!(2), None).await.unwrap();
        store.set("b:1", json!(3), None).await.unwrap();
        assert_eq!(store.keys("a:").await.unwrap(), vec!["a:1", "a:2"]);
        assert_eq!(store.delete_prefix("a:").await.unwrap(), 2);
        assert!(store.keys("a:").await.unwrap().is_empty());
        assert_eq!(store.keys("").await.unwrap(), vec!["b:1"]);
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let store = InMemoryStore::new();
        assert_eq!(store.publish("ch", json!("nobody")).await.unwrap(), 0);

        let mut rx1 = store.subscribe("ch").await.unwrap();
        let mut rx2 = store.subscribe("ch").await.unwrap();
        assert_eq!(store.publish("ch", json!("hello")).await.unwrap(), 2);
        assert_eq!(rx1.recv().await.unwrap(), json!("hello"));
        assert_eq!(rx2.recv().await.unwrap(), json!("hello"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_are_purged() {
        let store = InMemoryStore::new();
        let ttl = Some(Duration::from_secs(1));
        for i in 0..10 {
            assert!(store.set_if_absent(&format!("claim:{i}"), json!(i), ttl).await.unwrap());
        }
        store.set("task:1", json!("kept"), None).await.unwrap();
        assert_eq!(store.data.read().await.len(), 11);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.keys("").await.unwrap(), vec!["task:1"]);
        assert_eq!(store.data.read().await.len(), 1);

        store.set("lapsed", json!(0), ttl).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.set_if_absent("fresh", json!(1), None).await.unwrap());
        assert!(!store.data.read().await.contains_key("lapsed"));
    }
}
