use crate::store::StateStore;
use async_trait::async_trait;
use futures_util::StreamExt;
use nexus_core::{NexusError, NexusResult};
use redis::aio::ConnectionManager;
use redis::{Client, RedisError, Script};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::{broadcast, OnceCell};
use tracing::{debug, info, warn};

const SCAN_BATCH: usize = 500;

const COMPARE_AND_SWAP: &str = r"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
  if current ~= ARGV[2] then return 0 end
elseif current then
  return 0
end
redis.call('SET', KEYS[1], ARGV[3])
return 1
";

const COMPARE_AND_DELETE: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
";

const COMPARE_AND_EXPIRE: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
";

fn unavailable(e: RedisError) -> NexusError {
    NexusError::StoreUnavailable(format!("redis: {e}"))
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// `MATCH` pattern selecting every key that starts with `prefix`.
fn prefix_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('*');
    pattern
}

/// [`StateStore`] over a Redis server, shared by every worker pointed at it.
///
/// Values are stored as JSON strings. Conditional writes run as Lua scripts,
/// so each one is a single atomic step on the server; `serde_json` renders
/// equal values identically, which is what the comparisons rely on. The
/// connection is opened on first use and re-established after failures.
pub struct RedisStore {
    client: Client,
    connection: OnceCell<ConnectionManager>,
    channel_capacity: usize,
    compare_and_swap: Script,
    compare_and_delete: Script,
    compare_and_expire: Script,
}

impl RedisStore {
    /// Store for a `redis://` or `rediss://` url. Does not connect yet.
    pub fn open(url: &str) -> NexusResult<Self> {
        let client = Client::open(url)
            .map_err(|e| NexusError::Config(format!("invalid redis url '{url}': {e}")))?;
        Ok(Self {
            client,
            connection: OnceCell::new(),
            channel_capacity: 256,
            compare_and_swap: Script::new(COMPARE_AND_SWAP),
            compare_and_delete: Script::new(COMPARE_AND_DELETE),
            compare_and_expire: Script::new(COMPARE_AND_EXPIRE),
        })
    }

    async fn conn(&self) -> NexusResult<ConnectionManager> {
        let manager = self
            .connection
            .get_or_try_init(|| async {
                let manager = ConnectionManager::new(self.client.clone()).await?;
                info!("Connected to redis");
                Ok::<_, RedisError>(manager)
            })
            .await
            .map_err(unavailable)?;
        Ok(manager.clone())
    }

    async fn scan(&self, prefix: &str) -> NexusResult<Vec<String>> {
        let mut conn = self.conn().await?;
        let pattern = prefix_pattern(prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern.as_str())
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn get(&self, key: &str) -> NexusResult<Option<Value>> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        raw.map(|s| serde_json::from_str(&s).map_err(NexusError::from))
            .transpose()
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> NexusResult<()> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(serde_json::to_string(&value)?);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let _: () = cmd.query_async(&mut conn).await.map_err(unavailable)?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> NexusResult<bool> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(serde_json::to_string(&value)?).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let written: Option<String> = cmd.query_async(&mut conn).await.map_err(unavailable)?;
        Ok(written.is_some())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&Value>,
        new: Value,
    ) -> NexusResult<bool> {
        let mut conn = self.conn().await?;
        let (present, expected) = match expected {
            Some(v) => ("1", serde_json::to_string(v)?),
            None => ("0", String::new()),
        };
        let mut invocation = self.compare_and_swap.prepare_invoke();
        invocation
            .key(key)
            .arg(present)
            .arg(expected)
            .arg(serde_json::to_string(&new)?);
        let swapped: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(swapped == 1)
    }

    async fn compare_and_delete(&self, key: &str, expected: &Value) -> NexusResult<bool> {
        let mut conn = self.conn().await?;
        let mut invocation = self.compare_and_delete.prepare_invoke();
        invocation.key(key).arg(serde_json::to_string(expected)?);
        let deleted: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(deleted == 1)
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &Value,
        ttl: Duration,
    ) -> NexusResult<bool> {
        let mut conn = self.conn().await?;
        let mut invocation = self.compare_and_expire.prepare_invoke();
        invocation
            .key(key)
            .arg(serde_json::to_string(expected)?)
            .arg(ttl_millis(ttl));
        let renewed: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(renewed == 1)
    }

    async fn keys(&self, prefix: &str) -> NexusResult<Vec<String>> {
        self.scan(prefix).await
    }

    async fn delete_prefix(&self, prefix: &str) -> NexusResult<usize> {
        let keys = self.scan(prefix).await?;
        let mut conn = self.conn().await?;
        let mut removed = 0;
        for chunk in keys.chunks(SCAN_BATCH) {
            let n: usize = redis::cmd("DEL")
                .arg(chunk)
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;
            removed += n;
        }
        Ok(removed)
    }

    async fn publish(&self, channel: &str, payload: Value) -> NexusResult<usize> {
        let mut conn = self.conn().await?;
        let reached: usize = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(serde_json::to_string(&payload)?)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(reached)
    }

    async fn subscribe(&self, channel: &str) -> NexusResult<broadcast::Receiver<Value>> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(unavailable)?;
        pubsub.subscribe(channel).await.map_err(unavailable)?;
        let (tx, rx) = broadcast::channel(self.channel_capacity);
        let channel = channel.to_string();
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "Unreadable pub/sub message");
                        continue;
                    }
                };
                match serde_json::from_str::<Value>(&payload) {
                    Ok(value) => {
                        if tx.send(value).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(channel = %channel, error = %e, "Dropping non-JSON message"),
                }
            }
            debug!(channel = %channel, "Subscription closed");
        });
        Ok(rx)
    }

    async fn ping(&self) -> NexusResult<()> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}
