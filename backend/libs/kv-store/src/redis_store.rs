//! Redis-backed implementation of the [`KeyValueStore`] facade.
//!
//! A single `ConnectionManager` is shared behind a Tokio mutex and cloned per
//! command; the manager reconnects on its own. Commands are wrapped with a
//! timeout and retried with capped exponential backoff before surfacing
//! `KvError::Unavailable`.

use crate::{KeyValueStore, KvError, KvResult};
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(3);
const MAX_ATTEMPTS: u32 = 3;
const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(50);
const MAX_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Shared connection manager guarded by a Tokio mutex.
pub type SharedConnectionManager = Arc<Mutex<ConnectionManager>>;

pub struct RedisKvStore {
    client: Client,
    manager: SharedConnectionManager,
}

impl RedisKvStore {
    /// Connect to the store from a `redis://` URL.
    pub async fn connect(url: &str) -> KvResult<Self> {
        let client =
            Client::open(url).map_err(|e| KvError::Unavailable(format!("invalid url: {e}")))?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| KvError::Unavailable(format!("connect: {e}")))?;

        Ok(Self {
            client,
            manager: Arc::new(Mutex::new(manager)),
        })
    }

    pub fn manager(&self) -> SharedConnectionManager {
        self.manager.clone()
    }

    async fn retry<T, F, Fut>(&self, mut op: F) -> KvResult<T>
    where
        F: FnMut(ConnectionManager) -> Fut,
        Fut: Future<Output = Result<T, RedisError>>,
    {
        let mut delay = INITIAL_RETRY_DELAY;
        let mut attempt = 0;

        loop {
            let conn = {
                let guard = self.manager.lock().await;
                guard.clone()
            };

            let result = match timeout(COMMAND_TIMEOUT, op(conn)).await {
                Ok(inner) => inner,
                Err(_) => Err(RedisError::from((
                    redis::ErrorKind::IoError,
                    "command timed out",
                ))),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if attempt >= MAX_ATTEMPTS {
                        return Err(KvError::Unavailable(err.to_string()));
                    }
                    debug!(attempt, error = %err, "kv command failed, retrying");
                    sleep(delay).await;
                    delay = (delay * 2).min(MAX_RETRY_DELAY);
                }
            }
        }
    }
}

#[async_trait]
impl KeyValueStore for RedisKvStore {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        self.retry(|mut conn| async move { conn.get(key).await })
            .await
    }

    async fn set(&self, key: &str, value: &str) -> KvResult<()> {
        self.retry(|mut conn| async move { conn.set(key, value).await })
            .await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> KvResult<()> {
        let secs = ttl.as_secs().max(1);
        self.retry(|mut conn| async move { conn.set_ex(key, value, secs).await })
            .await
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> KvResult<bool> {
        let secs = ttl.as_secs().max(1);
        let reply: Option<String> = self
            .retry(|mut conn| async move {
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("EX")
                    .arg(secs)
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        self.retry(|mut conn| async move { conn.del(key).await })
            .await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool> {
        let secs = ttl.as_secs().max(1) as i64;
        self.retry(|mut conn| async move { conn.expire(key, secs).await })
            .await
    }

    async fn increment(&self, key: &str) -> KvResult<i64> {
        self.retry(|mut conn| async move { conn.incr(key, 1i64).await })
            .await
    }

    async fn list_append(&self, key: &str, value: &str) -> KvResult<i64> {
        self.retry(|mut conn| async move { conn.rpush(key, value).await })
            .await
    }

    async fn list_trim(&self, key: &str, start: isize, stop: isize) -> KvResult<()> {
        self.retry(|mut conn| async move { conn.ltrim(key, start, stop).await })
            .await
    }

    async fn list_range(&self, key: &str, start: isize, stop: isize) -> KvResult<Vec<String>> {
        self.retry(|mut conn| async move { conn.lrange(key, start, stop).await })
            .await
    }

    async fn set_add(&self, key: &str, member: &str) -> KvResult<bool> {
        let added: i64 = self
            .retry(|mut conn| async move { conn.sadd(key, member).await })
            .await?;
        Ok(added > 0)
    }

    async fn set_remove(&self, key: &str, member: &str) -> KvResult<bool> {
        let removed: i64 = self
            .retry(|mut conn| async move { conn.srem(key, member).await })
            .await?;
        Ok(removed > 0)
    }

    async fn set_members(&self, key: &str) -> KvResult<Vec<String>> {
        self.retry(|mut conn| async move { conn.smembers(key).await })
            .await
    }

    async fn set_contains(&self, key: &str, member: &str) -> KvResult<bool> {
        self.retry(|mut conn| async move { conn.sismember(key, member).await })
            .await
    }

    async fn publish(&self, channel: &str, payload: &str) -> KvResult<()> {
        self.retry(|mut conn| async move { conn.publish(channel, payload).await })
            .await
    }

    async fn subscribe(&self, channel: &str) -> KvResult<UnboundedReceiver<String>> {
        // Pub/sub needs a dedicated connection, not the multiplexed manager.
        let conn = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| KvError::Unavailable(format!("pubsub connect: {e}")))?;
        let mut pubsub = conn.into_pubsub();
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| KvError::Unavailable(format!("subscribe: {e}")))?;

        let (tx, rx) = unbounded_channel();
        let channel = channel.to_string();

        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(err) => {
                        warn!(channel = %channel, error = %err, "dropping undecodable pubsub message");
                        continue;
                    }
                };
                if tx.send(payload).is_err() {
                    // Receiver dropped; tear down the subscription.
                    break;
                }
            }
        });

        Ok(rx)
    }
}
