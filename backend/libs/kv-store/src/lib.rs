//! Typed facade over the shared key-value store.
//!
//! Every service-side consumer (key ring, abuse ladder, push buffers, quota
//! counters) talks to [`KeyValueStore`] instead of a raw client. The
//! production implementation is [`RedisKvStore`]; [`MemoryKvStore`] backs unit
//! tests and degraded single-process deployments.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

pub mod memory;
pub mod redis_store;

pub use memory::MemoryKvStore;
pub use redis_store::RedisKvStore;

pub type KvResult<T> = Result<T, KvError>;

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    /// The store could not be reached after retries. Read paths should treat
    /// this as a cache miss when safe; write paths surface it as degradation.
    #[error("key-value store unavailable: {0}")]
    Unavailable(String),

    #[error("key-value store protocol error: {0}")]
    Protocol(String),
}

/// Uniform operations over the shared ordered/keyed store.
///
/// All TTLs are absolute from the time of the call. List indices follow the
/// store convention: negative indices count from the tail, `-1` is the last
/// element.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> KvResult<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> KvResult<()>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> KvResult<()>;

    /// Atomic set-if-absent with TTL. Returns `true` when the key was set,
    /// `false` when it already existed. This is the locking primitive.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> KvResult<bool>;

    async fn delete(&self, key: &str) -> KvResult<()>;

    /// Refresh a key's TTL. Returns `false` when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool>;

    /// Atomic counter increment; initializes the key at 0 first.
    async fn increment(&self, key: &str) -> KvResult<i64>;

    /// Append to the tail of a list; returns the new list length.
    async fn list_append(&self, key: &str, value: &str) -> KvResult<i64>;

    async fn list_trim(&self, key: &str, start: isize, stop: isize) -> KvResult<()>;

    async fn list_range(&self, key: &str, start: isize, stop: isize) -> KvResult<Vec<String>>;

    /// Returns `true` when the member was newly added.
    async fn set_add(&self, key: &str, member: &str) -> KvResult<bool>;

    async fn set_remove(&self, key: &str, member: &str) -> KvResult<bool>;

    async fn set_members(&self, key: &str) -> KvResult<Vec<String>>;

    async fn set_contains(&self, key: &str, member: &str) -> KvResult<bool>;

    async fn publish(&self, channel: &str, payload: &str) -> KvResult<()>;

    /// Subscribe to a channel. Messages arrive on the returned receiver until
    /// it is dropped; the underlying subscription is torn down lazily.
    async fn subscribe(&self, channel: &str) -> KvResult<UnboundedReceiver<String>>;
}
