//! In-process implementation of the [`KeyValueStore`] facade.
//!
//! Backs unit tests across the workspace. TTLs are honored lazily: expired
//! entries are dropped on access.

use crate::{KeyValueStore, KvError, KvResult};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;

#[derive(Clone)]
enum Value {
    Text(String),
    List(Vec<String>),
    Set(BTreeSet<String>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn text(value: &str, ttl: Option<Duration>) -> Self {
        Self {
            value: Value::Text(value.to_string()),
            expires_at: ttl.map(|t| Instant::now() + t),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

#[derive(Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, Entry>>,
    channels: Mutex<HashMap<String, Vec<UnboundedSender<String>>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let norm = |idx: isize| -> isize {
        if idx < 0 {
            len as isize + idx
        } else {
            idx
        }
    };
    let start = norm(start).max(0);
    let stop = norm(stop).min(len as isize - 1);
    if len == 0 || start > stop {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[async_trait]
impl KeyValueStore for MemoryKvStore {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.is_expired() => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => match &entry.value {
                Value::Text(s) => Ok(Some(s.clone())),
                _ => Err(KvError::Protocol(format!("{key} is not a string"))),
            },
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> KvResult<()> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), Entry::text(value, None));
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> KvResult<()> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), Entry::text(value, Some(ttl)));
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> KvResult<bool> {
        let mut entries = self.entries.lock().await;
        let occupied = entries.get(key).is_some_and(|e| !e.is_expired());
        if occupied {
            return Ok(false);
        }
        entries.insert(key.to_string(), Entry::text(value, Some(ttl)));
        Ok(true)
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool> {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(key) {
            Some(entry) if !entry.is_expired() => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn increment(&self, key: &str) -> KvResult<i64> {
        let mut entries = self.entries.lock().await;
        let expired = entries.get(key).is_some_and(|e| e.is_expired());
        if expired {
            entries.remove(key);
        }
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::text("0", None));
        let current: i64 = match &entry.value {
            Value::Text(s) => s
                .parse()
                .map_err(|_| KvError::Protocol(format!("{key} is not an integer")))?,
            _ => return Err(KvError::Protocol(format!("{key} is not an integer"))),
        };
        let next = current + 1;
        entry.value = Value::Text(next.to_string());
        Ok(next)
    }

    async fn list_append(&self, key: &str, value: &str) -> KvResult<i64> {
        let mut entries = self.entries.lock().await;
        let expired = entries.get(key).is_some_and(|e| e.is_expired());
        if expired {
            entries.remove(key);
        }
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::List(Vec::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::List(items) => {
                items.push(value.to_string());
                Ok(items.len() as i64)
            }
            _ => Err(KvError::Protocol(format!("{key} is not a list"))),
        }
    }

    async fn list_trim(&self, key: &str, start: isize, stop: isize) -> KvResult<()> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(key) {
            if let Value::List(items) = &mut entry.value {
                match resolve_range(items.len(), start, stop) {
                    Some((lo, hi)) => {
                        *items = items[lo..=hi].to_vec();
                    }
                    None => {
                        entries.remove(key);
                    }
                }
            }
        }
        Ok(())
    }

    async fn list_range(&self, key: &str, start: isize, stop: isize) -> KvResult<Vec<String>> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.is_expired() => {
                entries.remove(key);
                Ok(Vec::new())
            }
            Some(entry) => match &entry.value {
                Value::List(items) => Ok(resolve_range(items.len(), start, stop)
                    .map(|(lo, hi)| items[lo..=hi].to_vec())
                    .unwrap_or_default()),
                _ => Err(KvError::Protocol(format!("{key} is not a list"))),
            },
            None => Ok(Vec::new()),
        }
    }

    async fn set_add(&self, key: &str, member: &str) -> KvResult<bool> {
        let mut entries = self.entries.lock().await;
        let expired = entries.get(key).is_some_and(|e| e.is_expired());
        if expired {
            entries.remove(key);
        }
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Set(BTreeSet::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Set(members) => Ok(members.insert(member.to_string())),
            _ => Err(KvError::Protocol(format!("{key} is not a set"))),
        }
    }

    async fn set_remove(&self, key: &str, member: &str) -> KvResult<bool> {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(key) {
            Some(entry) => match &mut entry.value {
                Value::Set(members) => Ok(members.remove(member)),
                _ => Err(KvError::Protocol(format!("{key} is not a set"))),
            },
            None => Ok(false),
        }
    }

    async fn set_members(&self, key: &str) -> KvResult<Vec<String>> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.is_expired() => {
                entries.remove(key);
                Ok(Vec::new())
            }
            Some(entry) => match &entry.value {
                Value::Set(members) => Ok(members.iter().cloned().collect()),
                _ => Err(KvError::Protocol(format!("{key} is not a set"))),
            },
            None => Ok(Vec::new()),
        }
    }

    async fn set_contains(&self, key: &str, member: &str) -> KvResult<bool> {
        Ok(self.set_members(key).await?.iter().any(|m| m == member))
    }

    async fn publish(&self, channel: &str, payload: &str) -> KvResult<()> {
        let mut channels = self.channels.lock().await;
        if let Some(senders) = channels.get_mut(channel) {
            senders.retain(|tx| tx.send(payload.to_string()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> KvResult<UnboundedReceiver<String>> {
        let (tx, rx) = unbounded_channel();
        self.channels
            .lock()
            .await
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_if_absent_acts_as_lock() {
        let kv = MemoryKvStore::new();
        assert!(kv
            .set_if_absent("lock", "a", Duration::from_secs(60))
            .await
            .unwrap());
        assert!(!kv
            .set_if_absent("lock", "b", Duration::from_secs(60))
            .await
            .unwrap());
        assert_eq!(kv.get("lock").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn expired_entries_read_as_missing() {
        let kv = MemoryKvStore::new();
        kv.set_ex("k", "v", Duration::from_millis(5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
        // The slot is free again for set-if-absent.
        assert!(kv
            .set_if_absent("k", "w", Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn list_trim_keeps_newest_suffix() {
        let kv = MemoryKvStore::new();
        for i in 0..5 {
            kv.list_append("l", &i.to_string()).await.unwrap();
        }
        // Keep the last three entries.
        kv.list_trim("l", -3, -1).await.unwrap();
        assert_eq!(kv.list_range("l", 0, -1).await.unwrap(), ["2", "3", "4"]);
    }

    #[tokio::test]
    async fn increment_starts_at_one() {
        let kv = MemoryKvStore::new();
        assert_eq!(kv.increment("c").await.unwrap(), 1);
        assert_eq!(kv.increment("c").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let kv = MemoryKvStore::new();
        let mut rx1 = kv.subscribe("ch").await.unwrap();
        let mut rx2 = kv.subscribe("ch").await.unwrap();
        kv.publish("ch", "hello").await.unwrap();
        assert_eq!(rx1.recv().await.unwrap(), "hello");
        assert_eq!(rx2.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn set_membership_round_trip() {
        let kv = MemoryKvStore::new();
        assert!(kv.set_add("s", "a").await.unwrap());
        assert!(!kv.set_add("s", "a").await.unwrap());
        assert!(kv.set_contains("s", "a").await.unwrap());
        assert!(kv.set_remove("s", "a").await.unwrap());
        assert!(!kv.set_contains("s", "a").await.unwrap());
    }
}
