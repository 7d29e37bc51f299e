//! Durable per-(user, topic) buffer for undeliverable push events.
//!
//! Events that reach no open subscribed connection are appended to a KV list
//! `ws:buffer:<userId>:<topic>`, trimmed to the newest `buffer_max_len`
//! entries, with the list TTL refreshed on every append. Replay skips entries
//! older than the message expiry and consumes exactly the entries it
//! replayed, so events appended mid-replay survive.

use crate::config::PushSettings;
use crate::error::AppResult;
use chrono::Utc;
use kv_store::KeyValueStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

fn buffer_key(user_id: Uuid, topic: &str) -> String {
    format!("ws:buffer:{user_id}:{topic}")
}

#[derive(Debug, Serialize, Deserialize)]
struct BufferedEntry {
    payload: String,
    enqueued_at_ms: i64,
}

#[derive(Clone)]
pub struct PushBuffer {
    kv: Arc<dyn KeyValueStore>,
    max_len: usize,
    ttl: Duration,
    message_expiry_ms: i64,
}

impl PushBuffer {
    pub fn new(kv: Arc<dyn KeyValueStore>, settings: &PushSettings) -> Self {
        Self {
            kv,
            max_len: settings.buffer_max_len,
            ttl: Duration::from_secs(settings.buffer_ttl_secs),
            message_expiry_ms: settings.message_expiry_ms as i64,
        }
    }

    /// Append an undelivered payload, trim to the newest entries, refresh TTL.
    pub async fn append(&self, user_id: Uuid, topic: &str, payload: &str) -> AppResult<()> {
        let key = buffer_key(user_id, topic);
        let entry = BufferedEntry {
            payload: payload.to_string(),
            enqueued_at_ms: Utc::now().timestamp_millis(),
        };
        let raw = serde_json::to_string(&entry).expect("buffer entries always serialize");

        self.kv.list_append(&key, &raw).await?;
        self.kv
            .list_trim(&key, -(self.max_len as isize), -1)
            .await?;
        self.kv.expire(&key, self.ttl).await?;
        Ok(())
    }

    /// Entries eligible for replay, in enqueue order, plus the total number of
    /// buffered entries they were drawn from (for [`consume`](Self::consume)).
    pub async fn replayable(&self, user_id: Uuid, topic: &str) -> AppResult<(Vec<String>, usize)> {
        let key = buffer_key(user_id, topic);
        let raw_entries = self.kv.list_range(&key, 0, -1).await?;
        let total = raw_entries.len();
        let cutoff = Utc::now().timestamp_millis() - self.message_expiry_ms;

        let mut payloads = Vec::new();
        for raw in raw_entries {
            match serde_json::from_str::<BufferedEntry>(&raw) {
                Ok(entry) if entry.enqueued_at_ms >= cutoff => payloads.push(entry.payload),
                Ok(_) => {} // expired entry, skipped
                Err(err) => {
                    warn!(user_id = %user_id, topic, error = %err, "dropping malformed buffer entry");
                }
            }
        }

        Ok((payloads, total))
    }

    /// Drop the first `count` entries after a fully delivered replay. Events
    /// appended after the replay snapshot stay buffered.
    pub async fn consume(&self, user_id: Uuid, topic: &str, count: usize) -> AppResult<()> {
        if count == 0 {
            return Ok(());
        }
        let key = buffer_key(user_id, topic);
        self.kv.list_trim(&key, count as isize, -1).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kv_store::MemoryKvStore;

    fn settings(max_len: usize, message_expiry_ms: u64) -> PushSettings {
        PushSettings {
            ping_interval_ms: 30000,
            auth_timeout_ms: 10000,
            inactive_timeout_ms: 30000,
            buffer_max_len: max_len,
            buffer_ttl_secs: 86400,
            message_expiry_ms,
        }
    }

    fn buffer(max_len: usize) -> PushBuffer {
        PushBuffer::new(Arc::new(MemoryKvStore::new()), &settings(max_len, 300_000))
    }

    #[tokio::test]
    async fn replay_preserves_enqueue_order() {
        let buf = buffer(50);
        let user = Uuid::now_v7();

        for i in 0..3 {
            buf.append(user, "conversation:c", &format!("event-{i}"))
                .await
                .unwrap();
        }

        let (payloads, total) = buf.replayable(user, "conversation:c").await.unwrap();
        assert_eq!(payloads, ["event-0", "event-1", "event-2"]);
        assert_eq!(total, 3);
    }

    #[tokio::test]
    async fn buffer_trims_to_newest_entries() {
        let buf = buffer(3);
        let user = Uuid::now_v7();

        for i in 0..5 {
            buf.append(user, "conversation:c", &format!("event-{i}"))
                .await
                .unwrap();
        }

        let (payloads, _) = buf.replayable(user, "conversation:c").await.unwrap();
        assert_eq!(payloads, ["event-2", "event-3", "event-4"]);
    }

    #[tokio::test]
    async fn replay_skips_entries_past_message_expiry() {
        let kv = Arc::new(MemoryKvStore::new());
        let buf = PushBuffer::new(kv.clone(), &settings(50, 300_000));
        let user = Uuid::now_v7();
        let key = buffer_key(user, "conversation:c");

        // One entry well past expiry, one fresh.
        let stale = serde_json::to_string(&BufferedEntry {
            payload: "stale".to_string(),
            enqueued_at_ms: Utc::now().timestamp_millis() - 600_000,
        })
        .unwrap();
        kv.list_append(&key, &stale).await.unwrap();
        buf.append(user, "conversation:c", "fresh").await.unwrap();

        let (payloads, total) = buf.replayable(user, "conversation:c").await.unwrap();
        assert_eq!(payloads, ["fresh"]);
        // Both entries still count toward consumption.
        assert_eq!(total, 2);
    }

    #[tokio::test]
    async fn consume_drops_only_the_replayed_prefix() {
        let buf = buffer(50);
        let user = Uuid::now_v7();

        buf.append(user, "conversation:c", "a").await.unwrap();
        buf.append(user, "conversation:c", "b").await.unwrap();
        let (_, total) = buf.replayable(user, "conversation:c").await.unwrap();

        // A new event lands between replay and consumption.
        buf.append(user, "conversation:c", "late").await.unwrap();
        buf.consume(user, "conversation:c", total).await.unwrap();

        let (payloads, _) = buf.replayable(user, "conversation:c").await.unwrap();
        assert_eq!(payloads, ["late"]);
    }

    #[tokio::test]
    async fn consuming_everything_empties_the_buffer() {
        let buf = buffer(50);
        let user = Uuid::now_v7();

        buf.append(user, "conversation:c", "a").await.unwrap();
        let (_, total) = buf.replayable(user, "conversation:c").await.unwrap();
        buf.consume(user, "conversation:c", total).await.unwrap();

        let (payloads, total) = buf.replayable(user, "conversation:c").await.unwrap();
        assert!(payloads.is_empty());
        assert_eq!(total, 0);
    }
}
