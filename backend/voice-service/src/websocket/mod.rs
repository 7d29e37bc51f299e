//! Push channel manager.
//!
//! Tracks every authenticated connection under its user, fans domain events
//! out to subscribed connections, and falls back to the durable per-topic
//! buffer when nothing can take a delivery. Registration and publication to
//! the same user synchronize on that user's lock; the lock is never held
//! across a network send (senders are unbounded enqueues).

use crate::websocket::buffer::PushBuffer;
use crate::websocket::frames::ServerFrame;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

pub mod buffer;
pub mod frames;
pub mod session;

/// What the manager pushes into a connection's outbound queue.
#[derive(Debug)]
pub enum PushMessage {
    Frame(ServerFrame),
    /// Server is shutting down; close with code `server-shutdown`.
    Shutdown,
}

struct Subscriber {
    conn_id: Uuid,
    topics: HashSet<String>,
    sender: UnboundedSender<PushMessage>,
}

type UserConns = Arc<Mutex<Vec<Subscriber>>>;

pub struct ChannelManager {
    users: RwLock<HashMap<Uuid, UserConns>>,
    buffer: PushBuffer,
}

impl ChannelManager {
    pub fn new(buffer: PushBuffer) -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            buffer,
        }
    }

    async fn user_conns(&self, user_id: Uuid) -> Option<UserConns> {
        self.users.read().await.get(&user_id).cloned()
    }

    /// Register an authenticated connection and hand back its outbound queue.
    pub async fn register(&self, user_id: Uuid, conn_id: Uuid) -> UnboundedReceiver<PushMessage> {
        let (tx, rx) = unbounded_channel();

        let conns = {
            let mut users = self.users.write().await;
            users.entry(user_id).or_default().clone()
        };
        let mut conns = conns.lock().await;
        conns.push(Subscriber {
            conn_id,
            topics: HashSet::new(),
            sender: tx,
        });
        debug!(user_id = %user_id, conn_id = %conn_id, total = conns.len(), "push connection registered");

        rx
    }

    pub async fn deregister(&self, user_id: Uuid, conn_id: Uuid) {
        let Some(conns) = self.user_conns(user_id).await else {
            return;
        };

        let now_empty = {
            let mut conns = conns.lock().await;
            conns.retain(|s| s.conn_id != conn_id);
            conns.is_empty()
        };

        if now_empty {
            let mut users = self.users.write().await;
            // Re-check under the write lock; a new connection may have raced in.
            if let Some(existing) = users.get(&user_id) {
                if existing.lock().await.is_empty() {
                    users.remove(&user_id);
                }
            }
        }
        debug!(user_id = %user_id, conn_id = %conn_id, "push connection deregistered");
    }

    /// Add the topic to the connection's set, then snapshot the buffer for
    /// replay. The ordering (set first) guarantees events published mid-replay
    /// are delivered live rather than lost.
    pub async fn subscribe(
        &self,
        user_id: Uuid,
        conn_id: Uuid,
        topic: &str,
    ) -> (Vec<String>, usize) {
        if let Some(conns) = self.user_conns(user_id).await {
            let mut conns = conns.lock().await;
            if let Some(subscriber) = conns.iter_mut().find(|s| s.conn_id == conn_id) {
                subscriber.topics.insert(topic.to_string());
            }
        }

        match self.buffer.replayable(user_id, topic).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                // Buffer unavailable reads as empty; the next reconnect retries.
                tracing::warn!(user_id = %user_id, topic, error = %err, "buffer replay unavailable");
                (Vec::new(), 0)
            }
        }
    }

    pub async fn unsubscribe(&self, user_id: Uuid, conn_id: Uuid, topic: &str) {
        if let Some(conns) = self.user_conns(user_id).await {
            let mut conns = conns.lock().await;
            if let Some(subscriber) = conns.iter_mut().find(|s| s.conn_id == conn_id) {
                subscriber.topics.remove(topic);
            }
        }
    }

    /// Drop consumed buffer entries after a fully delivered replay.
    pub async fn confirm_replay(&self, user_id: Uuid, topic: &str, consumed: usize) {
        if let Err(err) = self.buffer.consume(user_id, topic, consumed).await {
            tracing::warn!(user_id = %user_id, topic, error = %err, "buffer consume failed; entries may replay again");
        }
    }

    /// Deliver an event to every open connection of `user_id` subscribed to
    /// `topic`. When none accepts it, the payload goes to the durable buffer.
    pub async fn publish(&self, user_id: Uuid, topic: &str, frame: ServerFrame) {
        let mut delivered = 0usize;

        if let Some(conns) = self.user_conns(user_id).await {
            let mut conns = conns.lock().await;
            conns.retain(|subscriber| {
                if !subscriber.topics.contains(topic) {
                    return true;
                }
                match subscriber.sender.send(PushMessage::Frame(frame.clone())) {
                    Ok(()) => {
                        delivered += 1;
                        true
                    }
                    // Dead connection; prune it here.
                    Err(_) => false,
                }
            });
        }

        if delivered == 0 {
            let payload = frame.encode();
            if let Err(err) = self.buffer.append(user_id, topic, &payload).await {
                tracing::warn!(user_id = %user_id, topic, error = %err, "push event lost: no delivery and buffer unavailable");
            } else {
                debug!(user_id = %user_id, topic, "event buffered for later delivery");
            }
        }
    }

    /// Notify every connection of shutdown. The HTTP layer stops accepting
    /// new connections separately; callers wait the drain period afterwards.
    pub async fn shutdown(&self) {
        let users: Vec<UserConns> = self.users.read().await.values().cloned().collect();
        let mut notified = 0usize;

        for conns in users {
            let conns = conns.lock().await;
            for subscriber in conns.iter() {
                if subscriber.sender.send(PushMessage::Shutdown).is_ok() {
                    notified += 1;
                }
            }
        }

        info!(connections = notified, "push channel shutdown broadcast");
    }

    /// Open connections for a user (diagnostics and tests).
    pub async fn connection_count(&self, user_id: Uuid) -> usize {
        match self.user_conns(user_id).await {
            Some(conns) => conns.lock().await.len(),
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PushSettings;
    use kv_store::MemoryKvStore;

    fn manager() -> ChannelManager {
        let settings = PushSettings {
            ping_interval_ms: 30000,
            auth_timeout_ms: 10000,
            inactive_timeout_ms: 30000,
            buffer_max_len: 50,
            buffer_ttl_secs: 86400,
            message_expiry_ms: 300_000,
        };
        ChannelManager::new(PushBuffer::new(Arc::new(MemoryKvStore::new()), &settings))
    }

    fn progress(progress: f32) -> ServerFrame {
        ServerFrame::ConversationProgress {
            conversation_id: Uuid::nil(),
            progress,
        }
    }

    #[tokio::test]
    async fn publish_with_no_connections_buffers() {
        let mgr = manager();
        let user = Uuid::now_v7();

        mgr.publish(user, "conversation:c", progress(0.5)).await;

        let (replay, total) = mgr.subscribe(user, Uuid::now_v7(), "conversation:c").await;
        assert_eq!(total, 1);
        assert_eq!(replay.len(), 1);
        assert!(replay[0].contains("conversation_progress"));
    }

    #[tokio::test]
    async fn subscribed_connection_receives_instead_of_buffering() {
        let mgr = manager();
        let user = Uuid::now_v7();
        let conn = Uuid::now_v7();

        let mut rx = mgr.register(user, conn).await;
        mgr.subscribe(user, conn, "conversation:c").await;

        mgr.publish(user, "conversation:c", progress(0.25)).await;

        match rx.recv().await.unwrap() {
            PushMessage::Frame(ServerFrame::ConversationProgress { progress, .. }) => {
                assert_eq!(progress, 0.25)
            }
            other => panic!("unexpected message: {other:?}"),
        }

        // Nothing was buffered.
        let (replay, total) = mgr.subscribe(user, conn, "conversation:c").await;
        assert!(replay.is_empty());
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn unsubscribed_connections_do_not_count_as_delivery() {
        let mgr = manager();
        let user = Uuid::now_v7();
        let conn = Uuid::now_v7();

        // Connected but not subscribed to this topic.
        let mut rx = mgr.register(user, conn).await;
        mgr.subscribe(user, conn, "conversation:other").await;

        mgr.publish(user, "conversation:c", progress(0.75)).await;

        assert!(rx.try_recv().is_err());
        let (replay, _) = mgr.subscribe(user, conn, "conversation:c").await;
        assert_eq!(replay.len(), 1);
    }

    #[tokio::test]
    async fn events_are_delivered_in_publish_order() {
        let mgr = manager();
        let user = Uuid::now_v7();
        let conn = Uuid::now_v7();

        let mut rx = mgr.register(user, conn).await;
        mgr.subscribe(user, conn, "conversation:c").await;

        for i in 0..5 {
            mgr.publish(user, "conversation:c", progress(i as f32 / 10.0))
                .await;
        }

        for i in 0..5 {
            match rx.recv().await.unwrap() {
                PushMessage::Frame(ServerFrame::ConversationProgress { progress, .. }) => {
                    assert_eq!(progress, i as f32 / 10.0)
                }
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn dead_connections_are_pruned_and_event_buffered() {
        let mgr = manager();
        let user = Uuid::now_v7();
        let conn = Uuid::now_v7();

        let rx = mgr.register(user, conn).await;
        mgr.subscribe(user, conn, "conversation:c").await;
        drop(rx);

        mgr.publish(user, "conversation:c", progress(0.5)).await;

        assert_eq!(mgr.connection_count(user).await, 0);
        let (replay, _) = mgr.subscribe(user, Uuid::now_v7(), "conversation:c").await;
        assert_eq!(replay.len(), 1);
    }

    #[tokio::test]
    async fn confirmed_replay_clears_the_buffer() {
        let mgr = manager();
        let user = Uuid::now_v7();
        let conn = Uuid::now_v7();

        mgr.publish(user, "conversation:c", progress(0.5)).await;

        let (replay, total) = mgr.subscribe(user, conn, "conversation:c").await;
        assert_eq!(replay.len(), 1);
        mgr.confirm_replay(user, "conversation:c", total).await;

        let (replay, total) = mgr.subscribe(user, conn, "conversation:c").await;
        assert!(replay.is_empty());
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn repeated_subscribe_is_idempotent_and_still_replays() {
        let mgr = manager();
        let user = Uuid::now_v7();
        let conn = Uuid::now_v7();

        let mut rx = mgr.register(user, conn).await;
        mgr.publish(user, "conversation:c", progress(0.5)).await;

        let (first, _) = mgr.subscribe(user, conn, "conversation:c").await;
        assert_eq!(first.len(), 1);
        // Second subscribe: same topic set, replay attempt still happens.
        let (second, total) = mgr.subscribe(user, conn, "conversation:c").await;
        assert_eq!(second.len(), 1);
        mgr.confirm_replay(user, "conversation:c", total).await;

        // Live delivery still single.
        mgr.publish(user, "conversation:c", progress(0.9)).await;
        let mut live = 0;
        while let Ok(msg) = rx.try_recv() {
            if matches!(msg, PushMessage::Frame(_)) {
                live += 1;
            }
        }
        assert_eq!(live, 1);
    }

    #[tokio::test]
    async fn shutdown_notifies_every_connection() {
        let mgr = manager();
        let user_a = Uuid::now_v7();
        let user_b = Uuid::now_v7();

        let mut rx_a = mgr.register(user_a, Uuid::now_v7()).await;
        let mut rx_b = mgr.register(user_b, Uuid::now_v7()).await;

        mgr.shutdown().await;

        assert!(matches!(rx_a.recv().await.unwrap(), PushMessage::Shutdown));
        assert!(matches!(rx_b.recv().await.unwrap(), PushMessage::Shutdown));
    }
}
