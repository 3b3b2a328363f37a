//! Publish/subscribe hub over conversation topics.
//!
//! Topics are `/chat/{hex}` plus the global `/events`. Publishing reaches
//! every subscriber on this instance; delivery to other instances goes
//! through the job queue, never through the hub.

use axum::extract::ws::Message;
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};

const TOPIC_CAPACITY: usize = 128;

/// Topic for the global notification sockets.
pub const EVENTS_TOPIC: &str = "/events";

/// Topic for one conversation's chat sockets.
pub fn chat_topic(conversation_hex: &str) -> String {
    format!("/chat/{conversation_hex}")
}

#[derive(Debug, Default)]
pub struct ChannelHub {
    topics: RwLock<HashMap<String, broadcast::Sender<Message>>>,
}

impl ChannelHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a topic, creating it on first use.
    pub async fn subscribe(&self, topic: &str) -> broadcast::Receiver<Message> {
        let mut topics = self.topics.write().await;
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }

    /// Deliver a payload to every current subscriber of the topic on this
    /// instance. Returns how many subscribers it reached.
    pub async fn publish(&self, topic: &str, payload: Message) -> usize {
        let delivered = {
            let topics = self.topics.read().await;
            match topics.get(topic) {
                Some(sender) => sender.send(payload).unwrap_or(0),
                None => 0,
            }
        };
        if delivered == 0 {
            self.prune(topic).await;
        }
        delivered
    }

    /// Drop a topic once its last subscriber is gone.
    async fn prune(&self, topic: &str) {
        let mut topics = self.topics.write().await;
        if let Some(sender) = topics.get(topic) {
            if sender.receiver_count() == 0 {
                topics.remove(topic);
            }
        }
    }

    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }
}
