//! In-process topic pub/sub
//!
//! Fan-out is at-most-once from the publishing instant: subscribers receive
//! messages published after they subscribed, lagging subscribers drop the
//! oldest buffered messages, and publishing never blocks.

use crate::events::PipelineEvent;
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::broadcast;

const TOPIC_CAPACITY: usize = 256;

/// Topic-keyed broadcast broker
pub struct Broker {
    topics: RwLock<HashMap<String, broadcast::Sender<PipelineEvent>>>,
}

impl Broker {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<PipelineEvent> {
        if let Some(sender) = self.topics.read().unwrap().get(topic) {
            return sender.clone();
        }
        let mut topics = self.topics.write().unwrap();
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }

    /// Publish to a topic. Messages published with no subscribers are
    /// dropped silently.
    pub fn publish(&self, topic: &str, event: PipelineEvent) {
        let sender = self.sender(topic);
        let delivered = sender.send(event).unwrap_or(0);
        tracing::trace!(topic, delivered, "published");
    }

    /// Subscribe to a topic. Each subscriber gets an independent cursor
    /// starting at the subscription instant.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<PipelineEvent> {
        self.sender(topic).subscribe()
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}
