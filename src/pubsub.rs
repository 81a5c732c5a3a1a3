use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::mpsc;
use uuid::Uuid;

const SUBSCRIBER_CAPACITY: usize = 64;

pub type Subscription = mpsc::Receiver<String>;

/// In-process topic fan-out, keyed by camera UUID.
///
/// Grounded almost verbatim on the original's in-memory pub/sub: a topic maps
/// to an ordered list of bounded channels; unsubscribe removes by identity
/// with swap-remove; broadcast is non-blocking so one slow subscriber can
/// never stall the publisher or its peers.
pub struct PubSub {
    topics: RwLock<HashMap<Uuid, Vec<mpsc::Sender<String>>>>,
}

impl Default for PubSub {
    fn default() -> Self {
        Self::new()
    }
}

impl PubSub {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
        }
    }

    /// Appends a fresh channel for `topic` and returns the receiving half.
    pub fn subscribe(&self, topic: Uuid) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let mut topics = self.topics.write().expect("pubsub lock poisoned");
        topics.entry(topic).or_default().push(tx);
        rx
    }

    /// Removes a subscriber by channel identity (compared via `Sender::same_channel`),
    /// using swap-remove for O(1) removal; drops the topic entry once empty.
    pub fn unsubscribe(&self, topic: Uuid, sender: &mpsc::Sender<String>) {
        let mut topics = self.topics.write().expect("pubsub lock poisoned");
        if let Some(senders) = topics.get_mut(&topic) {
            if let Some(idx) = senders.iter().position(|s| s.same_channel(sender)) {
                senders.swap_remove(idx);
            }
            if senders.is_empty() {
                topics.remove(&topic);
            }
        }
    }

    /// Drops every subscriber for a topic, e.g. on unpair.
    pub fn purge(&self, topic: Uuid) {
        let mut topics = self.topics.write().expect("pubsub lock poisoned");
        topics.remove(&topic);
    }

    /// Non-blocking fan-out: a full subscriber channel silently drops the
    /// message rather than stalling the publisher.
    pub fn broadcast(&self, topic: Uuid, msg: &str) {
        let topics = self.topics.read().expect("pubsub lock poisoned");
        if let Some(senders) = topics.get(&topic) {
            for sender in senders {
                let _ = sender.try_send(msg.to_string());
            }
        }
    }

    pub fn subscriber_count(&self, topic: Uuid) -> usize {
        let topics = self.topics.read().expect("pubsub lock poisoned");
        topics.get(&topic).map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_delivers_to_all_subscribers() {
        let pubsub = PubSub::new();
        let topic = Uuid::new_v4();
        let mut rx1 = pubsub.subscribe(topic);
        let mut rx2 = pubsub.subscribe(topic);

        pubsub.broadcast(topic, "hello");

        assert_eq!(rx1.recv().await.unwrap(), "hello");
        assert_eq!(rx2.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn broadcast_to_unknown_topic_is_a_noop() {
        let pubsub = PubSub::new();
        pubsub.broadcast(Uuid::new_v4(), "nobody listening");
    }

    #[tokio::test]
    async fn unsubscribe_removes_only_the_matching_channel() {
        let pubsub = PubSub::new();
        let topic = Uuid::new_v4();
        let rx1 = pubsub.subscribe(topic);
        let _rx2 = pubsub.subscribe(topic);

        let senders_snapshot = {
            let topics = pubsub.topics.read().unwrap();
            topics.get(&topic).unwrap().clone()
        };
        pubsub.unsubscribe(topic, &senders_snapshot[0]);
        assert_eq!(pubsub.subscriber_count(topic), 1);
        drop(rx1);
    }

    #[tokio::test]
    async fn purge_drops_topic_entirely() {
        let pubsub = PubSub::new();
        let topic = Uuid::new_v4();
        let _rx = pubsub.subscribe(topic);
        pubsub.purge(topic);
        assert_eq!(pubsub.subscriber_count(topic), 0);
    }

    #[tokio::test]
    async fn full_subscriber_channel_drops_message_without_blocking() {
        let pubsub = PubSub::new();
        let topic = Uuid::new_v4();
        let mut rx = pubsub.subscribe(topic);

        for _ in 0..SUBSCRIBER_CAPACITY + 5 {
            pubsub.broadcast(topic, "x");
        }

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert!(received <= SUBSCRIBER_CAPACITY);
    }
}
