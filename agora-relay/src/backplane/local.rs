//! In-process backplane over tokio broadcast channels.
//!
//! One broadcast channel per topic. Hubs that share a `LocalBackplane`
//! behave like separate processes sharing a real pub/sub server, which is
//! how the multi-hub tests run. A lagging subscriber skips messages rather
//! than blocking publishers.

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use super::{Backplane, BackplaneError, Subscription};

/// Single-process pub/sub.
#[derive(Clone)]
pub struct LocalBackplane {
    topics: Arc<Mutex<HashMap<String, broadcast::Sender<Arc<Vec<u8>>>>>>,
    capacity: usize,
    published: Arc<AtomicU64>,
}

impl LocalBackplane {
    /// `capacity` is the per-subscriber buffer before lagging kicks in.
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
            capacity,
            published: Arc::new(AtomicU64::new(0)),
        }
    }

    fn sender(&self, topic: &str) -> Result<broadcast::Sender<Arc<Vec<u8>>>, BackplaneError> {
        let mut topics = self
            .topics
            .lock()
            .map_err(|_| BackplaneError::Connection("topic table poisoned".into()))?;
        let sender = topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        Ok(sender.clone())
    }

    /// Messages published over the backplane's lifetime.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Current subscriber count for `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .map(|topics| topics.get(topic).map_or(0, |s| s.receiver_count()))
            .unwrap_or(0)
    }
}

impl Default for LocalBackplane {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl Backplane for LocalBackplane {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BackplaneError> {
        let sender = self.sender(topic)?;
        // No subscribers is not an error: nobody is listening yet.
        let _ = sender.send(Arc::new(payload));
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BackplaneError> {
        let rx = self.sender(topic)?.subscribe();
        let topic = topic.to_string();

        let stream = stream::unfold((rx, topic), |(mut rx, topic)| async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => return Some((payload.as_ref().clone(), (rx, topic))),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Backplane subscriber on {topic} lagged by {n} messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let backplane = LocalBackplane::new(16);
        let mut a = backplane.subscribe("t").await.unwrap();
        let mut b = backplane.subscribe("t").await.unwrap();
        assert_eq!(backplane.subscriber_count("t"), 2);

        backplane.publish("t", vec![1, 2, 3]).await.unwrap();

        assert_eq!(a.next().await, Some(vec![1, 2, 3]));
        assert_eq!(b.next().await, Some(vec![1, 2, 3]));
        assert_eq!(backplane.published(), 1);
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let backplane = LocalBackplane::new(16);
        let mut other = backplane.subscribe("other").await.unwrap();

        backplane.publish("t", vec![9]).await.unwrap();

        let result = timeout(Duration::from_millis(50), other.next()).await;
        assert!(result.is_err(), "other topic must stay silent");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let backplane = LocalBackplane::new(16);
        assert!(backplane.publish("t", vec![1]).await.is_ok());
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips_ahead() {
        let backplane = LocalBackplane::new(2);
        let mut sub = backplane.subscribe("t").await.unwrap();

        for i in 0..5u8 {
            backplane.publish("t", vec![i]).await.unwrap();
        }

        // The two newest payloads survive.
        assert_eq!(sub.next().await, Some(vec![3]));
        assert_eq!(sub.next().await, Some(vec![4]));
    }
}
