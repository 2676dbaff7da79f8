//! In-process event bus.

use async_trait::async_trait;
use futures::stream;
use gantry_core::events::{Event, subject_matches};
use gantry_core::ports::{EventBus, EventStream};
use gantry_core::{Error, Result};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::RwLock;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 1024;

/// Broadcasts events to subscribers and keeps a record of everything published.
pub struct InMemoryEventBus {
    sender: broadcast::Sender<Event>,
    published: RwLock<Vec<Event>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            published: RwLock::new(Vec::new()),
        }
    }

    /// Every event published so far, oldest first.
    pub async fn published(&self) -> Vec<Event> {
        self.published.read().await.clone()
    }

    /// Published events whose subject matches `pattern`.
    pub async fn published_matching(&self, pattern: &str) -> Vec<Event> {
        self.published
            .read()
            .await
            .iter()
            .filter(|e| subject_matches(pattern, &e.subject()))
            .cloned()
            .collect()
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, event: Event) -> Result<()> {
        debug!(subject = %event.subject(), "Publishing event");
        self.published.write().await.push(event.clone());
        // No subscribers is not an error.
        let _ = self.sender.send(event);
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<EventStream> {
        debug!("Subscribing to pattern: {}", pattern);
        let receiver = self.sender.subscribe();
        let pattern = pattern.to_string();

        let events = stream::unfold(receiver, move |mut receiver| {
            let pattern = pattern.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(event) if subject_matches(&pattern, &event.subject()) => {
                            return Some((Ok(event), receiver));
                        }
                        Ok(_) => continue,
                        Err(RecvError::Lagged(skipped)) => {
                            let error =
                                Error::EventBus(format!("Subscriber lagged by {} events", skipped));
                            return Some((Err(error), receiver));
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(Box::pin(events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use futures::StreamExt;
    use gantry_core::events::PipelineUnlockedPayload;

    fn unlocked(pipeline: &str) -> Event {
        Event::PipelineUnlocked(PipelineUnlockedPayload {
            pipeline_name: pipeline.to_string(),
            counter: 1,
            unlocked_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_subscriber_sees_matching_events_only() {
        let bus = InMemoryEventBus::new();
        let mut stream = bus.subscribe("pipeline.p1.*").await.unwrap();

        bus.publish(unlocked("p2")).await.unwrap();
        bus.publish(unlocked("p1")).await.unwrap();

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.subject(), "pipeline.p1.unlocked");
        assert_eq!(bus.published().await.len(), 2);
        assert_eq!(bus.published_matching("pipeline.>").await.len(), 2);
    }

    #[tokio::test]
    async fn test_subscriber_waits_for_a_match() {
        let bus = InMemoryEventBus::new();
        let mut stream = bus.subscribe("pipeline.p1.*").await.unwrap();
        let mut next = tokio_test::task::spawn(stream.next());
        tokio_test::assert_pending!(next.poll());

        bus.publish(unlocked("p2")).await.unwrap();
        tokio_test::assert_pending!(next.poll());

        bus.publish(unlocked("p1")).await.unwrap();
        let event = tokio_test::assert_ready!(next.poll()).unwrap().unwrap();
        assert_eq!(event.subject(), "pipeline.p1.unlocked");
    }
}
