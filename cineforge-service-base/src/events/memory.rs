use crate::events::{AttributeFilter, BusError, Delivery, EventBus, EventEnvelope, Subscription};
use async_trait::async_trait;
use cineforge_common::metrics::EVENTS_PUBLISHED;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

struct SubscriberEntry {
    filter: AttributeFilter,
    tx: mpsc::UnboundedSender<Delivery>,
}

/// Broker for single-process deployments and tests. Each subscriber has its
/// own unbounded queue; publishing fans out to every subscriber whose
/// filter matches. Dead subscribers are pruned on publish.
#[derive(Default)]
pub struct InMemoryEventBus {
    topics: Mutex<HashMap<String, Vec<SubscriberEntry>>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<SubscriberEntry>>> {
        match self.topics.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, topic: &str, envelope: EventEnvelope) -> Result<(), BusError> {
        EVENTS_PUBLISHED
            .with_label_values(&[topic, envelope.event_type().unwrap_or("unknown")])
            .inc();
        let mut topics = self.locked();
        let subscribers = topics.entry(topic.to_string()).or_default();
        subscribers.retain(|entry| {
            if !entry.filter.matches(&envelope) {
                return !entry.tx.is_closed();
            }
            entry
                .tx
                .send(Delivery {
                    envelope: envelope.clone(),
                    attempt: 1,
                })
                .is_ok()
        });
        debug!(topic, event_type = ?envelope.event_type(), "published event");
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        filter: AttributeFilter,
    ) -> Result<Subscription, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let redeliver_tx = tx.clone();
        self.locked()
            .entry(topic.to_string())
            .or_default()
            .push(SubscriberEntry { filter, tx });
        Ok(Subscription::new(rx, redeliver_tx))
    }
}
