pub mod memory;
pub mod subscriber;

use async_trait::async_trait;
use cineforge_common::model::{JobEvent, PipelineEvent, EVENT_TYPE_ATTRIBUTE};
use cineforge_common::SafeDisplay;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;

pub use memory::InMemoryEventBus;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Topic is closed: {0}")]
    TopicClosed(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Bus error: {0}")]
    Internal(String),
}

impl SafeDisplay for BusError {
    fn to_safe_string(&self) -> String {
        self.to_string()
    }
}

/// Transport-level message: a JSON payload plus string attributes used for
/// subscription filtering. Attributes always include the event type.
#[derive(Clone, Debug, PartialEq)]
pub struct EventEnvelope {
    pub attributes: HashMap<String, String>,
    pub payload: Value,
}

impl EventEnvelope {
    pub fn new(event_type: &str, payload: Value) -> Self {
        let mut attributes = HashMap::new();
        attributes.insert(EVENT_TYPE_ATTRIBUTE.to_string(), event_type.to_string());
        Self {
            attributes,
            payload,
        }
    }

    pub fn with_attribute(mut self, key: &str, value: &str) -> Self {
        self.attributes.insert(key.to_string(), value.to_string());
        self
    }

    pub fn event_type(&self) -> Option<&str> {
        self.attributes.get(EVENT_TYPE_ATTRIBUTE).map(String::as_str)
    }

    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, BusError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| BusError::Serialization(e.to_string()))
    }
}

impl TryFrom<&JobEvent> for EventEnvelope {
    type Error = BusError;

    fn try_from(event: &JobEvent) -> Result<Self, Self::Error> {
        let payload =
            serde_json::to_value(event).map_err(|e| BusError::Serialization(e.to_string()))?;
        Ok(EventEnvelope::new(&event.event_type.to_string(), payload)
            .with_attribute("project_id", event.project_id.as_str()))
    }
}

impl TryFrom<&PipelineEvent> for EventEnvelope {
    type Error = BusError;

    fn try_from(event: &PipelineEvent) -> Result<Self, Self::Error> {
        let payload =
            serde_json::to_value(event).map_err(|e| BusError::Serialization(e.to_string()))?;
        let mut envelope = EventEnvelope::new(&event.event_type.to_string(), payload)
            .with_attribute("project_id", event.project_id.as_str());
        if let Some(command_id) = &event.command_id {
            envelope = envelope.with_attribute("command_id", command_id.as_str());
        }
        Ok(envelope)
    }
}

/// Attribute-based subscription filter: the named attribute must be one of
/// the accepted values. An empty accepted set matches everything.
#[derive(Clone, Debug)]
pub struct AttributeFilter {
    pub key: String,
    pub any_of: HashSet<String>,
}

impl AttributeFilter {
    pub fn event_type_in(types: &[&str]) -> Self {
        Self {
            key: EVENT_TYPE_ATTRIBUTE.to_string(),
            any_of: types.iter().map(|t| t.to_string()).collect(),
        }
    }

    pub fn all() -> Self {
        Self {
            key: EVENT_TYPE_ATTRIBUTE.to_string(),
            any_of: HashSet::new(),
        }
    }

    pub fn matches(&self, envelope: &EventEnvelope) -> bool {
        if self.any_of.is_empty() {
            return true;
        }
        envelope
            .attributes
            .get(&self.key)
            .map(|value| self.any_of.contains(value))
            .unwrap_or(false)
    }
}

/// A delivered message and how many times it has been handed out.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub envelope: EventEnvelope,
    pub attempt: u32,
}

/// Handle to a single subscriber queue. Messages are redelivered through
/// `nack`; completion of `next` without a nack acts as the ack.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Delivery>,
    redeliver_tx: mpsc::UnboundedSender<Delivery>,
}

impl Subscription {
    pub fn new(
        rx: mpsc::UnboundedReceiver<Delivery>,
        redeliver_tx: mpsc::UnboundedSender<Delivery>,
    ) -> Self {
        Self { rx, redeliver_tx }
    }

    /// `None` when the bus side hung up.
    pub async fn next(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    /// Requeues the message for redelivery with a bumped attempt counter.
    pub fn nack(&self, mut delivery: Delivery) {
        delivery.attempt += 1;
        let _ = self.redeliver_tx.send(delivery);
    }
}

/// Publish/subscribe transport with at-least-once delivery. The in-memory
/// implementation serves single-process deployments and tests; brokered
/// adapters implement the same trait out of tree.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, topic: &str, envelope: EventEnvelope) -> Result<(), BusError>;

    async fn subscribe(
        &self,
        topic: &str,
        filter: AttributeFilter,
    ) -> Result<Subscription, BusError>;
}
