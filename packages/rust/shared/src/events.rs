//! Pipeline event bus.
//!
//! Built on a `tokio::sync::broadcast` channel: publishing never waits on
//! subscribers, and a subscriber that falls behind by more than the channel
//! capacity skips the oldest events (reported as [`EventBusError::Lagged`]).
//! Subscribing or dropping a receiver is safe while a publish is in flight.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::types::{KnowledgeItem, Pattern, Prediction, RawItem};

/// Default number of buffered events per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Every event emitted by ingestion and the composed pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum PipelineEvent {
    #[serde(rename = "item:ingested")]
    ItemIngested(Box<RawItem>),
    #[serde(rename = "batch:complete")]
    BatchComplete { source: String, count: usize },
    #[serde(rename = "error")]
    Error { source: String, error: String },
    #[serde(rename = "knowledge:added")]
    KnowledgeAdded(Box<KnowledgeItem>),
    #[serde(rename = "pattern:discovered")]
    PatternDiscovered(Box<Pattern>),
    #[serde(rename = "prediction:made")]
    PredictionMade(Box<Prediction>),
}

impl PipelineEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ItemIngested(_) => "item:ingested",
            Self::BatchComplete { .. } => "batch:complete",
            Self::Error { .. } => "error",
            Self::KnowledgeAdded(_) => "knowledge:added",
            Self::PatternDiscovered(_) => "pattern:discovered",
            Self::PredictionMade(_) => "prediction:made",
        }
    }
}

/// Cloneable handle for publishing and subscribing to pipeline events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: PipelineEvent) {
        let name = event.name();
        match self.sender.send(event) {
            Ok(receivers) => debug!(event = name, receivers, "event published"),
            Err(_) => debug!(event = name, "no subscribers listening to event"),
        }
    }

    /// Subscribe to every event published from now on.
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Get the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

/// Receiving half of an [`EventBus`] subscription. Dropping it unsubscribes.
pub struct EventReceiver {
    receiver: broadcast::Receiver<PipelineEvent>,
}

impl EventReceiver {
    /// Wait for the next event.
    pub async fn recv(&mut self) -> Result<PipelineEvent, EventBusError> {
        self.receiver.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => EventBusError::Closed,
            broadcast::error::RecvError::Lagged(n) => {
                warn!(skipped = n, "event receiver lagged");
                EventBusError::Lagged(n)
            }
        })
    }

    /// Take the next buffered event without waiting.
    pub fn try_recv(&mut self) -> Result<PipelineEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => EventBusError::Lagged(n),
        })
    }
}

/// Why a receive returned no event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventBusError {
    #[error("event bus closed")]
    Closed,
    #[error("receiver lagged by {0} events")]
    Lagged(u64),
    #[error("no event available")]
    Empty,
}
