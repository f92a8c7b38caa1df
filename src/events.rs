//! Chain-scoped publish/subscribe bus.
//!
//! The engine never addresses writers, displays or plots directly. It publishes
//! [`AcqEvent`]s on the [`EventBus`] owned by the chain and every consumer
//! subscribes on its own. The bus is a `tokio::sync::broadcast` channel: a slow
//! subscriber only loses the oldest events (it receives `Lagged`), publishers
//! never block.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

use crate::channel::Payload;

/// Default number of events buffered per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Event published by the engine.
#[derive(Debug, Clone)]
pub enum AcqEvent {
    /// The object began a capture phase (after `start()` or a re-armed trigger).
    Start { object: String },
    /// The object's reading task finished at the end of the run.
    End { object: String },
    /// A channel accepted new data.
    NewData {
        object: String,
        channel: String,
        data: Arc<Payload>,
    },
}

impl AcqEvent {
    /// Name of the acquisition object that produced the event.
    pub fn object(&self) -> &str {
        match self {
            AcqEvent::Start { object } | AcqEvent::End { object } => object,
            AcqEvent::NewData { object, .. } => object,
        }
    }

    /// Short event label (`start`, `end`, `new_data`).
    pub fn kind(&self) -> &'static str {
        match self {
            AcqEvent::Start { .. } => "start",
            AcqEvent::End { .. } => "end",
            AcqEvent::NewData { .. } => "new_data",
        }
    }
}

/// Sender side of the event bus. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<AcqEvent>,
}

impl EventBus {
    /// Create a bus buffering `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to all events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<AcqEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Having no subscriber is not an error.
    pub fn publish(&self, event: AcqEvent) {
        trace!(kind = event.kind(), object = event.object(), "publish");
        let _ = self.sender.send(event);
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
