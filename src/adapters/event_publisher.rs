//! Event Publisher Adapters
//!
//! Implementations of the `EventPublisher` port: structured log lines,
//! an in-memory collector for tests, and a fan-out composite.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::domain::{DomainEvent, EventPublisher};
use crate::error::Result;

/// Publishes domain events as structured log lines.
///
/// Failures and data-loss events are logged at `warn`, everything else at
/// `info` (or `debug` when built with [`LoggingEventPublisher::quiet`]).
#[derive(Debug, Clone)]
pub struct LoggingEventPublisher {
    verbose: bool,
}

impl Default for LoggingEventPublisher {
    fn default() -> Self {
        Self { verbose: true }
    }
}

impl LoggingEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routine events at debug level.
    pub fn quiet() -> Self {
        Self { verbose: false }
    }

    fn is_alarming(event: &DomainEvent) -> bool {
        matches!(
            event,
            DomainEvent::WriteFailed { .. }
                | DomainEvent::HealIncomplete { .. }
                | DomainEvent::ObjectCorrupt { .. }
        )
    }
}

#[async_trait]
impl EventPublisher for LoggingEventPublisher {
    async fn publish(&self, event: DomainEvent) -> Result<()> {
        let event_type = event.event_type();
        let object = event.object().unwrap_or("-").to_string();
        let json = serde_json::to_string(&event)?;

        if Self::is_alarming(&event) {
            warn!(event_type, %object, event = %json, "Domain event");
        } else if self.verbose {
            info!(event_type, %object, event = %json, "Domain event");
        } else {
            debug!(event_type, %object, event = %json, "Domain event");
        }
        Ok(())
    }

    async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<()> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }
}

/// Keeps every published event in memory.
#[derive(Debug, Default)]
pub struct InMemoryEventCollector {
    events: parking_lot::RwLock<Vec<DomainEvent>>,
}

impl InMemoryEventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.read().clone()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Events whose `type` tag equals `event_type`.
    pub fn events_of_type(&self, event_type: &str) -> Vec<DomainEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }

    /// Events about one object, given in its display form.
    pub fn events_for_object(&self, object: &str) -> Vec<DomainEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.object() == Some(object))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventCollector {
    async fn publish(&self, event: DomainEvent) -> Result<()> {
        self.events.write().push(event);
        Ok(())
    }

    async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<()> {
        self.events.write().extend(events);
        Ok(())
    }
}

/// Forwards every event to each inner publisher.
///
/// A failing publisher is logged and skipped; the others still receive
/// the event.
#[derive(Default, Clone)]
pub struct CompositeEventPublisher {
    publishers: Vec<Arc<dyn EventPublisher>>,
}

impl CompositeEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publishers.push(publisher);
        self
    }
}

impl std::fmt::Debug for CompositeEventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeEventPublisher")
            .field("publisher_count", &self.publishers.len())
            .finish()
    }
}

#[async_trait]
impl EventPublisher for CompositeEventPublisher {
    async fn publish(&self, event: DomainEvent) -> Result<()> {
        for publisher in &self.publishers {
            if let Err(e) = publisher.publish(event.clone()).await {
                warn!(event_type = event.event_type(), "Event publisher failed: {}", e);
            }
        }
        Ok(())
    }

    async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<()> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }
}
