//! Event Publisher Adapter
//!
//! `EventPublisher` backends: a tracing publisher that picks the log level
//! from the event kind, and a bounded in-memory history that backs the ops
//! `/events` endpoint and the test suites.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::domain::events::CacheEvent;
use crate::domain::ports::EventPublisher;
use crate::error::Result;

/// Events kept by [`InMemoryEventCollector::new`].
pub const DEFAULT_EVENT_HISTORY: usize = 1024;

/// Publishes cache events to the tracing pipeline.
///
/// Failed preloads log at warn, per-step and per-entity progress at debug,
/// everything else at info. With a history attached, every event is also
/// kept for the ops endpoints.
#[derive(Debug, Clone, Default)]
pub struct LoggingEventPublisher {
    history: Option<Arc<InMemoryEventCollector>>,
}

impl LoggingEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history(mut self, history: Arc<InMemoryEventCollector>) -> Self {
        self.history = Some(history);
        self
    }

    fn log(event: &CacheEvent) {
        let event_type = event.event_type();
        let json = serde_json::to_string(event).unwrap_or_else(|_| format!("{:?}", event));
        match event {
            CacheEvent::PreloadFailed { .. } => {
                warn!(event_type, event = %json, "Cache event")
            }
            CacheEvent::PreloadStepCompleted { .. } | CacheEvent::EntityRefreshed { .. } => {
                debug!(event_type, event = %json, "Cache event")
            }
            _ => info!(event_type, event = %json, "Cache event"),
        }
    }
}

#[async_trait]
impl EventPublisher for LoggingEventPublisher {
    async fn publish(&self, event: CacheEvent) -> Result<()> {
        Self::log(&event);
        if let Some(history) = &self.history {
            history.record(event);
        }
        Ok(())
    }

    async fn publish_all(&self, events: Vec<CacheEvent>) -> Result<()> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }
}

/// Bounded event history. The oldest event is dropped once full.
#[derive(Debug)]
pub struct InMemoryEventCollector {
    events: RwLock<VecDeque<CacheEvent>>,
    capacity: usize,
}

impl Default for InMemoryEventCollector {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_EVENT_HISTORY)
    }
}

impl InMemoryEventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: RwLock::new(VecDeque::with_capacity(capacity.min(DEFAULT_EVENT_HISTORY))),
            capacity,
        }
    }

    fn record(&self, event: CacheEvent) {
        let mut events = self.events.write();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Every kept event, oldest first.
    pub fn events(&self) -> Vec<CacheEvent> {
        self.events.read().iter().cloned().collect()
    }

    /// Up to `limit` events, newest first.
    pub fn recent(&self, limit: usize) -> Vec<CacheEvent> {
        self.events.read().iter().rev().take(limit).cloned().collect()
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

    pub fn events_of_type(&self, event_type: &str) -> Vec<CacheEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventCollector {
    async fn publish(&self, event: CacheEvent) -> Result<()> {
        self.record(event);
        Ok(())
    }

    async fn publish_all(&self, events: Vec<CacheEvent>) -> Result<()> {
        for event in events {
            self.record(event);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_logging_publisher_feeds_history() {
        let history = Arc::new(InMemoryEventCollector::new());
        let publisher = LoggingEventPublisher::new().with_history(history.clone());

        publisher
            .publish(CacheEvent::preload_started(1, "test"))
            .await
            .unwrap();
        publisher
            .publish(CacheEvent::preload_failed(1, "employee", "source down"))
            .await
            .unwrap();

        assert_eq!(history.len(), 2);
        assert_eq!(history.recent(1)[0].event_type(), "PreloadFailed");
    }

    #[tokio::test]
    async fn test_logging_publisher_without_history() {
        let publisher = LoggingEventPublisher::new();
        publisher
            .publish_all(vec![
                CacheEvent::preload_step_completed(1, "division", 3, 6, 10),
                CacheEvent::cache_invalidated(12, 4),
            ])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_collector_is_bounded() {
        let collector = InMemoryEventCollector::with_capacity(2);
        assert!(collector.is_empty());

        collector
            .publish_all(vec![
                CacheEvent::preload_started(1, "admin"),
                CacheEvent::preload_step_completed(1, "division", 3, 6, 10),
                CacheEvent::preload_step_completed(1, "section", 5, 15, 12),
            ])
            .await
            .unwrap();

        assert_eq!(collector.len(), 2);
        assert!(collector.events_of_type("PreloadStarted").is_empty());
        assert_eq!(collector.events_of_type("PreloadStepCompleted").len(), 2);

        collector.clear();
        assert!(collector.is_empty());
    }
}
