//! Shared application state passed to every handler via Axum's `State` extractor.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::config::Config;
use crate::store::SharedStore;
use crate::util::now_ms;

/// Shared state of the management endpoint.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    pub store: SharedStore,
    /// Id of this node; default target of management commands.
    pub server_id: String,
    /// Monotonic instant when the node started (for uptime calculation).
    pub start_time: Instant,
    /// Recent controller activity on this node.
    pub events: Arc<EventLog>,
}

/// Controller event types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Started,
    Rejected,
    StopRequested,
    Exited,
    Failed,
}

impl EventType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Rejected => "rejected",
            Self::StopRequested => "stop_requested",
            Self::Exited => "exited",
            Self::Failed => "failed",
        }
    }
}

/// A feature-instance lifecycle event.
#[derive(Clone, Debug)]
pub struct ControllerEvent {
    /// Wall-clock milliseconds.
    pub timestamp: u64,
    pub event_type: EventType,
    pub instance_id: String,
    pub detail: String,
}

/// Maximum number of recent events to retain.
const MAX_EVENTS: usize = 50;

/// Bounded ring of recent controller events.
pub struct EventLog {
    events: Mutex<VecDeque<ControllerEvent>>,
}

impl EventLog {
    #[must_use]
    pub fn new() -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(MAX_EVENTS)),
        }
    }

    /// Push an event, evicting the oldest if at capacity.
    pub async fn push(&self, event_type: EventType, instance_id: &str, detail: impl Into<String>) {
        let mut events = self.events.lock().await;
        if events.len() >= MAX_EVENTS {
            events.pop_front();
        }
        events.push_back(ControllerEvent {
            timestamp: now_ms(),
            event_type,
            instance_id: instance_id.to_string(),
            detail: detail.into(),
        });
    }

    /// Events newest first, as JSON.
    pub async fn recent(&self) -> Vec<Value> {
        let events = self.events.lock().await;
        events
            .iter()
            .rev()
            .map(|e| {
                json!({
                    "time": e.timestamp,
                    "event": e.event_type.as_str(),
                    "instanceId": e.instance_id,
                    "detail": e.detail,
                })
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.events.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.lock().await.is_empty()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ring_evicts_oldest() {
        let log = EventLog::new();
        for i in 0..MAX_EVENTS + 5 {
            log.push(EventType::Started, &format!("i{i}"), "").await;
        }
        assert_eq!(log.len().await, MAX_EVENTS);
        let recent = log.recent().await;
        assert_eq!(recent[0]["instanceId"], format!("i{}", MAX_EVENTS + 4));
        assert_eq!(recent[MAX_EVENTS - 1]["instanceId"], "i5");
        assert_eq!(recent[0]["event"], "started");
    }
}
