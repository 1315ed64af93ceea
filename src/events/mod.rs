//! Typed events flowing between the stream splitter, plugins, and the queue
//!
//! Every notification in the pipeline is an [`Event`]: a tagged payload with
//! a unique id, an epoch-millisecond timestamp, and correlation metadata.
//! Events are immutable once published; subscribers receive clones.

mod bus;

pub use bus::{
    listener, BusMetrics, EventBus, Filter, Listener, Subject, SubscribeOptions, SubscriptionId,
};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Discriminant for every event kind the pipeline can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A structured record recovered from the wrapped tool's output.
    Record,
    /// A failure on the stream processing path.
    StreamError,
    /// A subscriber handler failed during an emission.
    ListenerError,
    /// The processing channel rejected too many chunks.
    BackpressureWarning,
    /// A plugin changed state (disabled, re-enabled).
    PluginStatus,
    /// A batch exhausted its retries and was dropped.
    BatchFailed,
}

/// Payload shapes, one per [`EventKind`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Record {
        record: serde_json::Value,
    },
    StreamError {
        message: String,
        context: String,
    },
    ListenerError {
        message: String,
        cause: String,
        event_kind: EventKind,
        event_id: String,
    },
    BackpressureWarning {
        count: u64,
        threshold: u64,
    },
    PluginStatus {
        plugin: String,
        status: String,
    },
    BatchFailed {
        message: String,
        batch_len: usize,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Record { .. } => EventKind::Record,
            EventPayload::StreamError { .. } => EventKind::StreamError,
            EventPayload::ListenerError { .. } => EventKind::ListenerError,
            EventPayload::BackpressureWarning { .. } => EventKind::BackpressureWarning,
            EventPayload::PluginStatus { .. } => EventKind::PluginStatus,
            EventPayload::BatchFailed { .. } => EventKind::BatchFailed,
        }
    }
}

/// Correlation metadata attached to every event.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EventMetadata {
    pub correlation_id: String,
    pub session_id: String,
    pub source: String,
    pub timestamp: i64,
}

impl EventMetadata {
    pub fn new(session_id: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            source: source.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// A published notification. Immutable after publish.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub kind: EventKind,
    pub timestamp: i64,
    pub payload: EventPayload,
    pub metadata: EventMetadata,
}

impl Event {
    pub fn new(payload: EventPayload, metadata: EventMetadata) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: payload.kind(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            payload,
            metadata,
        }
    }

    /// Convenience constructor for a record event.
    pub fn record(record: serde_json::Value, metadata: EventMetadata) -> Self {
        Self::new(EventPayload::Record { record }, metadata)
    }

    /// The inner record, if this is a record event.
    pub fn as_record(&self) -> Option<&serde_json::Value> {
        match &self.payload {
            EventPayload::Record { record } => Some(record),
            _ => None,
        }
    }
}

/// Shared key/value state plugins can exchange across dispatches.
pub type SharedState = HashMap<String, serde_json::Value>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_kind_matches_event_kind() {
        let event = Event::record(json!({"a": 1}), EventMetadata::new("s1", "test"));
        assert_eq!(event.kind, EventKind::Record);
        assert_eq!(event.as_record(), Some(&json!({"a": 1})));
    }

    #[test]
    fn events_have_unique_ids() {
        let meta = EventMetadata::new("s1", "test");
        let a = Event::record(json!(1), meta.clone());
        let b = Event::record(json!(1), meta);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn event_serializes_with_tagged_payload() {
        let event = Event::new(
            EventPayload::BackpressureWarning {
                count: 10,
                threshold: 10,
            },
            EventMetadata::new("s1", "stream"),
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "backpressure_warning");
        assert_eq!(value["payload"]["type"], "backpressure_warning");
    }
}
