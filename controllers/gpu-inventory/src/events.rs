//! Notification events.
//!
//! Events are best effort: a failure to publish is logged and swallowed so
//! that it never turns a successful reconcile into a failed one.

use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use kube_runtime::events::{Event, EventType, Recorder, Reporter};
use tracing::{debug, warn};

/// A device record was created
pub const REASON_DEVICE_DISCOVERED: &str = "GpuDeviceDiscovered";
/// A device record was deleted because its device disappeared
pub const REASON_DEVICE_REMOVED: &str = "GpuDeviceRemoved";
/// The per-node detection agent could not be queried
pub const REASON_DETECTION_UNAVAILABLE: &str = "GpuDetectionUnavailable";

/// Event severity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Routine progress
    Normal,
    /// Something needs operator attention
    Warning,
}

/// One notification event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryEvent {
    /// Event severity
    pub kind: EventKind,
    /// Short CamelCase reason, one of the `REASON_*` constants
    pub reason: String,
    /// What the controller did (e.g. `Create`, `Delete`, `Reconcile`)
    pub action: String,
    /// Human readable detail
    pub note: String,
}

impl InventoryEvent {
    /// A `Normal` event.
    pub fn normal(reason: &str, action: &str, note: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Normal,
            reason: reason.to_string(),
            action: action.to_string(),
            note: note.into(),
        }
    }

    /// A `Warning` event.
    pub fn warning(reason: &str, action: &str, note: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Warning,
            reason: reason.to_string(),
            action: action.to_string(),
            note: note.into(),
        }
    }

    /// Event for a condition whose status, reason or message changed.
    pub fn condition_changed(condition_type: &str, note: impl Into<String>) -> Self {
        Self::normal(&format!("{condition_type}Changed"), "Reconcile", note)
    }
}

/// Destination of notification events
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    /// Publish `event` about the object behind `target`. Never fails.
    async fn publish(&self, target: &ObjectReference, event: InventoryEvent);
}

/// Publishes events through the Kubernetes events API
pub struct KubeEventSink {
    recorder: Recorder,
}

impl std::fmt::Debug for KubeEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeEventSink").finish_non_exhaustive()
    }
}

impl KubeEventSink {
    /// Publishes events as `controller_name`, tagged with the pod name when `POD_NAME` is set.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait::async_trait]
impl EventSink for KubeEventSink {
    async fn publish(&self, target: &ObjectReference, event: InventoryEvent) {
        let type_ = match event.kind {
            EventKind::Normal => EventType::Normal,
            EventKind::Warning => EventType::Warning,
        };
        let kube_event = Event {
            type_,
            reason: event.reason.clone(),
            note: Some(event.note.clone()),
            action: event.action.clone(),
            secondary: None,
        };
        let object = target.name.as_deref().unwrap_or_default();
        match self.recorder.publish(&kube_event, target).await {
            Ok(()) => debug!("Published event {} for {}", event.reason, object),
            Err(e) => warn!("Failed to publish event {} for {}: {}", event.reason, object, e),
        }
    }
}

/// Collects events in memory
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub struct RecordingEventSink {
    events: std::sync::Arc<std::sync::Mutex<Vec<(ObjectReference, InventoryEvent)>>>,
}

#[cfg(test)]
impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event recorded so far, oldest first
    pub fn events(&self) -> Vec<(ObjectReference, InventoryEvent)> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Just the reasons, oldest first
    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|(_, e)| e.reason).collect()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
#[async_trait::async_trait]
impl EventSink for RecordingEventSink {
    async fn publish(&self, target: &ObjectReference, event: InventoryEvent) {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((target.clone(), event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_changed_reason() {
        let event = InventoryEvent::condition_changed("ManagedDisabled", "node opted out");
        assert_eq!(event.reason, "ManagedDisabledChanged");
        assert_eq!(event.kind, EventKind::Normal);
    }

    #[tokio::test]
    async fn test_recording_sink_keeps_order() {
        let sink = RecordingEventSink::new();
        let target = ObjectReference {
            kind: Some("Node".to_string()),
            name: Some("gpu-1".to_string()),
            ..Default::default()
        };
        sink.publish(&target, InventoryEvent::normal(REASON_DEVICE_DISCOVERED, "Create", "a")).await;
        sink.publish(&target, InventoryEvent::warning(REASON_DETECTION_UNAVAILABLE, "Reconcile", "b")).await;

        assert_eq!(sink.reasons(), vec![REASON_DEVICE_DISCOVERED, REASON_DETECTION_UNAVAILABLE]);
        assert_eq!(sink.events()[1].1.kind, EventKind::Warning);
        sink.clear();
        assert!(sink.events().is_empty());
    }
}
