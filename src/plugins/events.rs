use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use super::models::PluginStatus;

/// Events buffered per subscriber before it starts lagging.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "plugin:installing")]
    Installing,
    #[serde(rename = "plugin:installed")]
    Installed,
    #[serde(rename = "plugin:starting")]
    Starting,
    #[serde(rename = "plugin:started")]
    Started,
    #[serde(rename = "plugin:stopping")]
    Stopping,
    #[serde(rename = "plugin:stopped")]
    Stopped,
    #[serde(rename = "plugin:uninstalling")]
    Uninstalling,
    #[serde(rename = "plugin:uninstalled")]
    Uninstalled,
    #[serde(rename = "plugin:error")]
    Error,
    #[serde(rename = "plugin:health")]
    Health,
    #[serde(rename = "plugin:log")]
    Log,
}

impl EventKind {
    /// The event announcing that an instance entered `status`.
    pub fn for_status(status: PluginStatus) -> Self {
        match status {
            PluginStatus::Installing => Self::Installing,
            PluginStatus::Installed => Self::Installed,
            PluginStatus::Starting => Self::Starting,
            PluginStatus::Running => Self::Started,
            PluginStatus::Stopping => Self::Stopping,
            PluginStatus::Stopped => Self::Stopped,
            PluginStatus::Uninstalling => Self::Uninstalling,
            PluginStatus::Error => Self::Error,
        }
    }

    /// Inverse of [`EventKind::for_status`] for lifecycle events.
    pub fn status(&self) -> Option<PluginStatus> {
        match self {
            Self::Installing => Some(PluginStatus::Installing),
            Self::Installed => Some(PluginStatus::Installed),
            Self::Starting => Some(PluginStatus::Starting),
            Self::Started => Some(PluginStatus::Running),
            Self::Stopping => Some(PluginStatus::Stopping),
            Self::Stopped => Some(PluginStatus::Stopped),
            Self::Uninstalling => Some(PluginStatus::Uninstalling),
            Self::Error => Some(PluginStatus::Error),
            Self::Uninstalled | Self::Health | Self::Log => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub plugin_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl PluginEvent {
    pub fn new(kind: EventKind, plugin_id: impl Into<String>) -> Self {
        Self {
            kind,
            plugin_id: plugin_id.into(),
            timestamp: Utc::now(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Single-writer, multi-reader fan-out of plugin events.
///
/// Publishing never blocks: a subscriber that falls more than the channel
/// capacity behind loses the oldest events and carries on from there.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PluginEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub(crate) fn publish(&self, event: PluginEvent) {
        debug!(plugin_id = %event.plugin_id, kind = ?event.kind, "Publishing event");
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

/// One subscriber's view of the bus. Dropping it unsubscribes.
pub struct EventSubscription {
    rx: broadcast::Receiver<PluginEvent>,
}

impl EventSubscription {
    /// Next event, skipping over any lost to lag. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<PluginEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Event subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`EventSubscription::recv`].
    pub fn try_recv(&mut self) -> Option<PluginEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Everything already published to this subscriber.
    pub fn drain(&mut self) -> Vec<PluginEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = PluginEvent::new(EventKind::Started, "abc")
            .with_data(serde_json::json!({"host_port": 30000}));
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "plugin:started");
        assert_eq!(json["plugin_id"], "abc");
        assert_eq!(json["data"]["host_port"], 30000);
        let ts = json["timestamp"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(ts).is_ok());

        let bare = serde_json::to_value(PluginEvent::new(EventKind::Log, "abc")).unwrap();
        assert!(bare.get("data").is_none());
    }

    #[test]
    fn test_status_kind_mapping_is_inverse() {
        use PluginStatus::*;
        for status in [
            Installing, Installed, Starting, Running, Stopping, Stopped, Uninstalling, Error,
        ] {
            assert_eq!(EventKind::for_status(status).status(), Some(status));
        }
        assert_eq!(EventKind::Health.status(), None);
    }

    #[tokio::test]
    async fn test_subscribers_see_events_in_order() {
        let bus = EventBus::new(16);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        for kind in [EventKind::Installing, EventKind::Installed, EventKind::Starting] {
            bus.publish(PluginEvent::new(kind, "p1"));
        }
        for sub in [&mut a, &mut b] {
            let kinds: Vec<EventKind> = sub.drain().into_iter().map(|e| e.kind).collect();
            assert_eq!(
                kinds,
                vec![EventKind::Installing, EventKind::Installed, EventKind::Starting]
            );
        }
    }

    #[tokio::test]
    async fn test_no_replay_for_late_subscribers() {
        let bus = EventBus::new(16);
        bus.publish(PluginEvent::new(EventKind::Installing, "p1"));
        let mut late = bus.subscribe();
        bus.publish(PluginEvent::new(EventKind::Installed, "p1"));
        let events = late.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Installed);
    }

    #[tokio::test]
    async fn test_lagged_subscriber_skips_and_continues() {
        let bus = EventBus::new(2);
        let mut slow = bus.subscribe();
        for i in 0..5 {
            bus.publish(PluginEvent::new(EventKind::Log, format!("p{}", i)));
        }
        let first = slow.recv().await.unwrap();
        assert_eq!(first.plugin_id, "p3");
        assert_eq!(slow.recv().await.unwrap().plugin_id, "p4");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.publish(PluginEvent::new(EventKind::Error, "p1"));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_subscription_unsubscribes() {
        let bus = EventBus::default();
        let sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
