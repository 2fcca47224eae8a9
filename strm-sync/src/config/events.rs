//! Configuration update events.
//!
//! Events are broadcast when settings or task definitions change so that
//! long-lived services can swap their snapshots or rebuild schedules.

use tokio::sync::broadcast;

/// Events broadcast when configuration changes occur.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConfigUpdateEvent {
    /// The global settings row was replaced.
    SettingsUpdated,
    /// A task was created or edited.
    TaskUpdated { task_id: i64 },
    /// A task was deleted.
    TaskDeleted { task_id: i64 },
}

impl ConfigUpdateEvent {
    /// Get a description of the event for logging.
    pub fn description(&self) -> String {
        match self {
            Self::SettingsUpdated => "Settings updated".to_string(),
            Self::TaskUpdated { task_id } => format!("Task updated: {}", task_id),
            Self::TaskDeleted { task_id } => format!("Task deleted: {}", task_id),
        }
    }
}

/// Default channel capacity for config update events.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Broadcaster for configuration update events.
///
/// Uses tokio's broadcast channel to distribute events to multiple subscribers.
#[derive(Clone)]
pub struct ConfigEventBroadcaster {
    sender: broadcast::Sender<ConfigUpdateEvent>,
}

impl ConfigEventBroadcaster {
    /// Create a new broadcaster with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new broadcaster with specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to configuration update events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigUpdateEvent> {
        self.sender.subscribe()
    }

    /// Publish a configuration update event.
    ///
    /// Returns the number of receivers that received the event.
    pub fn publish(&self, event: ConfigUpdateEvent) -> usize {
        tracing::debug!("Publishing config event: {}", event.description());
        // No receivers is not an error.
        self.sender.send(event).unwrap_or(0)
    }

    /// Get the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ConfigEventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_description() {
        assert_eq!(
            ConfigUpdateEvent::SettingsUpdated.description(),
            "Settings updated"
        );
        assert_eq!(
            ConfigUpdateEvent::TaskDeleted { task_id: 3 }.description(),
            "Task deleted: 3"
        );
    }

    #[tokio::test]
    async fn test_broadcaster_multiple_subscribers() {
        let broadcaster = ConfigEventBroadcaster::new();
        let mut receiver1 = broadcaster.subscribe();
        let mut receiver2 = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 2);

        let event = ConfigUpdateEvent::TaskUpdated { task_id: 7 };
        assert_eq!(broadcaster.publish(event.clone()), 2);

        assert_eq!(receiver1.recv().await.unwrap(), event);
        assert_eq!(receiver2.recv().await.unwrap(), event);
    }

    #[test]
    fn test_broadcaster_no_subscribers() {
        let broadcaster = ConfigEventBroadcaster::new();
        assert_eq!(broadcaster.publish(ConfigUpdateEvent::SettingsUpdated), 0);
    }
}
