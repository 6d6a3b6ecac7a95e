// Backup Log Events
// Fire-and-forget progress stream for backup and restore runs

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events buffered per receiver before it starts lagging
pub const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Command,
    Stderr,
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Backup,
    Restore,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupLogEvent {
    /// Unix epoch milliseconds
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub kind: LogKind,
    pub message: String,
    pub connection_name: String,
    pub operation: Operation,
}

/// Broadcasts events to every current subscriber
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BackupLogEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BackupLogEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, operation: Operation, connection_name: &str, kind: LogKind, message: impl Into<String>) {
        let event = BackupLogEvent {
            timestamp: chrono::Utc::now().timestamp_millis(),
            kind,
            message: message.into(),
            connection_name: connection_name.to_string(),
            operation,
        };
        // No subscribers is fine
        if self.sender.send(event).is_err() {
            tracing::trace!("backup log event dropped, no subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_receives() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.emit(Operation::Backup, "prod", LogKind::Command, "pg_dump mydb");

        let a = first.recv().await.unwrap();
        let b = second.recv().await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.kind, LogKind::Command);
        assert_eq!(a.connection_name, "prod");
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new();
        bus.emit(Operation::Restore, "dev", LogKind::Error, "boom");
    }

    #[test]
    fn test_event_json_shape() {
        let event = BackupLogEvent {
            timestamp: 1,
            kind: LogKind::Stderr,
            message: "m".to_string(),
            connection_name: "c".to_string(),
            operation: Operation::Restore,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "stderr");
        assert_eq!(json["connectionName"], "c");
        assert_eq!(json["operation"], "restore");
    }
}
