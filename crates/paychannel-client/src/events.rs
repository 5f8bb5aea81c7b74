//! Status events observable by the host application.

use serde::Serialize;
use serde_json::Value;
use std::fmt;
use tokio::sync::broadcast;
use tracing::debug;

/// Topic of a status event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum StatusTopic {
    #[serde(rename = "connect::info")]
    ConnectInfo,
    #[serde(rename = "connect::error")]
    ConnectError,
    #[serde(rename = "disconnect::info")]
    DisconnectInfo,
    #[serde(rename = "game::error")]
    GameError,
    #[serde(rename = "error")]
    Error,
}

impl StatusTopic {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusTopic::ConnectInfo => "connect::info",
            StatusTopic::ConnectError => "connect::error",
            StatusTopic::DisconnectInfo => "disconnect::info",
            StatusTopic::GameError => "game::error",
            StatusTopic::Error => "error",
        }
    }
}

impl fmt::Display for StatusTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct StatusEvent {
    pub topic: StatusTopic,
    pub status: String,
    pub data: Value,
}

/// Publish/subscribe hub for status events
///
/// Emitting never blocks and never fails; events sent while nobody is
/// subscribed are dropped.
#[derive(Clone)]
pub struct StatusHub {
    sender: broadcast::Sender<StatusEvent>,
}

impl StatusHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, topic: StatusTopic, status: &str, data: Value) {
        debug!(topic = %topic, status, "status event");
        let _ = self.sender.send(StatusEvent {
            topic,
            status: status.to_string(),
            data,
        });
    }
}

impl Default for StatusHub {
    fn default() -> Self {
        Self::new(128)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_subscribers_receive_events() {
        let hub = StatusHub::default();
        let mut rx = hub.subscribe();

        hub.emit(StatusTopic::ConnectInfo, "findBankroller", json!({ "deposit": "5" }));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.topic, StatusTopic::ConnectInfo);
        assert_eq!(event.status, "findBankroller");
        assert_eq!(event.data["deposit"], "5");
    }

    #[test]
    fn test_topic_wire_names() {
        let json = serde_json::to_value(StatusTopic::GameError).unwrap();
        assert_eq!(json, "game::error");
        assert_eq!(StatusTopic::DisconnectInfo.as_str(), "disconnect::info");
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        StatusHub::new(4).emit(StatusTopic::Error, "timeout", Value::Null);
    }
}
