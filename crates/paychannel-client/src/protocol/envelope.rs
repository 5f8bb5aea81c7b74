//! Wire envelope exchanged between player and bankroller.

use crate::error::ChannelError;
use paychannel_core::Address;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Request/response correlation identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Create a new random correlation ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CorrelationId({})", self.0)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Request,
    Response,
    /// Unsolicited room-wide announcement
    Broadcast,
}

/// Protocol action carried by an envelope
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Connect,
    OpenChannel,
    CheckOpenChannel,
    Call,
    UpdateState,
    CloseByConsent,
    ChannelClosed,
    Disconnect,
    BankrollerActive,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Connect => "connect",
            Action::OpenChannel => "open_channel",
            Action::CheckOpenChannel => "check_open_channel",
            Action::Call => "call",
            Action::UpdateState => "update_state",
            Action::CloseByConsent => "close_by_consent",
            Action::ChannelClosed => "channel_closed",
            Action::Disconnect => "disconnect",
            Action::BankrollerActive => "bankroller_active",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A message on the wire
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub action: Action,
    /// Assigned by the request bus when a request is sent
    pub correlation_id: Option<CorrelationId>,
    pub sender: Address,
    /// Addressed member; `None` reaches everyone in the room
    pub recipient: Option<Address>,
    pub payload: Value,
}

impl Envelope {
    pub fn request(action: Action, sender: Address, recipient: Address, payload: Value) -> Self {
        Self {
            kind: MessageKind::Request,
            action,
            correlation_id: None,
            sender,
            recipient: Some(recipient),
            payload,
        }
    }

    pub fn broadcast(action: Action, sender: Address, payload: Value) -> Self {
        Self {
            kind: MessageKind::Broadcast,
            action,
            correlation_id: None,
            sender,
            recipient: None,
            payload,
        }
    }

    /// Mirror this request back to its sender with `payload` attached
    pub fn response_to(&self, sender: Address, payload: Value) -> Self {
        Self {
            kind: MessageKind::Response,
            action: self.action,
            correlation_id: self.correlation_id,
            sender,
            recipient: Some(self.sender),
            payload,
        }
    }

    pub fn is_request(&self, action: Action) -> bool {
        self.kind == MessageKind::Request && self.action == action
    }

    /// Decode the payload as `T`
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ChannelError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| ChannelError::Malformed(format!("{} payload: {}", self.action, e)))
    }

    /// Decode a response payload, treating an `error` field as a refusal
    pub fn reply<T: DeserializeOwned>(&self) -> Result<T, ChannelError> {
        if let Some(error) = self.payload.get("error").and_then(Value::as_str) {
            return Err(ChannelError::CounterpartyProtocol(format!(
                "{} refused: {}",
                self.action, error
            )));
        }
        self.decode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn address(byte: u8) -> Address {
        Address::from_bytes([byte; 20])
    }

    #[test]
    fn test_response_mirrors_request() {
        let mut request = Envelope::request(Action::Call, address(1), address(2), json!({}));
        request.correlation_id = Some(CorrelationId::new());

        let response = request.response_to(address(2), json!({ "status": "ok" }));

        assert_eq!(response.kind, MessageKind::Response);
        assert_eq!(response.action, Action::Call);
        assert_eq!(response.correlation_id, request.correlation_id);
        assert_eq!(response.recipient, Some(address(1)));
        assert_eq!(response.sender, address(2));
    }

    #[test]
    fn test_wire_format() {
        let envelope = Envelope::broadcast(
            Action::BankrollerActive,
            address(3),
            json!({ "deposit": "10" }),
        );
        let json = serde_json::to_value(&envelope).unwrap();

        assert_eq!(json["type"], "broadcast");
        assert_eq!(json["action"], "bankroller_active");
        assert!(json["recipient"].is_null());
    }

    #[test]
    fn test_reply_surfaces_refusal() {
        let response = Envelope::request(
            Action::OpenChannel,
            address(1),
            address(2),
            json!({ "error": "no liquidity" }),
        );
        let result: Result<Value, _> = response.reply();
        assert!(matches!(result, Err(ChannelError::CounterpartyProtocol(msg)) if msg.contains("no liquidity")));
    }

    #[test]
    fn test_action_names_match_serde() {
        for action in [Action::CheckOpenChannel, Action::CloseByConsent, Action::UpdateState] {
            assert_eq!(serde_json::to_value(action).unwrap(), action.as_str());
        }
    }
}
