use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::rooms::msg::MessageId;

/// Frames a client sends over the socket.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    JoinRoom {
        user_id: String,
        receiver_id: String,
    },
    SendMessage {
        sender_id: String,
        receiver_id: String,
        message: String,
    },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame is not a client event")]
    Unreadable,
    #[error("{event} is missing fields or has fields of the wrong type")]
    Incomplete { event: String },
}

impl ClientEvent {
    const EVENTS: [&'static str; 2] = ["join-room", "send-message"];

    /// Tells garbage apart from a known event with bad fields, which the
    /// caller should hear about.
    pub fn decode(frame: &[u8]) -> Result<ClientEvent, DecodeError> {
        let value: Value = serde_json::from_slice(frame).map_err(|_| DecodeError::Unreadable)?;
        let event = value.get("event").and_then(Value::as_str).map(str::to_owned);

        serde_json::from_value(value).map_err(|_| match event {
            Some(event) if Self::EVENTS.contains(&event.as_str()) => DecodeError::Incomplete { event },
            _ => DecodeError::Unreadable,
        })
    }
}

/// Frames the relay pushes to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    MessageDelivered {
        id: MessageId,
        sender_id: String,
        message: String,
        timestamp: String,
    },
    Error {
        reason: String,
    },
}

impl ServerEvent {
    pub fn error(reason: impl ToString) -> ServerEvent {
        ServerEvent::Error {
            reason: reason.to_string(),
        }
    }
}
