use std::fmt;

use axum::{debug_handler, extract::{rejection::JsonRejection, State}, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::{macros::format_description, OffsetDateTime, UtcOffset};
use tracing::debug;

use crate::{relay::RelayError, AppResult, SharedRelay};

/// Content fingerprint of a message.
///
/// Identical `(sender, receiver, body, timestamp)` tuples always produce the
/// same id, so it doubles as the dedup key for stores and clients. It is not a
/// uniqueness guarantee.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn fingerprint(sender_id: &str, receiver_id: &str, body: &str, timestamp: &str) -> MessageId {
        let mut hasher = Sha256::new();
        hasher.update(format!("{sender_id}-{receiver_id}-{body}-{timestamp}").as_bytes());
        MessageId(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        MessageId(id)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// UTC, millisecond precision, `Z` suffix. Fixed width, so string order is time order.
pub fn format_timestamp(at: OffsetDateTime) -> Result<String, time::error::Format> {
    at.to_offset(UtcOffset::UTC).format(format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z"
    ))
}

pub fn timestamp_now() -> Result<String, time::error::Format> {
    format_timestamp(OffsetDateTime::now_utc())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    pub sender_id: String,
    pub receiver_id: String,
    pub message: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageQuery {
    pub sender_id: String,
    pub receiver_id: String,
    pub message: String,
}

impl SendMessageQuery {
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.sender_id.trim().is_empty() {
            return Err(RelayError::Validation("senderId must not be empty"));
        }
        if self.receiver_id.trim().is_empty() {
            return Err(RelayError::Validation("receiverId must not be empty"));
        }
        if self.message.is_empty() {
            return Err(RelayError::Validation("message must not be empty"));
        }
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Submitted {
    message: &'static str,
    new_message: Message,
}

/// Stores a message without a live connection. Nothing is broadcast.
#[debug_handler(state = crate::AppState)]
pub(crate) async fn submit_msg(
    State(relay): State<SharedRelay>,
    query: Result<Json<SendMessageQuery>, JsonRejection>,
) -> AppResult<(StatusCode, Json<Submitted>)> {
    let Json(query) = query.map_err(|rejection| {
        debug!(error = %rejection.body_text(), "unreadable submit body");
        RelayError::Validation("body needs senderId, receiverId and message as strings")
    })?;
    let new_message = relay.submit(query).await?;

    Ok((
        StatusCode::CREATED,
        Json(Submitted {
            message: "Message sent successfully",
            new_message,
        }),
    ))
}
