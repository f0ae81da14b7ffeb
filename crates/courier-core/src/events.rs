use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ids::{ConversationId, EventId, UserId};

/// Domain event kinds carried by the delivery log. Closed set — the log
/// never learns new kinds at runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    NewMessage,
    MessageRead,
    Notification,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewMessage => "new_message",
            Self::MessageRead => "message_read",
            Self::Notification => "notification",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new_message" => Ok(Self::NewMessage),
            "message_read" => Ok(Self::MessageRead),
            "notification" => Ok(Self::Notification),
            other => Err(format!("unknown event kind: {other}")),
        }
    }
}

/// One immutable record of the delivery log.
///
/// `id` is assigned by the store at append time and is the only ordering
/// authority; `created_at` is advisory wall-clock. The payload is opaque to
/// the log — stored and returned verbatim.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEvent {
    pub id: EventId,
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient_user_id: Option<UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient_email: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: String,
}
