use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type UserId = u64;
pub type RoomId = u64;

/// A chat line after it has been persisted
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub id: String,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub sender_name: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// An event addressed to every live connection of one user
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub recipient_id: UserId,
    /// Domain event name, e.g. `bid_created`
    pub kind: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Everything the hub pushes to clients
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Envelope {
    Chat(ChatMessage),
    Notification(Notification),
}

impl Envelope {
    pub fn notification(
        recipient_id: UserId,
        kind: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Envelope::Notification(Notification {
            recipient_id,
            kind: kind.into(),
            payload,
            timestamp: Utc::now(),
        })
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Envelope::Chat(_) => "CHAT",
            Envelope::Notification(_) => "NOTIFICATION",
        }
    }
}

/// Frames accepted from clients
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    Chat { content: String },
}
