use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::hub::{RoomId, UserId};
use crate::shared::AppError;

/// A chat line as the chat store recorded it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredChatMessage {
    pub id: String,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Canonical identity of whoever sent a chat line
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatSender {
    pub user_id: UserId,
    pub display_name: String,
}

/// Persists chat lines before they are broadcast
#[async_trait]
pub trait ChatService: Send + Sync {
    async fn save_message(
        &self,
        room_id: RoomId,
        sender_id: UserId,
        content: &str,
    ) -> Result<(StoredChatMessage, ChatSender), AppError>;
}

#[derive(Default)]
struct ChatStore {
    display_names: HashMap<UserId, String>,
    rooms: HashMap<RoomId, Vec<StoredChatMessage>>,
}

/// In-memory implementation of ChatService for development and testing
#[derive(Default)]
pub struct InMemoryChatService {
    store: Mutex<ChatStore>,
}

impl InMemoryChatService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_display_name(&self, user_id: UserId, display_name: impl Into<String>) {
        self.store
            .lock()
            .await
            .display_names
            .insert(user_id, display_name.into());
    }

    /// Messages saved for `room_id`, oldest first
    pub async fn history(&self, room_id: RoomId) -> Vec<StoredChatMessage> {
        self.store
            .lock()
            .await
            .rooms
            .get(&room_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChatService for InMemoryChatService {
    #[instrument(skip(self, content))]
    async fn save_message(
        &self,
        room_id: RoomId,
        sender_id: UserId,
        content: &str,
    ) -> Result<(StoredChatMessage, ChatSender), AppError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(AppError::BadRequest("Chat message is empty".to_string()));
        }

        let message = StoredChatMessage {
            id: Uuid::new_v4().to_string(),
            room_id,
            sender_id,
            content: content.to_string(),
            created_at: Utc::now(),
        };

        let mut store = self.store.lock().await;
        let display_name = store
            .display_names
            .get(&sender_id)
            .cloned()
            .unwrap_or_else(|| sender_id.to_string());
        store.rooms.entry(room_id).or_default().push(message.clone());

        debug!(message_id = %message.id, "Chat message saved");
        Ok((
            message,
            ChatSender {
                user_id: sender_id,
                display_name,
            },
        ))
    }
}
