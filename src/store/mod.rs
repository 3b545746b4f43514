//! Conversation and message persistence
//!
//! Writes are idempotent by message id: inserting a message that already
//! exists is a no-op, and marking a message processed twice leaves one
//! record with the flag set. This is what makes at-least-once bus delivery
//! safe for the formatting stage.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};
use crate::protocol::ContentKind;

/// Lifecycle state of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Active,
    Closed,
}

/// A conversation between one user and the bot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub user_id: String,
    pub started_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
    pub status: ConversationStatus,
}

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderKind {
    User,
    Bot,
}

/// One persisted message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender: SenderKind,
    pub content: String,
    pub content_kind: ContentKind,
    pub created_at: DateTime<Utc>,
    /// Set once the understanding stage has produced a reply for this
    /// message. Bot messages are stored with the flag already set.
    pub processed: bool,
}

/// Persistence seam for conversations and messages.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Create a new active conversation for the user.
    async fn create_conversation(&self, user_id: &str) -> PipelineResult<Conversation>;

    /// Look up a conversation by id.
    async fn conversation(&self, id: Uuid) -> PipelineResult<Option<Conversation>>;

    /// Bump the conversation's last-activity timestamp.
    async fn touch_conversation(&self, id: Uuid) -> PipelineResult<()>;

    /// Mark a conversation closed. Closing an already closed conversation
    /// is a no-op.
    async fn close_conversation(&self, id: Uuid) -> PipelineResult<()>;

    /// Insert a message. If a message with the same id already exists the
    /// call succeeds without changing anything.
    async fn insert_message(&self, message: Message) -> PipelineResult<()>;

    /// Set the processed flag on a message. Idempotent; unknown ids are
    /// an error.
    async fn mark_processed(&self, message_id: Uuid) -> PipelineResult<()>;

    /// Look up a message by id.
    async fn message(&self, id: Uuid) -> PipelineResult<Option<Message>>;

    /// All messages in a conversation, oldest first.
    async fn conversation_messages(&self, conversation_id: Uuid) -> PipelineResult<Vec<Message>>;
}

/// In-memory store used by tests and single-process runs.
#[derive(Default)]
pub struct MemoryStore {
    conversations: Arc<RwLock<HashMap<Uuid, Conversation>>>,
    messages: Arc<RwLock<HashMap<Uuid, Message>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn create_conversation(&self, user_id: &str) -> PipelineResult<Conversation> {
        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            started_at: now,
            last_message_at: now,
            status: ConversationStatus::Active,
        };
        self.conversations
            .write()
            .await
            .insert(conversation.id, conversation.clone());
        Ok(conversation)
    }

    async fn conversation(&self, id: Uuid) -> PipelineResult<Option<Conversation>> {
        Ok(self.conversations.read().await.get(&id).cloned())
    }

    async fn touch_conversation(&self, id: Uuid) -> PipelineResult<()> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(&id)
            .ok_or(PipelineError::ConversationNotFound(id))?;
        conversation.last_message_at = Utc::now();
        Ok(())
    }

    async fn close_conversation(&self, id: Uuid) -> PipelineResult<()> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(&id)
            .ok_or(PipelineError::ConversationNotFound(id))?;
        conversation.status = ConversationStatus::Closed;
        Ok(())
    }

    async fn insert_message(&self, message: Message) -> PipelineResult<()> {
        let mut messages = self.messages.write().await;
        // Redelivered envelope: the first write wins.
        messages.entry(message.id).or_insert(message);
        Ok(())
    }

    async fn mark_processed(&self, message_id: Uuid) -> PipelineResult<()> {
        let mut messages = self.messages.write().await;
        let message = messages.get_mut(&message_id).ok_or_else(|| {
            PipelineError::store_error(format!("message {message_id} not found"))
        })?;
        message.processed = true;
        Ok(())
    }

    async fn message(&self, id: Uuid) -> PipelineResult<Option<Message>> {
        Ok(self.messages.read().await.get(&id).cloned())
    }

    async fn conversation_messages(&self, conversation_id: Uuid) -> PipelineResult<Vec<Message>> {
        let messages = self.messages.read().await;
        let mut result: Vec<Message> = messages
            .values()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        result.sort_by_key(|m| m.created_at);
        Ok(result)
    }
}
