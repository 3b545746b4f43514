//! Ingestion stage
//!
//! Accepts raw user messages, persists them, and publishes the incoming
//! envelope that starts the pipeline. Persist-then-publish ordering means
//! a crash between the two steps loses the publish, never the record; the
//! sender sees an error and retries, and the duplicate insert is a no-op.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::bus::MessageBus;
use crate::error::{PipelineError, PipelineResult};
use crate::protocol::{topics, ContentKind, IncomingEnvelope};
use crate::sessions::SessionRegistry;
use crate::store::{Message, MessageStore, SenderKind};

/// Receipt returned to the sender once the message is accepted.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitReceipt {
    pub message_id: Uuid,
    pub conversation_id: Uuid,
    pub status: &'static str,
}

/// Front door of the pipeline.
pub struct IngestionService {
    bus: Arc<dyn MessageBus>,
    store: Arc<dyn MessageStore>,
    sessions: Arc<SessionRegistry>,
}

impl IngestionService {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        store: Arc<dyn MessageStore>,
        sessions: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            bus,
            store,
            sessions,
        }
    }

    /// Accept one user message.
    ///
    /// With no `conversation_id` a new conversation is started. With one,
    /// the conversation must exist and belong to the user; a mismatch is
    /// an ownership violation and the message is refused.
    pub async fn submit(
        &self,
        user_id: &str,
        content: &str,
        content_kind: ContentKind,
        conversation_id: Option<Uuid>,
        destination: Option<&str>,
    ) -> PipelineResult<SubmitReceipt> {
        if user_id.is_empty() {
            return Err(PipelineError::invalid_envelope("user_id is empty"));
        }

        let conversation = match conversation_id {
            Some(id) => {
                let conversation = self
                    .store
                    .conversation(id)
                    .await?
                    .ok_or(PipelineError::ConversationNotFound(id))?;
                if conversation.user_id != user_id {
                    return Err(PipelineError::OwnershipViolation {
                        conversation_id: id,
                        user_id: user_id.to_string(),
                    });
                }
                self.store.touch_conversation(id).await?;
                conversation
            }
            None => {
                let conversation = self.store.create_conversation(user_id).await?;
                debug!(
                    conversation_id = %conversation.id,
                    user_id = %user_id,
                    "Started new conversation"
                );
                conversation
            }
        };

        if let Some(destination) = destination {
            self.sessions.register(user_id, destination);
        }

        let now = Utc::now();
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: conversation.id,
            sender: SenderKind::User,
            content: content.to_string(),
            content_kind: content_kind.clone(),
            created_at: now,
            processed: false,
        };
        let message_id = message.id;
        self.store.insert_message(message).await?;

        let envelope = IncomingEnvelope {
            version: crate::protocol::ENVELOPE_VERSION,
            message_id,
            conversation_id: conversation.id,
            user_id: user_id.to_string(),
            content: content.to_string(),
            content_kind,
            ingested_at: now,
        };
        self.bus
            .publish(topics::TOPIC_INCOMING, envelope.encode()?)
            .await?;

        info!(
            message_id = %message_id,
            conversation_id = %conversation.id,
            "Message accepted"
        );
        Ok(SubmitReceipt {
            message_id,
            conversation_id: conversation.id,
            status: "sent",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::store::MemoryStore;

    fn service() -> (IngestionService, Arc<MemoryBus>, Arc<MemoryStore>) {
        let bus = Arc::new(MemoryBus::default());
        let store = Arc::new(MemoryStore::new());
        let sessions = Arc::new(SessionRegistry::new());
        let service = IngestionService::new(bus.clone(), store.clone(), sessions);
        (service, bus, store)
    }

    #[tokio::test]
    async fn test_submit_persists_then_publishes() {
        let (service, bus, store) = service();
        let mut rx = bus.subscribe(topics::TOPIC_INCOMING).await.unwrap();

        let receipt = service
            .submit("user-1", "hello", ContentKind::Text, None, None)
            .await
            .unwrap();
        assert_eq!(receipt.status, "sent");

        let stored = store.message(receipt.message_id).await.unwrap().unwrap();
        assert_eq!(stored.sender, SenderKind::User);
        assert!(!stored.processed);

        let delivery = rx.recv().await.unwrap();
        let envelope = IncomingEnvelope::decode(delivery.payload()).unwrap();
        assert_eq!(envelope.message_id, receipt.message_id);
        assert_eq!(envelope.conversation_id, receipt.conversation_id);
    }

    #[tokio::test]
    async fn test_submit_without_conversation_starts_one() {
        let (service, _bus, store) = service();
        let receipt = service
            .submit("user-1", "hello", ContentKind::Text, None, None)
            .await
            .unwrap();

        let conversation = store
            .conversation(receipt.conversation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conversation.user_id, "user-1");
    }

    #[tokio::test]
    async fn test_submit_into_foreign_conversation_refused() {
        let (service, _bus, store) = service();
        let other = store.create_conversation("someone-else").await.unwrap();

        let result = service
            .submit("user-1", "hello", ContentKind::Text, Some(other.id), None)
            .await;
        assert!(matches!(
            result,
            Err(PipelineError::OwnershipViolation { .. })
        ));
    }

    #[tokio::test]
    async fn test_submit_into_unknown_conversation_refused() {
        let (service, _bus, _store) = service();
        let result = service
            .submit(
                "user-1",
                "hello",
                ContentKind::Text,
                Some(Uuid::new_v4()),
                None,
            )
            .await;
        assert!(matches!(
            result,
            Err(PipelineError::ConversationNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_submit_registers_session_destination() {
        let bus = Arc::new(MemoryBus::default());
        let store = Arc::new(MemoryStore::new());
        let sessions = Arc::new(SessionRegistry::new());
        let service = IngestionService::new(bus, store, sessions.clone());

        service
            .submit("user-1", "hi", ContentKind::Text, None, Some("chat-7"))
            .await
            .unwrap();
        assert_eq!(sessions.resolve("user-1"), Some("chat-7".to_string()));
    }

    #[tokio::test]
    async fn test_empty_user_id_refused() {
        let (service, _bus, _store) = service();
        let result = service
            .submit("", "hello", ContentKind::Text, None, None)
            .await;
        assert!(result.is_err());
    }
}
