//! Delivery stage
//!
//! Consumes `outgoing-messages` and pushes each reply to the user's live
//! session. A reply for a user with no registered session is dropped with
//! a warning and acknowledged (redelivery cannot conjure a destination);
//! a transport failure is transient and leads to a nack.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::PipelineResult;
use crate::protocol::{topics, OutgoingEnvelope};
use crate::sessions::SessionRegistry;
use crate::stages::Stage;
use crate::transport::ChatTransport;

pub struct DeliveryStage {
    sessions: Arc<SessionRegistry>,
    transport: Arc<dyn ChatTransport>,
}

impl DeliveryStage {
    pub fn new(sessions: Arc<SessionRegistry>, transport: Arc<dyn ChatTransport>) -> Self {
        Self {
            sessions,
            transport,
        }
    }
}

#[async_trait]
impl Stage for DeliveryStage {
    fn name(&self) -> &str {
        "delivery"
    }

    fn input_topic(&self) -> &str {
        topics::TOPIC_OUTGOING
    }

    async fn process(&self, payload: &[u8]) -> PipelineResult<()> {
        let envelope = OutgoingEnvelope::decode(payload)?;

        let Some(destination) = self.sessions.resolve(&envelope.user_id) else {
            warn!(
                user_id = %envelope.user_id,
                conversation_id = %envelope.conversation_id,
                "No live session for user, dropping reply"
            );
            return Ok(());
        };

        self.transport
            .send(&destination, &envelope.content, &envelope.content_kind)
            .await?;

        info!(
            user_id = %envelope.user_id,
            conversation_id = %envelope.conversation_id,
            "Reply delivered"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ContentKind;
    use crate::testing::MockChatTransport;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing::Level;
    use tracing_subscriber::layer::{Context, Layer};
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::Registry;
    use uuid::Uuid;

    struct WarningCounter(Arc<AtomicUsize>);

    impl<S: tracing::Subscriber> Layer<S> for WarningCounter {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            if *event.metadata().level() == Level::WARN {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn outgoing(user_id: &str) -> OutgoingEnvelope {
        OutgoingEnvelope {
            version: crate::protocol::ENVELOPE_VERSION,
            conversation_id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            content: "Your booking is confirmed.".to_string(),
            content_kind: ContentKind::Text,
            formatted_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_delivers_to_registered_session() {
        let sessions = Arc::new(SessionRegistry::new());
        sessions.register("user-1", "chat-42");
        let transport = Arc::new(MockChatTransport::new());
        let stage = DeliveryStage::new(sessions, transport.clone());

        let envelope = outgoing("user-1");
        stage.process(&envelope.encode().unwrap()).await.unwrap();

        let sends = transport.sends();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].destination, "chat-42");
        assert_eq!(sends[0].content, "Your booking is confirmed.");
    }

    #[tokio::test]
    async fn test_unknown_session_drops_with_one_warning() {
        let warnings = Arc::new(AtomicUsize::new(0));
        let _guard = tracing::subscriber::set_default(
            Registry::default().with(WarningCounter(warnings.clone())),
        );

        let sessions = Arc::new(SessionRegistry::new());
        let transport = Arc::new(MockChatTransport::new());
        let stage = DeliveryStage::new(sessions, transport.clone());

        let envelope = outgoing("stranger");
        stage.process(&envelope.encode().unwrap()).await.unwrap();

        assert!(transport.sends().is_empty());
        assert_eq!(warnings.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transport_failure_is_transient() {
        let sessions = Arc::new(SessionRegistry::new());
        sessions.register("user-1", "chat-42");
        let transport = Arc::new(MockChatTransport::failing_times(1));
        let stage = DeliveryStage::new(sessions, transport.clone());

        let envelope = outgoing("user-1");
        let payload = envelope.encode().unwrap();

        let error = stage.process(&payload).await.unwrap_err();
        assert!(!error.is_permanent());

        // The retry succeeds and the reply goes out exactly once.
        stage.process(&payload).await.unwrap();
        assert_eq!(transport.sends().len(), 1);
    }
}
