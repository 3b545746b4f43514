//! Understanding stage
//!
//! Consumes `incoming-messages`, derives intent and entities from the
//! message text, obtains a draft reply from the completion provider, and
//! publishes the processed envelope. NLU results are cached per user and
//! normalized content so a redelivered or repeated message skips the
//! provider call.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::bus::MessageBus;
use crate::cache::{self, Cache};
use crate::error::{PipelineError, PipelineResult};
use crate::llm::{CompletionError, CompletionProvider};
use crate::protocol::{
    topics, Entity, EntityKind, IncomingEnvelope, Intent, ProcessedEnvelope, Understanding,
};
use crate::stages::Stage;

/// Normalize message text for intent matching and cache keying: trim,
/// lowercase, collapse whitespace runs.
pub fn normalize_content(content: &str) -> String {
    content
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Keyword intent classification over normalized content. Precedence is
/// fixed: booking beats cancellation beats search beats the general
/// fallback.
pub fn classify_intent(normalized: &str) -> Intent {
    if normalized.contains("book") || normalized.contains("reservation") {
        Intent::HotelBooking
    } else if normalized.contains("cancel") {
        Intent::CancelBooking
    } else if normalized.contains("search") || normalized.contains("find") {
        Intent::HotelSearch
    } else {
        Intent::GeneralQuery
    }
}

/// Keyword entity extraction over normalized content. Extraction is
/// independent of the classified intent.
pub fn extract_entities(normalized: &str) -> Vec<Entity> {
    let mut entities = Vec::new();
    if normalized.contains("tomorrow") {
        entities.push(Entity::new(EntityKind::Date, "tomorrow"));
    }
    if normalized.contains("new york") {
        entities.push(Entity::new(EntityKind::Location, "new york"));
    }
    entities
}

pub struct UnderstandingStage {
    bus: Arc<dyn MessageBus>,
    cache: Arc<dyn Cache>,
    provider: Arc<dyn CompletionProvider>,
    cache_ttl: Duration,
    completion_timeout: Duration,
}

impl UnderstandingStage {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        cache: Arc<dyn Cache>,
        provider: Arc<dyn CompletionProvider>,
        cache_ttl: Duration,
        completion_timeout: Duration,
    ) -> Self {
        Self {
            bus,
            cache,
            provider,
            cache_ttl,
            completion_timeout,
        }
    }

    async fn cached_understanding(&self, key: &str) -> Option<Understanding> {
        match self.cache.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(understanding) => Some(understanding),
                Err(e) => {
                    // Stale or foreign entry; recompute.
                    warn!(key = %key, error = %e, "Discarding undecodable NLU cache entry");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(key = %key, error = %e, "NLU cache read failed, treating as miss");
                None
            }
        }
    }

    async fn store_understanding(&self, key: &str, understanding: &Understanding) {
        let serialized = match serde_json::to_string(understanding) {
            Ok(serialized) => serialized,
            Err(e) => {
                warn!(error = %e, "Failed to serialize NLU result for caching");
                return;
            }
        };
        if let Err(e) = self.cache.set(key, &serialized, self.cache_ttl).await {
            warn!(key = %key, error = %e, "NLU cache write failed");
        }
    }

    async fn understand(&self, envelope: &IncomingEnvelope) -> PipelineResult<Understanding> {
        let normalized = normalize_content(&envelope.content);
        let key = cache::nlu_key(&envelope.user_id, &normalized);

        if let Some(understanding) = self.cached_understanding(&key).await {
            debug!(message_id = %envelope.message_id, "NLU cache hit");
            return Ok(understanding);
        }

        let intent = classify_intent(&normalized);
        let entities = extract_entities(&normalized);

        let timeout_secs = self.completion_timeout.as_secs();
        let response_text =
            tokio::time::timeout(self.completion_timeout, self.provider.complete(&envelope.content))
                .await
                .map_err(|_| {
                    PipelineError::CompletionError(CompletionError::Timeout(timeout_secs))
                })??;

        let understanding = Understanding {
            intent,
            entities,
            response_text,
        };
        self.store_understanding(&key, &understanding).await;
        Ok(understanding)
    }
}

#[async_trait]
impl Stage for UnderstandingStage {
    fn name(&self) -> &str {
        "understanding"
    }

    fn input_topic(&self) -> &str {
        topics::TOPIC_INCOMING
    }

    async fn process(&self, payload: &[u8]) -> PipelineResult<()> {
        let envelope = IncomingEnvelope::decode(payload)?;
        let understanding = self.understand(&envelope).await?;

        debug!(
            message_id = %envelope.message_id,
            intent = ?understanding.intent,
            entities = understanding.entities.len(),
            "Message understood"
        );

        let processed = ProcessedEnvelope {
            version: envelope.version,
            message_id: envelope.message_id,
            conversation_id: envelope.conversation_id,
            user_id: envelope.user_id,
            content: envelope.content,
            content_kind: envelope.content_kind,
            understanding,
        };
        self.bus
            .publish(topics::TOPIC_PROCESSED, processed.encode()?)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::cache::MemoryCache;
    use crate::protocol::ContentKind;
    use crate::testing::MockCompletionProvider;
    use chrono::Utc;
    use uuid::Uuid;

    fn incoming(content: &str) -> IncomingEnvelope {
        IncomingEnvelope {
            version: crate::protocol::ENVELOPE_VERSION,
            message_id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            user_id: "user-1".to_string(),
            content: content.to_string(),
            content_kind: ContentKind::Text,
            ingested_at: Utc::now(),
        }
    }

    fn stage(
        provider: MockCompletionProvider,
    ) -> (UnderstandingStage, Arc<MemoryBus>, Arc<MockCompletionProvider>) {
        let bus = Arc::new(MemoryBus::default());
        let provider = Arc::new(provider);
        let stage = UnderstandingStage::new(
            bus.clone(),
            Arc::new(MemoryCache::new()),
            provider.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(5),
        );
        (stage, bus, provider)
    }

    #[test]
    fn test_intent_precedence() {
        assert_eq!(classify_intent("book a room"), Intent::HotelBooking);
        assert_eq!(classify_intent("i have a reservation"), Intent::HotelBooking);
        // "book" wins even when "cancel" is present
        assert_eq!(
            classify_intent("cancel my booking"),
            Intent::HotelBooking
        );
        assert_eq!(classify_intent("cancel everything"), Intent::CancelBooking);
        assert_eq!(classify_intent("search hotels"), Intent::HotelSearch);
        assert_eq!(classify_intent("find me a place"), Intent::HotelSearch);
        assert_eq!(classify_intent("what time is it"), Intent::GeneralQuery);
    }

    #[test]
    fn test_entity_extraction_independent_of_intent() {
        let entities = extract_entities("what happens tomorrow in new york");
        assert_eq!(entities.len(), 2);
        assert_eq!(entities[0], Entity::new(EntityKind::Date, "tomorrow"));
        assert_eq!(entities[1], Entity::new(EntityKind::Location, "new york"));

        assert!(extract_entities("hello there").is_empty());
    }

    #[test]
    fn test_normalize_content() {
        assert_eq!(
            normalize_content("  Book a  Hotel in NEW YORK "),
            "book a hotel in new york"
        );
    }

    #[tokio::test]
    async fn test_process_publishes_processed_envelope() {
        let (stage, bus, _provider) = stage(MockCompletionProvider::with_response("Sure."));
        let mut rx = bus.subscribe(topics::TOPIC_PROCESSED).await.unwrap();

        let envelope = incoming("I want to book a hotel in new york tomorrow");
        stage.process(&envelope.encode().unwrap()).await.unwrap();

        let delivery = rx.recv().await.unwrap();
        let processed = ProcessedEnvelope::decode(delivery.payload()).unwrap();
        assert_eq!(processed.message_id, envelope.message_id);
        assert_eq!(processed.understanding.intent, Intent::HotelBooking);
        assert_eq!(processed.understanding.entities.len(), 2);
        assert_eq!(processed.understanding.response_text, "Sure.");
    }

    #[tokio::test]
    async fn test_repeated_content_skips_provider() {
        let (stage, _bus, provider) = stage(MockCompletionProvider::with_response("Sure."));

        let first = incoming("Book a hotel");
        stage.process(&first.encode().unwrap()).await.unwrap();
        // Same user, same text after normalization
        let second = incoming("  book a   HOTEL ");
        stage.process(&second.encode().unwrap()).await.unwrap();

        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_provider_failure_is_transient() {
        let (stage, _bus, _provider) = stage(MockCompletionProvider::failing());
        let envelope = incoming("book a hotel");
        let result = stage.process(&envelope.encode().unwrap()).await;
        let error = result.unwrap_err();
        assert!(!error.is_permanent());
    }

    #[tokio::test]
    async fn test_malformed_payload_is_permanent() {
        let (stage, _bus, _provider) = stage(MockCompletionProvider::with_response("x"));
        let error = stage.process(b"not json").await.unwrap_err();
        assert!(error.is_permanent());
    }
}
