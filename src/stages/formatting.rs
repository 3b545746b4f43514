//! Formatting stage
//!
//! Turns an understood message into the final reply text, persists the
//! bot's message, marks the user's message processed, and publishes the
//! outgoing envelope. The bot message id is derived deterministically from
//! the user message id, so a redelivered envelope rewrites the same record
//! instead of producing a second reply.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::bus::MessageBus;
use crate::error::PipelineResult;
use crate::protocol::{
    topics, ContentKind, Entity, EntityKind, Intent, OutgoingEnvelope, ProcessedEnvelope,
};
use crate::stages::Stage;
use crate::store::{Message, MessageStore, SenderKind};

/// Uppercase the first letter of each word ("new york" -> "New York").
fn title_case(value: &str) -> String {
    value
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn location_of(entities: &[Entity]) -> Option<String> {
    entities
        .iter()
        .find(|e| e.kind == EntityKind::Location)
        .map(|e| title_case(&e.value))
}

/// Produce the reply text for an understood message. Booking and search
/// intents get guided templates keyed on whether a location was extracted;
/// everything else passes the drafted response through untouched.
pub fn render(intent: Intent, entities: &[Entity], response_text: &str) -> String {
    let location = location_of(entities);
    match (intent, location) {
        (Intent::HotelBooking, Some(location)) => format!(
            "I'd be happy to help you book a hotel in {location}. \
             Could you please provide your check-in and check-out dates?"
        ),
        (Intent::HotelBooking, None) => "I'd be happy to help you book a hotel. \
             Could you please provide the location and dates for your stay?"
            .to_string(),
        (Intent::HotelSearch, Some(location)) => format!(
            "I'll search for hotels in {location} for you. Please wait a moment...\n\n\
             Here are some top hotels in the area:\n\
             1. Grand Hotel\n\
             2. Luxury Suites\n\
             3. Comfort Inn"
        ),
        (Intent::HotelSearch, None) => "I can help you search for hotels. \
             Could you please specify the location you're interested in?"
            .to_string(),
        (Intent::CancelBooking | Intent::GeneralQuery, _) => response_text.to_string(),
    }
}

/// Deterministic id for the bot's reply to a given user message.
pub fn reply_message_id(user_message_id: Uuid) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, user_message_id.as_bytes())
}

pub struct FormattingStage {
    bus: Arc<dyn MessageBus>,
    store: Arc<dyn MessageStore>,
}

impl FormattingStage {
    pub fn new(bus: Arc<dyn MessageBus>, store: Arc<dyn MessageStore>) -> Self {
        Self { bus, store }
    }
}

#[async_trait]
impl Stage for FormattingStage {
    fn name(&self) -> &str {
        "formatting"
    }

    fn input_topic(&self) -> &str {
        topics::TOPIC_PROCESSED
    }

    async fn process(&self, payload: &[u8]) -> PipelineResult<()> {
        let envelope = ProcessedEnvelope::decode(payload)?;
        let reply = render(
            envelope.understanding.intent,
            &envelope.understanding.entities,
            &envelope.understanding.response_text,
        );

        let now = Utc::now();
        let bot_message = Message {
            id: reply_message_id(envelope.message_id),
            conversation_id: envelope.conversation_id,
            sender: SenderKind::Bot,
            content: reply.clone(),
            content_kind: ContentKind::Text,
            created_at: now,
            processed: true,
        };
        self.store.insert_message(bot_message).await?;
        self.store.mark_processed(envelope.message_id).await?;
        self.store.touch_conversation(envelope.conversation_id).await?;

        debug!(
            message_id = %envelope.message_id,
            intent = ?envelope.understanding.intent,
            "Reply formatted"
        );

        let outgoing = OutgoingEnvelope {
            version: envelope.version,
            conversation_id: envelope.conversation_id,
            user_id: envelope.user_id,
            content: reply,
            content_kind: ContentKind::Text,
            formatted_at: now,
        };
        self.bus
            .publish(topics::TOPIC_OUTGOING, outgoing.encode()?)
            .await?;
        Ok(())
    }
}
