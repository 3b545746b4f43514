//! Typed pipeline envelopes
//!
//! Every stage reads and writes these records; they are the only payloads
//! carried on the bus. The schema is explicit and versioned: a payload that
//! fails to decode, carries an unknown version, or is missing a required
//! field is a data-integrity failure and must be acknowledged without
//! retry (redelivery cannot fix a malformed envelope).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};

/// Current envelope schema version.
pub const ENVELOPE_VERSION: u32 = 1;

fn default_version() -> u32 {
    ENVELOPE_VERSION
}

/// Kind of content carried by a message.
///
/// Unknown kinds survive the wire as `Other` so delivery can fall back to
/// sending the literal content as text with a warning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ContentKind {
    Text,
    Image,
    Document,
    Location,
    Other(String),
}

impl ContentKind {
    pub fn as_str(&self) -> &str {
        match self {
            ContentKind::Text => "text",
            ContentKind::Image => "image",
            ContentKind::Document => "document",
            ContentKind::Location => "location",
            ContentKind::Other(kind) => kind,
        }
    }
}

impl Default for ContentKind {
    fn default() -> Self {
        ContentKind::Text
    }
}

impl From<String> for ContentKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "text" => ContentKind::Text,
            // The chat platform reports pictures as "photo"
            "image" | "photo" => ContentKind::Image,
            "document" => ContentKind::Document,
            "location" => ContentKind::Location,
            _ => ContentKind::Other(value),
        }
    }
}

impl From<ContentKind> for String {
    fn from(kind: ContentKind) -> Self {
        kind.as_str().to_string()
    }
}

/// Intent derived by the understanding stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    HotelBooking,
    CancelBooking,
    HotelSearch,
    GeneralQuery,
}

/// Kind of extracted entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Date,
    Location,
}

/// A single extracted entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    #[serde(rename = "type")]
    pub kind: EntityKind,
    pub value: String,
}

impl Entity {
    pub fn new(kind: EntityKind, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

/// Result of the understanding stage for one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Understanding {
    pub intent: Intent,
    pub entities: Vec<Entity>,
    pub response_text: String,
}

/// Envelope published by ingestion to `incoming-messages`.
///
/// `message_id` is globally unique and serves as the idempotency key for
/// every downstream cache lookup and dedup decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingEnvelope {
    #[serde(default = "default_version")]
    pub version: u32,
    pub message_id: Uuid,
    pub conversation_id: Uuid,
    pub user_id: String,
    pub content: String,
    pub content_kind: ContentKind,
    pub ingested_at: DateTime<Utc>,
}

/// Envelope published by understanding to `processed-messages`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedEnvelope {
    #[serde(default = "default_version")]
    pub version: u32,
    pub message_id: Uuid,
    pub conversation_id: Uuid,
    pub user_id: String,
    pub content: String,
    pub content_kind: ContentKind,
    pub understanding: Understanding,
}

/// Envelope published by formatting to `outgoing-messages`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingEnvelope {
    #[serde(default = "default_version")]
    pub version: u32,
    pub conversation_id: Uuid,
    pub user_id: String,
    pub content: String,
    pub content_kind: ContentKind,
    pub formatted_at: DateTime<Utc>,
}

macro_rules! envelope_codec {
    ($name:ident) => {
        impl $name {
            /// Serialize for publishing on the bus.
            pub fn encode(&self) -> PipelineResult<Vec<u8>> {
                serde_json::to_vec(self).map_err(|e| {
                    PipelineError::internal_error(format!(
                        "failed to serialize {}: {e}",
                        stringify!($name)
                    ))
                })
            }

            /// Decode a bus payload, treating any malformation as a
            /// data-integrity failure.
            pub fn decode(payload: &[u8]) -> PipelineResult<Self> {
                let envelope: Self = serde_json::from_slice(payload).map_err(|e| {
                    PipelineError::invalid_envelope(format!(
                        "{} failed to decode: {e}",
                        stringify!($name)
                    ))
                })?;
                envelope.validate()?;
                Ok(envelope)
            }
        }
    };
}

envelope_codec!(IncomingEnvelope);
envelope_codec!(ProcessedEnvelope);
envelope_codec!(OutgoingEnvelope);

impl IncomingEnvelope {
    fn validate(&self) -> PipelineResult<()> {
        validate_version(self.version)?;
        validate_user_id(&self.user_id)
    }
}

impl ProcessedEnvelope {
    fn validate(&self) -> PipelineResult<()> {
        validate_version(self.version)?;
        validate_user_id(&self.user_id)
    }
}

impl OutgoingEnvelope {
    fn validate(&self) -> PipelineResult<()> {
        validate_version(self.version)?;
        validate_user_id(&self.user_id)
    }
}

fn validate_version(version: u32) -> PipelineResult<()> {
    if version != ENVELOPE_VERSION {
        return Err(PipelineError::invalid_envelope(format!(
            "unsupported envelope version {version} (expected {ENVELOPE_VERSION})"
        )));
    }
    Ok(())
}

fn validate_user_id(user_id: &str) -> PipelineResult<()> {
    if user_id.is_empty() {
        return Err(PipelineError::invalid_envelope("user_id is empty"));
    }
    Ok(())
}
