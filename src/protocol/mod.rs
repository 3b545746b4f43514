//! Message envelope and topic contract shared by every stage

pub mod envelope;
pub mod topics;

pub use envelope::{
    ContentKind, Entity, EntityKind, IncomingEnvelope, Intent, OutgoingEnvelope,
    ProcessedEnvelope, Understanding, ENVELOPE_VERSION,
};
pub use topics::{normalize_topic, TOPIC_INCOMING, TOPIC_OUTGOING, TOPIC_PROCESSED};
