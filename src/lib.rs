//! Chatpipe - a staged chat-message pipeline
//!
//! User messages flow through four stages connected only by a pub/sub bus:
//!
//! - **Ingestion** accepts a message, persists it, and publishes it to
//!   `incoming-messages`.
//! - **Understanding** classifies intent, extracts entities, drafts a
//!   reply through a completion provider, and publishes to
//!   `processed-messages`.
//! - **Formatting** renders the final reply text, persists it, and
//!   publishes to `outgoing-messages`.
//! - **Delivery** pushes the reply to the user's live chat session.
//!
//! Deliveries are settled with manual acks: a stage that fails
//! transiently nacks and the bus redelivers, while malformed envelopes
//! are acked so they stop recirculating. Persistence is idempotent by
//! message id, which makes the at-least-once bus safe end to end.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use chatpipe::bus::MemoryBus;
//! use chatpipe::cache::MemoryCache;
//! use chatpipe::pipeline::Pipeline;
//! use chatpipe::sessions::SessionRegistry;
//! use chatpipe::stages::{DeliveryStage, FormattingStage, UnderstandingStage};
//! use chatpipe::store::MemoryStore;
//! use chatpipe::testing::{MockChatTransport, MockCompletionProvider};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = Arc::new(MemoryBus::default());
//! let store = Arc::new(MemoryStore::new());
//! let sessions = Arc::new(SessionRegistry::new());
//!
//! let pipeline = Pipeline::new(bus.clone())
//!     .with_stage(Arc::new(UnderstandingStage::new(
//!         bus.clone(),
//!         Arc::new(MemoryCache::new()),
//!         Arc::new(MockCompletionProvider::with_response("Hello!")),
//!         Duration::from_secs(3600),
//!         Duration::from_secs(30),
//!     )))
//!     .with_stage(Arc::new(FormattingStage::new(bus.clone(), store.clone())))
//!     .with_stage(Arc::new(DeliveryStage::new(
//!         sessions.clone(),
//!         Arc::new(MockChatTransport::new()),
//!     )));
//! pipeline.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod bus;
pub mod cache;
pub mod config;
pub mod error;
pub mod gateway;
pub mod llm;
pub mod observability;
pub mod pipeline;
pub mod protocol;
pub mod sessions;
pub mod stages;
pub mod store;
pub mod testing;
pub mod transport;

pub use config::PipelineConfig;
pub use error::{PipelineError, PipelineResult, Severity};
pub use pipeline::Pipeline;
pub use protocol::{
    ContentKind, Entity, EntityKind, IncomingEnvelope, Intent, OutgoingEnvelope,
    ProcessedEnvelope, Understanding,
};
