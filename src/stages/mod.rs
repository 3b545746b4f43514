//! Pipeline stages
//!
//! Each stage consumes one topic, does its work, and publishes to the next
//! topic before its input delivery is settled. Stages share nothing but
//! the bus; the supervisor in [`crate::pipeline`] owns the subscribe loop
//! and the ack decision.

use async_trait::async_trait;

use crate::error::PipelineResult;

pub mod delivery;
pub mod formatting;
pub mod ingestion;
pub mod understanding;

pub use delivery::DeliveryStage;
pub use formatting::FormattingStage;
pub use ingestion::{IngestionService, SubmitReceipt};
pub use understanding::UnderstandingStage;

/// One bus-driven stage of the pipeline.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Stage name for logs.
    fn name(&self) -> &str;

    /// Topic this stage consumes.
    fn input_topic(&self) -> &str;

    /// Process one delivered payload. `Ok` and permanent errors lead to an
    /// ack; transient errors lead to a nack and redelivery.
    async fn process(&self, payload: &[u8]) -> PipelineResult<()>;
}
