//! Pub/sub bus abstraction with manual acknowledgment
//!
//! Stages never call each other directly; the bus is the only inter-stage
//! transport. Each delivered message carries an explicit state machine
//! (`Received -> Processing -> Acknowledged | NegativelyAcknowledged`)
//! whose final transition is decided solely by the stage outcome.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod memory;
pub mod mqtt;

pub use memory::MemoryBus;
pub use mqtt::MqttBus;

/// Bus transport errors
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Broker unreachable: {0}")]
    Broker(String),
    #[error("Publish failed on '{topic}': {reason}")]
    Publish { topic: String, reason: String },
    #[error("Subscribe failed on '{topic}': {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("Delivery already settled")]
    AlreadySettled,
}

/// Lifecycle of a single delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Received,
    Processing,
    Acknowledged,
    NegativelyAcknowledged,
}

/// Transport-specific half of the acknowledgment protocol.
///
/// Consumed on the first decision; a delivery can settle exactly once.
#[async_trait]
pub trait AckHandle: Send {
    async fn ack(self: Box<Self>) -> Result<(), BusError>;
    async fn nack(self: Box<Self>) -> Result<(), BusError>;
}

/// One message handed to a subscriber, with its acknowledgment state.
pub struct BusDelivery {
    topic: String,
    payload: Vec<u8>,
    attempt: u32,
    state: DeliveryState,
    handle: Option<Box<dyn AckHandle>>,
}

impl BusDelivery {
    pub fn new(
        topic: impl Into<String>,
        payload: Vec<u8>,
        attempt: u32,
        handle: Box<dyn AckHandle>,
    ) -> Self {
        Self {
            topic: topic.into(),
            payload,
            attempt,
            state: DeliveryState::Received,
            handle: Some(handle),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Delivery attempt number, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn state(&self) -> DeliveryState {
        self.state
    }

    /// Mark the delivery as being processed.
    pub fn begin_processing(&mut self) {
        if self.state == DeliveryState::Received {
            self.state = DeliveryState::Processing;
        }
    }

    /// Acknowledge: the stage completed (or the envelope is permanently
    /// unprocessable and must not be redelivered).
    pub async fn ack(&mut self) -> Result<(), BusError> {
        let handle = self.handle.take().ok_or(BusError::AlreadySettled)?;
        self.state = DeliveryState::Acknowledged;
        handle.ack().await
    }

    /// Negatively acknowledge: the stage failed transiently and the bus
    /// should redeliver.
    pub async fn nack(&mut self) -> Result<(), BusError> {
        let handle = self.handle.take().ok_or(BusError::AlreadySettled)?;
        self.state = DeliveryState::NegativelyAcknowledged;
        handle.nack().await
    }
}

impl std::fmt::Debug for BusDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusDelivery")
            .field("topic", &self.topic)
            .field("payload_len", &self.payload.len())
            .field("attempt", &self.attempt)
            .field("state", &self.state)
            .finish()
    }
}

/// Pub/sub transport used by every stage.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a payload to a topic.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Subscribe to a topic. Each topic has a single consumer; deliveries
    /// arrive on the returned channel and must be settled via
    /// [`BusDelivery::ack`] or [`BusDelivery::nack`].
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<BusDelivery>, BusError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandle;

    #[async_trait]
    impl AckHandle for NoopHandle {
        async fn ack(self: Box<Self>) -> Result<(), BusError> {
            Ok(())
        }

        async fn nack(self: Box<Self>) -> Result<(), BusError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_delivery_state_machine() {
        let mut delivery = BusDelivery::new("t", vec![1, 2, 3], 1, Box::new(NoopHandle));
        assert_eq!(delivery.state(), DeliveryState::Received);

        delivery.begin_processing();
        assert_eq!(delivery.state(), DeliveryState::Processing);

        delivery.ack().await.unwrap();
        assert_eq!(delivery.state(), DeliveryState::Acknowledged);
    }

    #[tokio::test]
    async fn test_delivery_settles_exactly_once() {
        let mut delivery = BusDelivery::new("t", vec![], 1, Box::new(NoopHandle));
        delivery.begin_processing();
        delivery.nack().await.unwrap();
        assert_eq!(delivery.state(), DeliveryState::NegativelyAcknowledged);

        let second = delivery.ack().await;
        assert!(matches!(second, Err(BusError::AlreadySettled)));
    }
}
