//! In-process bus implementation
//!
//! Matches the broker contract the pipeline relies on: at-least-once
//! delivery with redelivery on negative acknowledgment, no ordering
//! guarantee across conversations. A bounded redelivery count prevents a
//! permanently failing envelope from looping forever; exhausted messages
//! are dropped with an error log. Used by tests and single-process runs.

use super::{AckHandle, BusDelivery, BusError, MessageBus};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error};

const SUBSCRIBER_CHANNEL_CAPACITY: usize = 64;

#[derive(Default)]
struct TopicState {
    subscriber: Option<mpsc::Sender<BusDelivery>>,
    /// Messages waiting for a subscriber (or for channel capacity),
    /// with their attempt counts.
    backlog: VecDeque<(Vec<u8>, u32)>,
}

type Topics = Arc<Mutex<HashMap<String, TopicState>>>;

/// In-memory pub/sub bus with nack-triggered redelivery.
pub struct MemoryBus {
    topics: Topics,
    max_delivery_attempts: u32,
}

impl MemoryBus {
    pub fn new(max_delivery_attempts: u32) -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
            max_delivery_attempts: max_delivery_attempts.max(1),
        }
    }

    fn enqueue(&self, topic: &str, payload: Vec<u8>, attempt: u32) {
        enqueue(
            &self.topics,
            self.max_delivery_attempts,
            topic,
            payload,
            attempt,
        );
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(5)
    }
}

/// Queue a message and flush as much backlog as the subscriber channel
/// accepts. Sends are non-blocking; anything the channel rejects stays in
/// the backlog until the next enqueue, subscribe, or settled delivery.
fn enqueue(topics: &Topics, max_attempts: u32, topic: &str, payload: Vec<u8>, attempt: u32) {
    let mut guard = topics.lock().expect("bus topic map poisoned");
    let state = guard.entry(topic.to_string()).or_default();
    state.backlog.push_back((payload, attempt));
    flush(topics, max_attempts, topic, state);
}

/// Re-flush a topic's backlog. Called whenever a delivery settles, since
/// a settled delivery means the consumer has freed channel capacity.
fn flush_topic(topics: &Topics, max_attempts: u32, topic: &str) {
    let mut guard = topics.lock().expect("bus topic map poisoned");
    if let Some(state) = guard.get_mut(topic) {
        flush(topics, max_attempts, topic, state);
    }
}

fn flush(topics: &Topics, max_attempts: u32, topic: &str, state: &mut TopicState) {
    let Some(sender) = state.subscriber.clone() else {
        return;
    };

    while let Some((payload, attempt)) = state.backlog.pop_front() {
        let handle = MemoryAckHandle {
            topics: topics.clone(),
            max_attempts,
            topic: topic.to_string(),
            payload: payload.clone(),
            attempt,
        };
        let delivery = BusDelivery::new(topic, payload, attempt, Box::new(handle));
        match sender.try_send(delivery) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(delivery)) => {
                state
                    .backlog
                    .push_front((delivery.payload().to_vec(), delivery.attempt()));
                break;
            }
            Err(mpsc::error::TrySendError::Closed(delivery)) => {
                state.subscriber = None;
                state
                    .backlog
                    .push_front((delivery.payload().to_vec(), delivery.attempt()));
                break;
            }
        }
    }
}

struct MemoryAckHandle {
    topics: Topics,
    max_attempts: u32,
    topic: String,
    payload: Vec<u8>,
    attempt: u32,
}

#[async_trait]
impl AckHandle for MemoryAckHandle {
    async fn ack(self: Box<Self>) -> Result<(), BusError> {
        flush_topic(&self.topics, self.max_attempts, &self.topic);
        Ok(())
    }

    async fn nack(self: Box<Self>) -> Result<(), BusError> {
        if self.attempt >= self.max_attempts {
            error!(
                topic = %self.topic,
                attempts = self.attempt,
                "Dropping message after exhausting redelivery attempts"
            );
            flush_topic(&self.topics, self.max_attempts, &self.topic);
            return Ok(());
        }

        debug!(
            topic = %self.topic,
            attempt = self.attempt + 1,
            "Requeueing negatively acknowledged message"
        );
        enqueue(
            &self.topics,
            self.max_attempts,
            &self.topic,
            self.payload,
            self.attempt + 1,
        );
        Ok(())
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.enqueue(topic, payload, 1);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<BusDelivery>, BusError> {
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let mut guard = self.topics.lock().expect("bus topic map poisoned");
        let state = guard.entry(topic.to_string()).or_default();
        state.subscriber = Some(sender);
        flush(&self.topics, self.max_delivery_attempts, topic, state);
        Ok(receiver)
    }
}
