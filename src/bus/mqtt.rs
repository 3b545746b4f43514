//! MQTT bus implementation
//!
//! QoS 1 with manual acknowledgment: a stage acks by completing the MQTT
//! puback, and nacks by withholding it so the broker redelivers per its
//! session policy. One background task owns the event loop and routes
//! inbound publishes to per-topic subscriber channels.

use super::{AckHandle, BusDelivery, BusError, MessageBus};
use crate::config::MqttSection;
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::v5::{Packet, Publish};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, Event, EventLoop, MqttOptions};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

const SUBSCRIBER_CHANNEL_CAPACITY: usize = 64;
const POLL_ERROR_BACKOFF: Duration = Duration::from_millis(250);

type Subscribers = Arc<Mutex<HashMap<String, mpsc::Sender<BusDelivery>>>>;

/// MQTT-backed pub/sub bus.
pub struct MqttBus {
    client: AsyncClient,
    subscribers: Subscribers,
    subscribed_topics: Arc<Mutex<Vec<String>>>,
    shutdown_tx: watch::Sender<bool>,
    event_loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MqttBus {
    /// Connect to the broker and start the event loop task.
    pub async fn connect(client_id: &str, config: &MqttSection) -> Result<Self, BusError> {
        let options = configure_mqtt_options(client_id, config)?;
        let (client, event_loop) = AsyncClient::new(options, 10);

        let subscribers: Subscribers = Arc::new(Mutex::new(HashMap::new()));
        let subscribed_topics = Arc::new(Mutex::new(Vec::new()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(run_event_loop(
            event_loop,
            client.clone(),
            subscribers.clone(),
            subscribed_topics.clone(),
            shutdown_rx,
        ));

        Ok(Self {
            client,
            subscribers,
            subscribed_topics,
            shutdown_tx,
            event_loop_handle: Mutex::new(Some(handle)),
        })
    }

    /// Stop the event loop task. In-flight unacknowledged deliveries are
    /// left unacked so the broker redelivers them on the next session.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self
            .event_loop_handle
            .lock()
            .expect("event loop handle poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[async_trait]
impl MessageBus for MqttBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| BusError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<BusDelivery>, BusError> {
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| BusError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

        let (sender, receiver) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        self.subscribers
            .lock()
            .expect("subscriber map poisoned")
            .insert(topic.to_string(), sender);
        self.subscribed_topics
            .lock()
            .expect("topic list poisoned")
            .push(topic.to_string());
        Ok(receiver)
    }
}

/// Build MQTT options from config: URL parsing, TLS for mqtts://,
/// credentials from environment variables, and manual acks (the whole
/// acknowledgment protocol depends on pubacks being withheld on failure).
fn configure_mqtt_options(client_id: &str, config: &MqttSection) -> Result<MqttOptions, BusError> {
    let url = Url::parse(&config.broker_url)
        .map_err(|_| BusError::Broker(format!("invalid broker URL: {}", config.broker_url)))?;

    let host = url
        .host_str()
        .ok_or_else(|| BusError::Broker(format!("invalid broker URL: {}", config.broker_url)))?;
    let port = url
        .port()
        .unwrap_or(if url.scheme() == "mqtts" { 8883 } else { 1883 });

    let mut options = MqttOptions::new(client_id, host, port);

    if url.scheme() == "mqtts" {
        options.set_transport(rumqttc::Transport::tls_with_default_config());
    }

    if let Some(username_env) = &config.username_env {
        if let Ok(username) = std::env::var(username_env) {
            let password = config
                .password_env
                .as_ref()
                .and_then(|env_name| std::env::var(env_name).ok())
                .unwrap_or_default();
            options.set_credentials(&username, &password);
        }
    }

    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    options.set_manual_acks(true);
    options.set_clean_start(false);

    Ok(options)
}

async fn run_event_loop(
    mut event_loop: EventLoop,
    client: AsyncClient,
    subscribers: Subscribers,
    subscribed_topics: Arc<Mutex<Vec<String>>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!("MQTT event loop started");
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("MQTT event loop stopping on shutdown signal");
                    break;
                }
            }
            event = event_loop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    route_publish(&client, &subscribers, publish);
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    debug!("MQTT connection acknowledged");
                    resubscribe(&client, &subscribed_topics).await;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "MQTT event loop error, backing off before retry");
                    tokio::time::sleep(POLL_ERROR_BACKOFF).await;
                }
            }
        }
    }
}

/// Restore subscriptions after a reconnect; the broker then redelivers
/// any messages that were left unacked in the previous session.
async fn resubscribe(client: &AsyncClient, subscribed_topics: &Arc<Mutex<Vec<String>>>) {
    let topics: Vec<String> = subscribed_topics
        .lock()
        .expect("topic list poisoned")
        .clone();
    for topic in topics {
        if let Err(e) = client.subscribe(&topic, QoS::AtLeastOnce).await {
            error!(topic = %topic, error = %e, "Failed to resubscribe after reconnect");
        }
    }
}

fn route_publish(client: &AsyncClient, subscribers: &Subscribers, publish: Publish) {
    let topic = String::from_utf8_lossy(&publish.topic).to_string();
    let sender = subscribers
        .lock()
        .expect("subscriber map poisoned")
        .get(&topic)
        .cloned();

    let Some(sender) = sender else {
        debug!(topic = %topic, "No subscriber registered for topic, leaving unacked");
        return;
    };

    // MQTT does not expose a redelivery count; the dup flag marks the
    // second and later attempts.
    let attempt = if publish.dup { 2 } else { 1 };
    let payload = publish.payload.to_vec();
    let handle = MqttAckHandle {
        client: client.clone(),
        publish,
    };
    let delivery = BusDelivery::new(&topic, payload, attempt, Box::new(handle));

    if let Err(e) = sender.try_send(delivery) {
        // Dropped delivery stays unacked; the broker will redeliver.
        warn!(topic = %topic, error = %e, "Subscriber channel rejected delivery");
    }
}

struct MqttAckHandle {
    client: AsyncClient,
    publish: Publish,
}

#[async_trait]
impl AckHandle for MqttAckHandle {
    async fn ack(self: Box<Self>) -> Result<(), BusError> {
        self.client
            .ack(&self.publish)
            .await
            .map_err(|e| BusError::Broker(format!("puback failed: {e}")))
    }

    async fn nack(self: Box<Self>) -> Result<(), BusError> {
        // Withholding the puback is the negative acknowledgment: the broker
        // redelivers the message per its session policy.
        debug!("Withholding puback for negative acknowledgment");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_mqtt_config() -> MqttSection {
        MqttSection {
            broker_url: "mqtt://localhost:1883".to_string(),
            username_env: None,
            password_env: None,
            keep_alive_secs: 60,
        }
    }

    #[test]
    fn test_configure_mqtt_options() {
        let config = test_mqtt_config();
        let options = configure_mqtt_options("chatpipe-test", &config);
        assert!(options.is_ok());
    }

    #[test]
    fn test_invalid_broker_url_rejected() {
        let mut config = test_mqtt_config();
        config.broker_url = "not a url".to_string();
        let result = configure_mqtt_options("chatpipe-test", &config);
        assert!(matches!(result, Err(BusError::Broker(_))));
    }

    #[test]
    fn test_mqtts_default_port() {
        let url = Url::parse("mqtts://broker.example.com").unwrap();
        let port = url
            .port()
            .unwrap_or(if url.scheme() == "mqtts" { 8883 } else { 1883 });
        assert_eq!(port, 8883);
    }
}
