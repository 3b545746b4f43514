//! Message injection utility
//!
//! Publishes an incoming envelope straight onto the broker, bypassing the
//! HTTP gateway. Useful for exercising a running pipeline from the
//! command line.
//!
//! ```bash
//! # Simple message
//! send-message --user-id alice --message "I want to book a hotel in New York"
//!
//! # Continue an existing conversation
//! send-message --user-id alice --message "tomorrow" \
//!   --conversation-id 7f8d2c1e-0000-0000-0000-000000000000
//! ```

use chatpipe::bus::{MessageBus, MqttBus};
use chatpipe::config::MqttSection;
use chatpipe::protocol::{topics, ContentKind, IncomingEnvelope, ENVELOPE_VERSION};
use chrono::Utc;
use clap::Parser;
use tokio::time::{sleep, Duration};
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "send-message",
    about = "Inject a user message into a running pipeline"
)]
struct Args {
    /// User id the message is sent as
    #[arg(long, required = true)]
    user_id: String,

    /// Message text
    #[arg(long, required = true)]
    message: String,

    /// Conversation ID (auto-generated if not provided)
    #[arg(long)]
    conversation_id: Option<Uuid>,

    /// Content kind (text, image, document, location)
    #[arg(long, default_value = "text")]
    content_type: String,

    /// MQTT broker URL
    #[arg(long, default_value = "mqtt://localhost:1883")]
    broker_url: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mqtt_config = MqttSection {
        broker_url: args.broker_url.clone(),
        username_env: None,
        password_env: None,
        keep_alive_secs: 60,
    };
    let client_id = format!("send-message-{}", Uuid::new_v4().simple());
    let bus = MqttBus::connect(&client_id, &mqtt_config).await?;

    let envelope = IncomingEnvelope {
        version: ENVELOPE_VERSION,
        message_id: Uuid::new_v4(),
        conversation_id: args.conversation_id.unwrap_or_else(Uuid::new_v4),
        user_id: args.user_id,
        content: args.message,
        content_kind: ContentKind::from(args.content_type),
        ingested_at: Utc::now(),
    };

    bus.publish(topics::TOPIC_INCOMING, envelope.encode()?).await?;
    // Give the client a moment to flush before disconnecting
    sleep(Duration::from_millis(500)).await;
    bus.shutdown().await;

    println!("Published message {}", envelope.message_id);
    println!("Conversation {}", envelope.conversation_id);
    Ok(())
}
