//! Telegram Bot API transport

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

use super::{ChatTransport, SendError};
use crate::protocol::ContentKind;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Coordinates carried in the content of a location message.
#[derive(Debug, Serialize, Deserialize)]
struct Coordinates {
    latitude: f64,
    longitude: f64,
}

/// Transport that pushes replies through the Telegram Bot API.
pub struct TelegramTransport {
    base_url: String,
    bot_token: String,
    client: Client,
}

impl TelegramTransport {
    pub fn new(bot_token: impl Into<String>, timeout: Duration) -> Result<Self, SendError> {
        Self::with_base_url(TELEGRAM_API_BASE, bot_token, timeout)
    }

    /// Point at a different API host, used by tests.
    pub fn with_base_url(
        base_url: impl Into<String>,
        bot_token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, SendError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SendError::Unreachable(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            bot_token: bot_token.into(),
            client,
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.base_url, self.bot_token)
    }

    async fn call_method(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<(), SendError> {
        let response = self
            .client
            .post(self.method_url(method))
            .json(&body)
            .send()
            .await
            .map_err(|e| SendError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(SendError::Rejected(format!("{method}: {status} - {error_text}")));
        }

        debug!(method = %method, "Telegram send succeeded");
        Ok(())
    }
}

#[async_trait]
impl ChatTransport for TelegramTransport {
    async fn send(
        &self,
        destination: &str,
        content: &str,
        kind: &ContentKind,
    ) -> Result<(), SendError> {
        match kind {
            ContentKind::Text => {
                self.call_method(
                    "sendMessage",
                    json!({ "chat_id": destination, "text": content }),
                )
                .await
            }
            ContentKind::Image => {
                self.call_method(
                    "sendPhoto",
                    json!({ "chat_id": destination, "photo": content }),
                )
                .await
            }
            ContentKind::Document => {
                self.call_method(
                    "sendDocument",
                    json!({ "chat_id": destination, "document": content }),
                )
                .await
            }
            ContentKind::Location => {
                let coordinates: Coordinates =
                    serde_json::from_str(content).map_err(|e| SendError::InvalidContent {
                        kind: "location".to_string(),
                        reason: e.to_string(),
                    })?;
                self.call_method(
                    "sendLocation",
                    json!({
                        "chat_id": destination,
                        "latitude": coordinates.latitude,
                        "longitude": coordinates.longitude,
                    }),
                )
                .await
            }
            ContentKind::Other(unknown) => {
                warn!(kind = %unknown, "Unknown content kind, sending as plain text");
                self.call_method(
                    "sendMessage",
                    json!({ "chat_id": destination, "text": content }),
                )
                .await
            }
        }
    }
}
