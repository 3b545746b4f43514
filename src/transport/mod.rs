//! Outbound chat transports
//!
//! Delivery pushes formatted replies through this seam. Send failures are
//! transient: the envelope is nacked and the bus redelivers it.

use async_trait::async_trait;
use thiserror::Error;

use crate::protocol::ContentKind;

pub mod telegram;

pub use telegram::TelegramTransport;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("Transport unreachable: {0}")]
    Unreachable(String),
    #[error("Chat platform rejected the send: {0}")]
    Rejected(String),
    #[error("Content is not valid for kind '{kind}': {reason}")]
    InvalidContent { kind: String, reason: String },
}

/// Push one reply to a destination on the chat platform.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send(
        &self,
        destination: &str,
        content: &str,
        kind: &ContentKind,
    ) -> Result<(), SendError>;
}
