//! Completion providers for the understanding stage

pub mod provider;
pub mod providers;

pub use provider::{CompletionError, CompletionProvider};
pub use providers::openai::{OpenAiConfig, OpenAiProvider};
