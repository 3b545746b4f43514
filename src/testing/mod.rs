//! Test doubles shared by unit and integration tests

mod mocks;

pub use mocks::{MockAuthClient, MockChatTransport, MockCompletionProvider, RecordedSend};
