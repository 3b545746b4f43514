//! Deterministic implementations of the pipeline's external seams

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::auth::{AuthClient, AuthError, Role};
use crate::llm::{CompletionError, CompletionProvider};
use crate::protocol::ContentKind;
use crate::transport::{ChatTransport, SendError};

/// Completion provider returning canned responses, with optional failure
/// injection for retry paths.
pub struct MockCompletionProvider {
    response: String,
    calls: AtomicU32,
    fail_times: AtomicU32,
    always_fail: bool,
}

impl MockCompletionProvider {
    pub fn with_response(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            calls: AtomicU32::new(0),
            fail_times: AtomicU32::new(0),
            always_fail: false,
        }
    }

    /// Fail every call.
    pub fn failing() -> Self {
        Self {
            response: String::new(),
            calls: AtomicU32::new(0),
            fail_times: AtomicU32::new(0),
            always_fail: true,
        }
    }

    /// Fail the first `n` calls, then succeed.
    pub fn failing_times(n: u32, response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            calls: AtomicU32::new(0),
            fail_times: AtomicU32::new(n),
            always_fail: false,
        }
    }

    /// Number of completion calls made so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionProvider for MockCompletionProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, _prompt: &str) -> Result<String, CompletionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.always_fail {
            return Err(CompletionError::NetworkError("mock failure".to_string()));
        }
        let remaining = self.fail_times.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_times.store(remaining - 1, Ordering::SeqCst);
            return Err(CompletionError::NetworkError("mock failure".to_string()));
        }
        Ok(self.response.clone())
    }
}

/// One send recorded by [`MockChatTransport`].
#[derive(Debug, Clone)]
pub struct RecordedSend {
    pub destination: String,
    pub content: String,
    pub kind: ContentKind,
}

/// Transport that records sends instead of reaching a chat platform.
pub struct MockChatTransport {
    sends: Mutex<Vec<RecordedSend>>,
    fail_times: AtomicU32,
}

impl MockChatTransport {
    pub fn new() -> Self {
        Self {
            sends: Mutex::new(Vec::new()),
            fail_times: AtomicU32::new(0),
        }
    }

    /// Fail the first `n` sends, then start succeeding.
    pub fn failing_times(n: u32) -> Self {
        Self {
            sends: Mutex::new(Vec::new()),
            fail_times: AtomicU32::new(n),
        }
    }

    /// Successfully recorded sends.
    pub fn sends(&self) -> Vec<RecordedSend> {
        self.sends.lock().expect("mock transport poisoned").clone()
    }
}

impl Default for MockChatTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatTransport for MockChatTransport {
    async fn send(
        &self,
        destination: &str,
        content: &str,
        kind: &ContentKind,
    ) -> Result<(), SendError> {
        let remaining = self.fail_times.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_times.store(remaining - 1, Ordering::SeqCst);
            return Err(SendError::Unreachable("mock failure".to_string()));
        }
        self.sends
            .lock()
            .expect("mock transport poisoned")
            .push(RecordedSend {
                destination: destination.to_string(),
                content: content.to_string(),
                kind: kind.clone(),
            });
        Ok(())
    }
}

/// Auth client with a fixed role set.
pub struct MockAuthClient {
    roles: Vec<Role>,
}

impl MockAuthClient {
    pub fn with_roles(roles: Vec<Role>) -> Self {
        Self { roles }
    }

    /// A client granting the single permission through a "user" role.
    pub fn granting(permission: impl Into<String>) -> Self {
        Self::with_roles(vec![Role {
            name: "user".to_string(),
            permissions: vec![permission.into()],
        }])
    }

    /// A client granting nothing.
    pub fn denying() -> Self {
        Self::with_roles(Vec::new())
    }
}

#[async_trait]
impl AuthClient for MockAuthClient {
    async fn roles(&self, _user_id: &str) -> Result<Vec<Role>, AuthError> {
        Ok(self.roles.clone())
    }
}
