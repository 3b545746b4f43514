//! Live session registry
//!
//! Maps a user id to the transport destination (chat id) where replies can
//! currently be sent. Registration happens at ingestion time; delivery
//! looks the destination up and drops the reply with a warning when no
//! session is known.

use std::collections::HashMap;
use std::sync::RwLock;

/// Registry of active user sessions.
#[derive(Default)]
pub struct SessionRegistry {
    destinations: RwLock<HashMap<String, String>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or refresh) the destination for a user. The latest
    /// registration wins.
    pub fn register(&self, user_id: &str, destination: &str) {
        self.destinations
            .write()
            .expect("session registry poisoned")
            .insert(user_id.to_string(), destination.to_string());
    }

    /// Destination for a user, if a session is registered.
    pub fn resolve(&self, user_id: &str) -> Option<String> {
        self.destinations
            .read()
            .expect("session registry poisoned")
            .get(user_id)
            .cloned()
    }

    /// Drop a user's session.
    pub fn unregister(&self, user_id: &str) {
        self.destinations
            .write()
            .expect("session registry poisoned")
            .remove(user_id);
    }
}
