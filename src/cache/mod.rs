//! TTL cache used by understanding (NLU results) and auth (role lookups)
//!
//! The cache is strictly an optimization: every caller must treat a cache
//! failure as a miss and continue. No stage outcome may depend on the cache
//! being up.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Namespace prefix for cached NLU results, keyed by user and normalized
/// message content.
pub fn nlu_key(user_id: &str, normalized_content: &str) -> String {
    format!("nlu:{user_id}:{normalized_content}")
}

/// Namespace prefix for cached role sets.
pub fn roles_key(user_id: &str) -> String {
    format!("roles:{user_id}")
}

/// Namespace prefix for cached permission checks.
pub fn permission_key(user_id: &str, permission: &str) -> String {
    format!("perm:{user_id}:{permission}")
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache backend unavailable: {0}")]
    Unavailable(String),
}

/// Keyed TTL cache. Implementations store opaque strings; callers own the
/// serialization of whatever they cache.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;
}

struct CacheEntry {
    value: String,
    expires_at: Instant,
}

/// In-process TTL cache.
///
/// Entries are dropped lazily on read; an expired entry behaves exactly
/// like a miss.
#[derive(Clone, Default)]
pub struct MemoryCache {
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            CacheEntry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }
}

/// A cache that always misses and accepts writes silently. Stands in when
/// no cache backend is configured; callers cannot tell it apart from a
/// cold cache, which is exactly the degradation contract.
#[derive(Clone, Copy, Default)]
pub struct NoopCache;

#[async_trait]
impl Cache for NoopCache {
    async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<(), CacheError> {
        Ok(())
    }
}
