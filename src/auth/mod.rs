//! Role and permission checks for the ingestion gateway
//!
//! Lookups go to an external auth service over HTTP; results are cached
//! for a short TTL so repeated sends from the same user do not hammer the
//! service. Cache failures degrade to a live lookup, never to a denial.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::{self, Cache};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Auth service unreachable: {0}")]
    Unreachable(String),
    #[error("Auth service returned an invalid response: {0}")]
    InvalidResponse(String),
    #[error("User '{0}' is unknown to the auth service")]
    UnknownUser(String),
}

/// A role held by a user, with the permissions it grants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub permissions: Vec<String>,
}

/// Role and permission lookups.
#[async_trait]
pub trait AuthClient: Send + Sync {
    /// Roles held by the user.
    async fn roles(&self, user_id: &str) -> Result<Vec<Role>, AuthError>;

    /// Whether any of the user's roles grants the permission.
    async fn has_permission(&self, user_id: &str, permission: &str) -> Result<bool, AuthError> {
        let roles = self.roles(user_id).await?;
        Ok(roles
            .iter()
            .any(|role| role.permissions.iter().any(|p| p == permission)))
    }
}

#[derive(Debug, Deserialize)]
struct RolesResponse {
    roles: Vec<Role>,
}

/// HTTP client against the external auth service.
pub struct HttpAuthClient {
    base_url: String,
    client: Client,
}

impl HttpAuthClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, AuthError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuthError::Unreachable(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            client,
        })
    }
}

#[async_trait]
impl AuthClient for HttpAuthClient {
    async fn roles(&self, user_id: &str) -> Result<Vec<Role>, AuthError> {
        let response = self
            .client
            .get(format!("{}/users/{user_id}/roles", self.base_url))
            .send()
            .await
            .map_err(|e| AuthError::Unreachable(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(AuthError::UnknownUser(user_id.to_string()));
        }
        if !response.status().is_success() {
            return Err(AuthError::InvalidResponse(format!(
                "status {}",
                response.status()
            )));
        }

        let body: RolesResponse = response
            .json()
            .await
            .map_err(|e| AuthError::InvalidResponse(e.to_string()))?;
        Ok(body.roles)
    }
}

/// Caching wrapper around any [`AuthClient`].
pub struct CachedAuthClient {
    inner: Arc<dyn AuthClient>,
    cache: Arc<dyn Cache>,
    ttl: Duration,
}

impl CachedAuthClient {
    pub fn new(inner: Arc<dyn AuthClient>, cache: Arc<dyn Cache>, ttl: Duration) -> Self {
        Self { inner, cache, ttl }
    }

    async fn cached_get(&self, key: &str) -> Option<String> {
        match self.cache.get(key).await {
            Ok(value) => value,
            Err(e) => {
                // Treat a broken cache as a miss
                warn!(key = %key, error = %e, "Auth cache read failed");
                None
            }
        }
    }

    async fn cached_set(&self, key: &str, value: &str) {
        if let Err(e) = self.cache.set(key, value, self.ttl).await {
            warn!(key = %key, error = %e, "Auth cache write failed");
        }
    }
}

#[async_trait]
impl AuthClient for CachedAuthClient {
    async fn roles(&self, user_id: &str) -> Result<Vec<Role>, AuthError> {
        let key = cache::roles_key(user_id);
        if let Some(cached) = self.cached_get(&key).await {
            if let Ok(roles) = serde_json::from_str::<Vec<Role>>(&cached) {
                debug!(user_id = %user_id, "Role cache hit");
                return Ok(roles);
            }
        }

        let roles = self.inner.roles(user_id).await?;
        if let Ok(serialized) = serde_json::to_string(&roles) {
            self.cached_set(&key, &serialized).await;
        }
        Ok(roles)
    }

    async fn has_permission(&self, user_id: &str, permission: &str) -> Result<bool, AuthError> {
        let key = cache::permission_key(user_id, permission);
        if let Some(cached) = self.cached_get(&key).await {
            return Ok(cached == "true");
        }

        let roles = self.roles(user_id).await?;
        let granted = roles
            .iter()
            .any(|role| role.permissions.iter().any(|p| p == permission));
        self.cached_set(&key, if granted { "true" } else { "false" })
            .await;
        Ok(granted)
    }
}
