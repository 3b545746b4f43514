//! HTTP gateway
//!
//! The inbound edge of the pipeline: a health endpoint for orchestration
//! probes and a send endpoint that hands user messages to ingestion. When
//! an auth client is configured, the sender must hold the send permission;
//! without one, every send is allowed.

use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};
use uuid::Uuid;
use warp::http::StatusCode;
use warp::Filter;

use crate::auth::AuthClient;
use crate::error::{sanitize_error_message, PipelineError};
use crate::protocol::ContentKind;
use crate::stages::IngestionService;

/// Message submission request body.
#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub user_id: String,
    pub content: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<Uuid>,
    #[serde(default)]
    pub destination: Option<String>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    pipeline_id: String,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// HTTP front door for the pipeline.
pub struct Gateway {
    pipeline_id: String,
    port: u16,
    ingestion: Arc<IngestionService>,
    auth: Option<Arc<dyn AuthClient>>,
    send_permission: String,
}

impl Gateway {
    pub fn new(
        pipeline_id: impl Into<String>,
        port: u16,
        ingestion: Arc<IngestionService>,
        auth: Option<Arc<dyn AuthClient>>,
        send_permission: impl Into<String>,
    ) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            port,
            ingestion,
            auth,
            send_permission: send_permission.into(),
        }
    }

    /// Serve until the process shuts down.
    pub async fn run(self: Arc<Self>) {
        let port = self.port;
        info!(port = port, "Gateway listening");
        warp::serve(self.routes()).run(([0, 0, 0, 0], port)).await;
    }

    fn routes(
        self: &Arc<Self>,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        let health_gateway = self.clone();
        let health = warp::path("health").and(warp::get()).and_then(move || {
            let gateway = health_gateway.clone();
            async move {
                let response = HealthResponse {
                    status: "ok",
                    pipeline_id: gateway.pipeline_id.clone(),
                    timestamp: current_timestamp(),
                };
                Ok::<_, Infallible>(warp::reply::json(&response))
            }
        });

        let send_gateway = self.clone();
        let send = warp::path("send")
            .and(warp::post())
            .and(warp::body::json())
            .and_then(move |request: SendRequest| {
                let gateway = send_gateway.clone();
                async move { Ok::<_, Infallible>(gateway.handle_send(request).await) }
            });

        health.or(send)
    }

    async fn handle_send(&self, request: SendRequest) -> warp::reply::WithStatus<warp::reply::Json> {
        if let Some(auth) = &self.auth {
            match auth
                .has_permission(&request.user_id, &self.send_permission)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    warn!(user_id = %request.user_id, "Send refused, permission missing");
                    return error_reply(StatusCode::FORBIDDEN, "permission denied");
                }
                Err(e) => {
                    warn!(error = %e, "Auth lookup failed");
                    return error_reply(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "authorization unavailable",
                    );
                }
            }
        }

        let content_kind = request
            .content_type
            .map(ContentKind::from)
            .unwrap_or_default();
        let result = self
            .ingestion
            .submit(
                &request.user_id,
                &request.content,
                content_kind,
                request.conversation_id,
                request.destination.as_deref(),
            )
            .await;

        match result {
            Ok(receipt) => {
                warp::reply::with_status(warp::reply::json(&receipt), StatusCode::ACCEPTED)
            }
            Err(PipelineError::OwnershipViolation { .. }) => {
                error_reply(StatusCode::FORBIDDEN, "conversation belongs to another user")
            }
            Err(PipelineError::ConversationNotFound(_)) => {
                error_reply(StatusCode::NOT_FOUND, "conversation not found")
            }
            Err(e @ PipelineError::InvalidEnvelope { .. }) => {
                error_reply(StatusCode::BAD_REQUEST, &e.to_string())
            }
            Err(e) => {
                warn!(error = %sanitize_error_message(&e.to_string()), "Send failed");
                error_reply(StatusCode::INTERNAL_SERVER_ERROR, "message not accepted")
            }
        }
    }
}

fn error_reply(status: StatusCode, message: &str) -> warp::reply::WithStatus<warp::reply::Json> {
    warp::reply::with_status(
        warp::reply::json(&ErrorResponse {
            error: message.to_string(),
        }),
        status,
    )
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
