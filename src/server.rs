//! HTTP surface: webhook intake, webhook verification and health checks.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::channels::{WebhookMessage, WebhookPayload};
use crate::pipeline::ReplyOrchestrator;

/// Shared state for the webhook handlers.
#[derive(Clone)]
pub struct WebhookState {
    pub orchestrator: Arc<ReplyOrchestrator>,
}

/// Build the router for the webhook service.
pub fn webhook_routes(orchestrator: Arc<ReplyOrchestrator>) -> Router {
    let state = WebhookState { orchestrator };

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/webhook", get(verify_webhook).post(receive_webhook))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn root() -> &'static str {
    "Lead Assist is running"
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "lead-assist"
    }))
}

// ── Webhook ─────────────────────────────────────────────────────────────

/// Echo the challenge back to the platform, or refuse.
async fn verify_webhook(Query(params): Query<HashMap<String, String>>) -> impl IntoResponse {
    match params.get("hub.challenge").or_else(|| params.get("challenge")) {
        Some(challenge) => (StatusCode::OK, challenge.clone()),
        None => (StatusCode::FORBIDDEN, "Forbidden".to_string()),
    }
}

/// Acknowledge right away. The payload's messages are handled in order in
/// one background task; a malformed message is skipped without affecting
/// its siblings.
async fn receive_webhook(State(state): State<WebhookState>, body: Bytes) -> StatusCode {
    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "Unparseable webhook body, ignoring");
            return StatusCode::OK;
        }
    };

    debug!(count = payload.messages.len(), "Webhook received");
    if payload.messages.is_empty() {
        return StatusCode::OK;
    }

    let orchestrator = Arc::clone(&state.orchestrator);
    tokio::spawn(async move {
        for raw in payload.messages {
            match WebhookMessage::parse(&raw).and_then(WebhookMessage::into_event) {
                Ok(event) => orchestrator.handle_event(event).await,
                Err(e) => warn!(error = %e, "Skipping malformed webhook message"),
            }
        }
    });
    StatusCode::OK
}
