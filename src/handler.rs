use axum::{
    body::Body,
    extract::State,
    http::{HeaderValue, Request},
    response::{IntoResponse, Response},
    Json,
};
use http_body_util::{BodyExt, Limited};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::client_id::resolve_client_identifier;
use crate::config::Config;
use crate::error::AdvisorError;
use crate::rate_limit::{RateLimitDecision, RateLimiter};
use crate::relay::{await_first_chunk, relay_completion};
use crate::request::{parse_request, ValidationError};
use crate::upstream::{system_prompt, CompletionBackend, OpenAiBackend, UpstreamError};

/// Largest request body we are willing to buffer.
pub const MAX_BODY_BYTES: usize = 64 * 1024;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Clone)]
pub struct AdvisorState {
    /// `None` when no upstream credential is configured.
    pub backend: Option<Arc<dyn CompletionBackend>>,
    pub rate_limiter: Arc<RateLimiter>,
    pub system_prompt: Arc<str>,
    pub include_strategy_details: bool,
    /// Bound on receiving the first text chunk; nothing is committed before it.
    pub first_chunk_timeout: Duration,
    pub stream_idle_timeout: Duration,
}

impl AdvisorState {
    pub fn new(config: &Config, backend: Option<Arc<dyn CompletionBackend>>) -> Self {
        Self {
            backend,
            rate_limiter: Arc::new(RateLimiter::new(
                config.rate_limit_max_requests,
                config.rate_limit_window,
            )),
            system_prompt: system_prompt(&config.response_language).into(),
            include_strategy_details: config.include_strategy_details,
            first_chunk_timeout: config.upstream_timeout,
            stream_idle_timeout: config.stream_idle_timeout,
        }
    }

    /// Wire up the OpenAI backend when a credential is present.
    pub fn from_config(config: &Config) -> Result<Self, UpstreamError> {
        let backend: Option<Arc<dyn CompletionBackend>> = match &config.api_key {
            Some(key) => Some(Arc::new(OpenAiBackend::new(config, key.clone())?)),
            None => None,
        };
        Ok(Self::new(config, backend))
    }
}

/// `POST /api/chat`
pub async fn chat_handler(State(state): State<AdvisorState>, req: Request<Body>) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let span = info_span!("chat", request_id = %request_id);

    let mut response = handle_chat(state, req)
        .instrument(span)
        .await
        .unwrap_or_else(IntoResponse::into_response);

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

async fn handle_chat(state: AdvisorState, req: Request<Body>) -> Result<Response, AdvisorError> {
    let Some(backend) = state.backend.clone() else {
        error!("❌ OPENAI_API_KEY is not configured, rejecting request");
        return Err(AdvisorError::MissingApiKey);
    };

    let identifier = resolve_client_identifier(req.headers());
    match state.rate_limiter.check(&identifier) {
        RateLimitDecision::Admitted { remaining } => {
            debug!("Client {} admitted ({} left in window)", identifier, remaining);
        }
        RateLimitDecision::Rejected { retry_after } => {
            warn!(
                "🚫 Rate limit exceeded for {} (retry after {:?})",
                identifier, retry_after
            );
            return Err(AdvisorError::RateLimited { retry_after });
        }
    }

    let body_bytes = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!("Failed to read request body: {}", e);
            return Err(ValidationError::InvalidJson.into());
        }
    };

    let query = parse_request(&body_bytes)
        .and_then(|request| request.into_query(state.include_strategy_details))
        .map_err(|e| {
            info!("📋 Rejected request from {}: {}", identifier, e);
            e
        })?;

    info!(
        "📨 Strategy question from {} ({} chars)",
        identifier,
        query.as_str().chars().count()
    );

    let opened = match backend.open_stream(&state.system_prompt, &query).await {
        Ok(upstream) => await_first_chunk(upstream, state.first_chunk_timeout).await,
        Err(e) => Err(e),
    };
    let stream = opened.map_err(|e| {
        error!("❌ Upstream completion failed: {}", e);
        e
    })?;

    info!("🌊 Upstream stream open, relaying to client");
    Ok(relay_completion(stream, state.stream_idle_timeout))
}

/// `GET /health`
pub async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}
