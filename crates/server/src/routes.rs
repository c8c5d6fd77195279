//! Axum router and handlers

use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use inference::constants::{limits, timeouts};
use inference::{GenerationRequest, SharedBridge};
use tower_http::cors::{Any, CorsLayer};

use crate::decode;
use crate::error::ApiError;
use crate::format::{self, ResponseContext};
use crate::stream;

/// Shared state for Axum handlers
#[derive(Clone)]
pub struct AppState {
    pub bridge: SharedBridge,
    /// Capacity of each streaming response queue
    pub stream_capacity: usize,
    /// Longest wait for the next streamed chunk
    pub chunk_timeout: Duration,
}

impl AppState {
    pub fn new(bridge: SharedBridge) -> Self {
        Self {
            bridge,
            stream_capacity: limits::STREAM_QUEUE_CAPACITY,
            chunk_timeout: Duration::from_secs(timeouts::STREAM_CHUNK_SECS),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/models", get(models_handler).fallback(not_found))
        .route(
            "/v1/chat/completions",
            post(chat_completions_handler).fallback(not_found),
        )
        .fallback(not_found)
        .layer(cors)
        .with_state(state)
}

async fn not_found() -> ApiError {
    ApiError::NotFound
}

async fn models_handler(State(state): State<AppState>) -> Json<format::ModelList> {
    Json(format::model_list(state.bridge.model_name()))
}

async fn chat_completions_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    let result = chat_completions(state, headers, body).await;
    if let Err(e) = &result {
        log::warn!("Chat completion failed ({}): {}", e.status(), e);
    }
    result
}

async fn chat_completions(
    state: AppState,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    let bytes = decode::read_body(&headers, body).await?;
    let decoded = decode::decode_request(&bytes)?;

    log::info!(
        "Chat completion request (stream: {}, max_tokens: {:?})",
        decoded.stream,
        decoded.max_tokens
    );

    // Echo the requested model name; the session's own when none was given
    let model = decoded
        .model
        .clone()
        .unwrap_or_else(|| state.bridge.model_name());
    let ctx = ResponseContext::new(model);
    let prompt_text = decoded.prompt.text.clone();
    let request = GenerationRequest {
        prompt: decoded.prompt,
        max_tokens: decoded.max_tokens,
    };

    if decoded.stream {
        let (producer, consumer) = stream::sse_channel(state.stream_capacity, ctx);
        stream::spawn_generation(state.bridge.clone(), request, producer);
        return Ok((
            [
                (header::CONTENT_TYPE, "text/event-stream"),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            consumer.into_body(state.chunk_timeout),
        )
            .into_response());
    }

    // Own task so a client disconnect cannot cut the generation short
    let bridge = state.bridge.clone();
    let result = tokio::spawn(async move { bridge.generate(request).await })
        .await
        .map_err(|e| ApiError::Internal(format!("Generation task failed: {}", e)))??;
    Ok(Json(format::completion(&ctx, &prompt_text, result.text)).into_response())
}
