//! Native wire schema endpoints.
//!
//! These speak the gateway's own request/response shapes and mirror the
//! canonical types one to one, so a chunk that leaves a backend reaches
//! the client byte-for-byte.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::State,
    response::{sse::Event, IntoResponse, Response, Sse},
    routing::{get, post},
    Json, Router,
};
use base64::Engine as _;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::OwnedSemaphorePermit;

use crate::error::{sse_error_event, ApiError, ApiJson};
use crate::state::AppState;
use vgate_core::{
    ChatMessage, Error, GenerationParams, PassthroughOp, VirtualModelDescriptor,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/generate", post(generate))
        .route("/embedding", post(embedding))
        .route("/rerank", post(rerank))
        .route("/tokenize", post(tokenize))
        .route("/transcription", post(transcription))
        .route("/models", get(list_models))
}

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Option<Vec<ChatMessage>>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(flatten)]
    pub params: GenerationParams,
}

impl GenerateRequest {
    /// A bare `content` string is shorthand for a single user message.
    fn into_messages(self) -> Result<(String, Vec<ChatMessage>, GenerationParams, bool), ApiError> {
        let stream = self.stream.unwrap_or(false);
        let messages = match (self.messages, self.content) {
            (Some(messages), _) if !messages.is_empty() => messages,
            (_, Some(content)) if !content.trim().is_empty() => vec![ChatMessage::user(content)],
            _ => {
                return Err(ApiError::bad_request(
                    "request must include `messages` or non-empty `content`",
                ))
            }
        };
        Ok((self.model, messages, self.params, stream))
    }
}

async fn generate(
    State(state): State<AppState>,
    ApiJson(raw): ApiJson<serde_json::Value>,
) -> Result<Response, ApiError> {
    let req: GenerateRequest =
        serde_json::from_value(raw.clone()).map_err(|err| ApiError::bad_request(err.to_string()))?;
    let (model, messages, params, stream) = req.into_messages()?;

    if stream {
        let permit = state
            .request_semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal("server is shutting down".into()))?;
        // A backend that speaks this wire protocol natively streams its
        // own chunks through unchanged.
        if let Some(upstream) = state
            .dispatcher
            .try_forward_raw_stream(&model, PassthroughOp::Generate, raw)
            .await?
        {
            return Ok(forward_stream(permit, upstream));
        }
        return generate_stream(state, permit, model, messages, params).await;
    }

    if let Some(forwarded) = state
        .dispatcher
        .try_forward_raw(&model, PassthroughOp::Generate, raw)
        .await?
    {
        return Ok(Json(forwarded).into_response());
    }

    let _permit = state.acquire_permit().await;
    let timeout = Duration::from_secs(state.request_timeout_secs);
    let generation = tokio::time::timeout(
        timeout,
        state.dispatcher.generate(&model, messages, params),
    )
    .await
    .map_err(|_| Error::ApiTimeout(format!("generation for {model} timed out")))??;

    Ok(Json(generation).into_response())
}

/// Chunk events carry the canonical chunk JSON verbatim; a backend
/// failure ends the stream with a single error-envelope event.
async fn generate_stream(
    state: AppState,
    permit: OwnedSemaphorePermit,
    model: String,
    messages: Vec<ChatMessage>,
    params: GenerationParams,
) -> Result<Response, ApiError> {
    let mut chunks = state.dispatcher.stream(&model, messages, params).await?;

    let stream = async_stream::stream! {
        let _permit = permit;
        while let Some(item) = chunks.next().await {
            match item {
                Ok(chunk) => {
                    let data = serde_json::to_string(&chunk).unwrap_or_default();
                    yield Ok::<_, Infallible>(Event::default().data(data));
                }
                Err(err) => {
                    yield Ok(sse_error_event(&err.envelope()));
                    return;
                }
            }
        }
    };

    Ok(super::streaming_response(
        Sse::new(stream).keep_alive(axum::response::sse::KeepAlive::default()),
    ))
}

/// Passthrough wire chunks travel through as-is; a failure ends the
/// stream with a single error-envelope event.
fn forward_stream(
    permit: OwnedSemaphorePermit,
    mut upstream: BoxStream<'static, vgate_core::Result<serde_json::Value>>,
) -> Response {
    let stream = async_stream::stream! {
        let _permit = permit;
        while let Some(item) = upstream.next().await {
            match item {
                Ok(value) => {
                    let data = serde_json::to_string(&value).unwrap_or_default();
                    yield Ok::<_, Infallible>(Event::default().data(data));
                }
                Err(err) => {
                    yield Ok(sse_error_event(&err.envelope()));
                    return;
                }
            }
        }
    };
    super::streaming_response(Sse::new(stream).keep_alive(axum::response::sse::KeepAlive::default()))
}

#[derive(Debug, Deserialize)]
pub struct EmbeddingRequest {
    pub model: String,
    pub content: OneOrMany,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(text) => vec![text],
            OneOrMany::Many(items) => items,
        }
    }
}

async fn embedding(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<EmbeddingRequest>,
) -> Result<Response, ApiError> {
    let _permit = state.acquire_permit().await;
    let output = state
        .dispatcher
        .embedding(&req.model, req.content.into_vec())
        .await?;
    Ok(Json(output).into_response())
}

#[derive(Debug, Deserialize)]
pub struct RerankRequest {
    pub model: String,
    pub content: Vec<[String; 2]>,
    #[serde(default)]
    pub apply_softmax: bool,
}

async fn rerank(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<RerankRequest>,
) -> Result<Response, ApiError> {
    let _permit = state.acquire_permit().await;
    let output = state
        .dispatcher
        .rerank(&req.model, req.content, req.apply_softmax)
        .await?;
    Ok(Json(output).into_response())
}

#[derive(Debug, Deserialize)]
pub struct TokenizeRequest {
    pub model: String,
    pub content: String,
}

async fn tokenize(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<TokenizeRequest>,
) -> Result<Response, ApiError> {
    let output = state.dispatcher.tokenize(&req.model, req.content).await?;
    Ok(Json(output).into_response())
}

#[derive(Debug, Deserialize)]
pub struct TranscriptionRequest {
    pub model: String,
    /// Base64-encoded audio payload.
    pub audio: String,
    #[serde(default)]
    pub language: Option<String>,
}

async fn transcription(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<TranscriptionRequest>,
) -> Result<Response, ApiError> {
    let audio = base64::engine::general_purpose::STANDARD
        .decode(req.audio.as_bytes())
        .map_err(|err| ApiError::bad_request(format!("invalid base64 audio: {err}")))?;

    let _permit = state.acquire_permit().await;
    let output = state
        .dispatcher
        .transcribe(&req.model, audio, req.language)
        .await?;
    Ok(Json(output).into_response())
}

async fn list_models(State(state): State<AppState>) -> Json<serde_json::Value> {
    let models: Vec<VirtualModelDescriptor> = state.manager.list().await;
    Json(json!({ "models": models }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_shorthand_becomes_user_message() {
        let req: GenerateRequest =
            serde_json::from_value(json!({ "model": "m", "content": "hi" })).unwrap();
        let (model, messages, _, stream) = req.into_messages().unwrap();
        assert_eq!(model, "m");
        assert_eq!(messages, vec![ChatMessage::user("hi")]);
        assert!(!stream);
    }

    #[test]
    fn empty_request_is_rejected() {
        let req: GenerateRequest = serde_json::from_value(json!({ "model": "m" })).unwrap();
        assert!(req.into_messages().is_err());
    }

    #[test]
    fn flattened_params_preserve_explicit_null() {
        let req: GenerateRequest = serde_json::from_value(json!({
            "model": "m",
            "content": "hi",
            "temperature": null,
            "max_tokens": 64,
        }))
        .unwrap();
        assert!(req.params.temperature.is_null());
        assert_eq!(req.params.max_tokens.clone().into_option(), Some(64));
    }

    #[tokio::test]
    async fn forwarded_stream_carries_wire_chunks_verbatim() {
        let permit = std::sync::Arc::new(tokio::sync::Semaphore::new(1))
            .acquire_owned()
            .await
            .unwrap();
        let upstream = async_stream::stream! {
            yield Ok(json!({ "id": "up-1", "delta": "hi" }));
            yield Err(Error::ModelGenerate("upstream died".into()));
        };
        let response = forward_stream(permit, upstream.boxed());
        assert_eq!(
            response.headers().get("x-accel-buffering").map(|v| v.as_bytes()),
            Some(b"no".as_slice())
        );

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(body.contains(r#""id":"up-1""#));
        assert!(body.contains("MODEL_GENERATE_ERROR"));
        assert!(!body.contains("[DONE]"));
    }

    #[test]
    fn embedding_content_accepts_string_or_array() {
        let one: EmbeddingRequest =
            serde_json::from_value(json!({ "model": "m", "content": "a" })).unwrap();
        assert_eq!(one.content.into_vec(), vec!["a".to_string()]);

        let many: EmbeddingRequest =
            serde_json::from_value(json!({ "model": "m", "content": ["a", "b"] })).unwrap();
        assert_eq!(many.content.into_vec().len(), 2);
    }
}
