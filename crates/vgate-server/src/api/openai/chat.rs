//! OpenAI-compatible chat completions endpoints.
//!
//! Adapters here restore canonical generations into the OpenAI wire
//! shape without inventing identity: the `id`, `created`, content,
//! finish reason and usage a backend produced travel through unchanged.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::State,
    response::{sse::Event, IntoResponse, Response, Sse},
    routing::post,
    Json, Router,
};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::Instant;

use crate::api::streaming_response;
use crate::error::{sse_error_event, ApiError, ApiJson};
use crate::state::AppState;
use vgate_core::{
    ChatMessage, ChatRole, Error, Generation, GenerationChunk, GenerationParams, Param,
    PassthroughOp, TokenUsage,
};

pub fn router() -> Router<AppState> {
    Router::new().route("/chat/completions", post(completions))
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<OpenAiInboundMessage>,
    #[serde(default)]
    pub max_tokens: Param<usize>,
    #[serde(default)]
    pub max_completion_tokens: Param<usize>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub stream_options: Option<ChatCompletionStreamOptions>,
    #[serde(default)]
    pub n: Option<usize>,
    #[serde(default)]
    pub temperature: Param<f32>,
    #[serde(default)]
    pub top_p: Param<f32>,
    #[serde(default)]
    pub frequency_penalty: Param<f32>,
    #[serde(default)]
    pub presence_penalty: Param<f32>,
    #[serde(default)]
    pub stop: Param<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionStreamOptions {
    #[serde(default)]
    pub include_usage: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiInboundMessage {
    pub role: String,
    pub content: OpenAiInboundContent,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OpenAiInboundContent {
    Text(String),
    Parts(Vec<OpenAiInboundContentPart>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiInboundContentPart {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub input_text: Option<String>,
}

#[derive(Debug, Serialize)]
struct OpenAiChatCompletionResponse {
    id: String,
    object: &'static str,
    created: u64,
    model: String,
    choices: Vec<OpenAiChoice>,
    usage: TokenUsage,
}

#[derive(Debug, Serialize)]
struct OpenAiChoice {
    index: usize,
    message: OpenAiAssistantMessage,
    finish_reason: &'static str,
}

#[derive(Debug, Serialize)]
struct OpenAiAssistantMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct OpenAiChatChunk {
    id: String,
    object: &'static str,
    created: u64,
    model: String,
    choices: Vec<OpenAiChunkChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    usage: Option<TokenUsage>,
}

#[derive(Debug, Serialize)]
struct OpenAiChunkChoice {
    index: usize,
    delta: OpenAiDelta,
    finish_reason: Option<&'static str>,
}

#[derive(Debug, Serialize)]
struct OpenAiDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
}

fn to_core_messages(messages: Vec<OpenAiInboundMessage>) -> Result<Vec<ChatMessage>, ApiError> {
    messages
        .into_iter()
        .map(|message| {
            let role = parse_role(&message.role)?;
            let content = flatten_content(message.content);
            if content.trim().is_empty() {
                return Err(ApiError::bad_request("chat message content cannot be empty"));
            }
            Ok(ChatMessage { role, content })
        })
        .collect()
}

fn parse_role(raw: &str) -> Result<ChatRole, ApiError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "system" => Ok(ChatRole::System),
        "user" => Ok(ChatRole::User),
        "assistant" => Ok(ChatRole::Assistant),
        "tool" => Ok(ChatRole::Tool),
        other => Err(ApiError::bad_request(format!(
            "unsupported chat message role: {other}"
        ))),
    }
}

fn flatten_content(content: OpenAiInboundContent) -> String {
    match content {
        OpenAiInboundContent::Text(text) => text,
        OpenAiInboundContent::Parts(parts) => parts
            .into_iter()
            .filter_map(|part| part.text.or(part.input_text))
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

/// Collect sampling parameters, preserving the supplied / cleared / value
/// distinction for each field. `max_completion_tokens` wins over the
/// legacy `max_tokens`.
fn to_generation_params(req: &ChatCompletionRequest) -> Result<GenerationParams, ApiError> {
    let max_tokens = if req.max_completion_tokens.is_unset() {
        req.max_tokens.clone()
    } else {
        req.max_completion_tokens.clone()
    };

    Ok(GenerationParams {
        max_tokens,
        temperature: req.temperature.clone(),
        top_p: req.top_p.clone(),
        frequency_penalty: req.frequency_penalty.clone(),
        presence_penalty: req.presence_penalty.clone(),
        stop: parse_stop(&req.stop)?,
        skip_special_tokens: Param::Unset,
    })
}

fn parse_stop(stop: &Param<serde_json::Value>) -> Result<Param<Vec<String>>, ApiError> {
    let value = match stop {
        Param::Unset => return Ok(Param::Unset),
        Param::Null => return Ok(Param::Null),
        Param::Value(value) => value,
    };
    match value {
        serde_json::Value::String(text) => Ok(Param::Value(vec![text.clone()])),
        serde_json::Value::Array(items) => items
            .iter()
            .map(|item| match item {
                serde_json::Value::String(text) => Ok(text.clone()),
                _ => Err(ApiError::bad_request("`stop` must be a string or string array")),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Param::Value),
        _ => Err(ApiError::bad_request("`stop` must be a string or string array")),
    }
}

fn restore_completion(generation: Generation) -> OpenAiChatCompletionResponse {
    OpenAiChatCompletionResponse {
        id: generation.id,
        object: "chat.completion",
        created: generation.created,
        model: generation.model,
        choices: vec![OpenAiChoice {
            index: 0,
            message: OpenAiAssistantMessage {
                role: "assistant",
                content: generation.content,
            },
            finish_reason: generation.finish_reason.as_str(),
        }],
        usage: generation.usage,
    }
}

fn restore_chunk(chunk: GenerationChunk, first: bool, include_usage: bool) -> OpenAiChatChunk {
    OpenAiChatChunk {
        id: chunk.id,
        object: "chat.completion.chunk",
        created: chunk.created,
        model: chunk.model,
        choices: vec![OpenAiChunkChoice {
            index: 0,
            delta: OpenAiDelta {
                role: first.then_some("assistant"),
                content: (!chunk.delta.is_empty()).then_some(chunk.delta),
            },
            finish_reason: chunk.finish_reason.map(|reason| reason.as_str()),
        }],
        usage: if include_usage { chunk.usage } else { None },
    }
}

pub async fn completions(
    State(state): State<AppState>,
    ApiJson(raw): ApiJson<serde_json::Value>,
) -> Result<Response, ApiError> {
    let req: ChatCompletionRequest = serde_json::from_value(raw.clone())
        .map_err(|err| ApiError::bad_request(err.to_string()))?;

    if req.n.unwrap_or(1) != 1 {
        return Err(ApiError::bad_request(
            "this server currently supports only `n=1` for chat completions",
        ));
    }
    if req.messages.is_empty() {
        return Err(ApiError::bad_request(
            "chat request must include at least one message",
        ));
    }

    if req.stream.unwrap_or(false) {
        let permit = state
            .request_semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal("server is shutting down".into()))?;
        // A passthrough backend streams its own wire chunks; the payload
        // travels verbatim, as in the non-streaming branch below.
        if let Some(upstream) = state
            .dispatcher
            .try_forward_raw_stream(&req.model, PassthroughOp::Generate, raw)
            .await?
        {
            return Ok(forward_stream(permit, upstream));
        }
        return complete_stream(state, permit, req).await;
    }

    // A backend that already speaks this wire protocol gets the payload
    // verbatim, skipping canonical conversion entirely.
    if let Some(forwarded) = state
        .dispatcher
        .try_forward_raw(&req.model, PassthroughOp::Generate, raw)
        .await?
    {
        return Ok(Json(forwarded).into_response());
    }

    let messages = to_core_messages(req.messages.clone())?;
    let params = to_generation_params(&req)?;

    let _permit = state.acquire_permit().await;
    let timeout = Duration::from_secs(state.request_timeout_secs);
    let generation = tokio::time::timeout(
        timeout,
        state.dispatcher.generate(&req.model, messages, params),
    )
    .await
    .map_err(|_| Error::ApiTimeout(format!("generation for {} timed out", req.model)))??;

    Ok(Json(restore_completion(generation)).into_response())
}

/// Chunk events mirror the backend's canonical chunks; the stream ends
/// with `[DONE]` after a clean finish, or with a single error-envelope
/// event after a mid-stream failure.
async fn complete_stream(
    state: AppState,
    permit: OwnedSemaphorePermit,
    req: ChatCompletionRequest,
) -> Result<Response, ApiError> {
    let messages = to_core_messages(req.messages.clone())?;
    let params = to_generation_params(&req)?;
    let include_usage = req
        .stream_options
        .as_ref()
        .and_then(|opts| opts.include_usage)
        .unwrap_or(false);

    let mut chunks = state.dispatcher.stream(&req.model, messages, params).await?;
    let deadline = Instant::now() + Duration::from_secs(state.request_timeout_secs);
    let model = req.model.clone();

    let stream = async_stream::stream! {
        let _permit = permit;
        let mut first = true;
        loop {
            let item = match tokio::time::timeout_at(deadline, chunks.next()).await {
                Ok(item) => item,
                Err(_) => {
                    let err = Error::ApiTimeout(format!("generation for {model} timed out"));
                    yield Ok(sse_error_event(&err.envelope()));
                    return;
                }
            };
            match item {
                Some(Ok(chunk)) => {
                    let chunk = restore_chunk(chunk, first, include_usage);
                    first = false;
                    let data = serde_json::to_string(&chunk).unwrap_or_default();
                    yield Ok(Event::default().data(data));
                }
                Some(Err(err)) => {
                    yield Ok(sse_error_event(&err.envelope()));
                    return;
                }
                None => break,
            }
        }
        yield Ok::<_, Infallible>(Event::default().data("[DONE]"));
    };

    Ok(streaming_response(
        Sse::new(stream).keep_alive(axum::response::sse::KeepAlive::default()),
    ))
}

/// Upstream wire chunks pass through untouched, ending with `[DONE]` on a
/// clean finish or a single error-envelope event on failure.
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
        yield Ok(Event::default().data("[DONE]"));
    };
    streaming_response(Sse::new(stream).keep_alive(axum::response::sse::KeepAlive::default()))
}
