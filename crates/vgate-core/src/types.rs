//! Canonical request/response types shared across all backends.
//!
//! These are the only shapes that cross the dispatcher/backend boundary;
//! wire-format conversion (OpenAI schema, SSE framing) happens only at the
//! server edge.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;

/// One operation a virtual model can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Chat,
    Embedding,
    Rerank,
    Tokenize,
    Transcribe,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::Chat => "chat",
            Capability::Embedding => "embedding",
            Capability::Rerank => "rerank",
            Capability::Tokenize => "tokenize",
            Capability::Transcribe => "transcribe",
        };
        f.write_str(name)
    }
}

impl FromStr for Capability {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "chat" | "generate" => Ok(Capability::Chat),
            "embedding" => Ok(Capability::Embedding),
            "rerank" => Ok(Capability::Rerank),
            "tokenize" => Ok(Capability::Tokenize),
            "transcribe" | "audio" => Ok(Capability::Transcribe),
            other => Err(Error::BadParams(format!("unknown capability: {other}"))),
        }
    }
}

pub type CapabilitySet = HashSet<Capability>;

/// Where a virtual model's execution actually happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Locality {
    InProcess,
    ChildProcess,
    Remote,
}

/// How a virtual model was onboarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServingMethod {
    #[serde(rename = "config")]
    StaticConfig,
    #[serde(rename = "dynamic")]
    DynamicRegistration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ContentFilter => "content_filter",
            FinishReason::ToolCalls => "tool_calls",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl TokenUsage {
    pub fn new(prompt_tokens: usize, completion_tokens: usize) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Backend-agnostic representation of one completed generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub id: String,
    pub created: u64,
    pub model: String,
    pub content: String,
    pub finish_reason: FinishReason,
    pub usage: TokenUsage,
    #[serde(default)]
    pub generation_time_ms: f64,
}

impl Generation {
    pub fn new(model: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: format!("gen-{}", uuid::Uuid::new_v4().simple()),
            created: now_unix_secs(),
            model: model.into(),
            content: content.into(),
            finish_reason: FinishReason::Stop,
            usage: TokenUsage::default(),
            generation_time_ms: 0.0,
        }
    }
}

/// Backend-agnostic representation of one incremental generation delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationChunk {
    pub id: String,
    pub created: u64,
    pub model: String,
    pub delta: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingOutput {
    pub embedding: Vec<Vec<f32>>,
    #[serde(default)]
    pub usage: TokenUsage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankOutput {
    pub scores: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenizeOutput {
    pub tokens: Vec<u32>,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcription {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
}

/// Tri-state optional parameter: not supplied, explicitly cleared, or given.
///
/// Only `Value` entries are forwarded to backends; `Unset` fields never
/// appear in a forwarded parameter set, and `Null` explicitly clears a
/// backend default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Param<T> {
    #[default]
    Unset,
    Null,
    Value(T),
}

impl<T> Param<T> {
    pub fn is_unset(&self) -> bool {
        matches!(self, Param::Unset)
    }

    pub fn is_value(&self) -> bool {
        matches!(self, Param::Value(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Param::Null)
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Param::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            Param::Value(v) => Some(v),
            _ => None,
        }
    }
}

impl<T> From<T> for Param<T> {
    fn from(value: T) -> Self {
        Param::Value(value)
    }
}

// Absent fields stay Unset via #[serde(default)]; a present `null` maps to
// Null, anything else to Value.
impl<'de, T: Deserialize<'de>> Deserialize<'de> for Param<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match Option::<T>::deserialize(deserializer)? {
            None => Param::Null,
            Some(value) => Param::Value(value),
        })
    }
}

impl<T: Serialize> Serialize for Param<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Param::Value(value) => serializer.serialize_some(value),
            _ => serializer.serialize_none(),
        }
    }
}

/// Optional sampling parameters for generation calls.
///
/// Every field distinguishes "not supplied" from "explicitly cleared" from
/// "given a value"; see [`Param`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(default, skip_serializing_if = "Param::is_unset")]
    pub max_tokens: Param<usize>,
    #[serde(default, skip_serializing_if = "Param::is_unset")]
    pub temperature: Param<f32>,
    #[serde(default, skip_serializing_if = "Param::is_unset")]
    pub top_p: Param<f32>,
    #[serde(default, skip_serializing_if = "Param::is_unset")]
    pub frequency_penalty: Param<f32>,
    #[serde(default, skip_serializing_if = "Param::is_unset")]
    pub presence_penalty: Param<f32>,
    #[serde(default, skip_serializing_if = "Param::is_unset")]
    pub stop: Param<Vec<String>>,
    #[serde(default, skip_serializing_if = "Param::is_unset")]
    pub skip_special_tokens: Param<bool>,
}

impl GenerationParams {
    /// Names of every parameter the caller actually supplied.
    pub fn supplied_keys(&self) -> Vec<&'static str> {
        let mut keys = Vec::new();
        if !self.max_tokens.is_unset() {
            keys.push("max_tokens");
        }
        if !self.temperature.is_unset() {
            keys.push("temperature");
        }
        if !self.top_p.is_unset() {
            keys.push("top_p");
        }
        if !self.frequency_penalty.is_unset() {
            keys.push("frequency_penalty");
        }
        if !self.presence_penalty.is_unset() {
            keys.push("presence_penalty");
        }
        if !self.stop.is_unset() {
            keys.push("stop");
        }
        if !self.skip_special_tokens.is_unset() {
            keys.push("skip_special_tokens");
        }
        keys
    }

    /// Supplied parameters absent from a backend's recognized set.
    pub fn unrecognized_keys(&self, recognized: &[&str]) -> Vec<&'static str> {
        self.supplied_keys()
            .into_iter()
            .filter(|key| !recognized.contains(key))
            .collect()
    }

    /// Warn (non-fatally) about supplied parameters the backend does not
    /// recognize. Backends call this instead of failing the request.
    pub fn warn_unrecognized(&self, model_id: &str, recognized: &[&str]) {
        let unused = self.unrecognized_keys(recognized);
        if !unused.is_empty() {
            tracing::warn!("{model_id} ignoring unrecognized parameters: {unused:?}");
        }
    }
}

pub fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct Sampling {
        #[serde(default)]
        temperature: Param<f32>,
    }

    #[test]
    fn param_distinguishes_absent_null_and_value() {
        let absent: Sampling = serde_json::from_str("{}").unwrap();
        assert!(absent.temperature.is_unset());

        let cleared: Sampling = serde_json::from_str(r#"{"temperature": null}"#).unwrap();
        assert_eq!(cleared.temperature, Param::Null);

        let given: Sampling = serde_json::from_str(r#"{"temperature": 0.7}"#).unwrap();
        assert_eq!(given.temperature, Param::Value(0.7));
    }

    #[test]
    fn supplied_keys_skips_unset_fields() {
        let params = GenerationParams {
            max_tokens: Param::Value(128),
            temperature: Param::Null,
            ..Default::default()
        };
        assert_eq!(params.supplied_keys(), vec!["max_tokens", "temperature"]);
    }

    #[test]
    fn unrecognized_keys_filters_out_supported_params() {
        let params = GenerationParams {
            max_tokens: Param::Value(128),
            top_p: Param::Value(0.9),
            skip_special_tokens: Param::Value(true),
            ..Default::default()
        };
        assert_eq!(
            params.unrecognized_keys(&["max_tokens", "top_p"]),
            vec!["skip_special_tokens"]
        );
        assert!(params
            .unrecognized_keys(&["max_tokens", "top_p", "skip_special_tokens"])
            .is_empty());
    }

    #[test]
    fn unset_params_are_not_serialized() {
        let params = GenerationParams {
            top_p: Param::Value(0.9),
            ..Default::default()
        };
        let json = serde_json::to_value(&params).unwrap();
        let obj = json.as_object().unwrap();
        assert_eq!(obj.len(), 1);
        assert_eq!(obj["top_p"], 0.9);
    }

    #[test]
    fn capability_parses_aliases() {
        assert_eq!(Capability::from_str("Chat").unwrap(), Capability::Chat);
        assert_eq!(
            Capability::from_str("generate").unwrap(),
            Capability::Chat
        );
        assert!(Capability::from_str("telepathy").is_err());
    }
}
