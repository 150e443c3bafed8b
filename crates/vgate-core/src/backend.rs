//! Backend capability interface.
//!
//! Concrete adapters (in-process runtimes, spawned serving processes,
//! remote third-party APIs) live outside this crate; the dispatcher only
//! requires this trait. An adapter implements the methods for the
//! capabilities it serves and leaves the rest on their default bodies,
//! which reject the call without touching any backend state.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::{Error, Result};
use crate::types::{
    ChatMessage, EmbeddingOutput, Generation, GenerationChunk, GenerationParams, RerankOutput,
    TokenizeOutput, Transcription,
};

/// Which wire operation a passthrough payload belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassthroughOp {
    Generate,
    Embedding,
    Rerank,
    Tokenize,
    Transcribe,
}

/// Capability interface every virtual model backend conforms to.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Backend-specific model identifier (may differ from the registry name).
    fn model_id(&self) -> &str;

    async fn generate(
        &self,
        messages: Vec<ChatMessage>,
        params: GenerationParams,
    ) -> Result<Generation> {
        let _ = (messages, params);
        Err(Error::BadParams(format!(
            "generate not supported by {}",
            self.model_id()
        )))
    }

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        params: GenerationParams,
    ) -> Result<BoxStream<'static, Result<GenerationChunk>>> {
        let _ = (messages, params);
        Err(Error::BadParams(format!(
            "stream not supported by {}",
            self.model_id()
        )))
    }

    async fn embedding(&self, content: Vec<String>) -> Result<EmbeddingOutput> {
        let _ = content;
        Err(Error::BadParams(format!(
            "embedding not supported by {}",
            self.model_id()
        )))
    }

    async fn rerank(&self, pairs: Vec<[String; 2]>, apply_softmax: bool) -> Result<RerankOutput> {
        let _ = (pairs, apply_softmax);
        Err(Error::BadParams(format!(
            "rerank not supported by {}",
            self.model_id()
        )))
    }

    async fn tokenize(&self, content: String) -> Result<TokenizeOutput> {
        let _ = content;
        Err(Error::BadParams(format!(
            "tokenize not supported by {}",
            self.model_id()
        )))
    }

    async fn transcribe(&self, audio: Vec<u8>, language: Option<String>) -> Result<Transcription> {
        let _ = (audio, language);
        Err(Error::BadParams(format!(
            "transcribe not supported by {}",
            self.model_id()
        )))
    }

    /// A passthrough backend is itself a full implementation of the public
    /// wire contract; the dispatcher forwards its JSON unchanged instead of
    /// converting through the canonical types.
    fn is_passthrough(&self) -> bool {
        false
    }

    /// Raw wire-level forwarding for passthrough backends.
    async fn forward_raw(
        &self,
        op: PassthroughOp,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let _ = (op, payload);
        Err(Error::BadParams(format!(
            "raw forwarding not supported by {}",
            self.model_id()
        )))
    }

    /// Raw wire-level streaming for passthrough backends. Each item is one
    /// wire chunk, forwarded without canonical conversion.
    async fn forward_raw_stream(
        &self,
        op: PassthroughOp,
        payload: serde_json::Value,
    ) -> Result<BoxStream<'static, Result<serde_json::Value>>> {
        let _ = (op, payload);
        Err(Error::BadParams(format!(
            "raw stream forwarding not supported by {}",
            self.model_id()
        )))
    }
}
