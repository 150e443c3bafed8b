//! Best-effort lifecycle observers.
//!
//! Observers are invoked around dispatcher operations and process
//! lifecycle. They are observational, not transactional: a failing
//! observer is logged and never fails the operation it watches.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::{RwLock, Semaphore};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::types::{
    ChatMessage, EmbeddingOutput, Generation, GenerationParams, RerankOutput, Transcription,
};

/// Whether the caller awaits an observer's completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Invoked concurrently with its siblings; the enclosing operation
    /// waits for completion, but individual failures are swallowed.
    Foreground,
    /// Scheduled independently; the outcome is never awaited.
    Background,
}

/// What a generation operation produced, as seen by observers.
#[derive(Debug, Clone)]
pub enum GenerationRecord {
    Completed(Generation),
    Streamed { chunks: usize },
}

/// Lifecycle hook surface. Every hook defaults to a no-op.
#[async_trait]
pub trait GatewayCallback: Send + Sync {
    /// Stable identifier used in logs and for removal.
    fn name(&self) -> &'static str;

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Foreground
    }

    async fn on_startup(&self, title: String, message: String) -> Result<()> {
        let _ = (title, message);
        Ok(())
    }

    async fn on_shutdown(&self, title: String, message: String) -> Result<()> {
        let _ = (title, message);
        Ok(())
    }

    async fn on_generation_start(
        &self,
        model: String,
        messages: Vec<ChatMessage>,
        params: GenerationParams,
    ) -> Result<()> {
        let _ = (model, messages, params);
        Ok(())
    }

    async fn on_generation_end(&self, model: String, record: GenerationRecord) -> Result<()> {
        let _ = (model, record);
        Ok(())
    }

    async fn on_embedding_start(&self, model: String, content: Vec<String>) -> Result<()> {
        let _ = (model, content);
        Ok(())
    }

    async fn on_embedding_end(&self, model: String, output: EmbeddingOutput) -> Result<()> {
        let _ = (model, output);
        Ok(())
    }

    async fn on_rerank_start(&self, model: String, pairs: usize) -> Result<()> {
        let _ = (model, pairs);
        Ok(())
    }

    async fn on_rerank_end(&self, model: String, output: RerankOutput) -> Result<()> {
        let _ = (model, output);
        Ok(())
    }

    async fn on_transcribe_start(
        &self,
        model: String,
        audio_bytes: usize,
        language: Option<String>,
    ) -> Result<()> {
        let _ = (model, audio_bytes, language);
        Ok(())
    }

    async fn on_transcribe_end(&self, model: String, output: Transcription) -> Result<()> {
        let _ = (model, output);
        Ok(())
    }

    async fn on_exception(&self, model: Option<String>, code: String, msg: String) -> Result<()> {
        let _ = (model, code, msg);
        Ok(())
    }
}

/// Ordered collection of observers with foreground/background fan-out.
pub struct CallbackGroup {
    callbacks: RwLock<Vec<Arc<dyn GatewayCallback>>>,
    background_limit: Arc<Semaphore>,
    background_permits: usize,
}

impl std::fmt::Debug for CallbackGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackGroup")
            .field("background_permits", &self.background_permits)
            .finish_non_exhaustive()
    }
}

impl CallbackGroup {
    pub fn new(callbacks: Vec<Arc<dyn GatewayCallback>>, background_limit: usize) -> Self {
        let permits = background_limit.max(1);
        Self {
            callbacks: RwLock::new(callbacks),
            background_limit: Arc::new(Semaphore::new(permits)),
            background_permits: permits,
        }
    }

    /// Empty group; every emit is a cheap no-op.
    pub fn empty() -> Self {
        Self::new(Vec::new(), 1)
    }

    /// Build a group from the comma-separated callback id list supplied via
    /// configuration. Unknown ids fail loudly at startup rather than being
    /// silently dropped.
    pub fn from_ids(ids: &[String], background_limit: usize) -> Result<Self> {
        let mut callbacks: Vec<Arc<dyn GatewayCallback>> = Vec::new();
        for id in ids {
            match id.trim() {
                "" => {}
                "logging" => callbacks.push(Arc::new(LoggingCallback)),
                // The server owns its own lifespan wiring; accept the id so
                // configs shared with older deployments keep working.
                "lifespan" => {}
                other => return Err(Error::BadParams(format!("unknown callback: {other}"))),
            }
        }
        Ok(Self::new(callbacks, background_limit))
    }

    pub async fn add(&self, callback: Arc<dyn GatewayCallback>) {
        self.callbacks.write().await.push(callback);
    }

    pub async fn remove(&self, name: &str) {
        self.callbacks.write().await.retain(|cb| cb.name() != name);
    }

    pub async fn len(&self) -> usize {
        self.callbacks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.callbacks.read().await.is_empty()
    }

    /// Fan one hook out to every observer. Foreground observers run
    /// concurrently and are awaited; background observers are spawned under
    /// the concurrency cap and never awaited. Observer failures are logged
    /// and swallowed in both modes.
    async fn emit<F, Fut>(&self, hook: &'static str, make: F)
    where
        F: Fn(Arc<dyn GatewayCallback>) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let callbacks = self.callbacks.read().await.clone();
        if callbacks.is_empty() {
            return;
        }

        let mut foreground = Vec::new();
        for callback in callbacks {
            let name = callback.name();
            match callback.execution_mode() {
                ExecutionMode::Foreground => {
                    let fut = make(callback);
                    foreground.push(async move {
                        if let Err(err) = fut.await {
                            warn!("callback {name} failed in {hook}: {err}");
                        }
                    });
                }
                ExecutionMode::Background => {
                    let fut = make(callback);
                    // Claim the permit before spawning so a shutdown-time
                    // idle wait accounts for tasks not yet scheduled.
                    let permit = match self.background_limit.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => continue,
                    };
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(err) = fut.await {
                            warn!("background callback {name} failed in {hook}: {err}");
                        }
                    });
                }
            }
        }
        join_all(foreground).await;
    }

    /// Wait until no background observer task is running. Used by shutdown
    /// so fire-and-forget sinks get a chance to flush.
    pub async fn wait_background_idle(&self) {
        let _all = self
            .background_limit
            .acquire_many(self.background_permits as u32)
            .await;
    }

    pub async fn on_startup(&self, title: &str, message: &str) {
        let (title, message) = (title.to_string(), message.to_string());
        self.emit("on_startup", move |cb| {
            let (t, m) = (title.clone(), message.clone());
            async move { cb.on_startup(t, m).await }
        })
        .await;
    }

    pub async fn on_shutdown(&self, title: &str, message: &str) {
        let (title, message) = (title.to_string(), message.to_string());
        self.emit("on_shutdown", move |cb| {
            let (t, m) = (title.clone(), message.clone());
            async move { cb.on_shutdown(t, m).await }
        })
        .await;
    }

    pub async fn on_generation_start(
        &self,
        model: &str,
        messages: &[ChatMessage],
        params: &GenerationParams,
    ) {
        let model = model.to_string();
        let messages = messages.to_vec();
        let params = params.clone();
        self.emit("on_generation_start", move |cb| {
            let (m, msgs, p) = (model.clone(), messages.clone(), params.clone());
            async move { cb.on_generation_start(m, msgs, p).await }
        })
        .await;
    }

    pub async fn on_generation_end(&self, model: &str, record: GenerationRecord) {
        let model = model.to_string();
        self.emit("on_generation_end", move |cb| {
            let (m, r) = (model.clone(), record.clone());
            async move { cb.on_generation_end(m, r).await }
        })
        .await;
    }

    pub async fn on_embedding_start(&self, model: &str, content: &[String]) {
        let model = model.to_string();
        let content = content.to_vec();
        self.emit("on_embedding_start", move |cb| {
            let (m, c) = (model.clone(), content.clone());
            async move { cb.on_embedding_start(m, c).await }
        })
        .await;
    }

    pub async fn on_embedding_end(&self, model: &str, output: &EmbeddingOutput) {
        let model = model.to_string();
        let output = output.clone();
        self.emit("on_embedding_end", move |cb| {
            let (m, o) = (model.clone(), output.clone());
            async move { cb.on_embedding_end(m, o).await }
        })
        .await;
    }

    pub async fn on_rerank_start(&self, model: &str, pairs: usize) {
        let model = model.to_string();
        self.emit("on_rerank_start", move |cb| {
            let m = model.clone();
            async move { cb.on_rerank_start(m, pairs).await }
        })
        .await;
    }

    pub async fn on_rerank_end(&self, model: &str, output: &RerankOutput) {
        let model = model.to_string();
        let output = output.clone();
        self.emit("on_rerank_end", move |cb| {
            let (m, o) = (model.clone(), output.clone());
            async move { cb.on_rerank_end(m, o).await }
        })
        .await;
    }

    pub async fn on_transcribe_start(
        &self,
        model: &str,
        audio_bytes: usize,
        language: Option<&str>,
    ) {
        let model = model.to_string();
        let language = language.map(|s| s.to_string());
        self.emit("on_transcribe_start", move |cb| {
            let (m, l) = (model.clone(), language.clone());
            async move { cb.on_transcribe_start(m, audio_bytes, l).await }
        })
        .await;
    }

    pub async fn on_transcribe_end(&self, model: &str, output: &Transcription) {
        let model = model.to_string();
        let output = output.clone();
        self.emit("on_transcribe_end", move |cb| {
            let (m, o) = (model.clone(), output.clone());
            async move { cb.on_transcribe_end(m, o).await }
        })
        .await;
    }

    pub async fn on_exception(&self, model: Option<&str>, error: &Error) {
        let model = model.map(|s| s.to_string());
        let code = error.domain_code().to_string();
        let msg = error.to_string();
        self.emit("on_exception", move |cb| {
            let (m, c, e) = (model.clone(), code.clone(), msg.clone());
            async move { cb.on_exception(m, c, e).await }
        })
        .await;
    }
}

/// Foreground observer that traces operation lifecycle.
pub struct LoggingCallback;

#[async_trait]
impl GatewayCallback for LoggingCallback {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn on_startup(&self, title: String, _message: String) -> Result<()> {
        info!("{title}");
        Ok(())
    }

    async fn on_shutdown(&self, title: String, _message: String) -> Result<()> {
        info!("{title}");
        Ok(())
    }

    async fn on_generation_start(
        &self,
        model: String,
        messages: Vec<ChatMessage>,
        _params: GenerationParams,
    ) -> Result<()> {
        info!("generation started: model={model} messages={}", messages.len());
        Ok(())
    }

    async fn on_generation_end(&self, model: String, record: GenerationRecord) -> Result<()> {
        match record {
            GenerationRecord::Completed(gen) => {
                info!(
                    "generation finished: model={model} tokens={}",
                    gen.usage.completion_tokens
                );
            }
            GenerationRecord::Streamed { chunks } => {
                info!("generation stream finished: model={model} chunks={chunks}");
            }
        }
        Ok(())
    }

    async fn on_embedding_start(&self, model: String, content: Vec<String>) -> Result<()> {
        info!("embedding started: model={model} inputs={}", content.len());
        Ok(())
    }

    async fn on_embedding_end(&self, model: String, output: EmbeddingOutput) -> Result<()> {
        info!("embedding finished: model={model} vectors={}", output.embedding.len());
        Ok(())
    }

    async fn on_rerank_start(&self, model: String, pairs: usize) -> Result<()> {
        info!("rerank started: model={model} pairs={pairs}");
        Ok(())
    }

    async fn on_rerank_end(&self, model: String, output: RerankOutput) -> Result<()> {
        info!("rerank finished: model={model} scores={}", output.scores.len());
        Ok(())
    }

    async fn on_exception(&self, model: Option<String>, code: String, msg: String) -> Result<()> {
        warn!(
            "operation failed: model={} code={code} msg={msg}",
            model.as_deref().unwrap_or("-")
        );
        Ok(())
    }
}
