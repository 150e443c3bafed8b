//! Request dispatcher: routes unified calls to resolved backends.
//!
//! Every operation follows the same shape: check capability, materialize
//! the backend if needed, fire the start hook, invoke the backend, fire
//! the end hook. Failures pass through the exception hook and come back
//! as typed errors; envelope translation happens once, at the server edge.

use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;

use crate::backend::PassthroughOp;
use crate::callback::{CallbackGroup, GenerationRecord};
use crate::error::{Error, Result};
use crate::manager::{ResolvedModel, VirtualModelManager};
use crate::types::{
    Capability, ChatMessage, EmbeddingOutput, Generation, GenerationChunk, GenerationParams,
    RerankOutput, TokenizeOutput, Transcription,
};

pub struct Dispatcher {
    manager: Arc<VirtualModelManager>,
    callbacks: Arc<CallbackGroup>,
}

impl Dispatcher {
    pub fn new(manager: Arc<VirtualModelManager>, callbacks: Arc<CallbackGroup>) -> Self {
        Self { manager, callbacks }
    }

    pub fn manager(&self) -> &Arc<VirtualModelManager> {
        &self.manager
    }

    pub fn callbacks(&self) -> &Arc<CallbackGroup> {
        &self.callbacks
    }

    /// Capability check first (so a wrong-capability request never spawns a
    /// process or touches a backend), then materialize and resolve.
    async fn prepare(&self, model: &str, capability: Capability) -> Result<ResolvedModel> {
        let descriptor = self.manager.descriptor(model).await?;
        if !descriptor.capabilities.contains(&capability) {
            return Err(Error::ModelNotStarted(format!(
                "{model} does not serve {capability}"
            )));
        }
        self.manager.ensure_running(model).await?;
        self.manager.resolve(model, capability).await
    }

    /// Forward a wire-level payload for a passthrough backend, bypassing
    /// canonical conversion. Returns `None` when the resolved backend does
    /// not speak the wire protocol natively.
    pub async fn try_forward_raw(
        &self,
        model: &str,
        op: PassthroughOp,
        payload: serde_json::Value,
    ) -> Result<Option<serde_json::Value>> {
        let resolved = self.prepare(model, op_capability(op)).await?;
        if !resolved.backend.is_passthrough() {
            return Ok(None);
        }
        match resolved.backend.forward_raw(op, payload).await {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                self.callbacks.on_exception(Some(model), &err).await;
                Err(err)
            }
        }
    }

    /// Streaming variant of [`try_forward_raw`]: the backend's wire chunks
    /// pass through untouched. Mid-stream failures yield exactly one
    /// trailing error item, mirroring [`stream`].
    ///
    /// [`try_forward_raw`]: Dispatcher::try_forward_raw
    /// [`stream`]: Dispatcher::stream
    pub async fn try_forward_raw_stream(
        &self,
        model: &str,
        op: PassthroughOp,
        payload: serde_json::Value,
    ) -> Result<Option<BoxStream<'static, Result<serde_json::Value>>>> {
        let resolved = self.prepare(model, op_capability(op)).await?;
        if !resolved.backend.is_passthrough() {
            return Ok(None);
        }
        let mut inner = match resolved.backend.forward_raw_stream(op, payload).await {
            Ok(stream) => stream,
            Err(err) => {
                self.callbacks.on_exception(Some(model), &err).await;
                return Err(err);
            }
        };

        let callbacks = self.callbacks.clone();
        let model = model.to_string();
        let guarded = async_stream::stream! {
            while let Some(item) = inner.next().await {
                match item {
                    Ok(value) => yield Ok(value),
                    Err(err) => {
                        callbacks.on_exception(Some(&model), &err).await;
                        yield Err(err);
                        return;
                    }
                }
            }
        };
        Ok(Some(guarded.boxed()))
    }

    pub async fn generate(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        params: GenerationParams,
    ) -> Result<Generation> {
        let resolved = self.prepare(model, Capability::Chat).await?;
        self.callbacks
            .on_generation_start(model, &messages, &params)
            .await;
        match resolved.backend.generate(messages, params).await {
            Ok(generation) => {
                self.callbacks
                    .on_generation_end(model, GenerationRecord::Completed(generation.clone()))
                    .await;
                Ok(generation)
            }
            Err(err) => Err(self.fail_generation(model, err).await),
        }
    }

    /// Lazy, finite, non-restartable chunk sequence. On a mid-stream
    /// backend failure the stream yields exactly one trailing error item
    /// and then ends; no chunk follows a terminal event.
    pub async fn stream(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        params: GenerationParams,
    ) -> Result<BoxStream<'static, Result<GenerationChunk>>> {
        let resolved = self.prepare(model, Capability::Chat).await?;
        self.callbacks
            .on_generation_start(model, &messages, &params)
            .await;
        let mut inner = match resolved.backend.stream(messages, params).await {
            Ok(stream) => stream,
            Err(err) => return Err(self.fail_generation(model, err).await),
        };

        let callbacks = self.callbacks.clone();
        let model = model.to_string();
        let guarded = async_stream::stream! {
            let mut chunks = 0usize;
            while let Some(item) = inner.next().await {
                match item {
                    Ok(chunk) => {
                        chunks += 1;
                        yield Ok(chunk);
                    }
                    Err(err) => {
                        let err = into_generate_error(err);
                        callbacks.on_exception(Some(&model), &err).await;
                        yield Err(err);
                        return;
                    }
                }
            }
            callbacks
                .on_generation_end(&model, GenerationRecord::Streamed { chunks })
                .await;
        };
        Ok(guarded.boxed())
    }

    pub async fn embedding(&self, model: &str, content: Vec<String>) -> Result<EmbeddingOutput> {
        let resolved = self.prepare(model, Capability::Embedding).await?;
        self.callbacks.on_embedding_start(model, &content).await;
        match resolved.backend.embedding(content).await {
            Ok(output) => {
                self.callbacks.on_embedding_end(model, &output).await;
                Ok(output)
            }
            Err(err) => {
                self.callbacks.on_exception(Some(model), &err).await;
                Err(err)
            }
        }
    }

    pub async fn rerank(
        &self,
        model: &str,
        pairs: Vec<[String; 2]>,
        apply_softmax: bool,
    ) -> Result<RerankOutput> {
        let resolved = self.prepare(model, Capability::Rerank).await?;
        self.callbacks.on_rerank_start(model, pairs.len()).await;
        match resolved.backend.rerank(pairs, apply_softmax).await {
            Ok(output) => {
                self.callbacks.on_rerank_end(model, &output).await;
                Ok(output)
            }
            Err(err) => {
                self.callbacks.on_exception(Some(model), &err).await;
                Err(err)
            }
        }
    }

    pub async fn tokenize(&self, model: &str, content: String) -> Result<TokenizeOutput> {
        let resolved = self.prepare(model, Capability::Tokenize).await?;
        match resolved.backend.tokenize(content).await {
            Ok(output) => Ok(output),
            Err(err) => {
                self.callbacks.on_exception(Some(model), &err).await;
                Err(err)
            }
        }
    }

    pub async fn transcribe(
        &self,
        model: &str,
        audio: Vec<u8>,
        language: Option<String>,
    ) -> Result<Transcription> {
        let resolved = self.prepare(model, Capability::Transcribe).await?;
        self.callbacks
            .on_transcribe_start(model, audio.len(), language.as_deref())
            .await;
        match resolved.backend.transcribe(audio, language).await {
            Ok(output) => {
                self.callbacks.on_transcribe_end(model, &output).await;
                Ok(output)
            }
            Err(err) => {
                self.callbacks.on_exception(Some(model), &err).await;
                Err(err)
            }
        }
    }

    async fn fail_generation(&self, model: &str, err: Error) -> Error {
        let err = into_generate_error(err);
        self.callbacks.on_exception(Some(model), &err).await;
        err
    }
}

fn op_capability(op: PassthroughOp) -> Capability {
    match op {
        PassthroughOp::Generate => Capability::Chat,
        PassthroughOp::Embedding => Capability::Embedding,
        PassthroughOp::Rerank => Capability::Rerank,
        PassthroughOp::Tokenize => Capability::Tokenize,
        PassthroughOp::Transcribe => Capability::Transcribe,
    }
}

/// Failures raised while executing a generation are generation failures;
/// taxonomy kinds that already describe the cause (auth, rate limit,
/// upstream timeout, ...) pass through untouched.
fn into_generate_error(err: Error) -> Error {
    match err {
        Error::ModelLoad(msg) | Error::Internal(msg) => Error::ModelGenerate(msg),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ModelBackend;
    use crate::manager::DynamicRegistration;
    use crate::supervisor::ProcessSupervisor;
    use crate::types::{FinishReason, Locality, TokenUsage};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct ScriptedBackend {
        invocations: Arc<AtomicUsize>,
        fail_generate: bool,
        fail_after_chunks: Option<usize>,
    }

    impl ScriptedBackend {
        fn new() -> Self {
            Self {
                invocations: Arc::new(AtomicUsize::new(0)),
                fail_generate: false,
                fail_after_chunks: None,
            }
        }

        fn chunk(i: usize) -> GenerationChunk {
            GenerationChunk {
                id: "gen-1".into(),
                created: 1,
                model: "m1".into(),
                delta: format!("tok{i}"),
                finish_reason: None,
                usage: None,
            }
        }
    }

    #[async_trait]
    impl ModelBackend for ScriptedBackend {
        fn model_id(&self) -> &str {
            "m1"
        }

        async fn generate(
            &self,
            _messages: Vec<ChatMessage>,
            params: GenerationParams,
        ) -> Result<Generation> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            params.warn_unrecognized(self.model_id(), &["max_tokens", "temperature"]);
            if self.fail_generate {
                return Err(Error::ModelLoad("weights corrupt".into()));
            }
            Ok(Generation {
                id: "gen-1".into(),
                created: 1,
                model: "m1".into(),
                content: "hello".into(),
                finish_reason: FinishReason::Stop,
                usage: TokenUsage::new(3, 5),
                generation_time_ms: 1.0,
            })
        }

        async fn stream(
            &self,
            _messages: Vec<ChatMessage>,
            _params: GenerationParams,
        ) -> Result<BoxStream<'static, Result<GenerationChunk>>> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            let fail_after = self.fail_after_chunks;
            let stream = async_stream::stream! {
                for i in 0..3 {
                    if fail_after == Some(i) {
                        yield Err(Error::Internal("backend died mid-stream".into()));
                        return;
                    }
                    yield Ok(ScriptedBackend::chunk(i));
                }
            };
            Ok(stream.boxed())
        }
    }

    async fn dispatcher_with(backend: ScriptedBackend) -> (Dispatcher, Arc<AtomicUsize>) {
        let invocations = backend.invocations.clone();
        let supervisor = Arc::new(ProcessSupervisor::new(Duration::from_secs(1)));
        let manager = Arc::new(VirtualModelManager::new(supervisor));
        manager
            .register_dynamic(DynamicRegistration {
                name: "m1".into(),
                model_id: None,
                capabilities: [Capability::Chat].into_iter().collect(),
                locality: Locality::InProcess,
                backend_params: serde_json::json!({}),
                port: None,
            })
            .await
            .unwrap();
        manager
            .attach_backend("m1", Arc::new(backend))
            .await
            .unwrap();
        let dispatcher = Dispatcher::new(manager, Arc::new(CallbackGroup::empty()));
        (dispatcher, invocations)
    }

    #[tokio::test]
    async fn generate_returns_canonical_response() {
        let (dispatcher, _) = dispatcher_with(ScriptedBackend::new()).await;
        let generation = dispatcher
            .generate("m1", vec![ChatMessage::user("hi")], Default::default())
            .await
            .unwrap();
        assert_eq!(generation.content, "hello");
        assert_eq!(generation.usage.total_tokens, 8);
    }

    #[tokio::test]
    async fn generate_failure_maps_to_model_generate_error() {
        let mut backend = ScriptedBackend::new();
        backend.fail_generate = true;
        let (dispatcher, _) = dispatcher_with(backend).await;

        let err = dispatcher
            .generate("m1", vec![ChatMessage::user("hi")], Default::default())
            .await
            .unwrap_err();
        assert_eq!(err.domain_code(), "MODEL_GENERATE_ERROR");
        assert_eq!(err.http_status(), 500);
        assert!(err.to_string().contains("weights corrupt"));
    }

    #[tokio::test]
    async fn wrong_capability_never_invokes_backend() {
        let (dispatcher, invocations) = dispatcher_with(ScriptedBackend::new()).await;
        let err = dispatcher
            .embedding("m1", vec!["hi".into()])
            .await
            .unwrap_err();
        assert_eq!(err.domain_code(), "MODEL_NOT_STARTED");
        assert_eq!(invocations.load(Ordering::SeqCst), 0);

        let err = dispatcher
            .generate("nope", vec![ChatMessage::user("hi")], Default::default())
            .await
            .unwrap_err();
        assert_eq!(err.domain_code(), "MODEL_NOT_FOUND");
        assert_eq!(invocations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn clean_stream_emits_all_chunks() {
        let (dispatcher, _) = dispatcher_with(ScriptedBackend::new()).await;
        let stream = dispatcher
            .stream("m1", vec![ChatMessage::user("hi")], Default::default())
            .await
            .unwrap();
        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 3);
        assert!(items.iter().all(|item| item.is_ok()));
    }

    #[tokio::test]
    async fn mid_stream_failure_emits_exactly_one_trailing_error() {
        let mut backend = ScriptedBackend::new();
        backend.fail_after_chunks = Some(2);
        let (dispatcher, _) = dispatcher_with(backend).await;

        let stream = dispatcher
            .stream("m1", vec![ChatMessage::user("hi")], Default::default())
            .await
            .unwrap();
        let items: Vec<_> = stream.collect().await;

        assert_eq!(items.len(), 3);
        assert!(items[0].is_ok());
        assert!(items[1].is_ok());
        let err = items[2].as_ref().unwrap_err();
        assert_eq!(err.domain_code(), "MODEL_GENERATE_ERROR");
        assert_eq!(items.iter().filter(|item| item.is_err()).count(), 1);
    }

    struct PassthroughBackend;

    #[async_trait]
    impl ModelBackend for PassthroughBackend {
        fn model_id(&self) -> &str {
            "gateway-upstream"
        }

        fn is_passthrough(&self) -> bool {
            true
        }

        async fn forward_raw(
            &self,
            _op: PassthroughOp,
            payload: serde_json::Value,
        ) -> Result<serde_json::Value> {
            Ok(serde_json::json!({ "forwarded": payload }))
        }

        async fn forward_raw_stream(
            &self,
            _op: PassthroughOp,
            payload: serde_json::Value,
        ) -> Result<BoxStream<'static, Result<serde_json::Value>>> {
            let stream = async_stream::stream! {
                yield Ok::<_, Error>(serde_json::json!({ "forwarded": payload, "seq": 0 }));
                yield Ok(serde_json::json!({ "forwarded": payload, "seq": 1 }));
            };
            Ok(stream.boxed())
        }
    }

    async fn passthrough_dispatcher() -> Dispatcher {
        let supervisor = Arc::new(ProcessSupervisor::new(Duration::from_secs(1)));
        let manager = Arc::new(VirtualModelManager::new(supervisor));
        manager
            .register_dynamic(DynamicRegistration {
                name: "up".into(),
                model_id: None,
                capabilities: [Capability::Chat].into_iter().collect(),
                locality: Locality::Remote,
                backend_params: serde_json::json!({}),
                port: None,
            })
            .await
            .unwrap();
        manager
            .attach_backend("up", Arc::new(PassthroughBackend))
            .await
            .unwrap();
        Dispatcher::new(manager, Arc::new(CallbackGroup::empty()))
    }

    #[tokio::test]
    async fn passthrough_backend_bypasses_conversion() {
        let dispatcher = passthrough_dispatcher().await;

        let payload = serde_json::json!({"model": "up", "messages": []});
        let forwarded = dispatcher
            .try_forward_raw("up", PassthroughOp::Generate, payload.clone())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(forwarded["forwarded"], payload);

        let (dispatcher, _) = dispatcher_with(ScriptedBackend::new()).await;
        let none = dispatcher
            .try_forward_raw("m1", PassthroughOp::Generate, payload)
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn passthrough_stream_forwards_wire_chunks() {
        let dispatcher = passthrough_dispatcher().await;

        let payload = serde_json::json!({"model": "up", "messages": [], "stream": true});
        let stream = dispatcher
            .try_forward_raw_stream("up", PassthroughOp::Generate, payload.clone())
            .await
            .unwrap()
            .expect("passthrough backend should forward streams");
        let items: Vec<_> = stream.collect().await;

        assert_eq!(items.len(), 2);
        let first = items[0].as_ref().unwrap();
        assert_eq!(first["forwarded"], payload);
        assert_eq!(first["seq"], 0);

        // A canonical backend signals that raw forwarding does not apply.
        let (dispatcher, _) = dispatcher_with(ScriptedBackend::new()).await;
        let none = dispatcher
            .try_forward_raw_stream("m1", PassthroughOp::Generate, payload)
            .await
            .unwrap();
        assert!(none.is_none());
    }
}
