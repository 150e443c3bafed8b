//! vgate core - virtual model gateway runtime
//!
//! This crate is the serving-gateway core: a registry of named virtual
//! models backed by heterogeneous backends (in-process adapters, spawned
//! serving subprocesses, remote APIs), a supervisor for the subprocess
//! lifecycle, a dispatcher that routes unified calls to backend adapters,
//! a best-effort callback bus, and a uniform error taxonomy.
//!
//! Concrete backend adapters live outside this crate; they only need to
//! implement [`ModelBackend`].

pub mod backend;
pub mod callback;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod manager;
pub mod supervisor;
pub mod types;

pub use backend::{ModelBackend, PassthroughOp};
pub use callback::{
    CallbackGroup, ExecutionMode, GatewayCallback, GenerationRecord, LoggingCallback,
};
pub use config::{GatewayConfig, ServeOptions};
pub use dispatch::Dispatcher;
pub use error::{Error, ErrorEnvelope, Result};
pub use manager::{
    DynamicRegistration, ResolvedModel, VirtualModelDescriptor, VirtualModelManager,
};
pub use supervisor::{
    LaunchParams, ProcessRecord, ProcessState, ProcessSupervisor, SERVER_FAILED_MSG,
    SERVER_STARTED_MSG,
};
pub use types::{
    Capability, CapabilitySet, ChatMessage, ChatRole, EmbeddingOutput, FinishReason, Generation,
    GenerationChunk, GenerationParams, Locality, Param, RerankOutput, ServingMethod, TokenUsage,
    TokenizeOutput, Transcription,
};
