//! Application state shared across API handlers

use std::sync::Arc;

use tokio::sync::Semaphore;

use vgate_core::{
    CallbackGroup, Dispatcher, GatewayConfig, ProcessSupervisor, VirtualModelManager,
};

/// Shared application state with backpressure on inference requests
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub manager: Arc<VirtualModelManager>,
    pub supervisor: Arc<ProcessSupervisor>,
    pub callbacks: Arc<CallbackGroup>,
    /// Concurrency limiter to prevent resource exhaustion
    pub request_semaphore: Arc<Semaphore>,
    /// Request timeout configuration (seconds)
    pub request_timeout_secs: u64,
    /// Bearer token required on every route when set
    pub api_key: Option<Arc<str>>,
}

impl AppState {
    pub fn new(
        config: &GatewayConfig,
        manager: Arc<VirtualModelManager>,
        callbacks: Arc<CallbackGroup>,
    ) -> Self {
        let supervisor = manager.supervisor().clone();
        let dispatcher = Arc::new(Dispatcher::new(manager.clone(), callbacks.clone()));

        Self {
            dispatcher,
            manager,
            supervisor,
            callbacks,
            request_semaphore: Arc::new(Semaphore::new(config.max_concurrent_requests)),
            request_timeout_secs: config.request_timeout_secs,
            api_key: config.api_key.as_deref().map(Arc::from),
        }
    }

    /// Acquire a permit for concurrent request processing
    pub async fn acquire_permit(&self) -> tokio::sync::SemaphorePermit<'_> {
        // The semaphore lives as long as the state and is never closed.
        match self.request_semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => unreachable!("request semaphore closed"),
        }
    }
}
