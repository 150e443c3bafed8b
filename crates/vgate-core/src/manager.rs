//! Virtual model registry and lifecycle.
//!
//! The manager owns the mapping from model names to descriptors and
//! attached backend adapters, and delegates child-process materialization
//! to the [`ProcessSupervisor`]. It is always constructed explicitly (in
//! `main`) and threaded through request handling, never a global.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::backend::ModelBackend;
use crate::error::{Error, Result};
use crate::supervisor::{LaunchParams, ProcessState, ProcessSupervisor};
use crate::types::{Capability, CapabilitySet, Locality, ServingMethod};

/// Identity and placement of one named virtual model.
///
/// The capability set is fixed at registration and never widened.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VirtualModelDescriptor {
    pub name: String,
    pub model_id: String,
    pub capabilities: CapabilitySet,
    pub locality: Locality,
    pub serving_method: ServingMethod,
    /// Opaque backend configuration (device selection, endpoint, ...).
    pub backend_params: serde_json::Value,
    /// Port a child serving process listens on, when locality requires one.
    pub port: Option<u16>,
}

/// Runtime onboarding request for a single model, used when one
/// long-running serving process is dedicated to exactly one model.
#[derive(Debug, Clone)]
pub struct DynamicRegistration {
    pub name: String,
    pub model_id: Option<String>,
    pub capabilities: CapabilitySet,
    pub locality: Locality,
    pub backend_params: serde_json::Value,
    pub port: Option<u16>,
}

/// A resolved model ready for dispatch.
#[derive(Clone)]
pub struct ResolvedModel {
    pub descriptor: VirtualModelDescriptor,
    pub backend: Arc<dyn ModelBackend>,
}

impl std::fmt::Debug for ResolvedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedModel")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

struct RegisteredModel {
    descriptor: VirtualModelDescriptor,
    backend: Option<Arc<dyn ModelBackend>>,
}

#[derive(Debug, Deserialize)]
struct ModelConfigFile {
    #[serde(default)]
    models: Vec<ModelConfigEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelConfigEntry {
    name: String,
    #[serde(default)]
    model_id: Option<String>,
    capabilities: Vec<Capability>,
    locality: Locality,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    backend_params: toml::value::Table,
}

/// Registry and lifecycle of named virtual models.
pub struct VirtualModelManager {
    registry: RwLock<HashMap<String, RegisteredModel>>,
    supervisor: Arc<ProcessSupervisor>,
    /// Per-name in-flight spawn locks: concurrent `ensure_running` callers
    /// for the same unready model join the same pending spawn.
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for VirtualModelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualModelManager").finish_non_exhaustive()
    }
}

impl VirtualModelManager {
    /// Empty manager; data-plane access fails with ManagerNotLoaded until a
    /// model is registered.
    pub fn new(supervisor: Arc<ProcessSupervisor>) -> Self {
        Self {
            registry: RwLock::new(HashMap::new()),
            supervisor,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Parse a static declarative model list (toml) into descriptors.
    pub fn load_from_config(source: &str, supervisor: Arc<ProcessSupervisor>) -> Result<Self> {
        let parsed: ModelConfigFile = toml::from_str(source)?;
        let mut registry = HashMap::new();
        for entry in parsed.models {
            if entry.capabilities.is_empty() {
                return Err(Error::BadParams(format!(
                    "model {} declares no capabilities",
                    entry.name
                )));
            }
            let descriptor = VirtualModelDescriptor {
                model_id: entry.model_id.unwrap_or_else(|| entry.name.clone()),
                capabilities: entry.capabilities.iter().copied().collect(),
                locality: entry.locality,
                serving_method: ServingMethod::StaticConfig,
                backend_params: serde_json::to_value(&entry.backend_params)
                    .map_err(|e| Error::BadParams(e.to_string()))?,
                port: entry.port,
                name: entry.name,
            };
            let key = descriptor.name.clone();
            if registry
                .insert(
                    key.clone(),
                    RegisteredModel {
                        descriptor,
                        backend: None,
                    },
                )
                .is_some()
            {
                return Err(Error::BadParams(format!(
                    "duplicate model name in config: {key}"
                )));
            }
        }
        info!("loaded {} virtual models from config", registry.len());
        Ok(Self {
            registry: RwLock::new(registry),
            supervisor,
            inflight: Mutex::new(HashMap::new()),
        })
    }

    /// Onboard one model at runtime. Idempotent with respect to name: a
    /// second registration returns the existing descriptor unchanged.
    pub async fn register_dynamic(
        &self,
        registration: DynamicRegistration,
    ) -> Result<VirtualModelDescriptor> {
        if registration.capabilities.is_empty() {
            return Err(Error::BadParams(format!(
                "model {} declares no capabilities",
                registration.name
            )));
        }
        let mut registry = self.registry.write().await;
        if let Some(existing) = registry.get(&registration.name) {
            debug!("model {} already registered", registration.name);
            return Ok(existing.descriptor.clone());
        }
        let descriptor = VirtualModelDescriptor {
            model_id: registration
                .model_id
                .unwrap_or_else(|| registration.name.clone()),
            capabilities: registration.capabilities,
            locality: registration.locality,
            serving_method: ServingMethod::DynamicRegistration,
            backend_params: registration.backend_params,
            port: registration.port,
            name: registration.name.clone(),
        };
        registry.insert(
            registration.name,
            RegisteredModel {
                descriptor: descriptor.clone(),
                backend: None,
            },
        );
        info!("registered virtual model {}", descriptor.name);
        Ok(descriptor)
    }

    /// Attach the adapter that actually executes calls for `name`.
    pub async fn attach_backend(&self, name: &str, backend: Arc<dyn ModelBackend>) -> Result<()> {
        let mut registry = self.registry.write().await;
        let model = registry
            .get_mut(name)
            .ok_or_else(|| Error::ModelNotFound(name.to_string()))?;
        model.backend = Some(backend);
        Ok(())
    }

    /// Look up a descriptor without materializing anything.
    pub async fn descriptor(&self, name: &str) -> Result<VirtualModelDescriptor> {
        let registry = self.registry.read().await;
        if registry.is_empty() {
            return Err(Error::ManagerNotLoaded("no models registered".into()));
        }
        registry
            .get(name)
            .map(|m| m.descriptor.clone())
            .ok_or_else(|| Error::ModelNotFound(name.to_string()))
    }

    /// Resolve a model name for one capability, never touching the backend.
    pub async fn resolve(&self, name: &str, capability: Capability) -> Result<ResolvedModel> {
        let registry = self.registry.read().await;
        if registry.is_empty() {
            return Err(Error::ManagerNotLoaded("no models registered".into()));
        }
        let model = registry
            .get(name)
            .ok_or_else(|| Error::ModelNotFound(name.to_string()))?;
        if !model.descriptor.capabilities.contains(&capability) {
            return Err(Error::ModelNotStarted(format!(
                "{name} does not serve {capability}"
            )));
        }
        if model.descriptor.locality == Locality::ChildProcess {
            let running = self
                .supervisor
                .list()
                .await
                .into_iter()
                .any(|record| record.name == name && record.state == ProcessState::Running);
            if !running {
                return Err(Error::ModelNotStarted(format!(
                    "{name} serving process is not running"
                )));
            }
        }
        let backend = model
            .backend
            .clone()
            .ok_or_else(|| Error::ModelNotStarted(format!("{name} has no backend attached")))?;
        Ok(ResolvedModel {
            descriptor: model.descriptor.clone(),
            backend,
        })
    }

    /// Materialize a child-process model, blocking cooperatively until
    /// readiness or failure. No-op for in-process and remote models.
    /// Concurrent callers for the same name join a single pending spawn.
    pub async fn ensure_running(&self, name: &str) -> Result<VirtualModelDescriptor> {
        let descriptor = {
            let registry = self.registry.read().await;
            if registry.is_empty() {
                return Err(Error::ManagerNotLoaded("no models registered".into()));
            }
            registry
                .get(name)
                .map(|m| m.descriptor.clone())
                .ok_or_else(|| Error::ModelNotFound(name.to_string()))?
        };
        if descriptor.locality != Locality::ChildProcess {
            return Ok(descriptor);
        }

        let gate = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let result = {
            let _guard = gate.lock().await;

            // Re-check under the per-name lock: a joined caller finds the
            // process the first caller already spawned.
            let running = self
                .supervisor
                .list()
                .await
                .into_iter()
                .any(|record| record.name == name && record.state == ProcessState::Running);
            if running {
                Ok(())
            } else {
                match Self::launch_params(&descriptor) {
                    Ok(launch) => self.supervisor.spawn(launch).await.map(|_| ()),
                    Err(err) => Err(err),
                }
            }
        };

        // Drop the in-flight entry once the spawn concluded and nobody
        // else holds a clone (one reference here, one in the map).
        {
            let mut inflight = self.inflight.lock().await;
            if inflight.get(name).is_some_and(|existing| {
                Arc::ptr_eq(existing, &gate) && Arc::strong_count(existing) <= 2
            }) {
                inflight.remove(name);
            }
        }

        result?;
        Ok(descriptor)
    }

    /// Remove a model from the registry, stopping its serving process when
    /// one is tracked.
    pub async fn offload(&self, name: &str) -> Result<()> {
        let removed = {
            let mut registry = self.registry.write().await;
            if registry.is_empty() {
                return Err(Error::ManagerNotLoaded("no models registered".into()));
            }
            registry
                .remove(name)
                .ok_or_else(|| Error::GroupNotFound(name.to_string()))?
        };
        if removed.descriptor.locality == Locality::ChildProcess {
            // The process may never have been spawned.
            match self.supervisor.stop(name).await {
                Ok(()) | Err(Error::GroupNotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        self.inflight.lock().await.remove(name);
        info!("offloaded virtual model {name}");
        Ok(())
    }

    /// Snapshot of every registered descriptor.
    pub async fn list(&self) -> Vec<VirtualModelDescriptor> {
        let registry = self.registry.read().await;
        registry.values().map(|m| m.descriptor.clone()).collect()
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    fn launch_params(descriptor: &VirtualModelDescriptor) -> Result<LaunchParams> {
        let port = descriptor.port.ok_or_else(|| {
            Error::BadParams(format!(
                "model {} has child_process locality but no port",
                descriptor.name
            ))
        })?;
        let params = &descriptor.backend_params;
        let mut launch = LaunchParams::new(&descriptor.name, port);
        launch.model_id = Some(descriptor.model_id.clone());
        launch.method = Some(
            match descriptor.serving_method {
                ServingMethod::StaticConfig => "config",
                ServingMethod::DynamicRegistration => "dynamic",
            }
            .to_string(),
        );
        launch.model_type = params
            .get("type")
            .and_then(|v| v.as_str())
            .map(String::from);
        launch.host = params
            .get("host")
            .and_then(|v| v.as_str())
            .map(String::from);
        launch.api_key = params
            .get("api_key")
            .and_then(|v| v.as_str())
            .map(String::from);
        launch.backend = params
            .get("backend")
            .and_then(|v| v.as_str())
            .map(String::from);
        launch.device_map_auto = params
            .get("device_map_auto")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        Ok(launch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::SERVER_STARTED_MSG;
    use async_trait::async_trait;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    struct NullBackend;

    #[async_trait]
    impl ModelBackend for NullBackend {
        fn model_id(&self) -> &str {
            "null"
        }
    }

    fn supervisor() -> Arc<ProcessSupervisor> {
        Arc::new(ProcessSupervisor::new(Duration::from_secs(1)))
    }

    fn chat_registration(name: &str) -> DynamicRegistration {
        DynamicRegistration {
            name: name.to_string(),
            model_id: None,
            capabilities: [Capability::Chat].into_iter().collect(),
            locality: Locality::InProcess,
            backend_params: serde_json::json!({}),
            port: None,
        }
    }

    #[tokio::test]
    async fn empty_manager_fails_uniformly() {
        let manager = VirtualModelManager::new(supervisor());
        let err = manager.resolve("m1", Capability::Chat).await.unwrap_err();
        assert_eq!(err.domain_code(), "MANAGER_NOT_LOADED");
        let err = manager.ensure_running("m1").await.unwrap_err();
        assert_eq!(err.domain_code(), "MANAGER_NOT_LOADED");
        let err = manager.offload("m1").await.unwrap_err();
        assert_eq!(err.domain_code(), "MANAGER_NOT_LOADED");
    }

    #[tokio::test]
    async fn register_dynamic_is_idempotent_per_name() {
        let manager = VirtualModelManager::new(supervisor());
        let first = manager
            .register_dynamic(chat_registration("m1"))
            .await
            .unwrap();
        assert_eq!(first.model_id, "m1");
        assert_eq!(first.serving_method, ServingMethod::DynamicRegistration);

        let mut again = chat_registration("m1");
        again.model_id = Some("other-id".into());
        let second = manager.register_dynamic(again).await.unwrap();
        assert_eq!(second.model_id, "m1");
        assert_eq!(manager.list().await.len(), 1);
    }

    #[tokio::test]
    async fn resolve_checks_capability_before_backend() {
        let manager = VirtualModelManager::new(supervisor());
        manager
            .register_dynamic(chat_registration("m1"))
            .await
            .unwrap();
        manager
            .attach_backend("m1", Arc::new(NullBackend))
            .await
            .unwrap();

        let err = manager
            .resolve("missing", Capability::Chat)
            .await
            .unwrap_err();
        assert_eq!(err.domain_code(), "MODEL_NOT_FOUND");

        let err = manager
            .resolve("m1", Capability::Embedding)
            .await
            .unwrap_err();
        assert_eq!(err.domain_code(), "MODEL_NOT_STARTED");

        let resolved = manager.resolve("m1", Capability::Chat).await.unwrap();
        assert!(resolved.descriptor.capabilities.contains(&Capability::Chat));
    }

    #[tokio::test]
    async fn resolve_requires_attached_backend() {
        let manager = VirtualModelManager::new(supervisor());
        manager
            .register_dynamic(chat_registration("m1"))
            .await
            .unwrap();
        let err = manager.resolve("m1", Capability::Chat).await.unwrap_err();
        assert_eq!(err.domain_code(), "MODEL_NOT_STARTED");
    }

    #[tokio::test]
    async fn load_from_config_rejects_malformed_input() {
        let err =
            VirtualModelManager::load_from_config("models = 'nope'", supervisor()).unwrap_err();
        assert_eq!(err.domain_code(), "BAD_PARAMS");
    }

    #[tokio::test]
    async fn load_from_config_builds_descriptors() {
        let source = r#"
            [[models]]
            name = "embed-small"
            capabilities = ["embedding"]
            locality = "remote"

            [models.backend_params]
            host = "localhost"

            [[models]]
            name = "chat-7b"
            model_id = "org/chat-7b"
            capabilities = ["chat", "tokenize"]
            locality = "child_process"
            port = 8101
        "#;
        let manager = VirtualModelManager::load_from_config(source, supervisor()).unwrap();
        let mut names: Vec<_> = manager.list().await.into_iter().map(|d| d.name).collect();
        names.sort();
        assert_eq!(names, vec!["chat-7b", "embed-small"]);

        let resolved_err = manager
            .resolve("chat-7b", Capability::Chat)
            .await
            .unwrap_err();
        // child_process model with no running process
        assert_eq!(resolved_err.domain_code(), "MODEL_NOT_STARTED");
    }

    #[tokio::test]
    async fn offload_removes_descriptor() {
        let manager = VirtualModelManager::new(supervisor());
        manager
            .register_dynamic(chat_registration("m1"))
            .await
            .unwrap();
        manager.offload("m1").await.unwrap();

        manager
            .register_dynamic(chat_registration("m2"))
            .await
            .unwrap();
        let err = manager.offload("m1").await.unwrap_err();
        assert_eq!(err.domain_code(), "GROUP_NOT_FOUND");
    }

    fn fake_serve_script() -> String {
        let path = std::env::temp_dir().join(format!(
            "vgate-manager-test-{}",
            uuid::Uuid::new_v4().simple()
        ));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh").unwrap();
        writeln!(file, "sleep 0.2").unwrap();
        writeln!(file, "echo '{SERVER_STARTED_MSG}'").unwrap();
        writeln!(file, "sleep 30").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().to_string()
    }

    #[tokio::test]
    async fn concurrent_ensure_running_spawns_once() {
        let supervisor = Arc::new(ProcessSupervisor::with_program(
            fake_serve_script(),
            Duration::from_secs(10),
        ));
        let manager = Arc::new(VirtualModelManager::new(supervisor.clone()));
        manager
            .register_dynamic(DynamicRegistration {
                name: "m1".into(),
                model_id: None,
                capabilities: [Capability::Chat].into_iter().collect(),
                locality: Locality::ChildProcess,
                backend_params: serde_json::json!({}),
                port: Some(8111),
            })
            .await
            .unwrap();

        let a = manager.clone();
        let b = manager.clone();
        let (ra, rb) = tokio::join!(a.ensure_running("m1"), b.ensure_running("m1"));
        ra.unwrap();
        rb.unwrap();

        assert_eq!(supervisor.list().await.len(), 1);
        assert!(manager.inflight.lock().await.is_empty());
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn failed_ensure_running_releases_inflight_entry() {
        let supervisor = supervisor();
        let manager = VirtualModelManager::new(supervisor.clone());
        manager
            .register_dynamic(DynamicRegistration {
                name: "portless".into(),
                model_id: None,
                capabilities: [Capability::Chat].into_iter().collect(),
                locality: Locality::ChildProcess,
                backend_params: serde_json::json!({}),
                port: None,
            })
            .await
            .unwrap();

        let err = manager.ensure_running("portless").await.unwrap_err();
        assert_eq!(err.domain_code(), "BAD_PARAMS");
        assert!(manager.inflight.lock().await.is_empty());
    }
}
