//! Gateway configuration types.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Main gateway configuration, filled from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Path to the static virtual-model list (toml). Absent means the
    /// registry starts empty and models arrive via dynamic registration.
    #[serde(default)]
    pub config_path: Option<PathBuf>,

    /// Comma-separated callback ids to activate at startup.
    #[serde(default)]
    pub callbacks: Vec<String>,

    /// Upper bound on the wait for a spawned serving process to report
    /// readiness.
    #[serde(default = "default_spawn_timeout_secs")]
    pub spawn_timeout_secs: u64,

    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Bearer token required on every request when set.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Cap on concurrently running background callback tasks.
    #[serde(default = "default_background_callback_limit")]
    pub background_callback_limit: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            config_path: None,
            callbacks: Vec::new(),
            spawn_timeout_secs: default_spawn_timeout_secs(),
            max_concurrent_requests: default_max_concurrent_requests(),
            request_timeout_secs: default_request_timeout_secs(),
            api_key: None,
            background_callback_limit: default_background_callback_limit(),
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        Self {
            host: env_or("VGATE_HOST", default_host),
            port: env_parsed("VGATE_PORT", default_port),
            config_path: std::env::var("VGATE_CONFIG").ok().map(PathBuf::from),
            callbacks: std::env::var("VGATE_CALLBACKS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            spawn_timeout_secs: env_parsed("VGATE_SPAWN_TIMEOUT_SECS", default_spawn_timeout_secs),
            max_concurrent_requests: env_parsed(
                "MAX_CONCURRENT_REQUESTS",
                default_max_concurrent_requests,
            ),
            request_timeout_secs: env_parsed("REQUEST_TIMEOUT_SECS", default_request_timeout_secs),
            api_key: std::env::var("SERVE_API_KEY").ok().filter(|s| !s.is_empty()),
            background_callback_limit: env_parsed(
                "VGATE_CALLBACK_CONCURRENCY",
                default_background_callback_limit,
            ),
        }
    }
}

/// Environment bag consumed by the single-model serve entrypoint.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub name: String,
    pub model_id: String,
    pub method: String,
    pub model_type: Option<String>,
    pub backend: String,
    pub device_map_auto: bool,
    pub api_key: Option<String>,
}

impl ServeOptions {
    pub fn from_env() -> Result<Self> {
        let name = std::env::var("SERVE_NAME")
            .ok()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::BadParams("SERVE_NAME is not set".into()))?;
        let model_id = std::env::var("SERVE_MODEL_ID")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| name.clone());
        Ok(Self {
            name,
            model_id,
            method: env_or("SERVE_METHOD", || "config".to_string()),
            model_type: std::env::var("SERVE_TYPE").ok().filter(|s| !s.is_empty()),
            backend: env_or("SERVE_BACKEND", || "torch".to_string()),
            device_map_auto: std::env::var("SERVE_DEVICE_MAP_AUTO")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            api_key: std::env::var("SERVE_API_KEY").ok().filter(|s| !s.is_empty()),
        })
    }
}

fn env_or(key: &str, default: impl Fn() -> String) -> String {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().to_string(),
        _ => default(),
    }
}

fn env_parsed<T: std::str::FromStr + Copy>(key: &str, default: impl Fn() -> T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("invalid {key}='{raw}', using default");
            default()
        }),
        Err(_) => default(),
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_spawn_timeout_secs() -> u64 {
    300
}

fn default_max_concurrent_requests() -> usize {
    100
}

fn default_request_timeout_secs() -> u64 {
    300
}

fn default_background_callback_limit() -> usize {
    64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = GatewayConfig::default();
        assert_eq!(config.port, 8000);
        assert_eq!(config.spawn_timeout_secs, 300);
        assert!(config.api_key.is_none());
        assert!(config.callbacks.is_empty());
    }
}
