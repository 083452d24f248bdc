// ABOUTME: Configuration parsing from TOML file with environment variable overrides.
// ABOUTME: Validates required fields and provides sensible defaults for optional ones.

use crate::dispatch::DispatchConfig;
use crate::reconnect::BackoffConfig;
use crate::session::{Credentials, SessionConfig};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub session: SessionTuning,
    #[serde(default)]
    pub reconnect: ReconnectTuning,
    #[serde(default)]
    pub dispatch: DispatchTuning,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_url")]
    pub url: String,
    #[serde(default)]
    pub agent_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
}

// Custom Debug impl to redact the agent key
impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("url", &self.url)
            .field("agent_key", &"[REDACTED]")
            .field("agent_name", &self.agent_name)
            .finish()
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: default_gateway_url(),
            agent_key: String::new(),
            agent_name: None,
        }
    }
}

fn default_gateway_url() -> String {
    "wss://gateway.perch.dev/ws".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTuning {
    #[serde(default = "default_auth_timeout_secs")]
    pub auth_timeout_secs: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
}

impl Default for SessionTuning {
    fn default() -> Self {
        Self {
            auth_timeout_secs: default_auth_timeout_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            grace_secs: default_grace_secs(),
        }
    }
}

fn default_auth_timeout_secs() -> u64 {
    10
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_grace_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectTuning {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_growth")]
    pub growth: f64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for ReconnectTuning {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            growth: default_growth(),
            jitter: default_jitter(),
        }
    }
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_growth() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchTuning {
    /// Cap on invocations running at once (absent = unbounded)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
    #[serde(default = "default_chat_queue_depth")]
    pub chat_queue_depth: usize,
}

impl Default for DispatchTuning {
    fn default() -> Self {
        Self {
            max_concurrency: None,
            chat_queue_depth: default_chat_queue_depth(),
        }
    }
}

fn default_chat_queue_depth() -> usize {
    64
}

impl Config {
    /// Find the config file, checking in order:
    /// 1. PERCH_CONFIG_PATH env var (if set)
    /// 2. ./perch.toml (current directory)
    fn find_config_file() -> Option<PathBuf> {
        if let Ok(env_path) = std::env::var("PERCH_CONFIG_PATH") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
        }

        let local_config = PathBuf::from("perch.toml");
        if local_config.exists() {
            return Some(local_config);
        }

        None
    }

    /// Load configuration from perch.toml with environment variable overrides
    pub fn load() -> Result<Self> {
        let mut config = if let Some(config_path) = Self::find_config_file() {
            tracing::info!(
                path = %config_path.display(),
                "Loading configuration from file"
            );
            Self::load_from_path(&config_path)?
        } else {
            tracing::info!("No config file found, using environment variables and defaults");
            Config::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific path, without env overrides
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str::<Config>(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("PERCH_GATEWAY_URL") {
            self.gateway.url = val;
        }
        if let Ok(val) = std::env::var("PERCH_AGENT_KEY") {
            self.gateway.agent_key = val;
        }
        if let Ok(val) = std::env::var("PERCH_AGENT_NAME") {
            self.gateway.agent_name = Some(val);
        }
    }

    /// Fail fast on configurations that could never connect
    pub fn validate(&self) -> Result<()> {
        if self.gateway.agent_key.trim().is_empty() {
            anyhow::bail!(
                "gateway.agent_key is required (set it in perch.toml or PERCH_AGENT_KEY)"
            );
        }
        if !self.gateway.url.starts_with("ws://") && !self.gateway.url.starts_with("wss://") {
            anyhow::bail!(
                "gateway.url must be a ws:// or wss:// URL, got {}",
                self.gateway.url
            );
        }
        Ok(())
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::new(
            self.gateway.agent_key.clone(),
            self.gateway.agent_name.clone(),
        )
    }

    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            auth_timeout: Duration::from_secs(self.session.auth_timeout_secs),
            heartbeat_interval: Duration::from_secs(self.session.heartbeat_interval_secs),
            grace: Duration::from_secs(self.session.grace_secs),
        }
    }

    pub fn to_backoff_config(&self) -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_millis(self.reconnect.initial_delay_ms),
            max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
            growth: self.reconnect.growth,
            jitter: self.reconnect.jitter,
        }
    }

    pub fn to_dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            max_concurrency: self.dispatch.max_concurrency,
            chat_queue_depth: self.dispatch.chat_queue_depth,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
