//! Runtime configuration
//!
//! Loaded from a TOML file (every field optional), then overridden by
//! `SITEPROBE_*` environment variables, then by command line flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ProbeError;

/// Environment variable overriding `gateway.url`
pub const ENV_GATEWAY_URL: &str = "SITEPROBE_GATEWAY_URL";
/// Environment variable overriding `gateway.auth_token`
pub const ENV_AUTH_TOKEN: &str = "SITEPROBE_AUTH_TOKEN";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub agent: AgentConfig,
    pub orchestrator: OrchestratorConfig,
    pub output: OutputConfig,
}

/// How to reach and identify ourselves to the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub url: String,
    pub auth_token: Option<String>,
    /// `Origin` header sent with the WebSocket upgrade
    pub origin: Option<String>,
    pub client_id: String,
    pub client_version: String,
    pub platform: String,
    pub mode: String,
    pub locale: String,
    pub user_agent: String,
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub challenge_timeout_ms: u64,
    pub handshake_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:18789".into(),
            auth_token: None,
            origin: Some("http://127.0.0.1:18789".into()),
            client_id: "webchat".into(),
            client_version: env!("CARGO_PKG_VERSION").into(),
            platform: "web".into(),
            mode: "ui".into(),
            locale: "en-US".into(),
            user_agent: concat!("siteprobe/", env!("CARGO_PKG_VERSION")).into(),
            min_protocol: 3,
            max_protocol: 3,
            challenge_timeout_ms: 2_000,
            handshake_timeout_secs: 15,
            request_timeout_secs: 30,
        }
    }
}

impl GatewayConfig {
    pub fn challenge_timeout(&self) -> Duration {
        Duration::from_millis(self.challenge_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Agent invocation bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub send_timeout_secs: u64,
    pub completion_timeout_secs: u64,
    pub retry_timeout_secs: u64,
    pub history_timeout_secs: u64,
    pub history_limit: u32,
    pub session_prefix: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            send_timeout_secs: 30,
            completion_timeout_secs: 300,
            retry_timeout_secs: 180,
            history_timeout_secs: 10,
            history_limit: 5,
            session_prefix: "agent:main:probe".into(),
        }
    }
}

impl AgentConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_secs(self.completion_timeout_secs)
    }

    pub fn retry_timeout(&self) -> Duration {
        Duration::from_secs(self.retry_timeout_secs)
    }

    pub fn history_timeout(&self) -> Duration {
        Duration::from_secs(self.history_timeout_secs)
    }
}

/// Batch admission and result shaping
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum simultaneously in-flight analyses
    pub concurrency: usize,
    /// Delay before each invocation, inside the gate
    pub pacing_ms: u64,
    pub url_sample_size: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            pacing_ms: 0,
            url_sample_size: 10,
        }
    }
}

impl OrchestratorConfig {
    pub fn pacing(&self) -> Option<Duration> {
        (self.pacing_ms > 0).then(|| Duration::from_millis(self.pacing_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("output"),
        }
    }
}

impl Config {
    /// Parse a TOML document
    pub fn from_toml_str(raw: &str) -> Result<Self, ProbeError> {
        let config: Config =
            toml::from_str(raw).map_err(|e| ProbeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if given, otherwise start from defaults, then apply
    /// environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ProbeError> {
        let mut config = match path {
            Some(path) => {
                debug!(path = %path.display(), "Loading configuration");
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    ProbeError::Config(format!("cannot read {}: {e}", path.display()))
                })?;
                Self::from_toml_str(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_GATEWAY_URL).filter(|v| !v.trim().is_empty()) {
            self.gateway.url = url;
        }
        if let Some(token) = lookup(ENV_AUTH_TOKEN).filter(|v| !v.trim().is_empty()) {
            self.gateway.auth_token = Some(token);
        }
    }

    /// Reject values that would make the run meaningless
    pub fn validate(&self) -> Result<(), ProbeError> {
        url::Url::parse(&self.gateway.url)
            .map_err(|e| ProbeError::Config(format!("gateway.url: {e}")))?;
        if self.gateway.min_protocol > self.gateway.max_protocol {
            return Err(ProbeError::Config(
                "gateway.min_protocol exceeds gateway.max_protocol".into(),
            ));
        }
        if self.gateway.request_timeout_secs == 0 || self.gateway.handshake_timeout_secs == 0 {
            return Err(ProbeError::Config("gateway timeouts must be positive".into()));
        }
        if self.agent.completion_timeout_secs == 0
            || self.agent.retry_timeout_secs == 0
            || self.agent.send_timeout_secs == 0
        {
            return Err(ProbeError::Config("agent timeouts must be positive".into()));
        }
        if self.orchestrator.concurrency == 0 {
            return Err(ProbeError::Config("orchestrator.concurrency must be at least 1".into()));
        }
        if self.orchestrator.url_sample_size == 0 {
            return Err(ProbeError::Config(
                "orchestrator.url_sample_size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
