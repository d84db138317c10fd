use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::gateway::Tuning;

/// Gateway description for the demo binary.
///
/// The library API takes direct call arguments; this is just the YAML shape
/// the binary feeds into it.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub http: Vec<HttpGateConfig>,
    #[serde(default)]
    pub tunnels: Vec<TunnelGateConfig>,
    #[serde(default)]
    pub tuning: TuningConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpGateConfig {
    pub listen: String,
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TunnelGateConfig {
    pub listen: String,
    pub upstream: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TuningConfig {
    pub max_sessions: usize,
    pub dial_timeout_secs: u64,
    pub max_idle_per_backend: usize,
    pub idle_timeout_secs: u64,
}

impl Default for TuningConfig {
    fn default() -> Self {
        let tuning = Tuning::default();
        Self {
            max_sessions: tuning.max_sessions,
            dial_timeout_secs: tuning.dial_timeout.as_secs(),
            max_idle_per_backend: tuning.max_idle_per_backend,
            idle_timeout_secs: tuning.idle_timeout.as_secs(),
        }
    }
}

impl TuningConfig {
    pub fn to_tuning(&self) -> Tuning {
        Tuning {
            max_sessions: self.max_sessions,
            dial_timeout: Duration::from_secs(self.dial_timeout_secs),
            max_idle_per_backend: self.max_idle_per_backend,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
        }
    }
}

impl Config {
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("failed to parse gateway config as YAML")
    }

    /// Loads the file named by FLOWGATE_CONFIG, default "flowgate.yaml".
    pub fn load() -> Result<Self> {
        let path =
            std::env::var("FLOWGATE_CONFIG").unwrap_or_else(|_| "flowgate.yaml".to_string());
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file {path}"))?;
        Self::from_yaml(&content)
    }
}
