//! Configuration management for diagpipe
//!
//! Loads `diagpipe.toml` with serde defaults per section, so a partial (or
//! absent) file yields a fully usable configuration. Validation happens at
//! load time: a tool should reject bad settings before any session or
//! listener is opened.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::counters::{CounterGroup, CounterPipelineSettings};
use crate::error::{ConfigError, Result};
use crate::logging::LogConfig;
use crate::proxy::{ProxyRunnerOptions, ReconnectPolicy};
use crate::transport::{ProxyEndpoint, ProxyTransportConfig};
use crate::triggers::EventCounterTriggerSettings;

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "diagpipe.toml";

/// Top-level tool configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagpipeConfig {
    /// Logging setup.
    pub logging: LogConfig,
    /// Diagnostic IPC proxy.
    pub proxy: ProxyConfig,
    /// Counter collection.
    pub counters: CountersConfig,
    /// Counter history retention.
    pub metrics: MetricsConfig,
    /// Artifact egress.
    pub egress: EgressConfig,
}

/// Proxy section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Where the target runtime connects.
    pub frontend: ProxyEndpoint,
    /// Where tooling is reached.
    pub backend: ProxyEndpoint,
    /// Seconds to wait for a runtime connection per accept.
    pub frontend_timeout_secs: u64,
    /// Seconds to wait for the back-end dial.
    pub backend_timeout_secs: u64,
    /// Terminate the proxy when no runtime connects within the timeout.
    pub auto_shutdown: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            frontend: ProxyEndpoint::Tcp {
                addr: "127.0.0.1:9400".to_string(),
            },
            backend: ProxyEndpoint::Tcp {
                addr: "127.0.0.1:9500".to_string(),
            },
            frontend_timeout_secs: 30,
            backend_timeout_secs: 10,
            auto_shutdown: false,
        }
    }
}

impl ProxyConfig {
    /// Transport-level view of this section.
    #[must_use]
    pub fn transport(&self) -> ProxyTransportConfig {
        ProxyTransportConfig {
            frontend: self.frontend.clone(),
            backend: self.backend.clone(),
            frontend_timeout: Duration::from_secs(self.frontend_timeout_secs),
            backend_timeout: Duration::from_secs(self.backend_timeout_secs),
        }
    }

    /// Runner-policy view of this section.
    #[must_use]
    pub fn runner_options(&self) -> ProxyRunnerOptions {
        ProxyRunnerOptions {
            auto_shutdown: self.auto_shutdown,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Counter collection section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CountersConfig {
    /// Providers whose counters are collected.
    pub providers: Vec<String>,
    /// Sampling interval requested from the runtime, in seconds.
    pub interval_seconds: f64,
    /// Optional trigger evaluated over the collected counters.
    pub trigger: Option<EventCounterTriggerSettings>,
}

impl Default for CountersConfig {
    fn default() -> Self {
        Self {
            providers: vec!["System.Runtime".to_string()],
            interval_seconds: 5.0,
            trigger: None,
        }
    }
}

impl CountersConfig {
    /// Pipeline-level view of this section.
    #[must_use]
    pub fn pipeline_settings(&self) -> CounterPipelineSettings {
        CounterPipelineSettings {
            groups: self
                .providers
                .iter()
                .map(|provider| CounterGroup::all(provider.clone()))
                .collect(),
            counter_interval_seconds: self.interval_seconds,
            trigger: self.trigger.clone(),
        }
    }
}

/// Metrics section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Samples retained per metric key.
    pub max_history: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { max_history: 3 }
    }
}

/// Egress section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EgressConfig {
    /// Directory artifacts are written into.
    pub directory: PathBuf,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("artifacts"),
        }
    }
}

impl DiagpipeConfig {
    /// Load from `path`, filling omitted sections with defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let config: Self = toml::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(config)
    }

    /// Load `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate cross-field settings, reporting field-level failures.
    ///
    /// Invalid trigger settings are rejected here, before any session is
    /// opened.
    pub fn validate(&self) -> Result<()> {
        if let Some(trigger) = &self.counters.trigger {
            trigger.validate()?;
        }
        Ok(())
    }
}
