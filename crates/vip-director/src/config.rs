//! Daemon configuration.
//!
//! Loaded from a TOML file, with the node identity overridable from the
//! `NODE_NAME` environment variable (the usual downward-API injection when
//! running as a DaemonSet).

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::watcher::SyncSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("node_name is required (set it in the config file or via NODE_NAME)")]
    MissingNodeName,

    #[error("interface is required but not provided")]
    MissingInterface,

    #[error("Invalid colocation mode: '{0}'")]
    InvalidColocationMode(String),

    #[error("watcher.poll_interval_secs must be greater than zero")]
    ZeroPollInterval,
}

/// Whether this director shares its node with a real-server agent, and if
/// so which component owns iptables there.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColocationMode {
    #[default]
    Disabled,
    Iptables,
    Ipvs,
}

impl std::str::FromStr for ColocationMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "disabled" | "" => Ok(Self::Disabled),
            "iptables" => Ok(Self::Iptables),
            "ipvs" => Ok(Self::Ipvs),
            other => Err(ConfigError::InvalidColocationMode(other.to_string())),
        }
    }
}

impl std::fmt::Display for ColocationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => write!(f, "disabled"),
            Self::Iptables => write!(f, "iptables"),
            Self::Ipvs => write!(f, "ipvs"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectorConfig {
    /// Name of the local node; matched against observed node inventory.
    #[serde(default)]
    pub node_name: String,

    /// Interface VIPs are bound to.
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Label attached to reconfigure metrics, distinguishing configs when
    /// several directors report to one Prometheus.
    #[serde(default = "default_config_key")]
    pub config_key: String,

    #[serde(default)]
    pub colocation_mode: ColocationMode,

    /// Tear kernel state down when the director stops.
    #[serde(default)]
    pub cleanup_on_stop: bool,

    /// Reserved. The forced reconfigure cadence currently runs
    /// unconditionally; this flag is accepted but not consulted.
    #[serde(default)]
    pub forced_reconfigure: bool,

    #[serde(default)]
    pub watcher: WatcherConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatcherConfig {
    #[serde(default = "default_configmap_namespace")]
    pub configmap_namespace: String,

    #[serde(default = "default_configmap_name")]
    pub configmap_name: String,

    #[serde(default = "default_configmap_key")]
    pub configmap_key: String,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Port for the /healthz and /readyz probe server. 0 disables it.
    #[serde(default = "default_health_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Listen address for the Prometheus /metrics endpoint. Unset disables
    /// the exporter (metrics macros become no-ops).
    #[serde(default)]
    pub listen_address: Option<SocketAddr>,
}

fn default_interface() -> String {
    "eth0".to_string()
}

fn default_config_key() -> String {
    "default".to_string()
}

fn default_configmap_namespace() -> String {
    "kube-system".to_string()
}

fn default_configmap_name() -> String {
    "vip-director-config".to_string()
}

fn default_configmap_key() -> String {
    "config.json".to_string()
}

fn default_poll_interval_secs() -> u64 {
    3
}

fn default_health_port() -> u16 {
    8081
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            configmap_namespace: default_configmap_namespace(),
            configmap_name: default_configmap_name(),
            configmap_key: default_configmap_key(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            port: default_health_port(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            listen_address: None,
        }
    }
}

impl Default for DirectorConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            interface: default_interface(),
            config_key: default_config_key(),
            colocation_mode: ColocationMode::Disabled,
            cleanup_on_stop: false,
            forced_reconfigure: false,
            watcher: WatcherConfig::default(),
            health: HealthConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl DirectorConfig {
    /// Load from a TOML file, apply environment overrides, validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&raw)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Fill the node identity from `NODE_NAME` when the file leaves it empty.
    pub fn apply_env(&mut self) {
        if self.node_name.is_empty() {
            match std::env::var("NODE_NAME") {
                Ok(name) if !name.is_empty() => self.node_name = name,
                Ok(_) | Err(_) => {}
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_name.is_empty() {
            return Err(ConfigError::MissingNodeName);
        }
        if self.interface.is_empty() {
            return Err(ConfigError::MissingInterface);
        }
        if self.watcher.poll_interval_secs == 0 {
            return Err(ConfigError::ZeroPollInterval);
        }
        if self.forced_reconfigure {
            warn!("forced_reconfigure is reserved and currently has no effect");
        }
        Ok(())
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            configmap_namespace: self.watcher.configmap_namespace.clone(),
            configmap_name: self.watcher.configmap_name.clone(),
            configmap_key: self.watcher.configmap_key.clone(),
            poll_interval: Duration::from_secs(self.watcher.poll_interval_secs),
        }
    }
}
