//! Configuration data structures for registry-gate.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files and
//! to `REGATE__*` environment variables. Every section has defaults so a
//! minimal config only needs `target.host`.
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::error::ErrorFormat;

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// How gateway-generated errors are rendered
    #[serde(default)]
    pub error_format: ErrorFormat,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub target: TargetConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Absent, or without a `uuid`, disables health pings
    #[serde(default)]
    pub healthchecks: Option<HealthchecksConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            error_format: ErrorFormat::default(),
            log: LogConfig::default(),
            target: TargetConfig::default(),
            cache: CacheConfig::default(),
            auth: AuthConfig::default(),
            metrics: MetricsConfig::default(),
            healthchecks: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LogConfig {
    /// `tracing` filter directive, e.g. `info` or `registry_gate=debug`
    pub level: String,
    /// JSON lines instead of human readable output
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
        }
    }
}

/// The single upstream registry.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TargetConfig {
    pub scheme: String,
    /// Host with optional port, without scheme
    pub host: String,
    pub connect_timeout_secs: u64,
    /// Upper bound for receiving the upstream response head
    pub timeout_secs: u64,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            scheme: "https".to_string(),
            host: String::new(),
            connect_timeout_secs: 10,
            timeout_secs: 300,
        }
    }
}

impl TargetConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    /// Maximum number of cached responses
    pub size: u64,
    /// Responses with larger bodies are passed through uncached
    pub max_entry_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 3600,
            size: 1000,
            max_entry_bytes: 4 * 1024 * 1024,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AuthConfig {
    /// Lifetime of positive and negative verdicts
    pub ttl_secs: u64,
    pub positive_size: u64,
    pub negative_size: u64,
    pub allowed: AllowedConfig,
    pub trusted: TrustedConfig,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            positive_size: 1000,
            negative_size: 10_000,
            allowed: AllowedConfig::default(),
            trusted: TrustedConfig::default(),
        }
    }
}

impl AuthConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Read access.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AllowedConfig {
    /// IPs that skip every read check
    pub ips: Vec<String>,
    /// Accepted user agent product names, e.g. `docker`, `containerd`
    pub uas: Vec<String>,
    pub provider: Option<ProviderConfig>,
}

/// Write access.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct TrustedConfig {
    pub ips: Vec<String>,
}

fn default_provider_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProviderConfig {
    /// URL template, the client IP replaces `{ip}` or `%s`
    pub url: String,
    #[serde(default)]
    pub login: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_provider_timeout_secs")]
    pub timeout_secs: u64,
}

impl ProviderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Access to `/metrics`.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct MetricsConfig {
    pub login: Option<String>,
    pub password: Option<String>,
    pub ips: Vec<String>,
}

fn default_healthchecks_url() -> String {
    "https://hc-ping.com".to_string()
}

fn default_healthchecks_interval_secs() -> u64 {
    60
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HealthchecksConfig {
    #[serde(default = "default_healthchecks_url")]
    pub url: String,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default = "default_healthchecks_interval_secs")]
    pub interval_secs: u64,
}

impl Default for HealthchecksConfig {
    fn default() -> Self {
        Self {
            url: default_healthchecks_url(),
            uuid: None,
            interval_secs: default_healthchecks_interval_secs(),
        }
    }
}

impl HealthchecksConfig {
    /// The check UUID, when pings are enabled.
    pub fn enabled_uuid(&self) -> Option<&str> {
        self.uuid.as_deref().map(str::trim).filter(|uuid| !uuid.is_empty())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}
