//! Configuration management for Tollgate.
//!
//! Configuration is layered: built-in defaults, then an optional YAML file,
//! then `TOLLGATE__*` environment variables (`__` separates nesting, so
//! `TOLLGATE__STORE__URL` sets `store.url`).

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::ratelimit::{
    default_rules, AdmissionGate, Bypass, Clock, CounterStore, FailureMode, GateOptions,
    IpNetwork, PolicySelector, RuleConfig, TierTableConfig,
};

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TollgateConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub bypass: BypassConfig,

    /// Role tiers for `tiered` rules
    #[serde(default)]
    pub tiers: TierTableConfig,

    /// Rules in evaluation order
    #[serde(default = "default_rules")]
    pub rules: Vec<RuleConfig>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for TollgateConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            store: StoreConfig::default(),
            bypass: BypassConfig::default(),
            tiers: TierTableConfig::default(),
            rules: default_rules(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// gRPC server address
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: SocketAddr,

    /// How long an unreleased lease may live before its slots are reclaimed
    #[serde(default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,

    /// How often expired leases are swept
    #[serde(default = "default_lease_reap_interval_ms")]
    pub lease_reap_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: default_grpc_addr(),
            lease_ttl_ms: default_lease_ttl_ms(),
            lease_reap_interval_ms: default_lease_reap_interval_ms(),
        }
    }
}

fn default_grpc_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8081))
}

fn default_lease_ttl_ms() -> u64 {
    300_000
}

fn default_lease_reap_interval_ms() -> u64 {
    5_000
}

/// Where counters live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local; counters are not shared between replicas.
    #[default]
    Memory,
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL, required for the redis backend
    #[serde(default)]
    pub url: Option<String>,

    /// Prepended to every counter key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Upper bound on a single store call
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub failure_mode: FailureMode,

    /// How often the memory backend drops expired counters
    #[serde(default = "default_purge_interval_ms")]
    pub purge_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: None,
            key_prefix: default_key_prefix(),
            timeout_ms: default_timeout_ms(),
            failure_mode: FailureMode::default(),
            purge_interval_ms: default_purge_interval_ms(),
        }
    }
}

fn default_key_prefix() -> String {
    "tollgate:".to_string()
}

fn default_timeout_ms() -> u64 {
    250
}

fn default_purge_interval_ms() -> u64 {
    60_000
}

/// Requests that skip rate limiting entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BypassConfig {
    /// Exact paths
    #[serde(default = "default_skip_paths")]
    pub skip_paths: Vec<String>,

    /// CIDR blocks or single addresses
    #[serde(default = "default_trusted_networks")]
    pub trusted_networks: Vec<String>,
}

impl Default for BypassConfig {
    fn default() -> Self {
        Self {
            skip_paths: default_skip_paths(),
            trusted_networks: default_trusted_networks(),
        }
    }
}

fn default_skip_paths() -> Vec<String> {
    ["/health", "/status", "/metrics"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_trusted_networks() -> Vec<String> {
    ["127.0.0.1", "::1", "10.0.0.0/8", "192.168.0.0/16"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration. `RUST_LOG` takes precedence over `level`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TollgateConfig {
    /// Load configuration from an optional YAML file overlaid with
    /// environment variables, then validate it.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml).required(true));
        }
        let config: TollgateConfig = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: TollgateConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Check everything that would otherwise fail later at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.lease_ttl_ms == 0 {
            return Err(ConfigError::invalid("server.lease_ttl_ms", "must be greater than zero"));
        }
        if self.server.lease_reap_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "server.lease_reap_interval_ms",
                "must be greater than zero",
            ));
        }
        if self.store.timeout_ms == 0 {
            return Err(ConfigError::invalid("store.timeout_ms", "must be greater than zero"));
        }
        if self.store.backend == StoreBackend::Redis {
            if cfg!(not(feature = "redis")) {
                return Err(ConfigError::invalid(
                    "store.backend",
                    "redis support was not compiled in",
                ));
            }
            if self.store.url.as_deref().map_or(true, |u| u.trim().is_empty()) {
                return Err(ConfigError::invalid("store.url", "required for the redis backend"));
            }
        }
        self.bypass()?;
        self.selector()?;
        Ok(())
    }

    pub fn bypass(&self) -> Result<Bypass, ConfigError> {
        let networks = self
            .bypass
            .trusted_networks
            .iter()
            .map(|n| n.parse::<IpNetwork>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Bypass::new(self.bypass.skip_paths.iter().cloned(), networks))
    }

    pub fn selector(&self) -> Result<PolicySelector, ConfigError> {
        PolicySelector::from_config(&self.rules, &self.tiers)
    }

    pub fn gate_options(&self) -> GateOptions {
        GateOptions {
            failure_mode: self.store.failure_mode,
            store_timeout: Duration::from_millis(self.store.timeout_ms),
            ..GateOptions::default()
        }
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.server.lease_ttl_ms)
    }

    pub fn lease_reap_interval(&self) -> Duration {
        Duration::from_millis(self.server.lease_reap_interval_ms)
    }
}

impl AdmissionGate {
    /// Build a gate from validated configuration.
    pub fn from_config(
        config: &TollgateConfig,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(AdmissionGate::new(
            store,
            clock,
            config.bypass()?,
            config.selector()?,
            config.gate_options(),
        ))
    }

    /// Apply a reloaded configuration. The store and failure handling are
    /// fixed for the life of the gate; only bypass and rules change.
    pub fn reload_from(&self, config: &TollgateConfig) -> Result<(), ConfigError> {
        let bypass = config.bypass()?;
        let selector = config.selector()?;
        self.reload(bypass, selector);
        Ok(())
    }
}
