//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{ResetMode, Tier};

/// Prefix for environment variable overrides, e.g. `TURNSTILE__SERVER__LISTEN_ADDR`.
const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub limiting: LimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitingConfig {
    /// Seconds between eviction sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Upper bound on tracked identities; 0 disables the bound
    #[serde(default = "default_max_tracked_keys")]
    pub max_tracked_keys: usize,

    /// How the reset deadline advertised to clients is computed
    #[serde(default)]
    pub reset_mode: ResetMode,

    /// Path prefix stripped before route rules are matched
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Headers consulted, in order, for the client address; empty trusts only the peer
    #[serde(default)]
    pub trusted_proxy_headers: Vec<String>,

    /// Per-tier overrides of the built-in policies
    #[serde(default)]
    pub policies: PolicyOverrides,

    /// Replacement route rule table; the built-in table is used when absent
    #[serde(default)]
    pub rules: Option<Vec<RouteRuleConfig>>,
}

impl Default for LimitingConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            max_tracked_keys: default_max_tracked_keys(),
            reset_mode: ResetMode::default(),
            namespace: default_namespace(),
            trusted_proxy_headers: Vec::new(),
            policies: PolicyOverrides::default(),
            rules: None,
        }
    }
}

impl LimitingConfig {
    /// The sweep interval as a duration.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_max_tracked_keys() -> usize {
    100_000
}

fn default_namespace() -> String {
    "/api".to_string()
}

/// Optional replacement values for one tier's policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyOverride {
    /// Window length in seconds
    #[serde(default)]
    pub window_secs: Option<u64>,
    /// Requests allowed per window
    #[serde(default)]
    pub max_requests: Option<u64>,
    /// Denial message
    #[serde(default)]
    pub message: Option<String>,
}

/// Policy overrides keyed by tier.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyOverrides {
    #[serde(default)]
    pub default: Option<PolicyOverride>,
    #[serde(default)]
    pub auth: Option<PolicyOverride>,
    #[serde(default)]
    pub financial: Option<PolicyOverride>,
    #[serde(default)]
    pub medical: Option<PolicyOverride>,
    #[serde(default)]
    pub read: Option<PolicyOverride>,
    #[serde(default)]
    pub admin: Option<PolicyOverride>,
}

impl PolicyOverrides {
    /// The override for a tier, if one is configured.
    pub fn get(&self, tier: Tier) -> Option<&PolicyOverride> {
        match tier {
            Tier::Default => self.default.as_ref(),
            Tier::Auth => self.auth.as_ref(),
            Tier::Financial => self.financial.as_ref(),
            Tier::Medical => self.medical.as_ref(),
            Tier::Read => self.read.as_ref(),
            Tier::Admin => self.admin.as_ref(),
        }
    }
}

/// A route rule as written in configuration.
///
/// Exactly one of `prefix`, `segment` or `contains` must be set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRuleConfig {
    /// Tier selected when the rule matches
    pub tier: Tier,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub segment: Option<String>,
    #[serde(default)]
    pub contains: Option<String>,
}

impl TurnstileConfig {
    /// Load configuration from an optional YAML file, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Yaml),
            );
        }

        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TurnstileError::Config(e.to_string()))
    }

    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse configuration: {}", e)))
    }
}
