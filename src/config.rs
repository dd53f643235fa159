//! Configuration management for Floodgate.
//!
//! Configuration is layered: built-in defaults, then an optional YAML file,
//! then `FLOODGATE_*` environment variables. Nested keys are separated by a
//! double underscore, e.g. `FLOODGATE_STORE__URL` or
//! `FLOODGATE_RATE_LIMITING__LIMITS__ANONYMOUS__PER_SECOND`.

use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FloodgateError, Result};
use crate::ratelimit::{Allowlist, ProfileSet};
use crate::transport::ClientIpResolver;

/// Main configuration for the Floodgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FloodgateConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub bans: BanConfig,
    #[serde(default)]
    pub degradation: DegradationConfig,
    #[serde(default)]
    pub allowlist: AllowlistConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub mesh: MeshConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// gRPC admission service address
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: SocketAddr,

    /// Admin HTTP address (health, metrics, bans)
    #[serde(default = "default_admin_addr")]
    pub admin_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: default_grpc_addr(),
            admin_addr: default_admin_addr(),
        }
    }
}

fn default_grpc_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8081))
}

fn default_admin_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
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

/// What to do when the counter store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Admit the request and count the error
    #[default]
    Open,
    /// Reject the request with a distinct error code
    Closed,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Master switch; when off every request is admitted
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub failure_policy: FailurePolicy,

    #[serde(default)]
    pub limits: ProfileSet,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_policy: FailurePolicy::default(),
            limits: ProfileSet::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
    Mesh,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Connection string for the redis backend
    #[serde(default)]
    pub url: Option<String>,

    /// Upper bound on a single store round-trip
    #[serde(default = "default_store_timeout")]
    pub timeout_ms: u64,

    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: None,
            timeout_ms: default_store_timeout(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_store_timeout() -> u64 {
    10
}

fn default_key_prefix() -> String {
    "floodgate".to_string()
}

/// Automatic ban configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanConfig {
    /// Record violations and ban automatically
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Violations tolerated per violation window
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u64,

    #[serde(default = "default_violation_window")]
    pub violation_window_secs: u64,

    #[serde(default = "default_ban_duration")]
    pub ban_duration_secs: u64,

    /// How often the banned-identifier gauge is refreshed
    #[serde(default = "default_ban_gauge_interval")]
    pub gauge_interval_secs: u64,
}

impl Default for BanConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: default_max_attempts(),
            violation_window_secs: default_violation_window(),
            ban_duration_secs: default_ban_duration(),
            gauge_interval_secs: default_ban_gauge_interval(),
        }
    }
}

fn default_max_attempts() -> u64 {
    100
}

fn default_violation_window() -> u64 {
    60
}

fn default_ban_duration() -> u64 {
    3600
}

fn default_ban_gauge_interval() -> u64 {
    15
}

/// Load-based degradation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DegradationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_sample_interval")]
    pub sample_interval_ms: u64,

    /// Path patterns exempt from degradation below the critical band
    #[serde(default)]
    pub priority_endpoints: Vec<String>,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_interval_ms: default_sample_interval(),
            priority_endpoints: Vec::new(),
        }
    }
}

fn default_sample_interval() -> u64 {
    5000
}

/// Identifiers and networks that bypass limits and bans.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllowlistConfig {
    /// CIDR ranges or bare addresses
    #[serde(default)]
    pub networks: Vec<String>,

    /// Identifier strings such as `user:ops-bot`
    #[serde(default)]
    pub identifiers: Vec<String>,
}

/// Transport adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Proxies whose forwarding headers are trusted
    #[serde(default)]
    pub trusted_proxies: Vec<String>,

    /// Header carrying the authenticated user set by a trusted gateway
    #[serde(default = "default_user_header")]
    pub user_header: String,

    /// HTTP paths that bypass the limiter
    #[serde(default = "default_skip_paths")]
    pub skip_paths: Vec<String>,

    /// gRPC method paths that bypass the limiter
    #[serde(default = "default_skip_methods")]
    pub skip_methods: Vec<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            trusted_proxies: Vec::new(),
            user_header: default_user_header(),
            skip_paths: default_skip_paths(),
            skip_methods: default_skip_methods(),
        }
    }
}

fn default_user_header() -> String {
    "x-authenticated-user".to_string()
}

fn default_skip_paths() -> Vec<String> {
    vec!["/healthz".to_string(), "/metrics".to_string()]
}

fn default_skip_methods() -> Vec<String> {
    vec![
        "/grpc.health.v1.Health/*".to_string(),
        "/floodgate.admission.v1.AdmissionService/Check".to_string(),
    ]
}

/// Gossip mesh configuration, used by the mesh store backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Defaults to a random UUID
    #[serde(default)]
    pub node_id: Option<String>,

    #[serde(default = "default_gossip_addr")]
    pub listen_addr: SocketAddr,

    /// Defaults to the listen address
    #[serde(default)]
    pub advertise_addr: Option<SocketAddr>,

    #[serde(default)]
    pub seed_nodes: Vec<String>,

    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,

    #[serde(default = "default_gossip_interval")]
    pub gossip_interval_ms: u64,

    #[serde(default = "default_gc_interval")]
    pub gc_interval_secs: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            node_id: None,
            listen_addr: default_gossip_addr(),
            advertise_addr: None,
            seed_nodes: Vec::new(),
            cluster_id: default_cluster_id(),
            gossip_interval_ms: default_gossip_interval(),
            gc_interval_secs: default_gc_interval(),
        }
    }
}

fn default_gossip_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7946))
}

fn default_cluster_id() -> String {
    "floodgate".to_string()
}

fn default_gossip_interval() -> u64 {
    100
}

fn default_gc_interval() -> u64 {
    30
}

impl MeshConfig {
    pub fn cluster_config(&self) -> crate::mesh::ClusterConfig {
        let defaults = crate::mesh::ClusterConfig::default();
        crate::mesh::ClusterConfig {
            node_id: self.node_id.clone().unwrap_or(defaults.node_id),
            listen_addr: self.listen_addr,
            advertise_addr: self.advertise_addr.unwrap_or(self.listen_addr),
            seed_nodes: self.seed_nodes.clone(),
            cluster_id: self.cluster_id.clone(),
            gossip_interval: std::time::Duration::from_millis(self.gossip_interval_ms),
            dead_node_grace_period: defaults.dead_node_grace_period,
        }
    }
}

/// Keys whose environment values are comma-separated lists.
const LIST_KEYS: &[&str] = &[
    "allowlist.networks",
    "allowlist.identifiers",
    "degradation.priority_endpoints",
    "transport.trusted_proxies",
    "transport.skip_paths",
    "transport.skip_methods",
    "mesh.seed_nodes",
];

impl FloodgateConfig {
    /// Load configuration from an optional YAML file and `FLOODGATE_*`
    /// environment variables, e.g. `FLOODGATE_STORE__URL`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Like [`load`](Self::load), reading variables from `env` instead of the
    /// process environment when given.
    fn load_with_env(path: Option<&Path>, env: Option<config::Map<String, String>>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }

        let mut environment = config::Environment::with_prefix("FLOODGATE")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .source(env);
        for key in LIST_KEYS {
            environment = environment.with_list_parse_key(key);
        }

        let config: FloodgateConfig = builder.add_source(environment).build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: FloodgateConfig =
            serde_yaml::from_str(yaml).map_err(|e| FloodgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.store.timeout_ms == 0 {
            return Err(FloodgateError::Config("store.timeout_ms must be positive".into()));
        }
        if self.store.backend == StoreBackend::Redis && self.store.url.is_none() {
            return Err(FloodgateError::Config(
                "store.url is required for the redis backend".into(),
            ));
        }
        if self.store.backend == StoreBackend::Mesh && !self.mesh.enabled {
            return Err(FloodgateError::Config(
                "the mesh backend requires mesh.enabled".into(),
            ));
        }
        if self.bans.max_attempts == 0 || self.bans.violation_window_secs == 0 {
            return Err(FloodgateError::Config(
                "bans.max_attempts and bans.violation_window_secs must be positive".into(),
            ));
        }
        if self.degradation.sample_interval_ms == 0 {
            return Err(FloodgateError::Config(
                "degradation.sample_interval_ms must be positive".into(),
            ));
        }

        let limits = &self.rate_limiting.limits;
        let profiles = limits
            .global
            .iter()
            .chain([&limits.anonymous, &limits.authenticated])
            .chain(limits.endpoints.iter().map(|e| &e.profile));
        for profile in profiles {
            if profile.windows().any(|w| profile.limit(w) == Some(0)) {
                return Err(FloodgateError::Config(
                    "configured limits must be positive; omit a window to leave it unlimited"
                        .into(),
                ));
            }
        }
        if limits
            .endpoints
            .iter()
            .any(|e| e.pattern.is_empty() || e.pattern.contains('|'))
        {
            return Err(FloodgateError::Config(
                "endpoint patterns must be non-empty and must not contain '|'".into(),
            ));
        }

        Allowlist::from_config(&self.allowlist)?;
        ClientIpResolver::from_config(&self.transport)?;
        Ok(())
    }
}
