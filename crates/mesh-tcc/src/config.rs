//! Transaction client configuration
//!
//! Configuration is loaded once from a file (JSON, TOML or YAML, chosen by
//! extension) or from `MESH_TXN_*` environment variables, then shared through
//! a [`ConfigHandle`]. Each transactional call reads a single snapshot, so a
//! reload never changes settings halfway through a Begin/Try/End sequence.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;

/// How this deployment reaches the coordinator and is reached back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommMode {
    /// Plain HTTP URLs plus path suffixes.
    #[default]
    Http,
    /// Topic addressing through the mesh.
    Mesh,
}

impl CommMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommMode::Http => "http",
            CommMode::Mesh => "mesh",
        }
    }
}

impl std::fmt::Display for CommMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" | "direct" => Ok(CommMode::Http),
            "mesh" => Ok(CommMode::Mesh),
            other => Err(ConfigError::Invalid(format!("unknown comm mode: {}", other))),
        }
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Transaction client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TxnConfig {
    pub comm_mode: CommMode,

    /// Pipe-delimited coordinator address (4 fields for http, 9 for mesh).
    pub coordinator_address: String,

    /// Base URL the coordinator uses to call this deployment back.
    pub participant_base_url: String,
    pub confirm_path: String,
    pub cancel_path: String,

    /// Topics advertised for callbacks in mesh mode.
    pub confirm_event_id: String,
    pub cancel_event_id: String,

    /// Gateway that delivers topic-addressed calls.
    pub mesh_gateway_url: String,

    /// Upper bound for any single coordinator call.
    pub request_timeout_ms: u64,

    /// Reserved for this service's own work when sizing coordinator calls.
    pub max_service_consume_ms: u64,

    /// Budget given to requests that enter the mesh without one.
    pub default_timeout_budget_ms: u64,

    /// Retries the RPC client may spend on one coordinator call.
    pub rpc_max_retries: u32,

    /// Report a failed branch Try to the coordinator right away instead of
    /// waiting for its cancel sweep.
    pub try_failed_ignore_callback_cancel: bool,

    /// Treat every service in this deployment as a propagator.
    pub is_propagator: bool,
    pub propagator_services: Vec<String>,

    pub macro_service: bool,
    pub macro_service_base_url: String,
    pub local_instance_id: String,

    /// Response headers with this prefix are forwarded to second-stage
    /// callbacks and removed from the visible response.
    pub second_stage_header_prefix: String,

    /// A response header under this key marks the Try as failed.
    pub error_sentinel_header: String,

    /// Language reported to services bound for a callback.
    pub language: String,

    /// Free-form settings handed to each service when it is bound for a
    /// callback, keyed by service name.
    pub services: HashMap<String, serde_json::Value>,
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            comm_mode: CommMode::Http,
            coordinator_address: String::new(),
            participant_base_url: "http://localhost:8080".to_string(),
            confirm_path: "/v1/txn/confirm".to_string(),
            cancel_path: "/v1/txn/cancel".to_string(),
            confirm_event_id: "TXN_CONFIRM".to_string(),
            cancel_event_id: "TXN_CANCEL".to_string(),
            mesh_gateway_url: "http://localhost:18080".to_string(),
            request_timeout_ms: 10_000,
            max_service_consume_ms: 1_000,
            default_timeout_budget_ms: mesh_span::DEFAULT_TIMEOUT_BUDGET_MS,
            rpc_max_retries: 0,
            try_failed_ignore_callback_cancel: false,
            is_propagator: false,
            propagator_services: Vec::new(),
            macro_service: false,
            macro_service_base_url: String::new(),
            local_instance_id: String::new(),
            second_stage_header_prefix: "x-txn-2s-".to_string(),
            error_sentinel_header: "x-txn-marked-error".to_string(),
            language: "rust".to_string(),
            services: HashMap::new(),
        }
    }
}

impl TxnConfig {
    /// Create a new config builder
    pub fn builder() -> TxnConfigBuilder {
        TxnConfigBuilder::new()
    }

    /// Create config from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let var = |name: &str| std::env::var(format!("MESH_TXN_{}", name)).ok();
        let parsed = |name: &str, default: u64| {
            var(name).map(|v| v.parse().unwrap_or(default)).unwrap_or(default)
        };
        let flag = |name: &str, default: bool| {
            var(name).map(|v| v.parse().unwrap_or(default)).unwrap_or(default)
        };

        Self {
            comm_mode: var("COMM_MODE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.comm_mode),
            coordinator_address: var("COORDINATOR_ADDRESS").unwrap_or(defaults.coordinator_address),
            participant_base_url: var("PARTICIPANT_BASE_URL").unwrap_or(defaults.participant_base_url),
            confirm_path: var("CONFIRM_PATH").unwrap_or(defaults.confirm_path),
            cancel_path: var("CANCEL_PATH").unwrap_or(defaults.cancel_path),
            confirm_event_id: var("CONFIRM_EVENT_ID").unwrap_or(defaults.confirm_event_id),
            cancel_event_id: var("CANCEL_EVENT_ID").unwrap_or(defaults.cancel_event_id),
            mesh_gateway_url: var("MESH_GATEWAY_URL").unwrap_or(defaults.mesh_gateway_url),
            request_timeout_ms: parsed("REQUEST_TIMEOUT_MS", defaults.request_timeout_ms),
            max_service_consume_ms: parsed("MAX_SERVICE_CONSUME_MS", defaults.max_service_consume_ms),
            default_timeout_budget_ms: parsed(
                "DEFAULT_TIMEOUT_BUDGET_MS",
                defaults.default_timeout_budget_ms,
            ),
            rpc_max_retries: parsed("RPC_MAX_RETRIES", defaults.rpc_max_retries as u64) as u32,
            try_failed_ignore_callback_cancel: flag(
                "TRY_FAILED_IGNORE_CALLBACK_CANCEL",
                defaults.try_failed_ignore_callback_cancel,
            ),
            is_propagator: flag("IS_PROPAGATOR", defaults.is_propagator),
            propagator_services: var("PROPAGATOR_SERVICES")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            macro_service: flag("MACRO_SERVICE", defaults.macro_service),
            macro_service_base_url: var("MACRO_SERVICE_BASE_URL")
                .unwrap_or(defaults.macro_service_base_url),
            local_instance_id: var("LOCAL_INSTANCE_ID").unwrap_or(defaults.local_instance_id),
            second_stage_header_prefix: var("SECOND_STAGE_HEADER_PREFIX")
                .unwrap_or(defaults.second_stage_header_prefix),
            error_sentinel_header: var("ERROR_SENTINEL_HEADER")
                .unwrap_or(defaults.error_sentinel_header),
            language: defaults.language,
            services: defaults.services,
        }
    }

    /// Load from a JSON, TOML or YAML file, chosen by extension.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        let config: Self = match extension.as_str() {
            "json" => serde_json::from_str(&content)
                .map_err(|e| ConfigError::Parse(format!("JSON error: {}", e)))?,
            "toml" => toml::from_str(&content)
                .map_err(|e| ConfigError::Parse(format!("TOML error: {}", e)))?,
            "yaml" | "yml" => serde_yaml::from_str(&content)
                .map_err(|e| ConfigError::Parse(format!("YAML error: {}", e)))?,
            other => {
                return Err(ConfigError::Invalid(format!(
                    "unsupported config format: {:?}",
                    other
                )))
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Check settings that would otherwise only fail at call time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid("request_timeout_ms must be > 0".into()));
        }
        if self.macro_service && self.macro_service_base_url.is_empty() {
            return Err(ConfigError::Invalid(
                "macro_service requires macro_service_base_url".into(),
            ));
        }
        if !self.confirm_path.starts_with('/') || !self.cancel_path.starts_with('/') {
            return Err(ConfigError::Invalid("callback paths must start with '/'".into()));
        }
        if self.confirm_path == self.cancel_path {
            return Err(ConfigError::Invalid(
                "confirm_path and cancel_path must differ".into(),
            ));
        }
        if self.second_stage_header_prefix.is_empty() {
            return Err(ConfigError::Invalid(
                "second_stage_header_prefix must not be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn is_propagator_service(&self, service_name: &str) -> bool {
        self.is_propagator || self.propagator_services.iter().any(|s| s == service_name)
    }

    pub fn default_timeout_budget(&self) -> Duration {
        Duration::from_millis(self.default_timeout_budget_ms)
    }

    /// Timeout for one coordinator call given the chain's remaining budget.
    ///
    /// The service's own reserved time is subtracted from the budget unless
    /// that would leave nothing, in which case the full remaining budget is
    /// used. The result never exceeds `request_timeout_ms`.
    pub fn call_timeout(&self, remaining: Duration) -> Duration {
        let reserved = Duration::from_millis(self.max_service_consume_ms);
        let budget = remaining
            .checked_sub(reserved)
            .filter(|d| !d.is_zero())
            .unwrap_or(remaining);
        budget.min(Duration::from_millis(self.request_timeout_ms))
    }
}

/// Builder for TxnConfig
pub struct TxnConfigBuilder {
    config: TxnConfig,
}

impl TxnConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: TxnConfig::default(),
        }
    }

    pub fn comm_mode(mut self, mode: CommMode) -> Self {
        self.config.comm_mode = mode;
        self
    }

    pub fn coordinator_address(mut self, address: impl Into<String>) -> Self {
        self.config.coordinator_address = address.into();
        self
    }

    pub fn participant_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.participant_base_url = url.into();
        self
    }

    pub fn mesh_gateway_url(mut self, url: impl Into<String>) -> Self {
        self.config.mesh_gateway_url = url.into();
        self
    }

    pub fn request_timeout_ms(mut self, timeout: u64) -> Self {
        self.config.request_timeout_ms = timeout;
        self
    }

    pub fn max_service_consume_ms(mut self, reserved: u64) -> Self {
        self.config.max_service_consume_ms = reserved;
        self
    }

    pub fn try_failed_ignore_callback_cancel(mut self, enabled: bool) -> Self {
        self.config.try_failed_ignore_callback_cancel = enabled;
        self
    }

    pub fn propagator(mut self, enabled: bool) -> Self {
        self.config.is_propagator = enabled;
        self
    }

    pub fn propagator_service(mut self, service_name: impl Into<String>) -> Self {
        self.config.propagator_services.push(service_name.into());
        self
    }

    /// Route calls to the coordinator co-located with `instance_id` directly
    /// to `base_url`.
    pub fn macro_service(mut self, base_url: impl Into<String>, instance_id: impl Into<String>) -> Self {
        self.config.macro_service = true;
        self.config.macro_service_base_url = base_url.into();
        self.config.local_instance_id = instance_id.into();
        self
    }

    pub fn service_config(mut self, service_name: impl Into<String>, value: serde_json::Value) -> Self {
        self.config.services.insert(service_name.into(), value);
        self
    }

    pub fn build(self) -> TxnConfig {
        self.config
    }
}

impl Default for TxnConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared, swappable configuration snapshot.
///
/// An external reload mechanism calls [`ConfigHandle::replace`]; readers take
/// a cheap `Arc` snapshot with [`ConfigHandle::current`].
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<TxnConfig>>>,
}

impl ConfigHandle {
    pub fn new(config: TxnConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    pub fn current(&self) -> Arc<TxnConfig> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn replace(&self, config: TxnConfig) {
        *self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(config);
        tracing::info!("Transaction configuration replaced");
    }
}

impl From<TxnConfig> for ConfigHandle {
    fn from(config: TxnConfig) -> Self {
        Self::new(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = TxnConfig::default();
        assert_eq!(config.comm_mode, CommMode::Http);
        assert_eq!(config.request_timeout_ms, 10_000);
        assert!(!config.try_failed_ignore_callback_cancel);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = TxnConfig::builder()
            .comm_mode(CommMode::Mesh)
            .coordinator_address("o|w|e|u|n|i|b|j|e")
            .request_timeout_ms(500)
            .try_failed_ignore_callback_cancel(true)
            .propagator_service("gateway")
            .macro_service("http://127.0.0.1:9000", "inst-1")
            .build();

        assert_eq!(config.comm_mode, CommMode::Mesh);
        assert_eq!(config.request_timeout_ms, 500);
        assert!(config.try_failed_ignore_callback_cancel);
        assert!(config.is_propagator_service("gateway"));
        assert!(!config.is_propagator_service("orders"));
        assert!(config.macro_service);
        assert_eq!(config.local_instance_id, "inst-1");
    }

    #[test]
    fn test_call_timeout() {
        let config = TxnConfig::builder()
            .request_timeout_ms(5_000)
            .max_service_consume_ms(1_000)
            .build();

        // budget minus reserved time
        assert_eq!(config.call_timeout(Duration::from_millis(3_000)), Duration::from_millis(2_000));
        // reserved time exceeds the budget: fall back to the budget itself
        assert_eq!(config.call_timeout(Duration::from_millis(800)), Duration::from_millis(800));
        assert_eq!(config.call_timeout(Duration::from_millis(1_000)), Duration::from_millis(1_000));
        // capped by the per-call timeout
        assert_eq!(config.call_timeout(Duration::from_secs(60)), Duration::from_millis(5_000));
    }

    #[test]
    fn test_comm_mode_parse() {
        assert_eq!("MESH".parse::<CommMode>().unwrap(), CommMode::Mesh);
        assert_eq!("direct".parse::<CommMode>().unwrap(), CommMode::Http);
        assert!("carrier-pigeon".parse::<CommMode>().is_err());
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
comm_mode = "mesh"
coordinator_address = "org|ws|dev|su1|n1|i1|begin|join|end"
try_failed_ignore_callback_cancel = true
propagator_services = ["edge"]

[services.orders]
currency = "EUR"
"#
        )
        .unwrap();

        let config = TxnConfig::from_file(file.path()).unwrap();
        assert_eq!(config.comm_mode, CommMode::Mesh);
        assert!(config.try_failed_ignore_callback_cancel);
        assert_eq!(config.propagator_services, vec!["edge".to_string()]);
        assert_eq!(config.services["orders"]["currency"], "EUR");
        // untouched fields keep their defaults
        assert_eq!(config.confirm_path, "/v1/txn/confirm");
    }

    #[test]
    fn test_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "coordinator_address: \"http://dxc|/begin|/join|/end\"\nrequest_timeout_ms: 250").unwrap();

        let config = TxnConfig::from_file(file.path()).unwrap();
        assert_eq!(config.request_timeout_ms, 250);
    }

    #[test]
    fn test_from_file_rejects_invalid() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        writeln!(file, r#"{{"macro_service": true}}"#).unwrap();
        assert!(matches!(
            TxnConfig::from_file(file.path()),
            Err(ConfigError::Invalid(_))
        ));

        let file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        assert!(TxnConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_config_handle_replace() {
        let handle = ConfigHandle::new(TxnConfig::default());
        let before = handle.current();

        handle.replace(TxnConfig::builder().request_timeout_ms(42).build());

        assert_eq!(before.request_timeout_ms, 10_000);
        assert_eq!(handle.current().request_timeout_ms, 42);
    }
}
