use alloy::primitives::Address;
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid address in {field}: {value}")]
    InvalidAddress { field: &'static str, value: String },
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    /// HTTP or WebSocket JSON-RPC endpoint - env RPC_URL
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,
    /// Factory emitting `RentalDeployed` - env LEGACY_FACTORY_ADDRESS
    #[serde(default)]
    pub legacy_factory: Option<String>,
    /// Clone factory emitting per-template creation events - env GENERIC_FACTORY_ADDRESS
    #[serde(default)]
    pub generic_factory: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Deployment poll interval.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Full reconciliation sweep interval.
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
    /// Blocks rescanned behind the head on startup.
    #[serde(default = "default_lookback")]
    pub lookback_blocks: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    /// Run the push listener for the legacy factory.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// How often the RPC-backed subscription polls for new logs.
    #[serde(default = "default_subscription_poll_ms")]
    pub subscription_poll_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    #[serde(alias = "redis")]
    Valkey,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,
    /// env REDIS_URL
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// env API_BIND_ADDR
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_rpc_url() -> String {
    "https://sepolia.base.org".to_string()
}
fn default_poll_interval() -> u64 {
    10
}
fn default_reconcile_interval() -> u64 {
    300
}
fn default_lookback() -> u64 {
    100
}
fn default_true() -> bool {
    true
}
fn default_base_delay_ms() -> u64 {
    5_000
}
fn default_max_attempts() -> u32 {
    5
}
fn default_subscription_poll_ms() -> u64 {
    4_000
}
fn default_backend() -> StoreBackend {
    StoreBackend::Memory
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_prefix() -> String {
    "factory-sync".to_string()
}
fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_url: default_rpc_url(),
            legacy_factory: None,
            generic_factory: None,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            reconcile_interval_secs: default_reconcile_interval(),
            lookback_blocks: default_lookback(),
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay_ms: default_base_delay_ms(),
            max_attempts: default_max_attempts(),
            subscription_poll_ms: default_subscription_poll_ms(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            url: default_redis_url(),
            prefix: default_prefix(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Config {
    /// Load config from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment variables (no file needed).
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("RPC_URL") {
            self.chain.rpc_url = url;
        }
        if let Ok(addr) = std::env::var("LEGACY_FACTORY_ADDRESS") {
            self.chain.legacy_factory = Some(addr);
        }
        if let Ok(addr) = std::env::var("GENERIC_FACTORY_ADDRESS") {
            self.chain.generic_factory = Some(addr);
        }
        if let Ok(url) = std::env::var("REDIS_URL") {
            self.store.url = url;
            self.store.backend = StoreBackend::Valkey;
        }
        if let Ok(bind) = std::env::var("API_BIND_ADDR") {
            self.api.bind_addr = bind;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.legacy_factory()?;
        self.generic_factory()?;
        if self.sync.poll_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sync.poll_interval_secs",
                reason: "must be at least 1".into(),
            });
        }
        if self.sync.reconcile_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sync.reconcile_interval_secs",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    pub fn legacy_factory(&self) -> Result<Option<Address>, ConfigError> {
        parse_optional_address("chain.legacy_factory", self.chain.legacy_factory.as_deref())
    }

    pub fn generic_factory(&self) -> Result<Option<Address>, ConfigError> {
        parse_optional_address("chain.generic_factory", self.chain.generic_factory.as_deref())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.sync.poll_interval_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.sync.reconcile_interval_secs)
    }
}

/// Empty strings count as "not configured".
fn parse_optional_address(field: &'static str, value: Option<&str>) -> Result<Option<Address>, ConfigError> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(v) => Address::from_str(v)
            .map(Some)
            .map_err(|_| ConfigError::InvalidAddress {
                field,
                value: v.to_string(),
            }),
    }
}
