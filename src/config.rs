use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::budget::SpendPolicy;

// ---------------------------------------------------------------------------
// Environment override tracking
// ---------------------------------------------------------------------------

/// Tracks which configuration settings are overridden by environment variables.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    overrides: HashMap<String, String>,
}

impl EnvOverrides {
    /// Get all overrides as a map of setting key -> env var name.
    pub fn all(&self) -> &HashMap<String, String> {
        &self.overrides
    }

    fn record(&mut self, key: &str, env_var: &str) {
        self.overrides.insert(key.to_string(), env_var.to_string());
    }
}

// ---------------------------------------------------------------------------
// Main configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Env var overrides are not serialized to TOML.
    #[serde(skip)]
    pub env_overrides: EnvOverrides,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Largest request body accepted on the completions route.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// How long open responses may run on after a shutdown signal.
    #[serde(default = "default_server_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_body_bytes: default_max_body_bytes(),
            shutdown_timeout_secs: default_server_shutdown_timeout_secs(),
        }
    }
}

impl ServerConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// Full URL of the upstream chat completions endpoint.
    #[serde(default = "default_upstream_url")]
    pub url: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Longest single event-stream record the relay will buffer.
    #[serde(default = "default_max_record_bytes")]
    pub max_record_bytes: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            connect_timeout_secs: default_connect_timeout_secs(),
            max_record_bytes: default_max_record_bytes(),
        }
    }
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LedgerBackend {
    #[default]
    Memory,
    Redis,
}

impl std::fmt::Display for LedgerBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Redis => write!(f, "redis"),
        }
    }
}

impl FromStr for LedgerBackend {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" | "valkey" => Ok(Self::Redis),
            _ => Err(format!("Unknown ledger backend: {s}")),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LedgerConfig {
    #[serde(default)]
    pub backend: LedgerBackend,
    #[serde(default)]
    pub redis: RedisLedgerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisLedgerConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// Keys are `{key_prefix}{token}:usage`.
    #[serde(default = "default_redis_key_prefix")]
    pub key_prefix: String,
    /// Bound on every store round trip, including the initial connect.
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for RedisLedgerConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_redis_key_prefix(),
            timeout_ms: default_redis_timeout_ms(),
        }
    }
}

impl RedisLedgerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Spend limit and cost model, in micro-dollars.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BudgetConfig {
    #[serde(default = "default_spend_limit_micros")]
    pub spend_limit_micros: i64,
    #[serde(default = "default_cost_per_token_micros")]
    pub cost_per_token_micros: i64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            spend_limit_micros: default_spend_limit_micros(),
            cost_per_token_micros: default_cost_per_token_micros(),
        }
    }
}

impl BudgetConfig {
    pub fn policy(&self) -> SpendPolicy {
        SpendPolicy::new(self.spend_limit_micros, self.cost_per_token_micros)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatcherConfig {
    /// Usage events queued beyond this are dropped.
    #[serde(default = "default_dispatcher_capacity")]
    pub capacity: usize,
    /// How long shutdown waits for queued usage to reach the ledger.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            capacity: default_dispatcher_capacity(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl DispatcherConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Default value functions
// ---------------------------------------------------------------------------

const fn default_port() -> u16 {
    8080
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
const fn default_max_body_bytes() -> usize {
    2 * 1024 * 1024
}
const fn default_server_shutdown_timeout_secs() -> u64 {
    5
}
fn default_upstream_url() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}
const fn default_connect_timeout_secs() -> u64 {
    10
}
const fn default_max_record_bytes() -> usize {
    1024 * 1024
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_redis_key_prefix() -> String {
    "apikey:".to_string()
}
const fn default_redis_timeout_ms() -> u64 {
    500
}
const fn default_spend_limit_micros() -> i64 {
    SpendPolicy::DEFAULT_SPEND_LIMIT
}
const fn default_cost_per_token_micros() -> i64 {
    SpendPolicy::DEFAULT_COST_PER_TOKEN
}
const fn default_dispatcher_capacity() -> usize {
    crate::budget::dispatcher::DEFAULT_CAPACITY
}
const fn default_shutdown_timeout_secs() -> u64 {
    5
}
fn default_log_level() -> String {
    "info".to_string()
}

// ---------------------------------------------------------------------------
// Config loading, env overrides, and validation
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a TOML file, then apply environment variable
    /// overrides. Any setting prefixed with `AURA_` takes precedence over the
    /// file value and is tracked in `env_overrides`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            config
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path.display());
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Reject settings the gateway cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.budget.spend_limit_micros <= 0 {
            anyhow::bail!(
                "budget.spend_limit_micros must be positive, got {}",
                self.budget.spend_limit_micros
            );
        }
        if self.budget.cost_per_token_micros <= 0 {
            anyhow::bail!(
                "budget.cost_per_token_micros must be positive, got {}",
                self.budget.cost_per_token_micros
            );
        }
        if self.dispatcher.capacity == 0 {
            anyhow::bail!("dispatcher.capacity must be at least 1");
        }
        if self.upstream.max_record_bytes == 0 {
            anyhow::bail!("upstream.max_record_bytes must be at least 1");
        }
        let url = url::Url::parse(&self.upstream.url)
            .map_err(|e| anyhow::anyhow!("upstream.url {:?} is invalid: {e}", self.upstream.url))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("upstream.url must be http or https, got {}", url.scheme());
        }
        Ok(())
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Every setting has a corresponding `AURA_*` env var. When set,
    /// the env var value replaces the file/default value and the setting key is
    /// recorded in `env_overrides`.
    fn apply_env_overrides(&mut self) {
        let mut ov = EnvOverrides::default();

        // -- Helpers (macros for concise per-field overrides) --

        macro_rules! env_str {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    $field = val;
                    ov.record($key, $env);
                }
            };
        }
        macro_rules! env_bool {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    $field = matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
                    ov.record($key, $env);
                }
            };
        }
        macro_rules! env_parse {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    if let Ok(parsed) = val.parse() {
                        $field = parsed;
                        ov.record($key, $env);
                    } else {
                        tracing::warn!(env = $env, value = %val, "Ignoring unparsable env override");
                    }
                }
            };
        }

        // -- Server --
        env_str!("server.host", "AURA_SERVER_HOST", self.server.host);
        env_parse!("server.port", "AURA_SERVER_PORT", self.server.port);
        env_parse!(
            "server.max_body_bytes",
            "AURA_SERVER_MAX_BODY_BYTES",
            self.server.max_body_bytes
        );
        env_parse!(
            "server.shutdown_timeout_secs",
            "AURA_SERVER_SHUTDOWN_TIMEOUT_SECS",
            self.server.shutdown_timeout_secs
        );

        // -- Upstream --
        env_str!("upstream.url", "AURA_UPSTREAM_URL", self.upstream.url);
        env_parse!(
            "upstream.connect_timeout_secs",
            "AURA_UPSTREAM_CONNECT_TIMEOUT_SECS",
            self.upstream.connect_timeout_secs
        );
        env_parse!(
            "upstream.max_record_bytes",
            "AURA_UPSTREAM_MAX_RECORD_BYTES",
            self.upstream.max_record_bytes
        );

        // -- Ledger --
        env_parse!("ledger.backend", "AURA_LEDGER_BACKEND", self.ledger.backend);
        env_str!("ledger.redis.url", "AURA_REDIS_URL", self.ledger.redis.url);
        env_str!(
            "ledger.redis.key_prefix",
            "AURA_REDIS_KEY_PREFIX",
            self.ledger.redis.key_prefix
        );
        env_parse!(
            "ledger.redis.timeout_ms",
            "AURA_REDIS_TIMEOUT_MS",
            self.ledger.redis.timeout_ms
        );

        // -- Budget --
        env_parse!(
            "budget.spend_limit_micros",
            "AURA_BUDGET_LIMIT_MICROS",
            self.budget.spend_limit_micros
        );
        env_parse!(
            "budget.cost_per_token_micros",
            "AURA_BUDGET_COST_PER_TOKEN_MICROS",
            self.budget.cost_per_token_micros
        );

        // -- Dispatcher --
        env_parse!(
            "dispatcher.capacity",
            "AURA_DISPATCHER_CAPACITY",
            self.dispatcher.capacity
        );
        env_parse!(
            "dispatcher.shutdown_timeout_secs",
            "AURA_DISPATCHER_SHUTDOWN_TIMEOUT_SECS",
            self.dispatcher.shutdown_timeout_secs
        );

        // -- Logging --
        env_str!("logging.level", "AURA_LOG_LEVEL", self.logging.level);
        env_bool!("logging.json", "AURA_LOG_JSON", self.logging.json);

        self.env_overrides = ov;
    }
}
