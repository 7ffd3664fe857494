//! Layered configuration: TOML file + environment overrides.
//!
//! Each concern owns its own section and its own `Default` impl, following
//! the one-section-per-file convention used across this codebase's config
//! modules. Every field is `serde(default)` so a partial or absent file
//! still produces a workable config.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub cla: ClaConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file, falling back to defaults for
    /// missing keys, then layer environment-variable overrides on top.
    pub fn load(path: &str) -> crate::error::Result<Self> {
        let mut config = if std::path::Path::new(path).exists() {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| crate::error::Error::Internal(format!("reading {path}: {e}")))?;
            toml::from_str(&raw)
                .map_err(|e| crate::error::Error::Internal(format!("parsing {path}: {e}")))?
        } else {
            Config::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from file if it exists, otherwise defaults -- still applying
    /// environment overrides either way.
    pub fn load_or_default(path: &str) -> Self {
        Self::load(path).unwrap_or_else(|_| {
            let mut config = Config::default();
            config.apply_env_overrides();
            config
        })
    }

    /// Environment overrides, `GW_`-prefixed, applied after the file so an
    /// operator can override a single value without editing the TOML.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("GW_PORT") {
            if let Ok(port) = v.parse() {
                self.server.port = port;
            }
        }
        if let Ok(v) = std::env::var("GW_HOST") {
            self.server.host = v;
        }
        if let Ok(v) = std::env::var("GW_API_KEYS") {
            self.auth.api_keys = v.split(',').map(|s| s.trim().to_owned()).collect();
        }
        if let Ok(v) = std::env::var("GW_CLA_BINARY_PATH") {
            self.cla.binary_path = v;
        }
        if let Ok(v) = std::env::var("GW_PROXY_BASE_URL") {
            self.proxy.base_url = v;
        }
        if let Ok(v) = std::env::var("GW_PROXY_API_KEY") {
            self.proxy.api_key = v;
        }
        if let Ok(v) = std::env::var("GW_PROXY_ENABLED") {
            self.proxy.enabled = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("GW_LOG_FILTER") {
            self.logging.filter = v;
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_port")]
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: d_port(),
            host: d_host(),
        }
    }
}

fn d_port() -> u16 {
    8080
}
fn d_host() -> String {
    "0.0.0.0".into()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Auth
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    /// Accepted bearer tokens. Empty means auth is disabled (dev mode).
    #[serde(default)]
    pub api_keys: Vec<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Rate limiting
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "d_per_ip_limit")]
    pub per_ip_limit: u32,
    #[serde(default = "d_per_key_limit")]
    pub per_key_limit: u32,
    #[serde(default = "d_per_session_limit")]
    pub per_session_limit: u32,
    #[serde(default = "d_window_secs")]
    pub window_secs: u64,
    #[serde(default = "d_max_concurrent_per_key")]
    pub max_concurrent_per_key: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_ip_limit: d_per_ip_limit(),
            per_key_limit: d_per_key_limit(),
            per_session_limit: d_per_session_limit(),
            window_secs: d_window_secs(),
            max_concurrent_per_key: d_max_concurrent_per_key(),
        }
    }
}

fn d_per_ip_limit() -> u32 {
    60
}
fn d_per_key_limit() -> u32 {
    120
}
fn d_per_session_limit() -> u32 {
    30
}
fn d_window_secs() -> u64 {
    60
}
fn d_max_concurrent_per_key() -> u32 {
    4
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "d_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "d_max_age_secs")]
    pub max_age_secs: u64,
    #[serde(default = "d_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: d_ttl_secs(),
            max_age_secs: d_max_age_secs(),
            sweep_interval_secs: d_sweep_interval_secs(),
        }
    }
}

fn d_ttl_secs() -> u64 {
    1_800
}
fn d_max_age_secs() -> u64 {
    86_400
}
fn d_sweep_interval_secs() -> u64 {
    60
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Process pool
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "d_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "d_queue_timeout_secs")]
    pub queue_timeout_secs: u64,
    #[serde(default = "d_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent: d_max_concurrent(),
            queue_timeout_secs: d_queue_timeout_secs(),
            shutdown_timeout_secs: d_shutdown_timeout_secs(),
        }
    }
}

fn d_max_concurrent() -> usize {
    8
}
fn d_queue_timeout_secs() -> u64 {
    30
}
fn d_shutdown_timeout_secs() -> u64 {
    10
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CLA backend
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaConfig {
    #[serde(default = "d_cla_binary")]
    pub binary_path: String,
}

impl Default for ClaConfig {
    fn default() -> Self {
        Self {
            binary_path: d_cla_binary(),
        }
    }
}

fn d_cla_binary() -> String {
    "claude".into()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Upstream proxy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "d_proxy_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub allow_client_key: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: d_proxy_base_url(),
            api_key: String::new(),
            allow_client_key: false,
        }
    }
}

fn d_proxy_base_url() -> String {
    "https://api.openai.com/v1".into()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Logging
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "d_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: d_log_filter(),
            json: false,
        }
    }
}

fn d_log_filter() -> String {
    "gateway=info,tower_http=info".into()
}
