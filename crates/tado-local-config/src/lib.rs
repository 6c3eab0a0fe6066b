//! Configuration for the tado-local bridge.
//!
//! A TOML file layered under `TADO_LOCAL_*` environment variables, cloud
//! token resolution (env + keyring + plaintext) and translation to
//! `tado_local_core::BridgeConfig`. The binary adds flag overrides on top.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::{BaseDirs, ProjectDirs};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use tado_local_api::hap::SetupCode;
use tado_local_core::{BridgeConfig, CloudConfig, GatewayTarget, PollingConfig, ReconnectConfig};

/// Keyring service name for stored secrets.
pub const KEYRING_SERVICE: &str = "tado-local";
/// Keyring entry holding the cloud refresh token.
pub const REFRESH_TOKEN_ENTRY: &str = "cloud/refresh-token";
/// Environment variable consulted when `cloud.refresh_token_env` is unset.
pub const DEFAULT_REFRESH_TOKEN_ENV: &str = "TADO_REFRESH_TOKEN";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("keyring error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// SQLite state file. Defaults to `~/.tado-local.db`.
    pub state_path: Option<PathBuf>,
    pub defaults: Defaults,
    pub gateway: GatewaySection,
    pub relay: RelaySection,
    pub polling: PollingSection,
    pub history: HistorySection,
    pub reconnect: ReconnectSection,
    pub cloud: CloudSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Defaults {
    /// Output format: table, json, json-compact or plain.
    pub output: String,
    /// HTTP timeout in seconds.
    pub timeout: u64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            output: "table".into(),
            timeout: 30,
        }
    }
}

/// The tado internet bridge on the local network.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewaySection {
    /// IP or host name. Optional once exactly one pairing is stored.
    pub address: Option<String>,
    pub port: u16,
    /// HomeKit setup code, only needed for the first pairing.
    pub setup_code: Option<String>,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            address: None,
            port: 80,
            setup_code: None,
        }
    }
}

impl GatewaySection {
    /// Address as used to key pairings: the host alone on the default
    /// port, `host:port` otherwise.
    pub fn target_address(&self) -> Option<String> {
        let host = self.address.as_deref()?.trim();
        if host.is_empty() {
            return None;
        }
        Some(if self.port == 80 {
            host.to_owned()
        } else {
            format!("{host}:{}", self.port)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RelaySection {
    /// WebSocket endpoint of the HAP relay.
    pub url: String,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:4408".into(),
            request_timeout_secs: 15,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PollingSection {
    /// Humidity poll interval. 0 disables.
    pub fast_secs: u64,
    /// Full poll interval. 0 disables.
    pub slow_secs: u64,
    pub batch_size: usize,
}

impl Default for PollingSection {
    fn default() -> Self {
        Self {
            fast_secs: 60,
            slow_secs: 120,
            batch_size: 15,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct HistorySection {
    pub bucket_secs: u64,
}

impl Default for HistorySection {
    fn default() -> Self {
        Self { bucket_secs: 10 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconnectSection {
    pub initial_secs: u64,
    pub max_secs: u64,
    /// Give up after this many failed attempts. Unset retries forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            initial_secs: 1,
            max_secs: 30,
            max_retries: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CloudSection {
    pub enabled: bool,
    pub home_id: Option<i64>,
    /// Refresh token (plaintext, prefer the keyring or an env var).
    pub refresh_token: Option<String>,
    /// Environment variable containing the refresh token.
    pub refresh_token_env: Option<String>,
    /// Freshness of battery and firmware data.
    pub dynamic_hours: u64,
    /// Freshness of zone data.
    pub static_hours: u64,
}

impl Default for CloudSection {
    fn default() -> Self {
        Self {
            enabled: false,
            home_id: None,
            refresh_token: None,
            refresh_token_env: None,
            dynamic_hours: 4,
            static_hours: 24,
        }
    }
}

// ── Paths ───────────────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("com", "tado-local", "tado-local").map_or_else(
        || {
            let mut p = home_dir();
            p.push(".config");
            p.push("tado-local");
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

/// `~/.tado-local.db`.
pub fn default_state_path() -> PathBuf {
    home_dir().join(".tado-local.db")
}

fn home_dir() -> PathBuf {
    BaseDirs::new().map_or_else(|| PathBuf::from("."), |dirs| dirs.home_dir().to_path_buf())
}

impl Config {
    pub fn state_path(&self) -> PathBuf {
        self.state_path.clone().unwrap_or_else(default_state_path)
    }
}

// ── Loading and saving ──────────────────────────────────────────────

/// Defaults, then the TOML file at `path`, then `TADO_LOCAL_*` variables
/// (`__` separates nested keys, e.g. `TADO_LOCAL_POLLING__FAST_SECS`).
pub fn figment(path: &Path) -> Figment {
    Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("TADO_LOCAL_").split("__"))
}

/// Load the config from the canonical path plus environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    Ok(figment(path).extract()?)
}

/// Load config, returning a default if it cannot be read.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_default()
}

/// Serialize config to TOML and write to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<PathBuf, ConfigError> {
    let path = config_path();
    save_config_to(cfg, &path)?;
    Ok(path)
}

pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Secret resolution ───────────────────────────────────────────────

/// Resolve the cloud refresh token: env var, then system keyring, then
/// plaintext in the config. `None` when no source has one.
pub fn resolve_refresh_token(cloud: &CloudSection) -> Option<SecretString> {
    let env_name = cloud
        .refresh_token_env
        .as_deref()
        .unwrap_or(DEFAULT_REFRESH_TOKEN_ENV);
    resolve_secret(
        std::env::var(env_name).ok(),
        || {
            keyring::Entry::new(KEYRING_SERVICE, REFRESH_TOKEN_ENTRY)
                .and_then(|entry| entry.get_password())
                .ok()
        },
        cloud.refresh_token.as_deref(),
    )
}

fn resolve_secret(
    from_env: Option<String>,
    from_keyring: impl FnOnce() -> Option<String>,
    plaintext: Option<&str>,
) -> Option<SecretString> {
    from_env
        .filter(|v| !v.trim().is_empty())
        .or_else(from_keyring)
        .or_else(|| plaintext.map(str::to_owned))
        .map(SecretString::from)
}

/// Store a refresh token in the system keyring.
pub fn store_refresh_token(token: &str) -> Result<(), ConfigError> {
    let entry = keyring::Entry::new(KEYRING_SERVICE, REFRESH_TOKEN_ENTRY)?;
    entry.set_password(token)?;
    Ok(())
}

// ── Translation ─────────────────────────────────────────────────────

/// The relay WebSocket endpoint.
pub fn relay_url(cfg: &Config) -> Result<Url, ConfigError> {
    let url: Url = cfg
        .relay
        .url
        .parse()
        .map_err(|_| invalid("relay.url", format!("invalid URL: {}", cfg.relay.url)))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(invalid("relay.url", format!("expected ws:// or wss://, got {other}://"))),
    }
}

pub fn relay_timeout(cfg: &Config) -> Duration {
    Duration::from_secs(cfg.relay.request_timeout_secs.max(1))
}

/// Build a `BridgeConfig`, validating values the core relies on.
pub fn to_bridge_config(cfg: &Config) -> Result<BridgeConfig, ConfigError> {
    let setup_code = cfg
        .gateway
        .setup_code
        .as_deref()
        .map(str::parse::<SetupCode>)
        .transpose()
        .map_err(|e| invalid("gateway.setup_code", e.to_string()))?;

    if cfg.polling.batch_size == 0 {
        return Err(invalid("polling.batch_size", "must be at least 1"));
    }
    if cfg.history.bucket_secs == 0 {
        return Err(invalid("history.bucket_secs", "must be at least 1"));
    }
    if cfg.reconnect.initial_secs > cfg.reconnect.max_secs {
        return Err(invalid(
            "reconnect.initial_secs",
            format!(
                "{} exceeds reconnect.max_secs ({})",
                cfg.reconnect.initial_secs, cfg.reconnect.max_secs
            ),
        ));
    }

    let mut bridge = BridgeConfig::new(cfg.state_path());
    bridge.gateway = GatewayTarget {
        address: cfg.gateway.target_address(),
        setup_code,
        clear_pairings: false,
    };
    bridge.polling = PollingConfig {
        fast_interval: Duration::from_secs(cfg.polling.fast_secs),
        slow_interval: Duration::from_secs(cfg.polling.slow_secs),
        batch_size: cfg.polling.batch_size,
    };
    bridge.bucket_width = Duration::from_secs(cfg.history.bucket_secs);
    bridge.reconnect = ReconnectConfig {
        initial_delay: Duration::from_secs(cfg.reconnect.initial_secs),
        max_delay: Duration::from_secs(cfg.reconnect.max_secs),
        max_retries: cfg.reconnect.max_retries,
    };
    bridge.timeout = Duration::from_secs(cfg.defaults.timeout.max(1));
    bridge.cloud = cfg.cloud.enabled.then(|| CloudConfig {
        refresh_token: resolve_refresh_token(&cfg.cloud),
        home_id: cfg.cloud.home_id,
        dynamic_ttl: hours(cfg.cloud.dynamic_hours),
        static_ttl: hours(cfg.cloud.static_hours),
        ..CloudConfig::default()
    });
    Ok(bridge)
}

fn hours(h: u64) -> Duration {
    Duration::from_secs(h.saturating_mul(3600))
}
