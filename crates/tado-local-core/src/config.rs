// ── Runtime bridge configuration ──
//
// These types describe how the bridge runs: where state lives, which
// gateway to talk to and how often to poll. They never touch config files.
// The CLI builds a `BridgeConfig` and hands it in.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use url::Url;

use tado_local_api::hap::SetupCode;

/// Which gateway to use and how to authenticate with it.
#[derive(Debug, Clone, Default)]
pub struct GatewayTarget {
    /// Gateway IP or host. `None` selects the only stored pairing.
    pub address: Option<String>,
    /// Setup code printed on the gateway. Supplying one starts a fresh pairing.
    pub setup_code: Option<SetupCode>,
    /// Delete stored pairings before connecting.
    pub clear_pairings: bool,
}

/// Poll cadences for the two safety-net loops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollingConfig {
    /// Re-read of fields that do not push reliably. Zero disables.
    pub fast_interval: Duration,
    /// Re-read of every tracked field. Zero disables.
    pub slow_interval: Duration,
    /// Characteristics per read request.
    pub batch_size: usize,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            fast_interval: Duration::from_secs(60),
            slow_interval: Duration::from_secs(120),
            batch_size: 15,
        }
    }
}

/// Backoff for the gateway reconnect loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// `None` retries forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: None,
        }
    }
}

/// Cloud metadata sync settings.
#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// Long-lived refresh token. Without one the loop idles and retries.
    pub refresh_token: Option<SecretString>,
    /// Home to sync. Discovered from `/me` when unset.
    pub home_id: Option<i64>,
    /// Freshness window for battery and firmware data.
    pub dynamic_ttl: Duration,
    /// Freshness window for zones and home data.
    pub static_ttl: Duration,
    /// Delay before the first sync after start.
    pub initial_delay: Duration,
    /// Delay after a failed sync.
    pub retry_delay: Duration,
    /// Delay while no valid token is available.
    pub unauthenticated_delay: Duration,
    /// Override of the REST API base (tests).
    pub api_base: Option<Url>,
    /// Override of the OAuth base (tests).
    pub auth_base: Option<Url>,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            refresh_token: None,
            home_id: None,
            dynamic_ttl: Duration::from_secs(4 * 3600),
            static_ttl: Duration::from_secs(24 * 3600),
            initial_delay: Duration::from_secs(60),
            retry_delay: Duration::from_secs(3600),
            unauthenticated_delay: Duration::from_secs(300),
            api_base: None,
            auth_base: None,
        }
    }
}

/// Everything the bridge needs to run.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// SQLite file holding the whole durable footprint.
    pub state_path: PathBuf,
    pub gateway: GatewayTarget,
    pub polling: PollingConfig,
    /// History bucket width.
    pub bucket_width: Duration,
    pub reconnect: ReconnectConfig,
    /// `None` disables cloud sync.
    pub cloud: Option<CloudConfig>,
    /// Seconds a successful write's value overlays predicted state.
    pub prediction_ttl: Duration,
    /// HTTP timeout for cloud requests.
    pub timeout: Duration,
}

impl BridgeConfig {
    pub fn new(state_path: impl Into<PathBuf>) -> Self {
        Self {
            state_path: state_path.into(),
            gateway: GatewayTarget::default(),
            polling: PollingConfig::default(),
            bucket_width: Duration::from_secs(10),
            reconnect: ReconnectConfig::default(),
            cloud: None,
            prediction_ttl: Duration::from_secs(10),
            timeout: Duration::from_secs(30),
        }
    }

    /// Bucket width in whole seconds, never below one.
    pub fn bucket_secs(&self) -> i64 {
        i64::try_from(self.bucket_width.as_secs()).unwrap_or(i64::MAX).max(1)
    }
}
