//! Config loading plus command-line overrides.
//!
//! Wraps `tado-local-config` and layers `--config`, `--state`, `--relay`
//! and the `run` flags on top.

use std::path::PathBuf;
use std::sync::Arc;

use tado_local_api::hap::SetupCode;
use tado_local_api::hap::relay::RelayTransport;
use tado_local_config::{Config, ConfigError};
use tado_local_core::BridgeConfig;

use crate::cli::{GlobalOpts, RunArgs};
use crate::error::CliError;

pub use tado_local_config::{save_config_to, store_refresh_token};

/// Path of the config file in effect.
pub fn config_path(global: &GlobalOpts) -> PathBuf {
    global
        .config
        .clone()
        .unwrap_or_else(tado_local_config::config_path)
}

/// Load the config file with `--state` and `--relay` applied.
pub fn load(global: &GlobalOpts) -> Result<Config, CliError> {
    let mut cfg = tado_local_config::load_config_from(&config_path(global))?;
    if let Some(ref state) = global.state {
        cfg.state_path = Some(state.clone());
    }
    if let Some(ref relay) = global.relay {
        cfg.relay.url.clone_from(relay);
    }
    Ok(cfg)
}

/// Everything needed to open a bridge.
pub struct Resolved {
    pub bridge: BridgeConfig,
    pub transport: Arc<RelayTransport>,
}

/// Translate the config into a bridge configuration and relay transport.
pub fn resolve(cfg: &Config) -> Result<Resolved, CliError> {
    let bridge = tado_local_config::to_bridge_config(cfg)?;
    let url = tado_local_config::relay_url(cfg)?;
    let transport = RelayTransport::new(url).with_request_timeout(tado_local_config::relay_timeout(cfg));
    Ok(Resolved {
        bridge,
        transport: Arc::new(transport),
    })
}

/// Apply `run` flags: gateway address, setup code and pairing reset.
pub fn apply_run_overrides(bridge: &mut BridgeConfig, args: &RunArgs) -> Result<(), CliError> {
    if let Some(ref ip) = args.bridge_ip {
        bridge.gateway.address = Some(ip.clone());
    }
    if let Some(ref pin) = args.pin {
        let code: SetupCode = pin.parse().map_err(|e: tado_local_api::Error| CliError::Validation {
            field: "--pin".into(),
            reason: e.to_string(),
        })?;
        bridge.gateway.setup_code = Some(code);
    }
    if args.clear_pairings {
        if bridge.gateway.address.is_none() {
            return Err(ConfigError::Validation {
                field: "--clear-pairings".into(),
                reason: "requires --bridge-ip or gateway.address".into(),
            }
            .into());
        }
        bridge.gateway.clear_pairings = true;
    }
    Ok(())
}
