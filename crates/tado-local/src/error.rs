//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` into user-facing errors with
//! actionable help text and stable exit codes.

use miette::Diagnostic;
use thiserror::Error;

use tado_local_config::ConfigError;
use tado_local_core::CoreError;

pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const NOT_FOUND: i32 = 4;
    pub const CONFLICT: i32 = 6;
    pub const CONNECTION: i32 = 7;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Connection ───────────────────────────────────────────────────
    #[error("Could not reach the gateway: {reason}")]
    #[diagnostic(
        code(tado_local::connection_failed),
        help(
            "Check that the HAP relay is running and the gateway is reachable.\n\
             Try: tado-local -v status"
        )
    )]
    ConnectionFailed { reason: String },

    // ── Pairing ──────────────────────────────────────────────────────
    #[error("{message}")]
    #[diagnostic(code(tado_local::pairing), help("{help}"))]
    Pairing { message: String, help: String },

    #[error("{message}")]
    #[diagnostic(
        code(tado_local::cloud_auth),
        help("Store a fresh token with: tado-local config set-cloud-token <TOKEN>")
    )]
    CloudAuth { message: String },

    // ── Resources ────────────────────────────────────────────────────
    #[error("{resource_type} '{identifier}' not found")]
    #[diagnostic(
        code(tado_local::not_found),
        help("Run: tado-local {list_command} to see available {resource_type}s")
    )]
    NotFound {
        resource_type: String,
        identifier: String,
        list_command: String,
    },

    // ── Writes ───────────────────────────────────────────────────────
    #[error("Gateway rejected write to {field} (HAP status {status})")]
    #[diagnostic(
        code(tado_local::write_rejected),
        help("The device may not support this value in its current mode.")
    )]
    WriteRejected { field: String, status: i64 },

    // ── Validation ───────────────────────────────────────────────────
    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(tado_local::validation))]
    Validation { field: String, reason: String },

    // ── Configuration ────────────────────────────────────────────────
    #[error(transparent)]
    #[diagnostic(
        code(tado_local::config),
        help("Check the config file. Run: tado-local config path")
    )]
    Config(#[from] ConfigError),

    // ── Core fallthrough ─────────────────────────────────────────────
    #[error(transparent)]
    #[diagnostic(code(tado_local::core))]
    Core(CoreError),

    // ── IO / Serialization ───────────────────────────────────────────
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Could not render output: {0}")]
    #[diagnostic(code(tado_local::json))]
    Json(#[from] serde_json::Error),

    #[error("Could not render configuration: {0}")]
    #[diagnostic(code(tado_local::toml))]
    Toml(#[from] toml::ser::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConnectionFailed { .. } => exit_code::CONNECTION,
            Self::Pairing { .. } | Self::CloudAuth { .. } => exit_code::AUTH,
            Self::NotFound { .. } => exit_code::NOT_FOUND,
            Self::WriteRejected { .. } => exit_code::CONFLICT,
            Self::Validation { .. } | Self::Config(ConfigError::Validation { .. }) => exit_code::USAGE,
            _ => exit_code::GENERAL,
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

fn pairing(err: &CoreError, help: &str) -> CliError {
    CliError::Pairing {
        message: err.to_string(),
        help: help.into(),
    }
}

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Transport { reason } => Self::ConnectionFailed { reason },
            CoreError::Disconnected => Self::ConnectionFailed {
                reason: "the session closed before the command finished".into(),
            },

            CoreError::PairingUnavailable => pairing(
                &err,
                "Remove the existing HomeKit pairing (e.g. in the Home app) or reset\n\
                 the gateway, then run: tado-local run --bridge-ip <IP> --pin <CODE>",
            ),
            CoreError::PinRequired { .. } | CoreError::AddressRequired | CoreError::NoPairings => pairing(
                &err,
                "Pair once with: tado-local run --bridge-ip <IP> --pin <XXX-XX-XXX>",
            ),
            CoreError::MultiplePairings { .. } | CoreError::NoPairing { .. } => {
                pairing(&err, "Run: tado-local pairings list")
            }
            CoreError::InvalidPin { .. } | CoreError::PairingPhaseFailed { .. } => pairing(
                &err,
                "Check the setup code printed on the gateway and try again.",
            ),

            CoreError::CloudAuthExpired => Self::CloudAuth {
                message: err.to_string(),
            },

            CoreError::DeviceNotFound { identifier } => Self::NotFound {
                resource_type: "device".into(),
                identifier,
                list_command: "devices".into(),
            },
            CoreError::ZoneNotFound { identifier } => Self::NotFound {
                resource_type: "zone".into(),
                identifier,
                list_command: "zones".into(),
            },

            CoreError::InvalidFieldValue { field, reason } => Self::Validation {
                field: field.to_string(),
                reason,
            },
            CoreError::InvalidField { device_id, field } => Self::Validation {
                reason: format!("not writable on device {device_id}"),
                field,
            },
            CoreError::RemoteWriteRejected { field, status } => Self::WriteRejected { field, status },

            other => Self::Core(other),
        }
    }
}
