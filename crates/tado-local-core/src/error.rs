// ── Core error types ──
//
// User-facing errors from tado-local-core. Consumers never see relay frames,
// HTTP status codes or SQL errors directly. The `From<tado_local_api::Error>`
// impl translates capability-layer errors into the bridge's taxonomy.

use thiserror::Error;

use crate::model::TrackedField;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Gateway connection ───────────────────────────────────────────
    /// Transient transport failure: retried with backoff, never
    /// invalidates the stored credential.
    #[error("Gateway transport error: {reason}")]
    Transport { reason: String },

    /// The bridge has no live session. Writes fail immediately.
    #[error("Gateway disconnected")]
    Disconnected,

    // ── Pairing ──────────────────────────────────────────────────────
    /// The gateway's single pairing slot is occupied. Needs operator action.
    #[error("Gateway is unavailable for pairing: it is already paired with another controller")]
    PairingUnavailable,

    /// A handshake phase failed. Phase-1 progress stays checkpointed.
    #[error("Pairing phase {phase} failed: {reason}")]
    PairingPhaseFailed { phase: u8, reason: String },

    #[error("No stored pairing for gateway {address}")]
    NoPairing { address: String },

    #[error("No stored pairings; pair first with --bridge-ip and --pin")]
    NoPairings,

    #[error("Multiple pairings stored ({}); choose one with --bridge-ip", addresses.join(", "))]
    MultiplePairings { addresses: Vec<String> },

    #[error("A bridge IP is required when pairing with a PIN")]
    AddressRequired,

    #[error("Gateway {address} is not paired; a setup code is required")]
    PinRequired { address: String },

    #[error("Invalid setup code: {message}")]
    InvalidPin { message: String },

    // ── Field operations ─────────────────────────────────────────────
    #[error("Field {field} is not writable on device {device_id}")]
    InvalidField { device_id: i64, field: String },

    /// Rejected locally; nothing was sent to the gateway.
    #[error("Invalid value for {field}: {reason}")]
    InvalidFieldValue { field: TrackedField, reason: String },

    /// The gateway refused the write. Not retried.
    #[error("Gateway rejected write to {field} (HAP status {status})")]
    RemoteWriteRejected { field: String, status: i64 },

    #[error("Device not found: {identifier}")]
    DeviceNotFound { identifier: String },

    #[error("Zone not found: {identifier}")]
    ZoneNotFound { identifier: String },

    // ── Cloud ────────────────────────────────────────────────────────
    #[error("Cloud authorization expired; provide a new refresh token")]
    CloudAuthExpired,

    #[error("Cloud API error: {message}")]
    Cloud { message: String, status: Option<u16> },

    // ── Storage ──────────────────────────────────────────────────────
    #[error("Storage error: {message}")]
    Storage { message: String },

    // ── Configuration ────────────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Returns `true` for failures the reconnect loop should retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Disconnected)
    }

    /// Returns `true` for pairing outcomes that need a human.
    pub fn needs_operator(&self) -> bool {
        matches!(
            self,
            Self::PairingUnavailable
                | Self::InvalidPin { .. }
                | Self::NoPairings
                | Self::MultiplePairings { .. }
                | Self::AddressRequired
                | Self::PinRequired { .. }
        )
    }
}

// ── Conversion from capability-layer errors ──────────────────────────

impl From<tado_local_api::Error> for CoreError {
    fn from(err: tado_local_api::Error) -> Self {
        use tado_local_api::Error as Api;
        match err {
            Api::PairingUnavailable => Self::PairingUnavailable,
            Api::PairingAuthentication { message } => Self::InvalidPin { message },
            Api::PairingProtocol { message } => Self::PairingPhaseFailed {
                phase: 0,
                reason: message,
            },
            Api::PairingBusy => Self::Transport {
                reason: "accessory busy with another pairing attempt".into(),
            },
            Api::WriteRejected { aid, iid, status } => Self::RemoteWriteRejected {
                field: format!("{aid}.{iid}"),
                status,
            },
            Api::CloudAuthExpired => Self::CloudAuthExpired,
            Api::RateLimited { retry_after_secs } => Self::Cloud {
                message: format!("rate limited, retry after {retry_after_secs}s"),
                status: Some(429),
            },
            Api::Cloud { status, message } => Self::Cloud {
                message,
                status: Some(status),
            },
            Api::Deserialization { message, body: _ } => {
                Self::Internal(format!("Deserialization error: {message}"))
            }
            Api::InvalidUrl(e) => Self::Config {
                message: format!("Invalid URL: {e}"),
            },
            Api::Transport(ref e) if e.url().is_some_and(|u| u.scheme().starts_with("http")) => {
                Self::Cloud {
                    message: e.to_string(),
                    status: e.status().map(|s| s.as_u16()),
                }
            }
            Api::ConnectionLost => Self::Disconnected,
            other @ (Api::Transport(_)
            | Api::Timeout { .. }
            | Api::Connection { .. }
            | Api::WebSocketConnect(_)
            | Api::WebSocketClosed { .. }) => Self::Transport {
                reason: other.to_string(),
            },
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage {
            message: format!("corrupt JSON column: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_is_not_transient() {
        let err = CoreError::from(tado_local_api::Error::PairingUnavailable);
        assert!(matches!(err, CoreError::PairingUnavailable));
        assert!(!err.is_transient());
        assert!(err.needs_operator());
    }

    #[test]
    fn connection_errors_are_transient() {
        let err = CoreError::from(tado_local_api::Error::Connection {
            reason: "no route".into(),
        });
        assert!(err.is_transient());
        assert!(CoreError::from(tado_local_api::Error::ConnectionLost).is_transient());
    }

    #[test]
    fn write_rejection_keeps_status() {
        let err = CoreError::from(tado_local_api::Error::WriteRejected {
            aid: 2,
            iid: 10,
            status: -70402,
        });
        assert!(matches!(err, CoreError::RemoteWriteRejected { status: -70402, .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn multiple_pairings_lists_addresses() {
        let err = CoreError::MultiplePairings {
            addresses: vec!["10.0.0.2".into(), "10.0.0.3".into()],
        };
        assert!(err.to_string().contains("10.0.0.2, 10.0.0.3"));
    }
}
