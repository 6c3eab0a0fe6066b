use thiserror::Error;

/// Top-level error type for the `tado-local-api` crate.
///
/// Covers every failure mode across the capability surfaces:
/// gateway pairing, the accessory session, the HAP relay socket, and the
/// Tado cloud REST API. `tado-local-core` maps these into its own taxonomy.
#[derive(Debug, Error)]
pub enum Error {
    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Request timed out.
    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// The gateway could not be reached.
    #[error("Gateway connection failed: {reason}")]
    Connection { reason: String },

    /// An established accessory session dropped.
    #[error("Gateway connection lost")]
    ConnectionLost,

    // ── Pairing ─────────────────────────────────────────────────────
    /// The gateway's single pairing slot is taken by another controller.
    #[error("Accessory reports unavailable for pairing")]
    PairingUnavailable,

    /// The gateway rejected the setup code or the proof.
    #[error("Pairing authentication failed: {message}")]
    PairingAuthentication { message: String },

    /// The gateway is busy with another pairing attempt.
    #[error("Accessory is busy with another pairing attempt")]
    PairingBusy,

    /// Unexpected TLV state or malformed pairing exchange.
    #[error("Pairing protocol error: {message}")]
    PairingProtocol { message: String },

    // ── Accessory session ───────────────────────────────────────────
    /// The gateway refused a characteristic write (HAP status code).
    #[error("Write to {aid}.{iid} rejected with HAP status {status}")]
    WriteRejected { aid: u64, iid: u64, status: i64 },

    // ── Cloud ───────────────────────────────────────────────────────
    /// The cloud refresh token is no longer accepted.
    #[error("Cloud authorization expired -- a new refresh token is required")]
    CloudAuthExpired,

    /// Rate limited by the cloud API. Includes retry-after in seconds.
    #[error("Rate limited -- retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Non-success status from the cloud API.
    #[error("Cloud API error (HTTP {status}): {message}")]
    Cloud { status: u16, message: String },

    // ── Relay socket ────────────────────────────────────────────────
    /// WebSocket connection to the HAP relay failed.
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    /// WebSocket to the HAP relay closed unexpectedly.
    #[error("WebSocket closed (code {code}): {reason}")]
    WebSocketClosed { code: u16, reason: String },

    // ── Data ────────────────────────────────────────────────────────
    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },
}

impl Error {
    /// Returns `true` if the cloud token was rejected and a refresh
    /// might resolve it.
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::CloudAuthExpired)
    }

    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::Timeout { .. }
            | Self::Connection { .. }
            | Self::ConnectionLost
            | Self::PairingBusy
            | Self::RateLimited { .. }
            | Self::WebSocketConnect(_)
            | Self::WebSocketClosed { .. } => true,
            _ => false,
        }
    }

    /// Returns `true` if the session underneath is gone and must be
    /// re-established before any further read or write.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost | Self::WebSocketClosed { .. } | Self::Connection { .. }
        )
    }

    /// Returns `true` if this is a "not found" error.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Transport(e) => e.status() == Some(reqwest::StatusCode::NOT_FOUND),
            Self::Cloud { status: 404, .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::ConnectionLost.is_transient());
        assert!(Error::PairingBusy.is_transient());
        assert!(Error::RateLimited { retry_after_secs: 5 }.is_transient());
        assert!(!Error::PairingUnavailable.is_transient());
        assert!(
            !Error::WriteRejected {
                aid: 1,
                iid: 2,
                status: -70402
            }
            .is_transient()
        );
    }

    #[test]
    fn disconnect_classification() {
        assert!(Error::ConnectionLost.is_disconnect());
        assert!(!Error::PairingBusy.is_disconnect());
        assert!(!Error::CloudAuthExpired.is_disconnect());
    }
}
