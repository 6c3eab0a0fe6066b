// Cloud access tokens.
//
// The bridge holds a long-lived refresh token and derives short-lived
// access tokens from it on demand. The refresh token rotates on every use;
// the latest value is readable so the caller can persist it.

use std::time::{Duration, Instant};

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::Error;

/// Public OAuth client id of the Tado apps.
pub const CLIENT_ID: &str = "1bb50063-6b0c-4d11-bd99-387f4a91cc46";
/// Default token endpoint base.
pub const AUTH_BASE_URL: &str = "https://login.tado.com/oauth2/";

/// Access tokens are treated as expired this long before they really do.
const EXPIRY_MARGIN: Duration = Duration::from_secs(30);
/// Lifetime assumed when the token response omits `expires_in`.
const DEFAULT_LIFETIME_SECS: u64 = 600;

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

struct CachedToken {
    token: SecretString,
    expires_at: Instant,
}

struct TokenState {
    refresh_token: Option<SecretString>,
    cached: Option<CachedToken>,
    rotated: bool,
}

/// Fetch, cache-with-expiry and invalidate of cloud access tokens.
pub struct TokenCache {
    http: reqwest::Client,
    token_url: Url,
    state: Mutex<TokenState>,
}

impl TokenCache {
    pub fn new(http: reqwest::Client, auth_base: &Url, refresh_token: Option<SecretString>) -> Result<Self, Error> {
        Ok(Self {
            http,
            token_url: auth_base.join("token")?,
            state: Mutex::new(TokenState {
                refresh_token,
                cached: None,
                rotated: false,
            }),
        })
    }

    /// Whether a refresh token is available at all.
    pub async fn has_refresh_token(&self) -> bool {
        self.state.lock().await.refresh_token.is_some()
    }

    /// Return a valid access token, refreshing when the cached one expired.
    ///
    /// The lock is held through the refresh so concurrent callers share a
    /// single token request.
    pub async fn access_token(&self) -> Result<SecretString, Error> {
        let mut state = self.state.lock().await;
        if let Some(cached) = &state.cached {
            if Instant::now() < cached.expires_at {
                return Ok(cached.token.clone());
            }
            debug!("access token expired");
        }

        let Some(refresh) = state.refresh_token.clone() else {
            return Err(Error::CloudAuthExpired);
        };

        let resp = self
            .http
            .post(self.token_url.clone())
            .query(&[
                ("client_id", CLIENT_ID),
                ("refresh_token", refresh.expose_secret()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(Error::Transport)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "token refresh rejected");
            if status == reqwest::StatusCode::BAD_REQUEST || status == reqwest::StatusCode::UNAUTHORIZED {
                state.refresh_token = None;
                state.cached = None;
                return Err(Error::CloudAuthExpired);
            }
            return Err(Error::Cloud {
                status: status.as_u16(),
                message: body,
            });
        }

        let body = resp.text().await.map_err(Error::Transport)?;
        let parsed: TokenResponse = serde_json::from_str(&body).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body: String::new(),
        })?;

        let lifetime = Duration::from_secs(parsed.expires_in.unwrap_or(DEFAULT_LIFETIME_SECS));
        let token = SecretString::from(parsed.access_token);
        state.cached = Some(CachedToken {
            token: token.clone(),
            expires_at: Instant::now() + lifetime.saturating_sub(EXPIRY_MARGIN),
        });
        if let Some(next) = parsed.refresh_token {
            state.refresh_token = Some(SecretString::from(next));
            state.rotated = true;
        }
        info!(lifetime_secs = lifetime.as_secs(), "cloud access token refreshed");
        Ok(token)
    }

    /// Drop the cached access token; the next call refreshes.
    pub async fn invalidate(&self) {
        self.state.lock().await.cached = None;
    }

    /// The refresh token, if it rotated since the last call.
    pub async fn take_rotated_refresh_token(&self) -> Option<SecretString> {
        let mut state = self.state.lock().await;
        if !state.rotated {
            return None;
        }
        state.rotated = false;
        state.refresh_token.clone()
    }
}
