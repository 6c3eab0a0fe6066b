// Tado cloud REST client
//
// Read-only access to the few endpoints the bridge needs for metadata that
// the local gateway does not expose (zone names, battery state, firmware).
// Every home-scoped GET is conditional: callers pass the ETag of their
// cached body and get `Conditional::NotModified` back on a 304.

pub mod auth;
pub mod rate_limit;
pub mod types;

use std::sync::{Mutex, PoisonError};

use reqwest::StatusCode;
use reqwest::header::{ETAG, IF_NONE_MATCH, RETRY_AFTER};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use url::Url;

use crate::error::Error;
use crate::transport::TransportConfig;

pub use auth::TokenCache;
pub use rate_limit::RateLimitInfo;
pub use types::{CloudDevice, CloudZone, DeviceList, DeviceListEntry, Home, Me};

/// Default REST API base.
pub const API_BASE_URL: &str = "https://my.tado.com/api/v2/";

/// Retry-after assumed when a 429 carries no header.
const DEFAULT_RETRY_AFTER_SECS: u64 = 3600;

/// Outcome of a conditional GET.
#[derive(Debug, Clone, PartialEq)]
pub enum Conditional<T> {
    /// 304: the caller's cached body is still current.
    NotModified,
    /// 200: a new body and its validator.
    Fresh { data: T, etag: Option<String> },
}

impl<T> Conditional<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Conditional<U> {
        match self {
            Self::NotModified => Conditional::NotModified,
            Self::Fresh { data, etag } => Conditional::Fresh { data: f(data), etag },
        }
    }
}

/// Client for `my.tado.com/api/v2`.
pub struct CloudClient {
    http: reqwest::Client,
    api_base: Url,
    tokens: TokenCache,
    rate_limit: Mutex<Option<RateLimitInfo>>,
}

impl CloudClient {
    /// Client against the production endpoints.
    pub fn new(transport: &TransportConfig, refresh_token: Option<SecretString>) -> Result<Self, Error> {
        Self::with_base_urls(
            transport,
            Url::parse(API_BASE_URL)?,
            &Url::parse(auth::AUTH_BASE_URL)?,
            refresh_token,
        )
    }

    /// Client against custom base URLs (both must end with `/`).
    pub fn with_base_urls(
        transport: &TransportConfig,
        api_base: Url,
        auth_base: &Url,
        refresh_token: Option<SecretString>,
    ) -> Result<Self, Error> {
        let http = transport.build_client()?;
        let tokens = TokenCache::new(http.clone(), auth_base, refresh_token)?;
        Ok(Self {
            http,
            api_base,
            tokens,
            rate_limit: Mutex::new(None),
        })
    }

    pub fn tokens(&self) -> &TokenCache {
        &self.tokens
    }

    /// Rate-limit state from the most recent response that carried it.
    pub fn rate_limit(&self) -> Option<RateLimitInfo> {
        *self.rate_limit.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Endpoints ────────────────────────────────────────────────────

    /// `GET /me`, used to discover the home id.
    pub async fn me(&self) -> Result<Me, Error> {
        let url = self.api_base.join("me")?;
        match self.get(url, None).await? {
            Conditional::Fresh { data, .. } => decode(data),
            Conditional::NotModified => Err(Error::Cloud {
                status: 304,
                message: "unexpected 304 for /me".into(),
            }),
        }
    }

    /// Raw conditional GET of `homes/{home_id}/{endpoint}`.
    ///
    /// `endpoint` is `""` for the home itself, otherwise e.g. `"zones"`.
    pub async fn fetch_home(
        &self,
        home_id: i64,
        endpoint: &str,
        etag: Option<&str>,
    ) -> Result<Conditional<serde_json::Value>, Error> {
        let url = self.api_base.join(&format!("homes/{home_id}/{endpoint}"))?;
        self.get(url, etag).await
    }

    pub async fn home(&self, home_id: i64, etag: Option<&str>) -> Result<Conditional<Home>, Error> {
        decode_conditional(self.fetch_home(home_id, "", etag).await?)
    }

    pub async fn zones(&self, home_id: i64, etag: Option<&str>) -> Result<Conditional<Vec<CloudZone>>, Error> {
        decode_conditional(self.fetch_home(home_id, "zones", etag).await?)
    }

    pub async fn device_list(&self, home_id: i64, etag: Option<&str>) -> Result<Conditional<DeviceList>, Error> {
        decode_conditional(self.fetch_home(home_id, "deviceList", etag).await?)
    }

    // ── Request helpers ──────────────────────────────────────────────

    /// Authenticated GET. A 401 invalidates the access token and retries
    /// exactly once.
    async fn get(&self, url: Url, etag: Option<&str>) -> Result<Conditional<serde_json::Value>, Error> {
        let mut retried = false;
        loop {
            let token = self.tokens.access_token().await?;
            debug!("GET {}", url);

            let mut req = self.http.get(url.clone()).bearer_auth(token.expose_secret());
            if let Some(etag) = etag {
                req = req.header(IF_NONE_MATCH, etag);
            }
            let resp = req.send().await.map_err(Error::Transport)?;
            self.record_rate_limit(resp.headers());

            let status = resp.status();
            match status {
                StatusCode::NOT_MODIFIED => {
                    debug!(url = %url, "304 not modified");
                    return Ok(Conditional::NotModified);
                }
                StatusCode::UNAUTHORIZED if !retried => {
                    debug!("401 from cloud, refreshing access token");
                    self.tokens.invalidate().await;
                    retried = true;
                }
                StatusCode::UNAUTHORIZED => return Err(Error::CloudAuthExpired),
                StatusCode::TOO_MANY_REQUESTS => {
                    let retry_after_secs = resp
                        .headers()
                        .get(RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
                    warn!(url = %url, retry_after_secs, "cloud rate limit exceeded");
                    return Err(Error::RateLimited { retry_after_secs });
                }
                s if s.is_success() => {
                    let etag = resp
                        .headers()
                        .get(ETAG)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_owned);
                    let body = resp.text().await.map_err(Error::Transport)?;
                    let data = serde_json::from_str(&body).map_err(|e| Error::Deserialization {
                        message: e.to_string(),
                        body,
                    })?;
                    return Ok(Conditional::Fresh { data, etag });
                }
                s => {
                    let message = resp.text().await.unwrap_or_default();
                    return Err(Error::Cloud {
                        status: s.as_u16(),
                        message,
                    });
                }
            }
        }
    }

    fn record_rate_limit(&self, headers: &reqwest::header::HeaderMap) {
        let Some(info) = RateLimitInfo::from_headers(headers) else {
            return;
        };
        if info.is_high_usage() {
            warn!(
                remaining = info.remaining_calls,
                granted = info.granted_calls,
                usage_percent = info.usage_percent().unwrap_or_default(),
                "Tado API usage high"
            );
        }
        *self.rate_limit.lock().unwrap_or_else(PoisonError::into_inner) = Some(info);
    }
}

fn decode<T: DeserializeOwned>(value: serde_json::Value) -> Result<T, Error> {
    serde_json::from_value(value.clone()).map_err(|e| Error::Deserialization {
        message: e.to_string(),
        body: value.to_string(),
    })
}

fn decode_conditional<T: DeserializeOwned>(c: Conditional<serde_json::Value>) -> Result<Conditional<T>, Error> {
    Ok(match c {
        Conditional::NotModified => Conditional::NotModified,
        Conditional::Fresh { data, etag } => Conditional::Fresh {
            data: decode(data)?,
            etag,
        },
    })
}
