// Tado cloud rate-limit headers.
//
//   ratelimit-policy: "perday";q=100;w=86400   (quota, window seconds)
//   ratelimit:        "perday";r=95;t=3600     (remaining, seconds to reset)

use chrono::{DateTime, Duration, Utc};
use reqwest::header::HeaderMap;
use serde::Serialize;

/// Usage above this share of the quota is logged as a warning.
pub const HIGH_USAGE_PERCENT: f64 = 80.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RateLimitInfo {
    pub granted_calls: Option<u32>,
    pub remaining_calls: Option<u32>,
    pub period_secs: Option<u32>,
    pub resets_at: Option<DateTime<Utc>>,
}

impl RateLimitInfo {
    /// Parse both headers. Returns `None` unless both are present.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let policy = headers.get("ratelimit-policy")?.to_str().ok()?;
        let limit = headers.get("ratelimit")?.to_str().ok()?;
        Some(Self::parse(policy, limit, Utc::now()))
    }

    fn parse(policy: &str, limit: &str, now: DateTime<Utc>) -> Self {
        let reset = param(limit, "t");
        Self {
            granted_calls: param(policy, "q"),
            period_secs: param(policy, "w"),
            remaining_calls: param(limit, "r"),
            resets_at: reset.map(|t| now + Duration::seconds(i64::from(t))),
        }
    }

    /// Percentage of the quota already used, when both numbers are known.
    pub fn usage_percent(&self) -> Option<f64> {
        let granted = self.granted_calls.filter(|g| *g > 0)?;
        let remaining = self.remaining_calls?;
        Some((1.0 - f64::from(remaining) / f64::from(granted)) * 100.0)
    }

    pub fn is_high_usage(&self) -> bool {
        self.usage_percent().is_some_and(|p| p > HIGH_USAGE_PERCENT)
    }
}

/// Extract `key=<int>` from a `;`-separated structured header.
fn param(header: &str, key: &str) -> Option<u32> {
    header.split(';').find_map(|part| {
        let (k, v) = part.trim().trim_matches('"').split_once('=')?;
        (k.trim() == key).then(|| v.trim().parse().ok()).flatten()
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn parses_policy_and_remaining() {
        let now = Utc::now();
        let info = RateLimitInfo::parse(r#""perday";q=100;w=86400"#, r#""perday";r=95;t=3600"#, now);
        assert_eq!(info.granted_calls, Some(100));
        assert_eq!(info.period_secs, Some(86400));
        assert_eq!(info.remaining_calls, Some(95));
        assert_eq!(info.resets_at, Some(now + Duration::seconds(3600)));
        assert!(!info.is_high_usage());
    }

    #[test]
    fn high_usage_above_eighty_percent() {
        let info = RateLimitInfo::parse(r#""perday";q=100;w=86400"#, r#""perday";r=15"#, Utc::now());
        assert!(info.is_high_usage());
        assert!(info.resets_at.is_none());
    }

    #[test]
    fn missing_header_yields_none() {
        let mut headers = HeaderMap::new();
        headers.insert("ratelimit-policy", HeaderValue::from_static(r#""perday";q=100;w=86400"#));
        assert!(RateLimitInfo::from_headers(&headers).is_none());

        headers.insert("ratelimit", HeaderValue::from_static(r#""perday";r=1"#));
        let info = RateLimitInfo::from_headers(&headers).unwrap();
        assert_eq!(info.remaining_calls, Some(1));
    }

    #[test]
    fn garbage_values_are_ignored() {
        let info = RateLimitInfo::parse(r#""perday";q=abc"#, "r=", Utc::now());
        assert_eq!(info.granted_calls, None);
        assert_eq!(info.usage_percent(), None);
    }
}
