// Accessory metadata cache, cloud response cache and the rotated cloud
// refresh token. Everything here is safe to delete.

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use sqlx::FromRow;

use tado_local_api::hap::{Accessory, DiscoveryInfo};

use super::{Database, from_db_int, to_db_int};
use crate::error::CoreError;

/// Cached accessory tree for one paired identity.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessoryCacheEntry {
    pub identity_key: String,
    pub discovery: DiscoveryInfo,
    pub accessories: Vec<Accessory>,
    pub updated_at: DateTime<Utc>,
}

/// Cached cloud response body with its validator.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudCacheEntry {
    pub endpoint: String,
    pub body: serde_json::Value,
    pub etag: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl CloudCacheEntry {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

#[derive(FromRow)]
struct AccessoryCacheRow {
    identity_key: String,
    config_version: Option<i64>,
    state_number: Option<i64>,
    broadcast_key: Option<String>,
    accessories: String,
    updated_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct CloudCacheRow {
    endpoint: String,
    body: String,
    etag: Option<String>,
    expires_at: DateTime<Utc>,
}

impl Database {
    // ── Accessory metadata ───────────────────────────────────────────

    pub async fn load_accessory_cache(&self, identity_key: &str) -> Result<Option<AccessoryCacheEntry>, CoreError> {
        let row: Option<AccessoryCacheRow> = sqlx::query_as(
            "SELECT identity_key, config_version, state_number, broadcast_key, accessories, updated_at
             FROM accessory_cache WHERE identity_key = ?",
        )
        .bind(identity_key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            Ok(AccessoryCacheEntry {
                discovery: DiscoveryInfo {
                    config_version: from_db_int(r.config_version),
                    state_number: from_db_int(r.state_number),
                    broadcast_key: r.broadcast_key,
                },
                accessories: serde_json::from_str(&r.accessories)?,
                identity_key: r.identity_key,
                updated_at: r.updated_at,
            })
        })
        .transpose()
    }

    pub async fn save_accessory_cache(
        &self,
        identity_key: &str,
        discovery: &DiscoveryInfo,
        accessories: &[Accessory],
    ) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO accessory_cache
                (identity_key, config_version, state_number, broadcast_key, accessories, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(identity_key)
        .bind(discovery.config_version.and_then(to_db_int))
        .bind(discovery.state_number.and_then(to_db_int))
        .bind(&discovery.broadcast_key)
        .bind(serde_json::to_string(accessories)?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_accessory_cache(&self, identity_key: &str) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM accessory_cache WHERE identity_key = ?")
            .bind(identity_key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Cloud responses ──────────────────────────────────────────────

    pub async fn load_cloud_cache(&self, endpoint: &str) -> Result<Option<CloudCacheEntry>, CoreError> {
        let row: Option<CloudCacheRow> = sqlx::query_as(
            "SELECT endpoint, body, etag, expires_at FROM cloud_cache WHERE endpoint = ?",
        )
        .bind(endpoint)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            Ok(CloudCacheEntry {
                body: serde_json::from_str(&r.body)?,
                endpoint: r.endpoint,
                etag: r.etag,
                expires_at: r.expires_at,
            })
        })
        .transpose()
    }

    pub async fn save_cloud_cache(&self, entry: &CloudCacheEntry) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO cloud_cache (endpoint, body, etag, expires_at, updated_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&entry.endpoint)
        .bind(serde_json::to_string(&entry.body)?)
        .bind(&entry.etag)
        .bind(entry.expires_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Extend an entry's freshness after a 304.
    pub async fn touch_cloud_cache(&self, endpoint: &str, expires_at: DateTime<Utc>) -> Result<(), CoreError> {
        sqlx::query("UPDATE cloud_cache SET expires_at = ?, updated_at = ? WHERE endpoint = ?")
            .bind(expires_at)
            .bind(Utc::now())
            .bind(endpoint)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Cloud refresh token ──────────────────────────────────────────

    pub async fn load_refresh_token(&self) -> Result<Option<SecretString>, CoreError> {
        let token: Option<String> = sqlx::query_scalar("SELECT refresh_token FROM cloud_tokens WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(token.map(SecretString::from))
    }

    pub async fn save_refresh_token(&self, token: &SecretString) -> Result<(), CoreError> {
        sqlx::query("INSERT OR REPLACE INTO cloud_tokens (id, refresh_token, updated_at) VALUES (1, ?, ?)")
            .bind(token.expose_secret())
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tado_local_api::hap::mock::thermostat_accessory;

    #[tokio::test]
    async fn accessory_cache_round_trips_tree() {
        let db = Database::in_memory().await.unwrap();
        assert!(db.load_accessory_cache("GW").await.unwrap().is_none());

        let discovery = DiscoveryInfo {
            config_version: Some(4),
            ..DiscoveryInfo::default()
        };
        let tree = vec![thermostat_accessory(2, "RU001", "Kitchen")];
        db.save_accessory_cache("GW", &discovery, &tree).await.unwrap();

        let entry = db.load_accessory_cache("GW").await.unwrap().unwrap();
        assert_eq!(entry.discovery.config_version, Some(4));
        assert_eq!(entry.accessories, tree);

        db.delete_accessory_cache("GW").await.unwrap();
        assert!(db.load_accessory_cache("GW").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cloud_cache_touch_extends_expiry() {
        let db = Database::in_memory().await.unwrap();
        let now = Utc::now();
        let entry = CloudCacheEntry {
            endpoint: "zones".into(),
            body: serde_json::json!([]),
            etag: Some("\"v1\"".into()),
            expires_at: now,
        };
        db.save_cloud_cache(&entry).await.unwrap();
        assert!(!db.load_cloud_cache("zones").await.unwrap().unwrap().is_fresh(now));

        db.touch_cloud_cache("zones", now + chrono::Duration::hours(1)).await.unwrap();
        let entry = db.load_cloud_cache("zones").await.unwrap().unwrap();
        assert!(entry.is_fresh(now));
        assert_eq!(entry.etag.as_deref(), Some("\"v1\""));
    }

    #[tokio::test]
    async fn refresh_token_is_replaced() {
        let db = Database::in_memory().await.unwrap();
        db.save_refresh_token(&SecretString::from("a".to_string())).await.unwrap();
        db.save_refresh_token(&SecretString::from("b".to_string())).await.unwrap();
        assert_eq!(db.load_refresh_token().await.unwrap().unwrap().expose_secret(), "b");
    }
}
