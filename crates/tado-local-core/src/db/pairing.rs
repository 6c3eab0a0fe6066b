// Identity, pairing credentials and phase-1 checkpoints.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use tado_local_api::hap::{ControllerIdentity, PairingCredential, Phase1Transcript};

use super::Database;
use crate::error::CoreError;

/// Progress saved after a successful phase 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingCheckpoint {
    pub gateway_address: String,
    pub controller_id: Uuid,
    /// Last completed phase.
    pub phase: u8,
    pub transcript: Phase1Transcript,
    pub created_at: DateTime<Utc>,
}

/// Summary of a stored credential.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, serde::Serialize)]
pub struct StoredPairing {
    pub gateway_address: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct IdentityRow {
    controller_id: String,
    secret_key: Vec<u8>,
    created_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct CheckpointRow {
    gateway_address: String,
    controller_id: String,
    phase: i64,
    salt: String,
    public_key: String,
    created_at: DateTime<Utc>,
}

fn parse_uuid(raw: &str) -> Result<Uuid, CoreError> {
    Uuid::parse_str(raw).map_err(|e| CoreError::Storage {
        message: format!("corrupt controller id {raw:?}: {e}"),
    })
}

impl Database {
    // ── Controller identity ──────────────────────────────────────────

    pub async fn load_identity(&self) -> Result<Option<ControllerIdentity>, CoreError> {
        let row: Option<IdentityRow> = sqlx::query_as(
            "SELECT controller_id, secret_key, created_at FROM controller_identity WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            let id = parse_uuid(&r.controller_id)?;
            ControllerIdentity::from_parts(id, &r.secret_key, r.created_at).map_err(|e| {
                CoreError::Storage {
                    message: format!("corrupt controller identity: {e}"),
                }
            })
        })
        .transpose()
    }

    /// Store `identity` unless one already exists. Returns whichever is
    /// stored afterwards, so the identity never changes once written.
    pub async fn insert_identity(&self, identity: &ControllerIdentity) -> Result<ControllerIdentity, CoreError> {
        sqlx::query(
            "INSERT INTO controller_identity (id, controller_id, secret_key, public_key, created_at)
             VALUES (1, ?, ?, ?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(identity.id().to_string())
        .bind(identity.secret_bytes().to_vec())
        .bind(identity.public_bytes().to_vec())
        .bind(identity.created_at())
        .execute(&self.pool)
        .await?;

        self.load_identity().await?.ok_or_else(|| CoreError::Storage {
            message: "controller identity vanished after insert".into(),
        })
    }

    // ── Pairing credentials ──────────────────────────────────────────

    pub async fn load_pairing(&self, address: &str) -> Result<Option<PairingCredential>, CoreError> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT credential FROM pairings WHERE gateway_address = ?")
                .bind(address)
                .fetch_optional(&self.pool)
                .await?;
        raw.map(|raw| {
            Ok(PairingCredential {
                gateway_address: address.to_owned(),
                data: serde_json::from_str(&raw)?,
            })
        })
        .transpose()
    }

    /// Insert or overwrite the credential for its gateway address.
    pub async fn save_pairing(&self, credential: &PairingCredential) -> Result<(), CoreError> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO pairings (gateway_address, credential, created_at, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(gateway_address) DO UPDATE SET
                credential = excluded.credential,
                updated_at = excluded.updated_at",
        )
        .bind(&credential.gateway_address)
        .bind(serde_json::to_string(&credential.data)?)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_pairings(&self) -> Result<Vec<StoredPairing>, CoreError> {
        Ok(sqlx::query_as(
            "SELECT gateway_address, created_at, updated_at FROM pairings ORDER BY gateway_address",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    /// Delete one credential, or all of them when `address` is `None`.
    /// Pending checkpoints go with them. Returns the number removed.
    pub async fn clear_pairings(&self, address: Option<&str>) -> Result<u64, CoreError> {
        let removed = match address {
            Some(address) => {
                sqlx::query("DELETE FROM pairing_sessions WHERE gateway_address = ?")
                    .bind(address)
                    .execute(&self.pool)
                    .await?;
                sqlx::query("DELETE FROM pairings WHERE gateway_address = ?")
                    .bind(address)
                    .execute(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("DELETE FROM pairing_sessions")
                    .execute(&self.pool)
                    .await?;
                sqlx::query("DELETE FROM pairings").execute(&self.pool).await?
            }
        };
        Ok(removed.rows_affected())
    }

    // ── Phase-1 checkpoints ──────────────────────────────────────────

    pub async fn load_checkpoint(&self, address: &str) -> Result<Option<PairingCheckpoint>, CoreError> {
        let row: Option<CheckpointRow> = sqlx::query_as(
            "SELECT gateway_address, controller_id, phase, salt, public_key, created_at
             FROM pairing_sessions WHERE gateway_address = ?",
        )
        .bind(address)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            Ok(PairingCheckpoint {
                controller_id: parse_uuid(&r.controller_id)?,
                phase: u8::try_from(r.phase).unwrap_or(0),
                transcript: Phase1Transcript {
                    salt: r.salt,
                    public_key: r.public_key,
                },
                gateway_address: r.gateway_address,
                created_at: r.created_at,
            })
        })
        .transpose()
    }

    /// Save a checkpoint, replacing any earlier one for the same address.
    pub async fn save_checkpoint(&self, checkpoint: &PairingCheckpoint) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO pairing_sessions
                (gateway_address, controller_id, phase, salt, public_key, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&checkpoint.gateway_address)
        .bind(checkpoint.controller_id.to_string())
        .bind(i64::from(checkpoint.phase))
        .bind(&checkpoint.transcript.salt)
        .bind(&checkpoint.transcript.public_key)
        .bind(checkpoint.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_checkpoint(&self, address: &str) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM pairing_sessions WHERE gateway_address = ?")
            .bind(address)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn identity_is_written_once() {
        let db = Database::in_memory().await.unwrap();
        assert!(db.load_identity().await.unwrap().is_none());

        let first = ControllerIdentity::generate();
        let stored = db.insert_identity(&first).await.unwrap();
        assert_eq!(stored.id(), first.id());

        let second = ControllerIdentity::generate();
        let stored = db.insert_identity(&second).await.unwrap();
        assert_eq!(stored.id(), first.id());
        assert_eq!(stored.public_bytes(), first.public_bytes());
    }

    #[tokio::test]
    async fn pairing_overwrites_per_address() {
        let db = Database::in_memory().await.unwrap();
        let mut cred = PairingCredential {
            gateway_address: "10.0.0.2".into(),
            data: json!({"AccessoryPairingID": "A"}),
        };
        db.save_pairing(&cred).await.unwrap();
        cred.data = json!({"AccessoryPairingID": "B"});
        db.save_pairing(&cred).await.unwrap();

        let loaded = db.load_pairing("10.0.0.2").await.unwrap().unwrap();
        assert_eq!(loaded.data["AccessoryPairingID"], "B");
        assert_eq!(db.list_pairings().await.unwrap().len(), 1);
        assert!(db.load_pairing("10.0.0.3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn at_most_one_checkpoint_per_address() {
        let db = Database::in_memory().await.unwrap();
        let mut cp = PairingCheckpoint {
            gateway_address: "10.0.0.2".into(),
            controller_id: Uuid::new_v4(),
            phase: 1,
            transcript: Phase1Transcript {
                salt: "s1".into(),
                public_key: "p1".into(),
            },
            created_at: Utc::now(),
        };
        db.save_checkpoint(&cp).await.unwrap();
        cp.transcript.salt = "s2".into();
        db.save_checkpoint(&cp).await.unwrap();

        let loaded = db.load_checkpoint("10.0.0.2").await.unwrap().unwrap();
        assert_eq!(loaded.transcript.salt, "s2");
        assert_eq!(loaded.controller_id, cp.controller_id);

        db.delete_checkpoint("10.0.0.2").await.unwrap();
        assert!(db.load_checkpoint("10.0.0.2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clear_pairings_by_address_or_all() {
        let db = Database::in_memory().await.unwrap();
        for addr in ["10.0.0.2", "10.0.0.3"] {
            db.save_pairing(&PairingCredential {
                gateway_address: addr.into(),
                data: json!({}),
            })
            .await
            .unwrap();
        }
        assert_eq!(db.clear_pairings(Some("10.0.0.2")).await.unwrap(), 1);
        assert_eq!(db.clear_pairings(None).await.unwrap(), 1);
        assert!(db.list_pairings().await.unwrap().is_empty());
    }
}
