// ── Controller identity store ──
//
// The controller's long-term key pair is created lazily on first use and
// never rotated. Every pairing made by this process uses it, which is what
// lets a phase-1 checkpoint be resumed after a restart.

use tracing::info;

use tado_local_api::hap::ControllerIdentity;

use crate::db::Database;
use crate::error::CoreError;

/// Load the stored controller identity, creating it on first run.
pub async fn load_or_create(db: &Database) -> Result<ControllerIdentity, CoreError> {
    if let Some(identity) = db.load_identity().await? {
        return Ok(identity);
    }
    let identity = db.insert_identity(&ControllerIdentity::generate()).await?;
    info!(controller_id = %identity.id(), "created controller identity");
    Ok(identity)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn identity_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");

        let db = Database::open(&path).await.unwrap();
        let first = load_or_create(&db).await.unwrap();
        db.close().await;

        let db = Database::open(&path).await.unwrap();
        let second = load_or_create(&db).await.unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(first.secret_bytes(), second.secret_bytes());
        assert_eq!(first.created_at().timestamp(), second.created_at().timestamp());
    }
}
