// ── Pairing session manager ──
//
// Produces an authenticated gateway session, either from a stored
// credential or by running the two-phase handshake with a setup code.
//
//   no credential ── code ──▶ phase 1 ──▶ checkpoint ──▶ phase 2 ──▶ paired
//   credential ─────────────▶ connect existing ───────────────────▶ paired
//
// Progress that succeeded is never thrown away: a phase-1 checkpoint
// outlives a phase-2 failure and is resumed as phase-2-only next time, and
// a credential that fails to connect is kept (the gateway may just be
// rebooting).

pub mod identity;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use tado_local_api::hap::{
    AccessorySession, ControllerIdentity, GatewayTransport, PairingChannel, PairingCredential,
    SetupCode,
};

use crate::config::GatewayTarget;
use crate::db::{Database, PairingCheckpoint};
use crate::error::CoreError;

/// Pause between closing and reopening the connection between phases.
const RECONNECT_PAUSE: Duration = Duration::from_millis(500);

/// One way of running the handshake. Gateway firmware differs in which
/// feature flags it accepts and whether it tolerates phase 2 on the
/// phase-1 connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeVariant {
    pub feature_flags: u8,
    pub reconnect_between_phases: bool,
}

/// Variants in the order they are tried.
pub const HANDSHAKE_VARIANTS: [HandshakeVariant; 4] = [
    HandshakeVariant { feature_flags: 0, reconnect_between_phases: false },
    HandshakeVariant { feature_flags: 1, reconnect_between_phases: false },
    HandshakeVariant { feature_flags: 0, reconnect_between_phases: true },
    HandshakeVariant { feature_flags: 1, reconnect_between_phases: true },
];

/// How a credential was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingPath {
    /// A stored credential was used.
    Existing,
    /// Phase 2 completed against a saved phase-1 checkpoint.
    Resumed,
    /// Both phases ran with the given variant.
    Fresh(HandshakeVariant),
}

/// Outcome of [`PairingManager::establish_session`].
pub struct EstablishedSession {
    pub address: String,
    pub credential: PairingCredential,
    pub session: Arc<dyn AccessorySession>,
    pub path: PairingPath,
}

impl std::fmt::Debug for EstablishedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EstablishedSession")
            .field("address", &self.address)
            .field("credential", &self.credential)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Owns the controller identity and every pairing artifact.
#[derive(Clone)]
pub struct PairingManager {
    db: Database,
    transport: Arc<dyn GatewayTransport>,
}

impl PairingManager {
    pub fn new(db: Database, transport: Arc<dyn GatewayTransport>) -> Self {
        Self { db, transport }
    }

    pub async fn identity(&self) -> Result<ControllerIdentity, CoreError> {
        identity::load_or_create(&self.db).await
    }

    /// Pick the gateway address for `target`.
    ///
    /// An explicit address wins. Without one, the only stored pairing is
    /// used; several stored pairings is an error listing them.
    pub async fn resolve_address(&self, target: &GatewayTarget) -> Result<String, CoreError> {
        if let Some(address) = &target.address {
            return Ok(address.clone());
        }
        let mut pairings = self.db.list_pairings().await?;
        match pairings.len() {
            0 if target.setup_code.is_some() => Err(CoreError::AddressRequired),
            0 => Err(CoreError::NoPairings),
            1 => {
                let only = pairings.remove(0).gateway_address;
                info!(address = %only, "auto-selected the only stored pairing");
                Ok(only)
            }
            _ => Err(CoreError::MultiplePairings {
                addresses: pairings.into_iter().map(|p| p.gateway_address).collect(),
            }),
        }
    }

    /// Apply `target` up to the point of connecting: clear stored
    /// pairings when asked, then resolve the gateway address.
    pub async fn select_gateway(&self, target: &GatewayTarget) -> Result<String, CoreError> {
        if target.clear_pairings {
            let removed = self.db.clear_pairings(None).await?;
            info!(removed, "cleared stored pairings");
        }
        self.resolve_address(target).await
    }

    /// Connect to `address`, pairing first when no credential is stored.
    pub async fn establish_session(
        &self,
        address: &str,
        setup_code: Option<&SetupCode>,
    ) -> Result<EstablishedSession, CoreError> {
        if let Some(credential) = self.db.load_pairing(address).await? {
            if setup_code.is_some() {
                info!(%address, "stored pairing found; ignoring setup code");
            }
            let session = self.connect_existing(&credential).await?;
            return Ok(EstablishedSession {
                address: address.to_owned(),
                credential,
                session,
                path: PairingPath::Existing,
            });
        }

        let code = setup_code.ok_or_else(|| CoreError::PinRequired {
            address: address.to_owned(),
        })?;
        let (credential, path) = self.pair(address, code).await?;
        let session = self.connect_existing(&credential).await?;
        Ok(EstablishedSession {
            address: address.to_owned(),
            credential,
            session,
            path,
        })
    }

    /// Connect with a stored credential. Failures leave the credential in
    /// place.
    pub async fn connect_existing(
        &self,
        credential: &PairingCredential,
    ) -> Result<Arc<dyn AccessorySession>, CoreError> {
        match self.transport.connect(credential).await {
            Ok(session) => {
                debug!(address = %credential.gateway_address, "session established");
                Ok(session)
            }
            Err(e) => {
                warn!(
                    address = %credential.gateway_address,
                    error = %e,
                    "connection with stored pairing failed; keeping the pairing"
                );
                Err(e.into())
            }
        }
    }

    // ── Handshake ────────────────────────────────────────────────────

    /// Run the handshake and store the resulting credential.
    ///
    /// A matching phase-1 checkpoint is resumed first. Otherwise each
    /// variant is tried in order until one completes.
    pub async fn pair(
        &self,
        address: &str,
        code: &SetupCode,
    ) -> Result<(PairingCredential, PairingPath), CoreError> {
        let identity = self.identity().await?;

        if let Some(checkpoint) = self.db.load_checkpoint(address).await? {
            if checkpoint.controller_id == identity.id() {
                info!(%address, "resuming pairing from saved phase 1");
                match self.resume_phase2(address, code, &identity, &checkpoint).await {
                    Ok(credential) => {
                        self.finish(&credential).await?;
                        return Ok((credential, PairingPath::Resumed));
                    }
                    Err(e @ (CoreError::InvalidPin { .. } | CoreError::PairingUnavailable)) => {
                        return Err(e);
                    }
                    Err(e) => warn!(%address, error = %e, "resume failed; starting fresh pairing"),
                }
            } else {
                debug!(%address, "checkpoint belongs to another controller identity; ignoring");
            }
        }

        let mut last_error = None;
        for variant in HANDSHAKE_VARIANTS {
            debug!(%address, ?variant, "trying handshake variant");
            match self.pair_with_variant(address, code, &identity, variant).await {
                Ok(credential) => {
                    info!(
                        %address,
                        feature_flags = variant.feature_flags,
                        reconnect_between_phases = variant.reconnect_between_phases,
                        "pairing succeeded"
                    );
                    self.finish(&credential).await?;
                    return Ok((credential, PairingPath::Fresh(variant)));
                }
                // The slot is taken or the code is wrong: no variant helps.
                Err(e @ (CoreError::PairingUnavailable | CoreError::InvalidPin { .. })) => return Err(e),
                Err(e) => {
                    warn!(%address, ?variant, error = %e, "handshake variant failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| CoreError::PairingPhaseFailed {
            phase: 1,
            reason: "no handshake variant available".into(),
        }))
    }

    async fn pair_with_variant(
        &self,
        address: &str,
        code: &SetupCode,
        identity: &ControllerIdentity,
        variant: HandshakeVariant,
    ) -> Result<PairingCredential, CoreError> {
        let mut channel = self.transport.open(address).await?;
        let transcript = match channel.pair_phase1(variant.feature_flags).await {
            Ok(t) => t,
            Err(e) => {
                channel.close().await;
                return Err(phase_error(1, e));
            }
        };

        self.db
            .save_checkpoint(&PairingCheckpoint {
                gateway_address: address.to_owned(),
                controller_id: identity.id(),
                phase: 1,
                transcript: transcript.clone(),
                created_at: Utc::now(),
            })
            .await?;
        debug!(%address, "phase 1 complete; checkpoint saved");

        if variant.reconnect_between_phases {
            channel.close().await;
            tokio::time::sleep(RECONNECT_PAUSE).await;
            channel = self.transport.open(address).await?;
        }

        let result = channel.pair_phase2(code, identity, &transcript).await;
        channel.close().await;
        result.map_err(|e| phase_error(2, e))
    }

    async fn resume_phase2(
        &self,
        address: &str,
        code: &SetupCode,
        identity: &ControllerIdentity,
        checkpoint: &PairingCheckpoint,
    ) -> Result<PairingCredential, CoreError> {
        let mut channel: Box<dyn PairingChannel> = self.transport.open(address).await?;
        let result = channel.pair_phase2(code, identity, &checkpoint.transcript).await;
        channel.close().await;
        result.map_err(|e| phase_error(2, e))
    }

    async fn finish(&self, credential: &PairingCredential) -> Result<(), CoreError> {
        self.db.save_pairing(credential).await?;
        self.db.delete_checkpoint(&credential.gateway_address).await?;
        Ok(())
    }
}

/// Tag protocol failures with the phase they happened in.
fn phase_error(phase: u8, err: tado_local_api::Error) -> CoreError {
    match CoreError::from(err) {
        CoreError::PairingPhaseFailed { reason, .. } => CoreError::PairingPhaseFailed { phase, reason },
        other => other,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tado_local_api::hap::mock::{DEFAULT_SETUP_CODE, MockGateway, thermostat_accessory};

    async fn setup() -> (Database, MockGateway, PairingManager) {
        let db = Database::in_memory().await.unwrap();
        let gateway = MockGateway::new(vec![thermostat_accessory(2, "RU001", "Kitchen")]);
        let manager = PairingManager::new(db.clone(), Arc::new(gateway.clone()));
        (db, gateway, manager)
    }

    fn code() -> SetupCode {
        DEFAULT_SETUP_CODE.parse().unwrap()
    }

    #[tokio::test]
    async fn fresh_pairing_stores_credential_and_clears_checkpoint() {
        let (db, gateway, manager) = setup().await;
        let established = manager.establish_session("10.0.0.2", Some(&code())).await.unwrap();

        assert_eq!(established.path, PairingPath::Fresh(HANDSHAKE_VARIANTS[0]));
        assert!(db.load_pairing("10.0.0.2").await.unwrap().is_some());
        assert!(db.load_checkpoint("10.0.0.2").await.unwrap().is_none());
        assert_eq!(gateway.connect_calls(), 1);
    }

    #[tokio::test]
    async fn variants_are_tried_in_order() {
        let (_db, gateway, manager) = setup().await;
        gateway.require_feature_flags(1);

        let (_, path) = manager.pair("10.0.0.2", &code()).await.unwrap();
        assert_eq!(path, PairingPath::Fresh(HANDSHAKE_VARIANTS[1]));
        assert_eq!(gateway.phase1_calls(), vec![0, 1]);
    }

    #[tokio::test]
    async fn unavailable_gateway_stops_immediately() {
        let (db, gateway, manager) = setup().await;
        gateway.set_unavailable(true);

        let err = manager.pair("10.0.0.2", &code()).await.unwrap_err();
        assert!(matches!(err, CoreError::PairingUnavailable));
        assert_eq!(gateway.phase1_calls().len(), 1);
        assert!(db.load_checkpoint("10.0.0.2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn phase2_failure_keeps_checkpoint_and_resume_skips_phase1() {
        let (db, gateway, manager) = setup().await;
        gateway.fail_next_phase2(HANDSHAKE_VARIANTS.len());

        let err = manager.pair("10.0.0.2", &code()).await.unwrap_err();
        assert!(matches!(err, CoreError::PairingPhaseFailed { phase: 2, .. }), "got {err:?}");
        let checkpoint = db.load_checkpoint("10.0.0.2").await.unwrap().unwrap();
        let phase1_before = gateway.phase1_calls().len();

        let (_, path) = manager.pair("10.0.0.2", &code()).await.unwrap();
        assert_eq!(path, PairingPath::Resumed);
        assert_eq!(gateway.phase1_calls().len(), phase1_before);
        assert_eq!(gateway.phase2_transcripts().last(), Some(&checkpoint.transcript));
        assert!(db.load_checkpoint("10.0.0.2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn wrong_code_is_reported_without_trying_every_variant() {
        let (db, gateway, manager) = setup().await;
        let wrong: SetupCode = "111-11-111".parse().unwrap();

        let err = manager.pair("10.0.0.2", &wrong).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidPin { .. }));
        assert_eq!(gateway.phase1_calls().len(), 1);
        // Phase 1 succeeded, so its checkpoint stays for a retry.
        assert!(db.load_checkpoint("10.0.0.2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn failed_connect_keeps_stored_credential() {
        let (db, gateway, manager) = setup().await;
        db.save_pairing(&PairingCredential {
            gateway_address: "10.0.0.2".into(),
            data: serde_json::json!({"AccessoryPairingID": "MOCK-GATEWAY"}),
        })
        .await
        .unwrap();
        gateway.fail_next_connects(1);

        let err = manager.establish_session("10.0.0.2", None).await.unwrap_err();
        assert!(err.is_transient());
        assert!(db.load_pairing("10.0.0.2").await.unwrap().is_some());

        let established = manager.establish_session("10.0.0.2", None).await.unwrap();
        assert_eq!(established.path, PairingPath::Existing);
    }

    #[tokio::test]
    async fn missing_credential_without_code_needs_pin() {
        let (_db, _gateway, manager) = setup().await;
        let err = manager.establish_session("10.0.0.2", None).await.unwrap_err();
        assert!(matches!(err, CoreError::PinRequired { .. }));
    }

    #[tokio::test]
    async fn address_resolution() {
        let (db, _gateway, manager) = setup().await;
        let target = GatewayTarget::default();
        assert!(matches!(manager.resolve_address(&target).await, Err(CoreError::NoPairings)));

        let with_code = GatewayTarget {
            setup_code: Some(code()),
            ..GatewayTarget::default()
        };
        assert!(matches!(manager.resolve_address(&with_code).await, Err(CoreError::AddressRequired)));

        for addr in ["10.0.0.2", "10.0.0.3"] {
            db.save_pairing(&PairingCredential {
                gateway_address: addr.into(),
                data: serde_json::json!({}),
            })
            .await
            .unwrap();
            if addr == "10.0.0.2" {
                assert_eq!(manager.resolve_address(&target).await.unwrap(), "10.0.0.2");
            }
        }
        match manager.resolve_address(&target).await {
            Err(CoreError::MultiplePairings { addresses }) => assert_eq!(addresses.len(), 2),
            other => panic!("expected MultiplePairings, got {other:?}"),
        }

        let cleared = GatewayTarget {
            clear_pairings: true,
            ..GatewayTarget::default()
        };
        assert!(matches!(manager.select_gateway(&cleared).await, Err(CoreError::NoPairings)));
        assert!(db.list_pairings().await.unwrap().is_empty());

        let cleared_with_address = GatewayTarget {
            address: Some("10.0.0.4".into()),
            clear_pairings: true,
            ..GatewayTarget::default()
        };
        assert_eq!(manager.select_gateway(&cleared_with_address).await.unwrap(), "10.0.0.4");
    }
}
