//! Gateway transport capability.
//!
//! The core never speaks the pairing protocol or the encrypted session
//! itself. It consumes these traits: a [`GatewayTransport`] opens
//! [`PairingChannel`]s for the two-phase handshake and connects
//! [`AccessorySession`]s from stored credentials. [`relay`] implements them
//! over a local HAP relay socket; `mock` (feature `test-util`) implements
//! them in memory.

pub mod identity;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod relay;
pub mod types;
pub mod uuid;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Error;

pub use identity::{ControllerIdentity, SetupCode};
pub use types::{
    Accessory, Characteristic, CharacteristicId, CharacteristicReading, CharacteristicWrite,
    DiscoveryInfo, PairingCredential, Phase1Transcript, PushEvent, Service,
};

/// Factory for pairing channels and authenticated sessions.
#[async_trait]
pub trait GatewayTransport: Send + Sync {
    /// Open an unauthenticated connection for pairing.
    async fn open(&self, address: &str) -> Result<Box<dyn PairingChannel>, Error>;

    /// Connect an authenticated session from a stored credential.
    async fn connect(&self, credential: &PairingCredential)
    -> Result<Arc<dyn AccessorySession>, Error>;
}

/// One unauthenticated connection running the two-phase handshake.
#[async_trait]
pub trait PairingChannel: Send {
    /// Phase 1: request the accessory's salt and public value.
    ///
    /// Returns [`Error::PairingUnavailable`] when the accessory already has
    /// a controller in its single pairing slot.
    async fn pair_phase1(&mut self, feature_flags: u8) -> Result<Phase1Transcript, Error>;

    /// Phase 2: prove knowledge of the setup code against a phase-1
    /// transcript and exchange long-term keys.
    ///
    /// The transcript may come from an earlier connection.
    async fn pair_phase2(
        &mut self,
        setup_code: &SetupCode,
        identity: &ControllerIdentity,
        transcript: &Phase1Transcript,
    ) -> Result<PairingCredential, Error>;

    /// Drop the underlying connection.
    async fn close(&mut self);
}

/// An authenticated, encrypted session with the gateway.
///
/// Shared by the push listener, both poll loops and the write path, so
/// every method takes `&self`. Implementations serialize requests on the
/// wire themselves.
#[async_trait]
pub trait AccessorySession: Send + Sync {
    /// Configuration hints used to validate the accessory metadata cache.
    async fn discovery(&self) -> Result<DiscoveryInfo, Error>;

    /// Enumerate the full accessory database.
    async fn accessories(&self) -> Result<Vec<Accessory>, Error>;

    /// Enable events for `ids`. The returned receiver ends when the
    /// session is lost or closed.
    async fn subscribe(&self, ids: &[CharacteristicId]) -> Result<mpsc::Receiver<PushEvent>, Error>;

    /// Disable events for `ids`.
    async fn unsubscribe(&self, ids: &[CharacteristicId]) -> Result<(), Error>;

    /// Read the current values of `ids`.
    async fn read(&self, ids: &[CharacteristicId]) -> Result<Vec<CharacteristicReading>, Error>;

    /// Write values. Fails with [`Error::WriteRejected`] on a per-value
    /// HAP error status.
    async fn write(&self, writes: &[CharacteristicWrite]) -> Result<(), Error>;

    /// Token cancelled when the connection drops.
    fn lost(&self) -> CancellationToken;

    /// Close the session. Idempotent.
    async fn close(&self);
}
