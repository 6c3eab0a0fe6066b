// Controller identity and setup codes.
//
// The controller identity is the long-term Ed25519 key pair this process
// presents to the gateway in phase 2 of pairing. Key generation comes from
// ed25519-dalek; the handshake math itself lives behind the transport.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use uuid::Uuid;

use crate::error::Error;

/// Long-lived key pair identifying this controller to the gateway.
#[derive(Clone)]
pub struct ControllerIdentity {
    id: Uuid,
    signing_key: SigningKey,
    created_at: DateTime<Utc>,
}

impl ControllerIdentity {
    /// Generate a fresh identity with a random pairing id.
    pub fn generate() -> Self {
        Self {
            id: Uuid::new_v4(),
            signing_key: SigningKey::generate(&mut OsRng),
            created_at: Utc::now(),
        }
    }

    /// Rebuild an identity from persisted parts.
    pub fn from_parts(id: Uuid, secret_key: &[u8], created_at: DateTime<Utc>) -> Result<Self, Error> {
        let bytes: [u8; 32] = secret_key.try_into().map_err(|_| Error::PairingProtocol {
            message: format!("controller key must be 32 bytes, got {}", secret_key.len()),
        })?;
        Ok(Self {
            id,
            signing_key: SigningKey::from_bytes(&bytes),
            created_at,
        })
    }

    /// Pairing identifier sent to the accessory (uppercase UUID).
    pub fn pairing_id(&self) -> String {
        self.id.as_hyphenated().to_string().to_uppercase()
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Raw 32-byte secret key, for persistence only.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Raw 32-byte public key.
    pub fn public_bytes(&self) -> [u8; 32] {
        self.verifying_key().to_bytes()
    }
}

impl fmt::Debug for ControllerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerIdentity")
            .field("id", &self.id)
            .field("public_key", &hex(&self.public_bytes()))
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Lowercase hex encoding.
pub fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

// ── Setup code ───────────────────────────────────────────────────────

/// HomeKit setup code in canonical `XXX-XX-XXX` form.
#[derive(Clone, PartialEq, Eq)]
pub struct SetupCode(String);

impl SetupCode {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for SetupCode {
    type Err = Error;

    /// Accepts `XXX-XX-XXX` or eight bare digits.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let digits: String = s.chars().filter(char::is_ascii_digit).collect();
        let dashed_ok = s.len() == 10 && s.as_bytes()[3] == b'-' && s.as_bytes()[6] == b'-';
        let bare_ok = s.len() == 8;
        if digits.len() != 8 || !(dashed_ok || bare_ok) {
            return Err(Error::PairingAuthentication {
                message: "setup code must be in XXX-XX-XXX format".into(),
            });
        }
        Ok(Self(format!("{}-{}-{}", &digits[..3], &digits[3..5], &digits[5..])))
    }
}

impl fmt::Display for SetupCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for SetupCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SetupCode(***-**-***)")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn identity_round_trips_through_parts() {
        let identity = ControllerIdentity::generate();
        let restored = ControllerIdentity::from_parts(
            identity.id(),
            &identity.secret_bytes(),
            identity.created_at(),
        )
        .unwrap();
        assert_eq!(restored.public_bytes(), identity.public_bytes());
        assert_eq!(restored.pairing_id(), identity.pairing_id());
    }

    #[test]
    fn identity_rejects_short_key() {
        assert!(ControllerIdentity::from_parts(Uuid::new_v4(), &[0u8; 16], Utc::now()).is_err());
    }

    #[test]
    fn debug_does_not_leak_secret() {
        let identity = ControllerIdentity::generate();
        let debug = format!("{identity:?}");
        assert!(!debug.contains(&hex(&identity.secret_bytes())));
    }

    #[test]
    fn setup_code_formats() {
        assert_eq!("123-45-678".parse::<SetupCode>().unwrap().as_str(), "123-45-678");
        assert_eq!("12345678".parse::<SetupCode>().unwrap().as_str(), "123-45-678");
        assert!("1234-5-678".parse::<SetupCode>().is_err());
        assert!("123-45-67".parse::<SetupCode>().is_err());
        assert!("abc-de-fgh".parse::<SetupCode>().is_err());
    }
}
