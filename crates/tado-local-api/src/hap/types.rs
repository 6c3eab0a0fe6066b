// Wire types for the gateway's accessory database and characteristic I/O.
//
// Field names follow the HAP JSON representation (`aid`, `iid`, `perms`,
// `minValue`, ...) so the same structs deserialize relay responses and the
// cached entity tree stored by the core.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::uuid;

// ── Addressing ───────────────────────────────────────────────────────

/// Session-scoped address of one characteristic: accessory id + instance id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CharacteristicId {
    pub aid: u64,
    pub iid: u64,
}

impl CharacteristicId {
    pub fn new(aid: u64, iid: u64) -> Self {
        Self { aid, iid }
    }
}

impl fmt::Display for CharacteristicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.aid, self.iid)
    }
}

// ── Accessory database ───────────────────────────────────────────────

/// One accessory exposed by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Accessory {
    pub aid: u64,
    #[serde(default)]
    pub services: Vec<Service>,
}

/// A service grouping related characteristics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub iid: u64,
    #[serde(rename = "type")]
    pub service_type: String,
    #[serde(default)]
    pub primary: Option<bool>,
    #[serde(default)]
    pub characteristics: Vec<Characteristic>,
}

/// A single readable/writable/subscribable value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Characteristic {
    pub iid: u64,
    #[serde(rename = "type")]
    pub char_type: String,
    #[serde(default)]
    pub perms: Vec<String>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(rename = "minValue", default, skip_serializing_if = "Option::is_none")]
    pub min_value: Option<f64>,
    #[serde(rename = "maxValue", default, skip_serializing_if = "Option::is_none")]
    pub max_value: Option<f64>,
    #[serde(rename = "minStep", default, skip_serializing_if = "Option::is_none")]
    pub min_step: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

/// HAP permission flags as they appear in `perms`.
pub mod perms {
    pub const PAIRED_READ: &str = "pr";
    pub const PAIRED_WRITE: &str = "pw";
    pub const EVENTS: &str = "ev";
}

impl Accessory {
    /// Find the first service of a given type (short or long form).
    pub fn service(&self, service_type: &str) -> Option<&Service> {
        self.services
            .iter()
            .find(|s| uuid::same_type(&s.service_type, service_type))
    }

    /// Find a characteristic of `char_type` inside the service `service_type`.
    pub fn characteristic(&self, service_type: &str, char_type: &str) -> Option<&Characteristic> {
        self.service(service_type)?.characteristic(char_type)
    }

    /// String value of an AccessoryInformation characteristic.
    pub fn info_string(&self, char_type: &str) -> Option<&str> {
        self.characteristic(uuid::SERVICE_ACCESSORY_INFORMATION, char_type)?
            .value
            .as_ref()?
            .as_str()
    }

    /// Iterate every characteristic together with its address.
    pub fn characteristics(&self) -> impl Iterator<Item = (CharacteristicId, &Characteristic)> {
        self.services.iter().flat_map(move |s| {
            s.characteristics
                .iter()
                .map(move |c| (CharacteristicId::new(self.aid, c.iid), c))
        })
    }
}

impl Service {
    pub fn characteristic(&self, char_type: &str) -> Option<&Characteristic> {
        self.characteristics
            .iter()
            .find(|c| uuid::same_type(&c.char_type, char_type))
    }
}

impl Characteristic {
    pub fn has_perm(&self, perm: &str) -> bool {
        self.perms.iter().any(|p| p == perm)
    }

    pub fn is_readable(&self) -> bool {
        self.has_perm(perms::PAIRED_READ)
    }

    pub fn is_writable(&self) -> bool {
        self.has_perm(perms::PAIRED_WRITE)
    }

    pub fn supports_events(&self) -> bool {
        self.has_perm(perms::EVENTS)
    }
}

// ── Characteristic I/O ───────────────────────────────────────────────

/// One value returned by a read.
///
/// `value` is `None` when the gateway answered with a per-characteristic
/// error status or a JSON null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacteristicReading {
    pub aid: u64,
    pub iid: u64,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<i64>,
}

impl CharacteristicReading {
    pub fn id(&self) -> CharacteristicId {
        CharacteristicId::new(self.aid, self.iid)
    }
}

/// One value to write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacteristicWrite {
    pub aid: u64,
    pub iid: u64,
    pub value: serde_json::Value,
}

/// Unsolicited value change delivered by a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushEvent {
    pub aid: u64,
    pub iid: u64,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
}

impl PushEvent {
    pub fn id(&self) -> CharacteristicId {
        CharacteristicId::new(self.aid, self.iid)
    }
}

/// Hints a session exposes for the accessory metadata cache.
///
/// `config_version` is the gateway's configuration number (`c#`): while it
/// is unchanged the accessory database is unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryInfo {
    pub config_version: Option<u64>,
    pub state_number: Option<u64>,
    pub broadcast_key: Option<String>,
}

// ── Pairing artifacts ────────────────────────────────────────────────

/// Result of phase 1 of the handshake: the accessory's salt and public
/// value. Enough to run phase 2 later on a fresh connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase1Transcript {
    pub salt: String,
    pub public_key: String,
}

/// Long-term pairing material for one gateway.
///
/// `data` is opaque to everything but the transport that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairingCredential {
    pub gateway_address: String,
    pub data: serde_json::Value,
}

impl PairingCredential {
    /// Stable key identifying the paired accessory, used to key the
    /// metadata cache. Falls back to the gateway address.
    pub fn identity_key(&self) -> String {
        self.data
            .get("AccessoryPairingID")
            .and_then(serde_json::Value::as_str)
            .map_or_else(|| self.gateway_address.clone(), str::to_owned)
    }
}
