// Tado cloud response types.
//
// Only the fields the bridge consumes are modeled; everything else is kept
// in `extra` so cached bodies survive a round trip unchanged.

use serde::{Deserialize, Serialize};

/// `GET /me`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Me {
    #[serde(default)]
    pub homes: Vec<HomeRef>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HomeRef {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
}

/// `GET /homes/{id}/`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Home {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One entry of `GET /homes/{id}/zones`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CloudZone {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type", default)]
    pub zone_type: Option<String>,
    #[serde(default)]
    pub devices: Vec<CloudDevice>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A physical device as described by the cloud.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudDevice {
    pub serial_no: String,
    #[serde(default)]
    pub device_type: Option<String>,
    #[serde(default)]
    pub current_fw_version: Option<String>,
    #[serde(default)]
    pub battery_state: Option<String>,
    #[serde(default)]
    pub duties: Vec<String>,
}

/// Zone duty marking the device that represents the zone.
pub const DUTY_ZONE_LEADER: &str = "ZONE_LEADER";
/// Zone duty marking the device that drives the boiler circuit.
pub const DUTY_CIRCUIT_DRIVER: &str = "CIRCUIT_DRIVER";

impl CloudDevice {
    pub fn has_duty(&self, duty: &str) -> bool {
        self.duties.iter().any(|d| d == duty)
    }

    /// `LOW` battery state from the cloud.
    pub fn battery_low(&self) -> Option<bool> {
        self.battery_state.as_deref().map(|s| s.eq_ignore_ascii_case("LOW"))
    }
}

/// `GET /homes/{id}/deviceList`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DeviceList {
    #[serde(default)]
    pub entries: Vec<DeviceListEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceListEntry {
    pub device: CloudDevice,
    #[serde(default)]
    pub zone: Option<ZoneRef>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ZoneRef {
    pub discriminator: i64,
}
