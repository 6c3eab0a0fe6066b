// ── Device and zone registry types ──

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use tado_local_api::hap::{Accessory, uuid};

use super::ids::{DeviceId, ZoneId};

/// What a registered device is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeviceKind {
    Thermostat,
    TemperatureSensor,
    HumiditySensor,
    InternetBridge,
    RadiatorValve,
    WirelessReceiver,
    Unknown,
}

impl DeviceKind {
    /// Classify from the accessory's services, falling back to the
    /// serial-number prefix.
    pub fn classify(accessory: &Accessory, serial: &str) -> Self {
        let by_service = [
            (uuid::SERVICE_THERMOSTAT, Self::Thermostat),
            (uuid::SERVICE_TEMPERATURE_SENSOR, Self::TemperatureSensor),
            (uuid::SERVICE_HUMIDITY_SENSOR, Self::HumiditySensor),
        ];
        for (service_type, kind) in by_service {
            if accessory.service(service_type).is_some() {
                return kind;
            }
        }
        Self::from_serial(serial)
    }

    pub fn from_serial(serial: &str) -> Self {
        match serial.get(..2) {
            Some("IB") => Self::InternetBridge,
            Some("RU") => Self::Thermostat,
            Some("VA") => Self::RadiatorValve,
            Some("WR") => Self::WirelessReceiver,
            _ => Self::Unknown,
        }
    }
}

/// A registered device. Identity is the serial number; `aid` is only
/// meaningful within the current gateway session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub serial_number: String,
    pub aid: Option<u64>,
    pub zone_id: Option<ZoneId>,
    pub kind: DeviceKind,
    pub name: Option<String>,
    pub model: Option<String>,
    pub manufacturer: Option<String>,
    pub battery_state: Option<String>,
    pub firmware_version: Option<String>,
    pub is_circuit_driver: bool,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Device {
    /// Name for log lines and tables.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.serial_number)
    }
}

/// Attributes gathered for a device before it has an id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceRegistration {
    pub serial_number: String,
    pub aid: Option<u64>,
    pub kind: Option<DeviceKind>,
    pub name: Option<String>,
    pub model: Option<String>,
    pub manufacturer: Option<String>,
}

impl DeviceRegistration {
    /// Read serial, name, model and manufacturer from the accessory
    /// information service. `None` when the accessory has no serial.
    pub fn from_accessory(accessory: &Accessory) -> Option<Self> {
        let serial = accessory
            .info_string(uuid::CHAR_SERIAL_NUMBER)
            .filter(|s| !s.trim().is_empty())?
            .to_owned();
        Some(Self {
            kind: Some(DeviceKind::classify(accessory, &serial)),
            aid: Some(accessory.aid),
            name: accessory.info_string(uuid::CHAR_NAME).map(str::to_owned),
            model: accessory.info_string(uuid::CHAR_MODEL).map(str::to_owned),
            manufacturer: accessory.info_string(uuid::CHAR_MANUFACTURER).map(str::to_owned),
            serial_number: serial,
        })
    }
}

/// A heating zone. The leader represents the zone's shared attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub id: ZoneId,
    pub cloud_id: Option<i64>,
    pub name: String,
    pub zone_type: Option<String>,
    pub leader_device_id: Option<DeviceId>,
    pub order: i64,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tado_local_api::hap::mock::thermostat_accessory;

    #[test]
    fn serial_prefix_classifies_when_no_service_matches() {
        assert_eq!(DeviceKind::from_serial("IB123"), DeviceKind::InternetBridge);
        assert_eq!(DeviceKind::from_serial("VA0001"), DeviceKind::RadiatorValve);
        assert_eq!(DeviceKind::from_serial("X"), DeviceKind::Unknown);
    }

    #[test]
    fn registration_reads_information_service() {
        let accessory = thermostat_accessory(2, "VA001", "Kitchen");
        let reg = DeviceRegistration::from_accessory(&accessory).unwrap();
        assert_eq!(reg.serial_number, "VA001");
        assert_eq!(reg.name.as_deref(), Some("Kitchen"));
        assert_eq!(reg.aid, Some(2));
        // The thermostat service wins over the serial prefix.
        assert_eq!(reg.kind, Some(DeviceKind::Thermostat));
    }

    #[test]
    fn accessory_without_serial_is_skipped() {
        let accessory = thermostat_accessory(2, "  ", "Kitchen");
        assert!(DeviceRegistration::from_accessory(&accessory).is_none());
    }

    #[test]
    fn kind_parses_from_snake_case() {
        assert_eq!("radiator_valve".parse::<DeviceKind>().unwrap(), DeviceKind::RadiatorValve);
        assert_eq!(DeviceKind::TemperatureSensor.to_string(), "temperature_sensor");
    }
}
