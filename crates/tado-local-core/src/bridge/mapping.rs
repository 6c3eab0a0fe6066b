// Characteristic ↔ (device, field) mapping for one gateway session.
//
// Built from the enumerated accessory tree after devices are registered.
// `aid`s are only valid for the session that produced them, so the map is
// rebuilt on every connect.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, warn};

use tado_local_api::hap::{Accessory, CharacteristicId};

use crate::model::{DeviceId, TrackedField, ValueKind};

/// One tracked characteristic with the metadata needed to read, subscribe
/// and validate writes.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedCharacteristic {
    pub id: CharacteristicId,
    pub device_id: DeviceId,
    pub field: TrackedField,
    pub readable: bool,
    pub writable: bool,
    pub events: bool,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
}

impl TrackedCharacteristic {
    /// Writable range: the gateway's advertised bounds, falling back to the
    /// field's default range.
    pub fn range(&self) -> Option<(f64, f64)> {
        let default = self.field.default_range();
        match (self.min_value, self.max_value) {
            (Some(min), Some(max)) => Some((min, max)),
            (Some(min), None) => default.map(|(_, max)| (min, max)),
            (None, Some(max)) => default.map(|(min, _)| (min, max)),
            (None, None) => default,
        }
    }
}

#[derive(Debug, Default)]
pub struct FieldMap {
    by_char: HashMap<CharacteristicId, TrackedCharacteristic>,
    by_field: HashMap<(DeviceId, TrackedField), CharacteristicId>,
}

impl FieldMap {
    /// Map every tracked characteristic of every registered accessory.
    ///
    /// `devices` maps session `aid`s to registered devices. When an
    /// accessory exposes a field twice (e.g. a thermostat service and a
    /// temperature sensor service), the first occurrence wins.
    pub fn build(accessories: &[Accessory], devices: &HashMap<u64, DeviceId>) -> Self {
        let mut map = Self::default();
        for accessory in accessories {
            let Some(&device_id) = devices.get(&accessory.aid) else {
                continue;
            };
            for (id, c) in accessory.characteristics() {
                let Some(field) = TrackedField::from_char_type(&c.char_type) else {
                    continue;
                };
                if map.by_field.contains_key(&(device_id, field)) {
                    debug!(%device_id, %field, %id, "duplicate characteristic ignored");
                    continue;
                }
                if let Some(format) = c.format.as_deref() {
                    if !format_matches(field, format) {
                        warn!(%device_id, %field, %id, format, "unexpected characteristic format");
                    }
                }
                map.by_field.insert((device_id, field), id);
                map.by_char.insert(
                    id,
                    TrackedCharacteristic {
                        id,
                        device_id,
                        field,
                        readable: c.is_readable(),
                        writable: c.is_writable(),
                        events: c.supports_events(),
                        min_value: c.min_value,
                        max_value: c.max_value,
                    },
                );
            }
        }
        map
    }

    pub fn lookup(&self, id: CharacteristicId) -> Option<&TrackedCharacteristic> {
        self.by_char.get(&id)
    }

    pub fn resolve(&self, device_id: DeviceId, field: TrackedField) -> Option<&TrackedCharacteristic> {
        self.by_field
            .get(&(device_id, field))
            .and_then(|id| self.by_char.get(id))
    }

    pub fn len(&self) -> usize {
        self.by_char.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_char.is_empty()
    }

    /// Characteristics that deliver events.
    pub fn subscribable(&self) -> Vec<CharacteristicId> {
        self.select(|c| c.events)
    }

    /// Every readable tracked characteristic.
    pub fn readable(&self) -> Vec<CharacteristicId> {
        self.select(|c| c.readable)
    }

    /// Readable characteristics of fields that do not push reliably.
    pub fn fast_polled(&self) -> Vec<CharacteristicId> {
        self.select(|c| c.readable && c.field.is_fast_polled())
    }

    /// Tracked fields per device, for the startup summary.
    pub fn fields_by_device(&self) -> BTreeMap<DeviceId, Vec<TrackedField>> {
        let mut out: BTreeMap<DeviceId, Vec<TrackedField>> = BTreeMap::new();
        for (device_id, field) in self.by_field.keys() {
            out.entry(*device_id).or_default().push(*field);
        }
        for fields in out.values_mut() {
            fields.sort();
        }
        out
    }

    fn select(&self, pred: impl Fn(&TrackedCharacteristic) -> bool) -> Vec<CharacteristicId> {
        let mut ids: Vec<_> = self.by_char.values().filter(|c| pred(c)).map(|c| c.id).collect();
        ids.sort();
        ids
    }
}

fn format_matches(field: TrackedField, format: &str) -> bool {
    match field.kind() {
        ValueKind::Float => format == "float",
        ValueKind::Int => matches!(format, "uint8" | "uint16" | "uint32" | "int" | "bool"),
    }
}
