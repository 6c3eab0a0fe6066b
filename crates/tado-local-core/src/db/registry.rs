// Device and zone registry.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use tracing::{debug, info};

use super::{Database, from_db_int, to_db_int};
use crate::error::CoreError;
use crate::model::{Device, DeviceId, DeviceKind, DeviceRegistration, Zone, ZoneId};

const DEVICE_COLUMNS: &str = "device_id, serial_number, aid, zone_id, kind, name, model, manufacturer, \
     battery_state, firmware_version, is_circuit_driver, first_seen, last_seen";

#[derive(FromRow)]
struct DeviceRow {
    device_id: i64,
    serial_number: String,
    aid: Option<i64>,
    zone_id: Option<i64>,
    kind: String,
    name: Option<String>,
    model: Option<String>,
    manufacturer: Option<String>,
    battery_state: Option<String>,
    firmware_version: Option<String>,
    is_circuit_driver: bool,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

impl From<DeviceRow> for Device {
    fn from(r: DeviceRow) -> Self {
        Self {
            id: DeviceId(r.device_id),
            kind: r.kind.parse().unwrap_or(DeviceKind::Unknown),
            aid: from_db_int(r.aid),
            zone_id: r.zone_id.map(ZoneId),
            serial_number: r.serial_number,
            name: r.name,
            model: r.model,
            manufacturer: r.manufacturer,
            battery_state: r.battery_state,
            firmware_version: r.firmware_version,
            is_circuit_driver: r.is_circuit_driver,
            first_seen: r.first_seen,
            last_seen: r.last_seen,
        }
    }
}

#[derive(FromRow)]
struct ZoneRow {
    zone_id: i64,
    cloud_id: Option<i64>,
    name: String,
    zone_type: Option<String>,
    leader_device_id: Option<i64>,
    sort_order: i64,
}

impl From<ZoneRow> for Zone {
    fn from(r: ZoneRow) -> Self {
        Self {
            id: ZoneId(r.zone_id),
            cloud_id: r.cloud_id,
            name: r.name,
            zone_type: r.zone_type,
            leader_device_id: r.leader_device_id.map(DeviceId),
            order: r.sort_order,
        }
    }
}

/// Cloud-only attributes of a device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloudDeviceAttrs {
    pub battery_state: Option<String>,
    pub firmware_version: Option<String>,
    pub is_circuit_driver: Option<bool>,
}

impl Database {
    // ── Devices ──────────────────────────────────────────────────────

    /// Match a device by serial number, creating it on first sight.
    ///
    /// Existing rows get a changed `aid` and `last_seen` updated; other
    /// attributes are only filled in when still unset. Returns the device
    /// and whether it was created.
    pub async fn register_device(&self, reg: &DeviceRegistration) -> Result<(Device, bool), CoreError> {
        let now = Utc::now();
        if let Some(existing) = self.device_by_serial(&reg.serial_number).await? {
            if reg.aid.is_some() && existing.aid != reg.aid {
                info!(
                    serial = %reg.serial_number,
                    old_aid = ?existing.aid,
                    new_aid = ?reg.aid,
                    "accessory id changed"
                );
            }
            sqlx::query(
                "UPDATE devices SET
                    aid = COALESCE(?, aid),
                    name = COALESCE(name, ?),
                    model = COALESCE(model, ?),
                    manufacturer = COALESCE(manufacturer, ?),
                    last_seen = ?
                 WHERE device_id = ?",
            )
            .bind(reg.aid.and_then(to_db_int))
            .bind(&reg.name)
            .bind(&reg.model)
            .bind(&reg.manufacturer)
            .bind(now)
            .bind(existing.id.get())
            .execute(&self.pool)
            .await?;
            let device = self.device(existing.id).await?.ok_or_else(|| CoreError::DeviceNotFound {
                identifier: reg.serial_number.clone(),
            })?;
            return Ok((device, false));
        }

        let kind = reg
            .kind
            .unwrap_or_else(|| DeviceKind::from_serial(&reg.serial_number));
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO devices (serial_number, aid, kind, name, model, manufacturer, first_seen, last_seen)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING device_id",
        )
        .bind(&reg.serial_number)
        .bind(reg.aid.and_then(to_db_int))
        .bind(kind.to_string())
        .bind(&reg.name)
        .bind(&reg.model)
        .bind(&reg.manufacturer)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        debug!(device_id = id, serial = %reg.serial_number, %kind, "registered device");

        let device = self.device(DeviceId(id)).await?.ok_or_else(|| CoreError::DeviceNotFound {
            identifier: reg.serial_number.clone(),
        })?;
        Ok((device, true))
    }

    pub async fn device(&self, id: DeviceId) -> Result<Option<Device>, CoreError> {
        let row: Option<DeviceRow> =
            sqlx::query_as(&format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE device_id = ?"))
                .bind(id.get())
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Device::from))
    }

    pub async fn device_by_serial(&self, serial: &str) -> Result<Option<Device>, CoreError> {
        let row: Option<DeviceRow> =
            sqlx::query_as(&format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE serial_number = ?"))
                .bind(serial)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Device::from))
    }

    pub async fn list_devices(&self) -> Result<Vec<Device>, CoreError> {
        let rows: Vec<DeviceRow> =
            sqlx::query_as(&format!("SELECT {DEVICE_COLUMNS} FROM devices ORDER BY device_id"))
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(Device::from).collect())
    }

    pub async fn assign_device_zone(&self, device: DeviceId, zone: Option<ZoneId>) -> Result<(), CoreError> {
        sqlx::query("UPDATE devices SET zone_id = ? WHERE device_id = ?")
            .bind(zone.map(ZoneId::get))
            .bind(device.get())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Apply cloud-sourced attributes. `None` leaves a column unchanged.
    pub async fn update_device_cloud(&self, device: DeviceId, attrs: &CloudDeviceAttrs) -> Result<(), CoreError> {
        sqlx::query(
            "UPDATE devices SET
                battery_state = COALESCE(?, battery_state),
                firmware_version = COALESCE(?, firmware_version),
                is_circuit_driver = COALESCE(?, is_circuit_driver)
             WHERE device_id = ?",
        )
        .bind(&attrs.battery_state)
        .bind(&attrs.firmware_version)
        .bind(attrs.is_circuit_driver)
        .bind(device.get())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ── Zones ────────────────────────────────────────────────────────

    /// Insert or update a zone keyed by its cloud id.
    pub async fn upsert_zone(
        &self,
        cloud_id: i64,
        name: &str,
        zone_type: Option<&str>,
        order: i64,
    ) -> Result<Zone, CoreError> {
        let row: ZoneRow = sqlx::query_as(
            "INSERT INTO zones (cloud_id, name, zone_type, sort_order, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(cloud_id) DO UPDATE SET
                name = excluded.name,
                zone_type = excluded.zone_type,
                sort_order = excluded.sort_order,
                updated_at = excluded.updated_at
             RETURNING zone_id, cloud_id, name, zone_type, leader_device_id, sort_order",
        )
        .bind(cloud_id)
        .bind(name)
        .bind(zone_type)
        .bind(order)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    /// Create a zone with no cloud counterpart.
    pub async fn create_zone(&self, name: &str) -> Result<Zone, CoreError> {
        let row: ZoneRow = sqlx::query_as(
            "INSERT INTO zones (name, sort_order, updated_at)
             VALUES (?, (SELECT COALESCE(MAX(sort_order), 0) + 1 FROM zones), ?)
             RETURNING zone_id, cloud_id, name, zone_type, leader_device_id, sort_order",
        )
        .bind(name)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    pub async fn set_zone_leader(&self, zone: ZoneId, leader: Option<DeviceId>) -> Result<(), CoreError> {
        sqlx::query("UPDATE zones SET leader_device_id = ? WHERE zone_id = ?")
            .bind(leader.map(DeviceId::get))
            .bind(zone.get())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_zones(&self) -> Result<Vec<Zone>, CoreError> {
        let rows: Vec<ZoneRow> = sqlx::query_as(
            "SELECT zone_id, cloud_id, name, zone_type, leader_device_id, sort_order
             FROM zones ORDER BY sort_order, zone_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Zone::from).collect())
    }
}
