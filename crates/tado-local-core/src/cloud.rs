// ── Cloud metadata sync ──
//
// Periodically pulls zones and the device list from the tado cloud and
// folds them into the registry: zone membership, zone leaders, battery
// state and firmware. The low-battery flag goes through the reconciler
// like any other observation.
//
// Responses are cached in SQLite with their ETag. A fresh cache entry is
// used without a request; a stale one is revalidated with If-None-Match.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tado_local_api::cloud::types::{DUTY_CIRCUIT_DRIVER, DUTY_ZONE_LEADER};
use tado_local_api::cloud::{CloudClient, CloudDevice, CloudZone, Conditional, DeviceList};
use tado_local_api::transport::TransportConfig;

use crate::bridge::BridgeStats;
use crate::config::CloudConfig;
use crate::db::{CloudCacheEntry, CloudDeviceAttrs};
use crate::error::CoreError;
use crate::model::{Device, DeviceKind, DeviceRegistration, FieldValue, Observation, TrackedField, UpdateSource};
use crate::store::StateStore;

/// Outcome counts of one sync pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub zones: usize,
    pub devices: usize,
    pub created_devices: usize,
}

pub struct CloudSync {
    config: CloudConfig,
    client: CloudClient,
    store: Arc<StateStore>,
    observations: mpsc::Sender<Observation>,
    stats: Arc<BridgeStats>,
    home_id: Option<i64>,
}

impl CloudSync {
    /// Build the client. A refresh token rotated by an earlier run wins
    /// over the configured one.
    pub(crate) async fn new(
        config: CloudConfig,
        timeout: Duration,
        store: Arc<StateStore>,
        observations: mpsc::Sender<Observation>,
        stats: Arc<BridgeStats>,
    ) -> Result<Self, CoreError> {
        let stored = store.db().load_refresh_token().await?;
        let token = stored.or_else(|| config.refresh_token.clone());
        let transport = TransportConfig::default().with_timeout(timeout);
        let client = match (&config.api_base, &config.auth_base) {
            (Some(api), Some(auth)) => CloudClient::with_base_urls(&transport, api.clone(), auth, token)?,
            _ => CloudClient::new(&transport, token)?,
        };
        Ok(Self {
            home_id: config.home_id,
            config,
            client,
            store,
            observations,
            stats,
        })
    }

    /// Sync on the configured schedule until `cancel` fires.
    pub(crate) async fn run(mut self, cancel: CancellationToken) {
        let mut delay = self.config.initial_delay;
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
            delay = match self.sync_once().await {
                Ok(report) => {
                    info!(
                        zones = report.zones,
                        devices = report.devices,
                        created = report.created_devices,
                        "cloud sync complete"
                    );
                    self.config.dynamic_ttl
                }
                Err(CoreError::CloudAuthExpired) => {
                    warn!("cloud sync skipped: no valid refresh token");
                    self.config.unauthenticated_delay
                }
                Err(e) => {
                    warn!(error = %e, "cloud sync failed");
                    self.config.retry_delay
                }
            };
        }
        debug!("cloud sync stopped");
    }

    /// One full pass: zones, then the device list.
    pub async fn sync_once(&mut self) -> Result<SyncReport, CoreError> {
        if !self.client.tokens().has_refresh_token().await {
            return Err(CoreError::CloudAuthExpired);
        }
        let result = self.sync_home().await;
        // Persist a rotated token even when a later request failed.
        if let Some(token) = self.client.tokens().take_rotated_refresh_token().await {
            if let Err(e) = self.store.db().save_refresh_token(&token).await {
                warn!(error = %e, "failed to persist rotated refresh token");
            } else {
                debug!("rotated refresh token saved");
            }
        }
        if let Some(limit) = self.client.rate_limit() {
            debug!(?limit, "cloud rate limit");
        }
        let report = result?;
        self.stats.record_cloud_sync(Utc::now());
        Ok(report)
    }

    async fn sync_home(&mut self) -> Result<SyncReport, CoreError> {
        let home_id = self.home_id().await?;
        let mut report = SyncReport::default();

        let zones: Vec<CloudZone> = decode(self.cached_fetch(home_id, "zones", self.config.static_ttl).await?)?;
        self.apply_zones(&zones, &mut report).await?;

        let devices: DeviceList =
            decode(self.cached_fetch(home_id, "deviceList", self.config.dynamic_ttl).await?)?;
        self.apply_device_list(&devices, &mut report).await?;

        self.store.refresh_registry().await?;
        Ok(report)
    }

    async fn home_id(&mut self) -> Result<i64, CoreError> {
        if let Some(id) = self.home_id {
            return Ok(id);
        }
        let me = self.client.me().await?;
        let home = me.homes.first().ok_or_else(|| CoreError::Cloud {
            message: "account has no homes".into(),
            status: None,
        })?;
        info!(home_id = home.id, name = ?home.name, "discovered cloud home");
        self.home_id = Some(home.id);
        Ok(home.id)
    }

    /// GET `homes/{home}/{endpoint}` through the response cache.
    async fn cached_fetch(
        &self,
        home_id: i64,
        endpoint: &str,
        ttl: Duration,
    ) -> Result<serde_json::Value, CoreError> {
        let db = self.store.db();
        let key = format!("homes/{home_id}/{endpoint}");
        let now = Utc::now();
        let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(4));

        let cached = db.load_cloud_cache(&key).await?;
        if let Some(entry) = &cached {
            if entry.is_fresh(now) {
                debug!(endpoint = %key, "cloud cache hit");
                return Ok(entry.body.clone());
            }
        }

        let etag = cached.as_ref().and_then(|e| e.etag.as_deref());
        let response = self.client.fetch_home(home_id, endpoint, etag).await?;
        match response {
            Conditional::NotModified => {
                let entry = cached.ok_or_else(|| CoreError::Cloud {
                    message: format!("304 for {key} without a cached body"),
                    status: Some(304),
                })?;
                debug!(endpoint = %key, "cloud cache revalidated");
                db.touch_cloud_cache(&key, expires_at).await?;
                Ok(entry.body)
            }
            Conditional::Fresh { data, etag } => {
                db.save_cloud_cache(&CloudCacheEntry {
                    endpoint: key,
                    body: data.clone(),
                    etag,
                    expires_at,
                })
                .await?;
                Ok(data)
            }
        }
    }

    // ── Applying responses ───────────────────────────────────────────

    async fn apply_zones(&self, zones: &[CloudZone], report: &mut SyncReport) -> Result<(), CoreError> {
        let db = self.store.db();
        for (order, cloud_zone) in (0_i64..).zip(zones) {
            let mut zone = db
                .upsert_zone(cloud_zone.id, &cloud_zone.name, cloud_zone.zone_type.as_deref(), order)
                .await?;
            let mut leader = None;
            for cloud_device in &cloud_zone.devices {
                let device = self.ensure_device(cloud_device, report).await?;
                db.assign_device_zone(device.id, Some(zone.id)).await?;
                db.update_device_cloud(
                    device.id,
                    &CloudDeviceAttrs {
                        battery_state: cloud_device.battery_state.clone(),
                        firmware_version: cloud_device.current_fw_version.clone(),
                        is_circuit_driver: Some(cloud_device.has_duty(DUTY_CIRCUIT_DRIVER)),
                    },
                )
                .await?;
                if cloud_device.has_duty(DUTY_ZONE_LEADER) {
                    leader = Some(device.id);
                }
            }
            db.set_zone_leader(zone.id, leader).await?;
            zone.leader_device_id = leader;
            debug!(zone = %zone.name, devices = cloud_zone.devices.len(), "zone synced");
            self.store.put_zone(zone);
            report.zones += 1;
        }
        Ok(())
    }

    async fn apply_device_list(&self, list: &DeviceList, report: &mut SyncReport) -> Result<(), CoreError> {
        let db = self.store.db();
        for entry in &list.entries {
            let cloud_device = &entry.device;
            let device = self.ensure_device(cloud_device, report).await?;
            db.update_device_cloud(
                device.id,
                &CloudDeviceAttrs {
                    battery_state: cloud_device.battery_state.clone(),
                    firmware_version: cloud_device.current_fw_version.clone(),
                    is_circuit_driver: None,
                },
            )
            .await?;
            if let Some(low) = cloud_device.battery_low() {
                let obs = Observation {
                    device_id: device.id,
                    field: TrackedField::StatusLowBattery,
                    value: Some(FieldValue::Int(i64::from(low))),
                    source: UpdateSource::Cloud,
                    observed_at: Utc::now(),
                };
                if self.observations.send(obs).await.is_err() {
                    return Err(CoreError::Internal("reconciler stopped".into()));
                }
            }
            report.devices += 1;
        }
        Ok(())
    }

    /// Find a device by serial, creating a placeholder for ones the
    /// gateway has not exposed yet.
    async fn ensure_device(&self, cloud_device: &CloudDevice, report: &mut SyncReport) -> Result<Arc<Device>, CoreError> {
        if let Some(device) = self.store.device_by_serial(&cloud_device.serial_no) {
            return Ok(device);
        }
        let name = placeholder_name(cloud_device);
        info!(serial = %cloud_device.serial_no, %name, "creating device from cloud metadata");
        report.created_devices += 1;
        self.store
            .upsert_device(&DeviceRegistration {
                serial_number: cloud_device.serial_no.clone(),
                kind: Some(DeviceKind::from_serial(&cloud_device.serial_no)),
                name: Some(name),
                ..Default::default()
            })
            .await
    }
}

/// `{deviceType}_{last six characters of the serial}`.
fn placeholder_name(device: &CloudDevice) -> String {
    let serial = &device.serial_no;
    let start = serial
        .char_indices()
        .rev()
        .nth(5)
        .map_or(0, |(i, _)| i);
    let device_type = device.device_type.as_deref().unwrap_or("device");
    format!("{device_type}_{}", &serial[start..])
}

fn decode<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, CoreError> {
    serde_json::from_value(value).map_err(|e| CoreError::Cloud {
        message: format!("unexpected response shape: {e}"),
        status: None,
    })
}
