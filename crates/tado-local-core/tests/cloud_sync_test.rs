// Cloud metadata sync against a wiremock tado API, driven through `Bridge`.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use url::Url;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tado_local_api::hap::mock::{DEFAULT_SETUP_CODE, MockGateway, thermostat_accessory};
use tado_local_core::db::Database;
use tado_local_core::{
    Bridge, BridgeConfig, ChangeStream, CloudConfig, FieldValue, StateChange, TrackedField, UpdateSource,
};

const WAIT: Duration = Duration::from_secs(5);

// ── Helpers ─────────────────────────────────────────────────────────

fn cloud_config(server: &MockServer, token: Option<&str>) -> CloudConfig {
    let base = Url::parse(&format!("{}/", server.uri())).unwrap();
    CloudConfig {
        refresh_token: token.map(|t| SecretString::from(t.to_string())),
        initial_delay: Duration::ZERO,
        dynamic_ttl: Duration::from_secs(3600),
        static_ttl: Duration::from_secs(3600),
        retry_delay: Duration::from_secs(3600),
        unauthenticated_delay: Duration::from_secs(3600),
        api_base: Some(base.join("api/v2/").unwrap()),
        auth_base: Some(base.join("oauth2/").unwrap()),
        ..CloudConfig::default()
    }
}

async fn bridge(gw: &MockGateway, cloud: CloudConfig) -> Bridge {
    let mut config = BridgeConfig::new("unused.db");
    config.gateway.address = Some("10.0.0.2".into());
    config.gateway.setup_code = Some(DEFAULT_SETUP_CODE.parse().unwrap());
    config.polling.fast_interval = Duration::ZERO;
    config.polling.slow_interval = Duration::ZERO;
    config.cloud = Some(cloud);
    let db = Database::in_memory().await.unwrap();
    Bridge::with_database(config, db, Arc::new(gw.clone())).await.unwrap()
}

async fn mount_token(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "tok-1",
            "refresh_token": "refresh-2",
            "expires_in": 600
        })))
        .mount(server)
        .await;
}

async fn mount_home(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/v2/me"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "homes": [{"id": 42, "name": "Home"}]
        })))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/v2/homes/42/deviceList"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "entries": [
                {"device": {"serialNo": "RU001", "deviceType": "RU02", "batteryState": "LOW",
                            "currentFwVersion": "54.20"}, "zone": {"discriminator": 1}},
                {"device": {"serialNo": "VA1234567890", "deviceType": "VA02", "batteryState": "NORMAL"},
                 "zone": {"discriminator": 1}}
            ]
        })))
        .mount(server)
        .await;
}

fn zones_body() -> serde_json::Value {
    json!([
        {"id": 1, "name": "Kitchen", "type": "HEATING", "devices": [
            {"serialNo": "RU001", "deviceType": "RU02", "batteryState": "NORMAL",
             "currentFwVersion": "54.20", "duties": ["ZONE_UI", "ZONE_LEADER", "CIRCUIT_DRIVER"]},
            {"serialNo": "VA1234567890", "deviceType": "VA02", "batteryState": "NORMAL", "duties": []}
        ]}
    ])
}

async fn wait_for_syncs(bridge: &Bridge, n: u64) {
    tokio::time::timeout(WAIT, async {
        while bridge.status().await.unwrap().cloud_syncs < n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("cloud sync did not run in time");
}

async fn find_change(changes: &mut ChangeStream, want: impl Fn(&StateChange) -> bool) -> StateChange {
    tokio::time::timeout(WAIT, async {
        loop {
            let change = changes.next_change().await.expect("change stream closed");
            if want(&change) {
                return change;
            }
        }
    })
    .await
    .expect("expected change never arrived")
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn sync_populates_zones_leaders_and_batteries() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    mount_home(&server).await;
    Mock::given(method("GET"))
        .and(path("/api/v2/homes/42/zones"))
        .respond_with(ResponseTemplate::new(200).set_body_json(zones_body()))
        .mount(&server)
        .await;

    let gw = MockGateway::new(vec![thermostat_accessory(2, "RU001", "Kitchen")]);
    let bridge = bridge(&gw, cloud_config(&server, Some("refresh-1"))).await;
    let mut changes = bridge.subscribe();
    bridge.start().await.unwrap();

    let battery = find_change(&mut changes, |c| {
        c.field == TrackedField::StatusLowBattery && c.source == UpdateSource::Cloud
    })
    .await;
    assert_eq!(battery.value, FieldValue::Int(1));
    assert_eq!(battery.previous_value, Some(FieldValue::Int(0)));

    wait_for_syncs(&bridge, 1).await;
    let status = bridge.status().await.unwrap();
    assert!(status.last_cloud_sync_at.is_some());
    // Low battery on the thermostat, first reading for the valve.
    assert_eq!(status.counters.cloud, 2);

    let zones = bridge.zones();
    assert_eq!(zones.len(), 1);
    let kitchen_zone = &zones[0];
    assert_eq!(kitchen_zone.name, "Kitchen");
    assert_eq!(kitchen_zone.cloud_id, Some(1));

    let thermostat = bridge.resolve_device("RU001").unwrap();
    assert_eq!(kitchen_zone.leader_device_id, Some(thermostat.id));
    assert_eq!(thermostat.zone_id, Some(kitchen_zone.id));
    assert_eq!(thermostat.firmware_version.as_deref(), Some("54.20"));
    assert!(thermostat.is_circuit_driver);

    // The valve is not exposed by the gateway; the cloud created it.
    let valve = bridge.resolve_device("VA1234567890").unwrap();
    assert_eq!(valve.display_name(), "VA02_567890");
    assert_eq!(valve.zone_id, Some(kitchen_zone.id));
    assert_eq!(bridge.devices().len(), 2);

    // The rotated refresh token was persisted.
    let stored = bridge.store().db().load_refresh_token().await.unwrap().unwrap();
    assert_eq!(stored.expose_secret(), "refresh-2");

    bridge.shutdown().await;
}

#[tokio::test]
async fn stale_cache_is_revalidated_with_etag() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    mount_home(&server).await;
    Mock::given(method("GET"))
        .and(path("/api/v2/homes/42/zones"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", "\"z1\"")
                .set_body_json(zones_body()),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v2/homes/42/zones"))
        .and(header("if-none-match", "\"z1\""))
        .respond_with(ResponseTemplate::new(304))
        .mount(&server)
        .await;

    let gw = MockGateway::new(vec![thermostat_accessory(2, "RU001", "Kitchen")]);
    let mut cloud = cloud_config(&server, Some("refresh-1"));
    // Zones go stale immediately; the loop resyncs every 50ms.
    cloud.static_ttl = Duration::ZERO;
    cloud.dynamic_ttl = Duration::from_millis(50);
    let bridge = bridge(&gw, cloud).await;
    bridge.start().await.unwrap();

    wait_for_syncs(&bridge, 2).await;
    bridge.shutdown().await;

    let zone_requests: Vec<_> = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.url.path() == "/api/v2/homes/42/zones")
        .collect();
    assert!(zone_requests.len() >= 2);
    assert!(!zone_requests[0].headers.contains_key("if-none-match"));
    assert_eq!(zone_requests[1].headers.get("if-none-match").unwrap(), "\"z1\"");

    // The cached body still applied after the 304.
    assert_eq!(bridge.zones().len(), 1);
    assert_eq!(bridge.zones()[0].name, "Kitchen");
}

#[tokio::test]
async fn missing_token_leaves_the_gateway_unaffected() {
    let server = MockServer::start().await;

    let gw = MockGateway::new(vec![thermostat_accessory(2, "RU001", "Kitchen")]);
    let bridge = bridge(&gw, cloud_config(&server, None)).await;
    bridge.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let status = bridge.status().await.unwrap();
    assert!(status.connected);
    assert_eq!(status.cloud_syncs, 0);
    assert!(server.received_requests().await.unwrap().is_empty());

    bridge.shutdown().await;
}

#[tokio::test]
async fn cloud_errors_do_not_block_transport_updates() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    mount_home(&server).await;
    Mock::given(method("GET"))
        .and(path("/api/v2/homes/42/zones"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let gw = MockGateway::new(vec![thermostat_accessory(2, "RU001", "Kitchen")]);
    let bridge = bridge(&gw, cloud_config(&server, Some("refresh-1"))).await;
    let mut changes = bridge.subscribe();
    bridge.start().await.unwrap();

    gw.push(
        tado_local_api::hap::CharacteristicId::new(2, tado_local_api::hap::mock::iids::CURRENT_TEMPERATURE),
        json!(22.0),
    );
    let change = find_change(&mut changes, |c| c.source == UpdateSource::Push).await;
    assert_eq!(change.value, FieldValue::Float(22.0));

    let status = bridge.status().await.unwrap();
    assert!(status.connected);
    assert_eq!(status.cloud_syncs, 0);

    bridge.shutdown().await;
}
