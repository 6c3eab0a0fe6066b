//! Integration tests for the `tado-local` binary.
//!
//! Everything here runs against a temporary config and state file; no
//! gateway or relay is contacted.
#![allow(clippy::unwrap_used)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use assert_cmd::cargo::cargo_bin_cmd;
use chrono::DateTime;
use predicates::prelude::*;
use tempfile::TempDir;
use tokio::sync::broadcast;

use tado_local_core::db::Database;
use tado_local_core::{DeviceRegistration, FieldValue, Observation, Reconciler, StateStore, TrackedField, UpdateSource};

// ── Helpers ─────────────────────────────────────────────────────────

struct Env {
    dir: TempDir,
}

impl Env {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn config(&self) -> PathBuf {
        self.dir.path().join("config.toml")
    }

    fn state(&self) -> PathBuf {
        self.dir.path().join("state.db")
    }

    /// `tado-local` with an isolated environment and this temp dir's
    /// config and state file.
    fn cmd(&self) -> assert_cmd::Command {
        let mut cmd = cargo_bin_cmd!("tado-local");
        cmd.env("HOME", self.dir.path())
            .env("XDG_CONFIG_HOME", self.dir.path())
            .env_remove("RUST_LOG")
            .env_remove("TADO_REFRESH_TOKEN")
            .env_remove("TADO_LOCAL_OUTPUT")
            .env_remove("TADO_LOCAL_RELAY_URL")
            .env_remove("TADO_LOCAL_BRIDGE_IP")
            .env_remove("TADO_LOCAL_PIN")
            .arg("--config")
            .arg(self.config())
            .arg("--state")
            .arg(self.state());
        cmd
    }
}

fn combined_output(output: &std::process::Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    format!("{stdout}{stderr}")
}

/// One thermostat with a pushed temperature and a polled humidity.
async fn seed_state(path: &Path) {
    let db = Database::open(path).await.unwrap();
    let store = Arc::new(StateStore::new(db.clone(), 10, Duration::from_secs(10)));
    let device = store
        .upsert_device(&DeviceRegistration {
            serial_number: "RU001".into(),
            name: Some("Kitchen".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    let (tx, _rx) = broadcast::channel(8);
    let mut reconciler = Reconciler::new(Arc::clone(&store), tx);
    for (field, value, source, t) in [
        (TrackedField::CurrentTemperature, 20.5, UpdateSource::Push, 1_704_067_200),
        (TrackedField::Humidity, 45.0, UpdateSource::FastPoll, 1_704_067_230),
    ] {
        reconciler
            .apply(Observation {
                device_id: device.id,
                field,
                value: Some(FieldValue::for_field(field, value)),
                source,
                observed_at: DateTime::from_timestamp(t, 0).unwrap(),
            })
            .await
            .unwrap();
    }
    db.close().await;
}

// ── Basic invocation ────────────────────────────────────────────────

#[test]
fn no_args_shows_help() {
    let output = Env::new().cmd().output().unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(combined_output(&output).contains("Usage"));
}

#[test]
fn help_lists_commands() {
    Env::new().cmd().arg("--help").assert().success().stdout(
        predicate::str::contains("HomeKit")
            .and(predicate::str::contains("run"))
            .and(predicate::str::contains("history"))
            .and(predicate::str::contains("pairings")),
    );
}

#[test]
fn version_flag() {
    Env::new()
        .cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("tado-local"));
}

#[test]
fn completions_for_each_shell() {
    let env = Env::new();
    env.cmd()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("tado-local"));
    env.cmd()
        .args(["completions", "zsh"])
        .assert()
        .success()
        .stdout(predicate::str::contains("#compdef"));
    env.cmd()
        .args(["completions", "fish"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty().not());
}

#[test]
fn unknown_subcommand_is_a_usage_error() {
    Env::new().cmd().arg("thermostats").assert().code(2);
}

// ── Offline state commands ──────────────────────────────────────────

#[test]
fn status_on_a_fresh_state_file() {
    let env = Env::new();
    env.cmd()
        .args(["status", "-o", "json"])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("\"paired\": false")
                .and(predicate::str::contains("\"devices\": 0"))
                .and(predicate::str::contains("\"pairings\": []")),
        );
    assert!(env.state().exists());
}

#[test]
fn empty_device_list_is_an_empty_json_array() {
    Env::new()
        .cmd()
        .args(["devices", "-o", "json-compact"])
        .assert()
        .success()
        .stdout("[]\n");
}

#[tokio::test]
async fn devices_and_history_read_the_state_file() {
    let env = Env::new();
    seed_state(&env.state()).await;

    env.cmd()
        .args(["devices", "-o", "plain"])
        .assert()
        .success()
        .stdout(predicate::str::contains("RU001"));

    env.cmd()
        .args(["devices"])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("Kitchen")
                .and(predicate::str::contains("20.5°C"))
                .and(predicate::str::contains("45%")),
        );

    env.cmd()
        .args(["history", "kitchen", "-o", "plain"])
        .assert()
        .success()
        .stdout(predicate::str::contains("current_temperature=20.5 humidity=45"));

    env.cmd()
        .args(["history", "RU001", "--start", "2030-01-01T00:00:00Z", "-o", "json-compact"])
        .assert()
        .success()
        .stdout("[]\n");
}

#[test]
fn history_for_an_unknown_device_is_not_found() {
    let output = Env::new().cmd().args(["history", "Attic"]).output().unwrap();
    assert_eq!(output.status.code(), Some(4));
    let text = combined_output(&output);
    assert!(text.contains("device 'Attic' not found"), "{text}");
    assert!(text.contains("tado-local devices"), "{text}");
}

#[test]
fn pairings_list_and_clear_on_empty_state() {
    let env = Env::new();
    env.cmd()
        .args(["pairings", "list", "-o", "plain"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
    env.cmd()
        .args(["pairings", "clear", "--address", "10.0.0.2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed 0 pairing(s) for gateway 10.0.0.2"));
}

// ── Validation before any connection ────────────────────────────────

#[test]
fn set_rejects_unknown_fields() {
    let output = Env::new()
        .cmd()
        .args(["set", "Kitchen", "colour", "3"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(combined_output(&output).contains("target_temperature"));
}

#[test]
fn run_rejects_a_malformed_pin() {
    let output = Env::new()
        .cmd()
        .args(["run", "--bridge-ip", "10.0.0.2", "--pin", "12-345"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(combined_output(&output).contains("--pin"));
}

#[test]
fn run_refuses_to_clear_pairings_without_an_address() {
    Env::new().cmd().args(["run", "--clear-pairings"]).assert().code(2);
}

#[test]
fn non_websocket_relay_is_rejected() {
    let output = Env::new()
        .cmd()
        .args(["--relay", "http://127.0.0.1:4408", "devices"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(combined_output(&output).contains("relay.url"));
}

// ── Config ──────────────────────────────────────────────────────────

#[test]
fn config_path_honors_the_flag() {
    let env = Env::new();
    env.cmd()
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains(env.config().display().to_string()));
}

#[test]
fn config_show_masks_secrets() {
    let env = Env::new();
    std::fs::write(
        env.config(),
        "[gateway]\naddress = \"10.0.0.2\"\nsetup_code = \"123-45-678\"\n\n\
         [cloud]\nenabled = true\nrefresh_token = \"very-secret\"\n",
    )
    .unwrap();

    env.cmd().args(["config", "show"]).assert().success().stdout(
        predicate::str::contains("10.0.0.2")
            .and(predicate::str::contains("****"))
            .and(predicate::str::contains("very-secret").not())
            .and(predicate::str::contains("123-45-678").not()),
    );
}

#[test]
fn plaintext_cloud_token_is_saved_and_enables_sync() {
    let env = Env::new();
    env.cmd()
        .args(["config", "set-cloud-token", "--plaintext", "refresh-abc"])
        .assert()
        .success()
        .stdout(predicate::str::contains("config file"));

    let saved = std::fs::read_to_string(env.config()).unwrap();
    assert!(saved.contains("refresh-abc"));
    assert!(saved.contains("enabled = true"));
}

#[test]
fn quiet_suppresses_output() {
    Env::new()
        .cmd()
        .args(["-q", "config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}
