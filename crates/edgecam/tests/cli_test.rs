//! Integration tests for the `edgecam` CLI binary.
//!
//! These cover argument parsing, provisioning output, configuration
//! handling, and error exit codes without any device or broker.
#![allow(clippy::unwrap_used)]

use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

// ── Helpers ─────────────────────────────────────────────────────────

/// Build a command for the `edgecam` binary with env isolation.
fn edgecam_cmd() -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("edgecam");
    cmd.env("HOME", "/tmp/edgecam-cli-test-nonexistent")
        .env("XDG_CONFIG_HOME", "/tmp/edgecam-cli-test-nonexistent")
        .env_remove("EDGECAM_DEVICE")
        .env_remove("EDGECAM_CONFIG")
        .env_remove("RUST_LOG");
    cmd
}

const CONFIG: &str = r#"
default_device = "bench"

[defaults]
ntp_server = "ntp.lan"

[devices.bench]
mqtt_host = "192.168.1.20"
webserver_host = "192.168.1.20"
wifi_ssid = "lab"
wifi_password = "hunter2"

[devices.secure]
mqtt_host = "10.0.0.2"
mqtt_port = 8883
tls = true
"#;

fn write_config(dir: &Path) -> PathBuf {
    let path = dir.join("config.toml");
    std::fs::write(&path, CONFIG).unwrap();
    path
}

// ── Basic invocation ────────────────────────────────────────────────

#[test]
fn no_args_shows_help() {
    let output = edgecam_cmd().output().unwrap();
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Usage"), "{stderr}");
}

#[test]
fn help_lists_commands() {
    edgecam_cmd().arg("--help").assert().success().stdout(
        predicate::str::contains("qr")
            .and(predicate::str::contains("deploy"))
            .and(predicate::str::contains("run")),
    );
}

// ── Provisioning ────────────────────────────────────────────────────

#[test]
fn qr_prints_provisioning_string() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    edgecam_cmd()
        .arg("--config")
        .arg(&config)
        .arg("qr")
        .assert()
        .success()
        .stdout(predicate::str::starts_with(
            "AAIAAAAAAAAAAAAAAAAAAA==N=11;E=192.168.1.20;H=1883;t=1;S=lab;P=hunter2;T=ntp.lan;U1FS",
        ));
}

#[test]
fn qr_for_tls_device_with_ascii() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    edgecam_cmd()
        .arg("--config")
        .arg(&config)
        .args(["--device", "secure", "qr", "--ascii"])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("N=11;E=10.0.0.2;H=8883;t=0;T=ntp.lan;U1FS")
                .and(predicate::str::contains("██")),
        );
}

#[test]
fn qr_rejects_oversized_border() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    edgecam_cmd()
        .arg("--config")
        .arg(&config)
        .args(["qr", "--ascii", "--border", "101"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("--border"));
}

#[test]
fn unknown_device_exits_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    edgecam_cmd()
        .arg("--config")
        .arg(&config)
        .args(["--device", "ghost", "qr"])
        .assert()
        .code(4)
        .stderr(predicate::str::contains("ghost"));
}

// ── Config ──────────────────────────────────────────────────────────

#[test]
fn config_path_honours_override() {
    edgecam_cmd()
        .args(["--config", "/etc/edgecam/custom.toml", "config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("/etc/edgecam/custom.toml"));
}

#[test]
fn config_show_renders_profiles() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    edgecam_cmd()
        .arg("--config")
        .arg(&config)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("192.168.1.20").and(predicate::str::contains("bench")));
}

// ── Deploy ──────────────────────────────────────────────────────────

#[test]
fn deploy_rejects_missing_module() {
    edgecam_cmd()
        .args(["deploy", "/nonexistent/app.wasm"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("not a file"));
}
