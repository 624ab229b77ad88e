mod common;

use assert_cmd::prelude::*;
use common::{pubkey_hex, signed_event_json, start_relay, storing_relay};
use serde_json::json;
use std::{fs, process::Command};
use tempfile::TempDir;

fn write_env(dir: &TempDir, relay_url: &str) -> String {
    let env_path = dir.path().join("env");
    let content = format!(
        "RELAY_URL={}\nNOSTR_PRIVKEY={}\nCONFIRMATION_TIMEOUT_SECS=2\n",
        relay_url,
        "01".repeat(32)
    );
    fs::write(&env_path, content).unwrap();
    env_path.to_str().unwrap().to_string()
}

fn cmd() -> Command {
    let mut cmd = Command::cargo_bin("nostr-orders").unwrap();
    for var in ["RELAY_URL", "NOSTR_PRIVKEY", "MOSTRO_PUBKEY", "VERIFY_SIG", "RUST_LOG"] {
        cmd.env_remove(var);
    }
    cmd
}

#[test]
fn verify_cli_success_and_failure() {
    let dir = TempDir::new().unwrap();

    let good = signed_event_json([1u8; 32], 1, vec![], "");
    let good_path = dir.path().join("good.json");
    fs::write(&good_path, serde_json::to_string(&good).unwrap()).unwrap();
    let output = cmd()
        .args(["verify", good_path.to_str().unwrap()])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).unwrap();
    assert!(text.contains(good["id"].as_str().unwrap()));

    // mismatched id
    let mut bad = good.clone();
    bad["id"] = serde_json::Value::String("ff".repeat(32));
    let bad_path = dir.path().join("bad.json");
    fs::write(&bad_path, serde_json::to_string(&bad).unwrap()).unwrap();
    cmd()
        .args(["verify", good_path.to_str().unwrap(), bad_path.to_str().unwrap()])
        .assert()
        .failure();

    // content changed after signing
    let mut tampered = good;
    tampered["content"] = json!("changed");
    fs::write(&bad_path, serde_json::to_string(&tampered).unwrap()).unwrap();
    cmd()
        .args(["verify", bad_path.to_str().unwrap()])
        .assert()
        .failure();
}

#[test]
fn verify_needs_no_env_file() {
    let dir = TempDir::new().unwrap();
    let ev = signed_event_json([2u8; 32], 38383, vec![vec!["d".into(), "x".into()]], "[]");
    let path = dir.path().join("ev.json");
    fs::write(&path, ev.to_string()).unwrap();
    cmd()
        .args(["--env", "/nonexistent/env", "verify", path.to_str().unwrap()])
        .assert()
        .success();
}

#[test]
fn missing_relay_url_fails() {
    let dir = TempDir::new().unwrap();
    let env_path = dir.path().join("env");
    fs::write(&env_path, "KIND_ORDER=38383\n").unwrap();
    let output = cmd()
        .args(["--env", env_path.to_str().unwrap(), "orders"])
        .assert()
        .failure()
        .get_output()
        .stderr
        .clone();
    assert!(String::from_utf8(output).unwrap().contains("RELAY_URL"));
}

#[test]
fn cli_help_lists_commands() {
    let output = cmd()
        .arg("--help")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).unwrap();
    for c in ["order", "orders", "show", "note", "verify"] {
        assert!(text.contains(c));
    }
}

#[test]
fn order_rejects_unknown_side() {
    cmd()
        .args(["order", "--side", "hold", "--amount", "1", "--fiat", "ARS", "--method", "x"])
        .assert()
        .failure();
}

#[tokio::test(flavor = "multi_thread")]
async fn note_cli_publishes_to_relay() {
    let url = start_relay(storing_relay(vec![])).await;
    let dir = TempDir::new().unwrap();
    let env_path = write_env(&dir, &url);
    let output = tokio::task::spawn_blocking(move || {
        cmd()
            .args(["--env", &env_path, "note", "gm"])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone()
    })
    .await
    .unwrap();
    let id = String::from_utf8(output).unwrap();
    assert_eq!(id.trim().len(), 64);
}

#[tokio::test(flavor = "multi_thread")]
async fn orders_and_show_cli_read_from_relay() {
    let envelope = json!([{"order": {
        "version": 1,
        "action": "new-order",
        "trade_index": 1,
        "payload": {"order": {
            "kind": "sell",
            "status": "pending",
            "amount": 0,
            "fiat_code": "ARS",
            "fiat_amount": 25000,
            "payment_method": "MercadoPago",
            "premium": 2.0,
            "created_at": 1700000000
        }}
    }}]);
    let listing = signed_event_json(
        [3u8; 32],
        38383,
        vec![vec!["d".into(), "order-42".into()]],
        &envelope.to_string(),
    );
    let url = start_relay(storing_relay(vec![listing.clone()])).await;
    let dir = TempDir::new().unwrap();
    let env_path = write_env(&dir, &url);

    let env = env_path.clone();
    let output = tokio::task::spawn_blocking(move || {
        cmd()
            .args(["--env", &env, "orders", "--limit", "5"])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone()
    })
    .await
    .unwrap();
    let text = String::from_utf8(output).unwrap();
    assert!(text.contains("order-42"));
    assert!(text.contains("25000 ARS"));

    let output = tokio::task::spawn_blocking(move || {
        cmd()
            .args(["--env", &env_path, "show", "order-42"])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone()
    })
    .await
    .unwrap();
    let shown: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(shown["id"], listing["id"]);
    assert_eq!(shown["pubkey"], pubkey_hex([3u8; 32]));
}

#[tokio::test(flavor = "multi_thread")]
async fn order_cli_times_out_without_confirmation() {
    let url = start_relay(storing_relay(vec![])).await;
    let dir = TempDir::new().unwrap();
    let env_path = write_env(&dir, &url);
    let output = tokio::task::spawn_blocking(move || {
        cmd()
            .args([
                "--env", &env_path, "order", "--side", "buy", "--amount", "100000", "--fiat",
                "ARS", "--method", "MercadoPago",
            ])
            .assert()
            .failure()
            .get_output()
            .clone()
    })
    .await
    .unwrap();
    assert!(String::from_utf8_lossy(&output.stdout).contains("published as event"));
    assert!(String::from_utf8_lossy(&output.stderr).contains("TimedOut"));
}
