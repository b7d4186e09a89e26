//! Integration tests for CLI commands

#![allow(deprecated)]

use assert_cmd::{assert::OutputAssertExt, cargo::CommandCargoExt};
use predicates::prelude::*;
use std::process::{Command, Stdio};
use tempfile::TempDir;

/// A config whose only server and model backend are unreachable
const UNREACHABLE_CONFIG: &str = r#"
[llm]
base_url = "http://127.0.0.1:1"

[mcp]
connect_timeout_secs = 2

[mcp.servers.database]
url = "http://127.0.0.1:1/sse"
"#;

fn relay() -> Command {
    let mut cmd = Command::cargo_bin("relay").unwrap();
    cmd.env_remove("OLLAMA_BASE_URL")
        .env_remove("OLLAMA_MODEL")
        .env_remove("RUST_LOG");
    cmd
}

fn write_config(dir: &TempDir, content: &str) -> std::path::PathBuf {
    let path = dir.path().join("config.toml");
    std::fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_help_lists_commands() {
    relay()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("MCP"))
        .stdout(predicate::str::contains("chat"))
        .stdout(predicate::str::contains("tools"))
        .stdout(predicate::str::contains("config"));
}

#[test]
fn test_chat_help_shows_overrides() {
    relay()
        .args(["chat", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--ollama-url"))
        .stdout(predicate::str::contains("NAME=URL"))
        .stdout(predicate::str::contains("--quiet"));
}

#[test]
fn test_version() {
    relay()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::starts_with("relay "));
}

#[test]
fn test_config_prints_defaults_when_file_missing() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("missing.toml");

    relay()
        .arg("--config")
        .arg(&path)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("[mcp.servers.database]"))
        .stdout(predicate::str::contains("http://127.0.0.1:8000/sse"))
        .stdout(predicate::str::contains("http://127.0.0.1:8001/sse"))
        .stdout(predicate::str::contains("model = \"llama3.2\""));
    assert!(!path.exists());
}

#[test]
fn test_config_write_round_trips() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("nested").join("config.toml");

    relay()
        .arg("--config")
        .arg(&path)
        .args(["config", "--write"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote configuration"));
    assert!(path.exists());

    relay()
        .arg("--config")
        .arg(&path)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("max_iterations = 8"));
}

#[test]
fn test_env_overrides_model() {
    let tmp = TempDir::new().unwrap();
    let path = write_config(&tmp, UNREACHABLE_CONFIG);

    relay()
        .env("OLLAMA_MODEL", "qwen2.5")
        .arg("--config")
        .arg(&path)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("model = \"qwen2.5\""));
}

#[test]
fn test_malformed_config_is_an_error() {
    let tmp = TempDir::new().unwrap();
    let path = write_config(&tmp, "[llm\nmodel = ");

    relay()
        .arg("--config")
        .arg(&path)
        .arg("config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to parse"));
}

#[test]
fn test_tools_fails_with_hint_when_server_unreachable() {
    let tmp = TempDir::new().unwrap();
    let path = write_config(&tmp, UNREACHABLE_CONFIG);

    relay()
        .arg("--config")
        .arg(&path)
        .arg("tools")
        .assert()
        .failure()
        .stderr(predicate::str::contains(
            "Make sure these MCP servers are running",
        ))
        .stderr(predicate::str::contains("database: http://127.0.0.1:1/sse"));
}

#[test]
fn test_chat_startup_failure_is_fatal() {
    let tmp = TempDir::new().unwrap();
    let path = write_config(&tmp, UNREACHABLE_CONFIG);

    relay()
        .arg("--config")
        .arg(&path)
        .args(["chat", "--server", "weather=http://127.0.0.1:1/weather/sse"])
        .stdin(Stdio::null())
        .assert()
        .failure()
        .stdout(predicate::str::contains("Model backend not ready"))
        .stderr(predicate::str::contains("Failed to connect to MCP servers"))
        .stderr(predicate::str::contains("weather: http://127.0.0.1:1/weather/sse"));
}

#[test]
fn test_bad_server_flag_is_rejected() {
    relay()
        .args(["chat", "--server", "database"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("expected NAME=URL"));
}

#[test]
fn test_chat_with_no_enabled_servers_exits_cleanly_at_eof() {
    let tmp = TempDir::new().unwrap();
    let path = write_config(
        &tmp,
        r#"
[llm]
base_url = "http://127.0.0.1:1"

[mcp.servers.database]
url = "http://127.0.0.1:1/sse"
enabled = false
"#,
    );

    relay()
        .arg("--config")
        .arg(&path)
        .arg("chat")
        .stdin(Stdio::null())
        .assert()
        .success()
        .stdout(predicate::str::contains("Total tools available: 0"))
        .stdout(predicate::str::contains("Goodbye"));
}
