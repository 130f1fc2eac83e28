//! Integration tests for the tailship binary
//!
//! These tests drive the agent through its command-line interface.

use mockito::{Matcher, Server};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time;

fn binary() -> &'static str {
    env!("CARGO_BIN_EXE_tailship")
}

fn write_config(dir: &Path, api_endpoint: &str, log_files: &[&Path], extra: serde_json::Value) -> std::path::PathBuf {
    let mut config = serde_json::json!({
        "api_endpoint": api_endpoint,
        "api_token": "integration-token",
        "machine_id": "it-machine",
        "log_files": log_files,
        "state_dir": dir.join("state"),
        "poll_interval": 1,
        "flush_interval": 1,
        "host_metrics_enabled": false,
        "docker_enabled": false
    });
    if let (Some(base), Some(extra)) = (config.as_object_mut(), extra.as_object()) {
        for (key, value) in extra {
            base.insert(key.clone(), value.clone());
        }
    }
    let path = dir.join("agent_config.json");
    fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();
    path
}

#[tokio::test]
async fn test_help_lists_flags() {
    let output = Command::new(binary())
        .arg("--help")
        .output()
        .await
        .expect("Failed to run --help");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("--test-config"));
    assert!(stdout.contains("--config"));
}

#[tokio::test]
async fn test_missing_config_writes_template_and_fails_closed() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("nested").join("agent_config.json");

    let output = Command::new(binary())
        .arg("--config")
        .arg(&config_path)
        .arg("--test-config")
        .env_remove("TAILSHIP_API_TOKEN")
        .env_remove("TAILSHIP_API_ENDPOINT")
        .output()
        .await
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    assert!(config_path.exists(), "default template should be written");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("api_token"), "{}", stdout);
}

#[tokio::test]
async fn test_invalid_config_file_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("agent_config.yaml");
    fs::write(&config_path, "invalid: yaml: content:\n  - [unclosed").unwrap();

    let output = Command::new(binary())
        .arg("--config")
        .arg(&config_path)
        .output()
        .await
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
}

#[tokio::test]
async fn test_config_check_against_reachable_api() {
    let mut server = Server::new_async().await;
    let lookup = server
        .mock("GET", "/api/agent/log-sources/12/")
        .match_header("authorization", "Bearer integration-token")
        .with_status(200)
        .with_body("{}")
        .create_async()
        .await;
    let temp_dir = TempDir::new().unwrap();
    let log = temp_dir.path().join("app.log");
    fs::write(&log, "hello\n").unwrap();
    let config_path = write_config(
        temp_dir.path(),
        &format!("{}/api", server.url()),
        &[&log],
        serde_json::json!({ "log_source_id": "12" }),
    );

    let output = Command::new(binary())
        .arg("--config")
        .arg(&config_path)
        .arg("--test-config")
        .env_remove("TAILSHIP_API_TOKEN")
        .env_remove("TAILSHIP_API_ENDPOINT")
        .output()
        .await
        .unwrap();

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "{}", stdout);
    assert!(stdout.contains("API connection successful"));
    assert!(stdout.contains("1/1 log files accessible"));
    lookup.assert_async().await;
}

#[tokio::test]
async fn test_config_check_fails_on_rejected_token() {
    let mut server = Server::new_async().await;
    let ping = server
        .mock("GET", Matcher::Any)
        .with_status(401)
        .create_async()
        .await;
    let temp_dir = TempDir::new().unwrap();
    let config_path = write_config(
        temp_dir.path(),
        &server.url(),
        &[],
        serde_json::json!({}),
    );

    let output = Command::new(binary())
        .arg("--config")
        .arg(&config_path)
        .arg("--test-config")
        .env_remove("TAILSHIP_API_TOKEN")
        .env_remove("TAILSHIP_API_ENDPOINT")
        .output()
        .await
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    ping.assert_async().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_ships_lines_and_checkpoints_on_sigterm() {
    let mut server = Server::new_async().await;
    // Both lines in a single batch, the blank line dropped
    let ingest = server
        .mock("POST", "/api/logs/ingest/")
        .match_header("authorization", "Bearer integration-token")
        .match_body(Matcher::AllOf(vec![
            Matcher::Regex(r#"^\[\{.*"message":"2024-01-01 10:00:00 INFO hello""#.to_string()),
            Matcher::Regex(r#""message":"2024-01-01 10:00:01 ERROR boom".*\}\]$"#.to_string()),
            Matcher::Regex(r#""machine_id":"it-machine""#.to_string()),
            Matcher::Regex(r#""level":"ERROR""#.to_string()),
        ]))
        .with_status(201)
        .expect(1)
        .create_async()
        .await;

    let temp_dir = TempDir::new().unwrap();
    // Present and empty at startup, so tailing starts at offset 0
    let log = temp_dir.path().join("service.log");
    fs::write(&log, "").unwrap();
    let config_path = write_config(
        temp_dir.path(),
        &format!("{}/api", server.url()),
        &[&log],
        serde_json::json!({}),
    );

    let mut child = Command::new(binary())
        .arg("--config")
        .arg(&config_path)
        .env_remove("TAILSHIP_API_TOKEN")
        .env_remove("TAILSHIP_API_ENDPOINT")
        .env_remove("RUST_LOG")
        .env("NO_COLOR", "1")
        .stdout(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .unwrap();

    let mut lines = BufReader::new(child.stdout.take().unwrap()).lines();
    let started = time::timeout(Duration::from_secs(15), async {
        while let Ok(Some(line)) = lines.next_line().await {
            if line.contains("Agent started") {
                return true;
            }
        }
        false
    })
    .await
    .expect("agent should start within 15s");
    assert!(started, "agent exited before starting");
    // Keep reading so the agent never blocks on a full pipe
    let drain = tokio::spawn(async move { while let Ok(Some(_)) = lines.next_line().await {} });

    // One write so a single poll sees both lines
    fs::OpenOptions::new()
        .append(true)
        .open(&log)
        .unwrap()
        .write_all(b"2024-01-01 10:00:00 INFO hello\n2024-01-01 10:00:01 ERROR boom\n\n")
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(15);
    while !ingest.matched_async().await && Instant::now() < deadline {
        time::sleep(Duration::from_millis(50)).await;
    }
    ingest.assert_async().await;

    let pid = child.id().unwrap().to_string();
    let status = Command::new("kill").arg("-TERM").arg(&pid).status().await.unwrap();
    assert!(status.success());

    let exit = time::timeout(Duration::from_secs(15), child.wait())
        .await
        .expect("agent should stop after SIGTERM")
        .unwrap();
    assert!(exit.success());
    drain.abort();

    let positions: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(temp_dir.path().join("state").join("positions.json")).unwrap(),
    )
    .unwrap();
    let offset = positions[&*log.to_string_lossy()].as_u64().unwrap();
    assert_eq!(offset, fs::metadata(&log).unwrap().len());
}
