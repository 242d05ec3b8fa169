//! CLI smoke tests for the ctxkit-inspect binary.

use std::path::PathBuf;
use std::process::{Command, Stdio};
use tempfile::TempDir;

fn run_inspect(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_ctxkit-inspect"))
        .args(args)
        .env_remove("CTXKIT__CONTEXT__NAME")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .expect("Failed to execute ctxkit-inspect")
}

fn write_config(dir: &TempDir, content: &str) -> PathBuf {
    let path = dir.path().join("ctxkit.yaml");
    std::fs::write(&path, content).expect("Failed to write config file");
    path
}

const SAMPLE: &str = r#"
context:
  name: "demo"

logging:
  default:
    console_level: "off"

bindings:
  greeting: "hello"
  app:
    server:
      port: 8080
  handlers.http: 1
  handlers.grpc: 2

configs:
  servers.main:
    port: 9000
"#;

fn run_with_sample(args: &[&str]) -> std::process::Output {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = write_config(&dir, SAMPLE);
    let mut full = vec!["--config", path.to_str().unwrap()];
    full.extend_from_slice(args);
    run_inspect(&full)
}

#[test]
fn test_cli_help_command() {
    let output = run_inspect(&["--help"]);
    assert!(output.status.success(), "Help command should succeed");

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Usage:"), "Should contain usage information");
    for word in ["check", "inspect", "get", "--config", "--print-config"] {
        assert!(stdout.contains(word), "Help should mention {word}: {stdout}");
    }
}

#[test]
fn test_cli_version_command() {
    let output = run_inspect(&["--version"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("ctxkit-inspect"));
    assert!(stdout.contains("0.1.0"));
}

#[test]
fn test_cli_invalid_command() {
    let output = run_inspect(&["invalid-command"]);
    assert!(!output.status.success(), "Invalid command should fail");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error"), "Unexpected stderr: {stderr}");
}

#[test]
fn test_cli_missing_config_file() {
    let output = run_inspect(&["-c", "/nonexistent/config.yaml", "check"]);
    assert!(!output.status.success(), "Should fail with missing config");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("config file not found"),
        "Should mention the missing file: {stderr}"
    );
}

#[test]
fn test_cli_invalid_yaml() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = write_config(&dir, "invalid: yaml: content: [unclosed");
    let output = run_inspect(&["--config", path.to_str().unwrap(), "check"]);
    assert!(!output.status.success(), "Should fail with invalid YAML");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Failed to load config"), "Unexpected stderr: {stderr}");
}

#[test]
fn test_cli_check_counts_bindings() {
    let output = run_with_sample(&["check"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "check failed: {stdout}");
    // four constants plus one configuration binding
    assert!(
        stdout.contains("Configuration OK: 5 binding(s) in context 'demo'"),
        "Unexpected stdout: {stdout}"
    );
}

#[test]
fn test_cli_no_command_defaults_to_check() {
    let output = run_inspect(&[]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Configuration OK: 0 binding(s) in context 'application'"));
}

#[test]
fn test_cli_inspect_by_pattern_and_tag() {
    let output = run_with_sample(&["inspect", "--pattern", "handlers.*"]);
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let keys: Vec<&str> = json
        .as_array()
        .unwrap()
        .iter()
        .map(|b| b["key"].as_str().unwrap())
        .collect();
    assert_eq!(keys, ["handlers.grpc", "handlers.http"]);

    let output = run_with_sample(&["inspect", "--tag", "configurationFor"]);
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json.as_array().unwrap().len(), 1);
    assert_eq!(json[0]["key"], "servers.main:$config");
    assert_eq!(json[0]["tags"]["configurationFor"], "servers.main");
    assert_eq!(json[0]["type"], "Constant");
}

#[test]
fn test_cli_get_values() {
    let output = run_with_sample(&["get", "greeting"]);
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "\"hello\"");

    let output = run_with_sample(&["get", "app#server.port"]);
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "8080");

    let output = run_with_sample(&["get", "servers.main:$config#port"]);
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "9000");
}

#[test]
fn test_cli_get_missing_key_fails() {
    let output = run_with_sample(&["get", "nope"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Failed to resolve 'nope'"), "Unexpected stderr: {stderr}");

    let output = run_with_sample(&["get", "app#server.host"]);
    assert!(!output.status.success());
}

#[test]
fn test_cli_print_config() {
    let output = run_with_sample(&["--print-config"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("context:"));
    assert!(stdout.contains("name: demo"));
    assert!(stdout.contains("greeting: hello"));
}

#[test]
fn test_cli_verbose_flag() {
    let output = run_inspect(&["-vv", "--help"]);
    assert!(output.status.success(), "Verbose help should succeed");
}
