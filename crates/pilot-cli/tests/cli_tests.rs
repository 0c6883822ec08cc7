//! Integration tests for the `patchpilot` binary

use serde_json::Value;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};

fn patchpilot(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_patchpilot"))
        .args(args)
        .env("RUST_LOG", "error")
        .output()
        .expect("patchpilot runs")
}

fn demo_fixture() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../demos/auth-migration.toml")
}

fn stdout_json(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("stdout is JSON")
}

#[test]
fn config_prints_parseable_defaults() {
    let output = patchpilot(&["config"]);
    assert!(output.status.success());

    let text = String::from_utf8(output.stdout).unwrap();
    let parsed: toml::Value = toml::from_str(&text).unwrap();
    assert_eq!(parsed["max_attempts"].as_integer(), Some(3));
    assert_eq!(parsed["enable_threshold"].as_float(), Some(0.7));
}

#[test]
fn scan_reports_inventory() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("src")).unwrap();
    fs::write(dir.path().join("package.json"), "{}").unwrap();
    fs::write(dir.path().join("src/client.ts"), "export {}").unwrap();
    fs::write(dir.path().join("src/session.ts"), "export {}").unwrap();

    let output = patchpilot(&["scan", "--project", dir.path().to_str().unwrap(), "--json"]);
    assert!(output.status.success());

    let inventory = stdout_json(&output);
    assert_eq!(inventory["files"], 2);
    assert_eq!(inventory["manifests"][0], "package.json");
}

#[test]
fn scan_rejects_missing_directory() {
    let output = patchpilot(&["scan", "--project", "/nonexistent/patchpilot-project"]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn run_demo_fixture_as_json() {
    let fixture = demo_fixture();
    let output = patchpilot(&["run", "--fixture", fixture.to_str().unwrap(), "--json"]);
    assert_eq!(output.status.code(), Some(0), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let body = stdout_json(&output);
    let libraries: Vec<&str> = body["report"]["outcomes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|o| o["library"].as_str().unwrap())
        .collect();
    assert_eq!(libraries, vec!["auth-sdk-legacy", "database-connector"]);
    assert!(body["report"]["outcomes"]
        .as_array()
        .unwrap()
        .iter()
        .all(|o| o["phase"] == "completed"));

    let attempts = body["attempts"].as_array().unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0]["outcome"], "resolved");
    assert!(!body["trace"].as_array().unwrap().is_empty());
}

#[test]
fn run_exits_two_when_a_target_fails() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = dir.path().join("fixture.toml");
    fs::write(
        &fixture,
        r#"
[[targets]]
library = "auth-sdk-legacy"
current_version = "v1.2.4"
target_version = "v2.0.0"
confidence = 0.98

[[knowledge.auth-sdk-legacy]]
type = "doc"
summary = "Auth token format changed from Bearer to Token prefix."
citation = "docs.auth-sdk.com/v2/migration"
relevance = 0.99

[[checks]]
selector = "target:auth-sdk-legacy"
name = "Token Validation"
outcomes = [{ status = "fail", error = "AssertionError: expected Token prefix" }]
"#,
    )
    .unwrap();

    let output = patchpilot(&["run", "--fixture", fixture.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(2));

    let text = String::from_utf8(output.stdout).unwrap();
    assert!(text.contains("auth-sdk-legacy [failed]"));
    assert!(text.contains("0/1 targets completed"));
}

#[test]
fn run_writes_trace_log() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("trace.jsonl");
    let fixture = demo_fixture();

    let output = patchpilot(&[
        "run",
        "--fixture",
        fixture.to_str().unwrap(),
        "--trace-log",
        log.to_str().unwrap(),
    ]);
    assert!(output.status.success());

    let contents = fs::read_to_string(&log).unwrap();
    let lines: Vec<Value> = contents
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert!(!lines.is_empty());
    let seqs: Vec<u64> = lines.iter().map(|l| l["seq"].as_u64().unwrap()).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
}
