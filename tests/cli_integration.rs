//! Integration tests for the ralph-loop CLI

use assert_cmd::cargo;
use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Get a Command for the ralph-loop binary
fn ralph_loop() -> Command {
    let mut cmd = Command::new(cargo::cargo_bin!("ralph-loop"));
    for key in [
        "MAX_CALLS_PER_HOUR",
        "CLAUDE_TIMEOUT_MINUTES",
        "CLAUDE_OUTPUT_FORMAT",
        "CLAUDE_USE_CONTINUE",
        "RALPH_EXECUTION_MODE",
        "RALPH_RESET_ON_STARTUP",
    ] {
        cmd.env_remove(key);
    }
    cmd
}

/// Project with a `.ralph/config.toml` pointing at the given agent command.
fn project_with_agent(command: &str) -> TempDir {
    let temp = TempDir::new().unwrap();
    fs::create_dir_all(temp.path().join(".ralph")).unwrap();
    fs::write(
        temp.path().join(".ralph/config.toml"),
        format!("[agent]\ncommand = \"{command}\"\n"),
    )
    .unwrap();
    temp
}

#[test]
fn test_help() {
    ralph_loop()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Autonomous Claude Code loop"));
}

#[test]
fn test_version() {
    ralph_loop()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("0.1.0"));
}

#[test]
fn test_missing_project_dir_fails() {
    ralph_loop()
        .arg("--project")
        .arg("/definitely/not/a/project/dir")
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));
}

#[test]
fn test_status_without_run() {
    let temp = TempDir::new().unwrap();

    ralph_loop()
        .arg("--project")
        .arg(temp.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("No run recorded yet"));

    assert!(!temp.path().join(".ralph").exists());
}

#[test]
fn test_status_json_without_run() {
    let temp = TempDir::new().unwrap();

    ralph_loop()
        .arg("--project")
        .arg(temp.path())
        .args(["status", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("null"));
}

#[test]
fn test_circuit_status_starts_closed() {
    let temp = TempDir::new().unwrap();

    ralph_loop()
        .arg("--project")
        .arg(temp.path())
        .args(["circuit", "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("CLOSED"));
}

#[test]
fn test_circuit_reset_closes_open_breaker() {
    let temp = TempDir::new().unwrap();
    fs::create_dir_all(temp.path().join(".ralph")).unwrap();
    fs::write(
        temp.path().join(".ralph/circuit_breaker.json"),
        r#"{"state":"OPEN","consecutive_no_progress":3,"opened_at":"2025-03-01T10:00:00Z","trip_reason":"no_progress"}"#,
    )
    .unwrap();

    ralph_loop()
        .arg("--project")
        .arg(temp.path())
        .args(["circuit", "status", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"OPEN\""));

    ralph_loop()
        .arg("--project")
        .arg(temp.path())
        .args(["circuit", "reset"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Circuit breaker closed"));

    let state = fs::read_to_string(temp.path().join(".ralph/circuit_breaker.json")).unwrap();
    assert!(state.contains("\"CLOSED\""));
    assert!(state.contains("manual_reset"));
}

#[test]
fn test_session_history_empty() {
    let temp = TempDir::new().unwrap();

    ralph_loop()
        .arg("--project")
        .arg(temp.path())
        .args(["session", "history"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No transitions recorded"));
}

#[test]
fn test_session_reset_is_recorded() {
    let temp = TempDir::new().unwrap();

    ralph_loop()
        .arg("--project")
        .arg(temp.path())
        .args(["session", "reset", "--reason", "operator_request"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Session reset"));

    ralph_loop()
        .arg("--project")
        .arg(temp.path())
        .args(["session", "history"])
        .assert()
        .success()
        .stdout(predicate::str::contains("operator_request"));
}

#[test]
fn test_run_fails_when_agent_missing() {
    let temp = project_with_agent("definitely-not-an-installed-agent");

    ralph_loop()
        .arg("--project")
        .arg(temp.path())
        .arg("run")
        .assert()
        .code(6)
        .stderr(predicate::str::contains("Agent command not found"));
}

#[test]
fn test_run_rejects_invalid_budget() {
    let temp = TempDir::new().unwrap();

    ralph_loop()
        .arg("--project")
        .arg(temp.path())
        .env("MAX_CALLS_PER_HOUR", "0")
        .arg("run")
        .assert()
        .code(7)
        .stderr(predicate::str::contains("max_calls_per_hour"));
}

#[cfg(unix)]
#[test]
fn test_run_fails_without_prompt() {
    let temp = project_with_agent("true");

    ralph_loop()
        .arg("--project")
        .arg(temp.path())
        .arg("run")
        .assert()
        .code(6)
        .stderr(predicate::str::contains("Missing required file"));

    let status = fs::read_to_string(temp.path().join(".ralph/status.json")).unwrap();
    assert!(status.contains("\"failed\""));
}

#[cfg(unix)]
#[test]
fn test_run_stops_when_plan_is_complete() {
    let temp = project_with_agent("true");
    fs::write(temp.path().join("PROMPT.md"), "Keep going.").unwrap();
    fs::write(
        temp.path().join("IMPLEMENTATION_PLAN.md"),
        "- [x] parser\n- [x] code generator\n",
    )
    .unwrap();

    ralph_loop()
        .arg("--project")
        .arg(temp.path())
        .arg("run")
        .assert()
        .success()
        .stdout(predicate::str::contains("plan_complete"));

    let status = fs::read_to_string(temp.path().join(".ralph/status.json")).unwrap();
    assert!(status.contains("\"completed\""));
    assert!(temp.path().join(".ralph/logs/ralph.log").exists());
}
