//! End-to-end tests for the tq binary.
//!
//! Every test points the binary at its own temporary data directory.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::TempDir;

fn tq(data_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("tq").expect("tq binary should exist");
    cmd.env_remove("TQ_CONFIG")
        .env_remove("RUST_LOG")
        .env("TQ_LOG", "off")
        .arg("--data-dir")
        .arg(data_dir.path())
        .args(["--user", "77"]);
    cmd
}

fn stdout_json(cmd: &mut Command) -> Value {
    let output = cmd.assert().success().get_output().stdout.clone();
    serde_json::from_slice(&output).expect("stdout should be JSON")
}

#[test]
fn unknown_command_fails() {
    let dir = TempDir::new().unwrap();
    tq(&dir)
        .arg("nonexistent-command")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

#[test]
fn status_of_fresh_data_dir_is_empty() {
    let dir = TempDir::new().unwrap();
    let status = stdout_json(tq(&dir).arg("status"));
    assert_eq!(status["user"], 77);
    assert_eq!(status["directory"], "evq_77.dir");
    assert_eq!(status["total_bytes"], 0);
}

#[test]
fn record_status_drain_round_trip() {
    let dir = TempDir::new().unwrap();

    let recorded = stdout_json(tq(&dir).args([
        "record",
        "MatchStarted",
        "--dimensions",
        r#"{"map": "harbor"}"#,
    ]));
    assert_eq!(recorded["event"]["name"], "MatchStarted");
    tq(&dir)
        .args(["record", "MatchEnded", "--measurements", r#"{"kills": 4}"#])
        .assert()
        .success();

    let status = stdout_json(tq(&dir).arg("status"));
    assert_eq!(status["files"].as_array().unwrap().len(), 1);
    assert!(status["total_bytes"].as_u64().unwrap() > 0);

    let output = tq(&dir).arg("drain").assert().success().get_output().stdout.clone();
    let names: Vec<String> = String::from_utf8(output)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str::<Value>(l).unwrap()["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, ["MatchStarted", "MatchEnded"]);

    let status = stdout_json(tq(&dir).arg("status"));
    assert_eq!(status["total_bytes"], 0);
}

#[test]
fn invalid_event_name_exits_with_args_error() {
    let dir = TempDir::new().unwrap();
    tq(&dir)
        .args(["record", "not a name"])
        .assert()
        .code(10)
        .stderr(predicate::str::contains("ERR_ARGS"));
}

#[test]
fn invalid_config_exits_with_args_error() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("tq.toml");
    std::fs::write(&config, "[queue]\nmax_file_size = 1\n").unwrap();
    tq(&dir)
        .arg("--config")
        .arg(&config)
        .arg("check")
        .assert()
        .code(10)
        .stderr(predicate::str::contains("1024"));
}

#[test]
fn corrupt_directory_exits_with_io_error() {
    let dir = TempDir::new().unwrap();
    let user_dir = dir.path().join("77");
    std::fs::create_dir_all(&user_dir).unwrap();
    std::fs::write(user_dir.join("evq_77.dir"), "garbage\n").unwrap();
    tq(&dir).arg("status").assert().code(21);
}

#[test]
fn check_prints_config_in_both_formats() {
    let dir = TempDir::new().unwrap();
    let config = stdout_json(tq(&dir).arg("check"));
    assert_eq!(config["queue"]["max_file_size"], 128_000);
    assert_eq!(config["tenant"]["max_events_per_payload"], 500);

    tq(&dir)
        .args(["check", "-f", "human"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[queue]"));
}

#[test]
fn log_level_flag_overrides_rust_log() {
    let dir = TempDir::new().unwrap();
    tq(&dir)
        .env("RUST_LOG", "trace")
        .args(["--log-level", "off", "record", "Quiet"])
        .assert()
        .success()
        .stderr(predicate::str::is_empty());
}

#[test]
fn rust_log_directives_apply_without_tq_log() {
    let dir = TempDir::new().unwrap();
    tq(&dir)
        .env_remove("TQ_LOG")
        .env("RUST_LOG", "tq_events=info")
        .args(["record", "Loud"])
        .assert()
        .success()
        .stderr(predicate::str::contains("event queue mode changed"));
}
