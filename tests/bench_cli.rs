// CLI smoke tests for the dispatch-bench binary.
use std::process::Command;

use serde_json::Value;

fn cmd() -> Command {
    let exe = env!("CARGO_BIN_EXE_dispatch-bench");
    let mut command = Command::new(exe);
    command.env("RUST_LOG", "warn");
    command
}

fn parse_json(output: &[u8]) -> Value {
    serde_json::from_str(std::str::from_utf8(output).expect("utf8")).expect("valid json")
}

#[test]
fn json_report_covers_every_run() {
    let output = cmd()
        .args([
            "--format",
            "json",
            "--messages",
            "500",
            "--buffer-size",
            "65536",
            "--producers",
            "1",
            "--producers",
            "2",
            "--payload-bytes",
            "32",
        ])
        .output()
        .expect("bench");
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let report = parse_json(&output.stdout);
    assert_eq!(report["name"], "logbuffer");
    assert_eq!(report["params"]["messages"], 500);
    let results = report["results"].as_array().expect("results array");
    assert_eq!(results.len(), 2);
    for (result, producers) in results.iter().zip([1, 2]) {
        assert_eq!(result["producers"], producers);
        assert_eq!(result["payload_bytes"], 32);
        assert!(result["msgs_per_sec"].as_f64().expect("rate") > 0.0);
    }
}

#[test]
fn batch_run_succeeds() {
    let output = cmd()
        .args([
            "--format",
            "json",
            "--messages",
            "400",
            "--buffer-size",
            "65536",
            "--batch",
            "4",
            "--subscribers",
            "2",
        ])
        .output()
        .expect("bench");
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let report = parse_json(&output.stdout);
    assert_eq!(report["results"][0]["batch"], 4);
    assert_eq!(report["results"][0]["subscribers"], 2);
}

#[test]
fn invalid_arguments_map_to_usage_exit_code() {
    let output = cmd().args(["--format", "yaml"]).output().expect("bench");
    assert_eq!(output.status.code(), Some(2));
    assert!(output.stdout.is_empty());

    let output = cmd()
        .args(["--format", "json", "--payload-bytes", "4"])
        .output()
        .expect("bench");
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn undersized_buffer_is_rejected() {
    let output = cmd()
        .args(["--format", "json", "--buffer-size", "64", "--messages", "1"])
        .output()
        .expect("bench");
    assert_eq!(output.status.code(), Some(2));
}
