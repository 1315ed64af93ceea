//! Black-box tests against the built binary.

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn mirrors_wrapped_command_output() {
    let dir = tempfile::tempdir().unwrap();
    Command::cargo_bin("wiretap")
        .unwrap()
        .current_dir(dir.path())
        .args(["--store", "records.jsonl", "--", "echo", "hello world"])
        .assert()
        .success()
        .stdout(predicate::str::contains("hello world"));
}

#[test]
fn exits_with_the_child_status() {
    let dir = tempfile::tempdir().unwrap();
    Command::cargo_bin("wiretap")
        .unwrap()
        .current_dir(dir.path())
        .args(["--store", "records.jsonl", "--", "sh", "-c", "exit 4"])
        .assert()
        .code(4);
}

#[test]
fn persists_structured_records_from_the_stream() {
    let dir = tempfile::tempdir().unwrap();
    Command::cargo_bin("wiretap")
        .unwrap()
        .current_dir(dir.path())
        .args([
            "--store",
            "records.jsonl",
            "--",
            "sh",
            "-c",
            "echo '{\"type\":\"span\",\"ms\":7}'; echo not-a-record",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("not-a-record"));

    let contents = std::fs::read_to_string(dir.path().join("records.jsonl")).unwrap();
    assert!(contents.contains("\"type\":\"span\""));
}

#[test]
fn refuses_to_run_without_a_command() {
    Command::cargo_bin("wiretap")
        .unwrap()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}
