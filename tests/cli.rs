//! Black-box tests of the `kiln` binary.

use std::io::Write as _;

use assert_cmd::Command;
use predicates::prelude::*;

use kiln::ui::decode_fields;

fn kiln() -> Command {
    let mut cmd = Command::cargo_bin("kiln").unwrap();
    // Keep the cache out of the source tree.
    let dir = std::env::temp_dir().join("kiln-cli-tests");
    std::fs::create_dir_all(&dir).unwrap();
    cmd.current_dir(dir);
    cmd
}

fn write_template(json: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();
    file
}

#[test]
fn version_command_prints_the_version() {
    kiln()
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains(format!(
            "kiln v{}",
            env!("CARGO_PKG_VERSION")
        )));
}

#[test]
fn no_arguments_prints_usage_and_fails() {
    kiln()
        .assert()
        .code(1)
        .stdout(predicate::str::contains("usage: kiln"))
        .stdout(predicate::str::contains("build"))
        .stdout(predicate::str::contains("version"));
}

#[test]
fn unknown_command_is_reported_with_usage() {
    kiln()
        .arg("no-such-command")
        .assert()
        .code(1)
        .stdout(predicate::str::contains("unknown command"))
        .stdout(predicate::str::contains("usage: kiln"));
}

#[test]
fn machine_readable_output_is_line_oriented() {
    let output = kiln()
        .args(["--machine-readable", "version"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let text = String::from_utf8(output).unwrap();
    let line = text.lines().next().expect("one event line");
    let fields = decode_fields(line);
    assert!(fields[0].parse::<u64>().is_ok(), "timestamp field: {line}");
    assert_eq!(fields[1], "", "host-level event has no target");
    assert_eq!(fields[2], "message");
    assert!(fields[3].starts_with("kiln v"));
}

#[test]
fn build_runs_the_null_builder() {
    let template = write_template(
        r#"{"builders": [{"type": "null", "name": "web", "image_name": "web-1"}]}"#,
    );

    kiln()
        .args(["build", &template.path().display().to_string()])
        .assert()
        .success()
        .stdout(predicate::str::contains("build finished: web-1"));
}

#[test]
fn build_reports_every_config_problem_at_once() {
    let template = write_template(
        r#"{"builders": [
            {"type": "null", "name": "a"},
            {"type": "null", "name": "b", "image_name": 42}
        ]}"#,
    );

    kiln()
        .args(["build", &template.path().display().to_string()])
        .assert()
        .code(1)
        .stdout(
            predicate::str::contains("\"a\"").and(predicate::str::contains("\"b\"")),
        );
}

#[test]
fn build_without_a_template_argument_fails() {
    kiln()
        .arg("build")
        .assert()
        .code(1)
        .stdout(predicate::str::contains("usage: kiln build"));
}

#[test]
fn build_with_a_missing_template_fails() {
    kiln()
        .args(["build", "/nonexistent/template.json"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("failed to read template"));
}
