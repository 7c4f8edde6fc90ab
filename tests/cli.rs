use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;

fn catcount() -> Command {
    let mut cmd = Command::cargo_bin("catcount").unwrap();
    cmd.env_remove("RUST_LOG");
    cmd
}

#[test]
fn missing_output_is_a_usage_error() {
    catcount()
        .assert()
        .code(2)
        .stderr(predicate::str::contains("<OUTPUT>"));
}

#[test]
fn existing_output_is_a_usage_error() {
    let dir = tempfile::tempdir().unwrap();
    catcount()
        .args(["--input", "whatever.jsonl"])
        .arg(dir.path())
        .assert()
        .code(2)
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn missing_input_is_a_usage_error() {
    let dir = tempfile::tempdir().unwrap();
    catcount()
        .arg(dir.path().join("out"))
        .assert()
        .code(2)
        .stderr(predicate::str::contains("no input given"));
    assert!(!dir.path().join("out").exists());
}

#[test]
fn unreadable_input_is_an_infrastructure_error() {
    let dir = tempfile::tempdir().unwrap();
    let pattern = dir.path().join("nothing-*.jsonl");
    catcount()
        .arg("--input")
        .arg(&pattern)
        .arg(dir.path().join("out"))
        .assert()
        .code(1)
        .stderr(predicate::str::contains("record source unavailable"));
    assert!(!dir.path().join("out").exists());
}

#[test]
fn successful_job_prints_counters_and_writes_parts() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("products.jsonl");
    fs::write(
        &input,
        concat!(
            r#"{"category":["Clothing, Shoes & Jewelry","Men","Shirts"]}"#,
            "\n",
            r#"{"category":["Books","Fiction"]}"#,
            "\n",
            "garbage\n",
            r#"{"category":["Clothing, Shoes & Jewelry","Men"]}"#,
            "\n",
        ),
    )
    .unwrap();
    let output = dir.path().join("out");

    catcount()
        .arg("-i")
        .arg(&input)
        .args(["-r", "2", "--counter-group", "Q2"])
        .arg(&output)
        .assert()
        .success()
        .stdout(predicate::str::contains("Q2"))
        .stdout(predicate::str::contains("Rows Processed=4"))
        .stdout(predicate::str::contains("Malformed Payloads=1"));

    assert!(output.join("_SUCCESS").exists());
    let mut lines: Vec<String> = fs::read_dir(&output)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.file_name().unwrap().to_string_lossy().starts_with("part-r-"))
        .flat_map(|path| {
            fs::read_to_string(path)
                .unwrap()
                .lines()
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .collect();
    lines.sort();
    assert_eq!(lines, vec!["Men\t2", "Shirts\t1"]);
}
