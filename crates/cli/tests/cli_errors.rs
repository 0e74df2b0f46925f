use assert_cmd::cargo::cargo_bin_cmd;
use std::fs;
use tempfile::tempdir;

#[test]
fn missing_inputs_warn_and_still_write_the_header() {
    let dir = tempdir().expect("tempdir");
    let out = dir.path().join("cg.csv");

    let assert = cargo_bin_cmd!("callgraph")
        .arg(dir.path().join("no-such-module.json"))
        .arg("-o")
        .arg(&out)
        .assert()
        .success();

    let stderr = String::from_utf8_lossy(&assert.get_output().stderr).to_string();
    assert!(stderr.contains("error loading file"), "expected a load warning, got: {stderr}");

    let text = fs::read_to_string(&out).expect("read csv");
    assert_eq!(text.lines().count(), 1, "header only");
}

#[test]
fn unsupported_formats_are_skipped() {
    let dir = tempdir().expect("tempdir");
    let bogus = dir.path().join("input.o");
    fs::write(&bogus, b"\x7fELF").expect("write");
    let out = dir.path().join("cg.csv");

    cargo_bin_cmd!("callgraph").arg(&bogus).arg("-o").arg(&out).assert().success();
    let text = fs::read_to_string(&out).expect("read csv");
    assert_eq!(text.lines().count(), 1);
}

#[test]
fn unopenable_output_path_is_fatal() {
    let dir = tempdir().expect("tempdir");
    let input = dir.path().join("m.json");
    fs::write(&input, "{}").expect("write");

    cargo_bin_cmd!("callgraph")
        .arg(&input)
        .arg("-o")
        .arg(dir.path().join("no-such-dir").join("cg.csv"))
        .assert()
        .failure();
}

#[test]
fn inputs_are_required() {
    cargo_bin_cmd!("callgraph").assert().failure();
}

#[test]
fn malformed_json_is_a_warning_not_an_error() {
    let dir = tempdir().expect("tempdir");
    let input = dir.path().join("broken.json");
    fs::write(&input, "{ not json").expect("write");
    let out = dir.path().join("cg.csv");

    let assert = cargo_bin_cmd!("callgraph").arg(&input).arg("-o").arg(&out).assert().success();
    let stderr = String::from_utf8_lossy(&assert.get_output().stderr).to_string();
    assert!(stderr.contains("error loading file"));
}
