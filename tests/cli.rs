use assert_cmd::Command;
use predicates::str::contains;
use serde_json::Value;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn bin() -> Command {
    let path = assert_cmd::cargo::cargo_bin!("cokacdir-setup");
    Command::new(path)
}

fn parse_json(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).expect("json output")
}

#[cfg(unix)]
fn install_fake_binary(dir: &Path) {
    use std::os::unix::fs::PermissionsExt;
    fs::create_dir_all(dir).unwrap();
    let path = dir.join("cokacdir");
    fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
}

#[test]
fn missing_tokens_prints_usage() {
    bin().assert().failure().stderr(contains("TOKEN"));
}

#[test]
fn blank_token_reports_its_position_and_touches_nothing() {
    let dir = tempdir().unwrap();
    let home = dir.path().join("home");
    fs::create_dir_all(&home).unwrap();

    bin()
        .env("HOME", &home)
        .env("PATH", "/nonexistent")
        .args(["ok", "   "])
        .assert()
        .code(1)
        .stderr(contains("token 2"));

    assert!(!home.join(".config").exists());
    assert!(!home.join(".local").exists());
}

#[test]
fn missing_server_binary_is_reported() {
    let dir = tempdir().unwrap();
    let home = dir.path().join("home");
    fs::create_dir_all(&home).unwrap();

    bin()
        .env("HOME", &home)
        .env("PATH", "/nonexistent")
        .arg("abc123")
        .assert()
        .code(1)
        .stderr(contains("not found in PATH"));
}

#[cfg(unix)]
#[test]
fn dry_run_prints_rendered_files_without_writing() {
    let dir = tempdir().unwrap();
    let home = dir.path().join("home");
    fs::create_dir_all(&home).unwrap();
    let bin_dir = dir.path().join("bin");
    install_fake_binary(&bin_dir);

    bin()
        .env("HOME", &home)
        .env("PATH", &bin_dir)
        .env_remove("XDG_STATE_HOME")
        .args(["--dry-run", "abc123"])
        .assert()
        .success()
        .stdout(contains("--ccserver -- 'abc123'"))
        .stdout(contains("cokacdir-wrapper.sh"));

    assert!(!home.join(".config").exists());
    assert!(!home.join(".local").exists());
    assert!(!home.join("Library").exists());
}

#[cfg(unix)]
#[test]
fn dry_run_json_emits_result_envelope() {
    let dir = tempdir().unwrap();
    let home = dir.path().join("home");
    fs::create_dir_all(&home).unwrap();
    let bin_dir = dir.path().join("bin");
    install_fake_binary(&bin_dir);

    let output = bin()
        .env("HOME", &home)
        .env("PATH", &bin_dir)
        .env_remove("XDG_STATE_HOME")
        .args(["--json", "--dry-run", "abc123"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let value = parse_json(&output.stdout);
    assert_eq!(value["ok"], Value::Bool(true));
    assert_eq!(value["result"]["dry_run"], Value::Bool(true));
    let wrapper = value["result"]["wrapper"].as_str().expect("wrapper text");
    assert!(wrapper.contains("--ccserver -- 'abc123'"));
    let descriptor = value["result"]["descriptor"]
        .as_str()
        .expect("descriptor text");
    assert!(!descriptor.contains("abc123"));
}

#[test]
fn json_error_envelope_on_failure() {
    let dir = tempdir().unwrap();
    let home = dir.path().join("home");
    fs::create_dir_all(&home).unwrap();

    let output = bin()
        .env("HOME", &home)
        .env("PATH", "/nonexistent")
        .args(["--json", "abc123"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));

    let value = parse_json(&output.stdout);
    assert_eq!(value["ok"], Value::Bool(false));
    let error = value["error"].as_str().expect("error text");
    assert!(error.contains("not found in PATH"));
}
