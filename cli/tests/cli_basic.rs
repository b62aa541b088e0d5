//! Basic CLI integration tests
//!
//! These tests verify that the CLI binary works correctly with various
//! argument combinations and validates error codes.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn dvojnik() -> Command {
    Command::cargo_bin("dvojnik").unwrap()
}

/// A fresh photos dir with two identical files plus a data dir.
fn fixture() -> (TempDir, std::path::PathBuf, std::path::PathBuf) {
    let tmp = TempDir::new().unwrap();
    let photos = tmp.path().join("photos");
    let data = tmp.path().join("data");
    std::fs::create_dir_all(&photos).unwrap();
    std::fs::create_dir_all(&data).unwrap();
    // Keep recycled files inside the temp dir instead of the user trash.
    std::fs::write(data.join("config.json"), r#"{"move_to_trash": false}"#).unwrap();
    std::fs::write(photos.join("a.jpg"), b"identical bytes").unwrap();
    std::fs::write(photos.join("a_copy.jpg"), b"identical bytes").unwrap();
    (tmp, photos, data)
}

// ============================================================================
// Help and Version Tests
// ============================================================================

#[test]
fn test_help() {
    dvojnik()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("duplicate photo and video finder"));
}

#[test]
fn test_scan_help() {
    dvojnik()
        .args(["scan", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Scan roots and detect duplicate groups"));
}

#[test]
fn test_merge_help() {
    dvojnik()
        .args(["merge", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--dry-run"))
        .stdout(predicate::str::contains("--force-overwrite"));
}

#[test]
fn test_version() {
    dvojnik()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("dvojnik"));
}

// ============================================================================
// Scan Command Tests
// ============================================================================

#[test]
fn test_scan_emits_json_envelope() {
    let (_tmp, photos, data) = fixture();
    dvojnik()
        .args(["--data-dir"])
        .arg(&data)
        .arg("scan")
        .arg(&photos)
        .arg("--json")
        .assert()
        .success()
        .stdout(predicate::str::contains("started_at"))
        .stdout(predicate::str::contains("duration_ms"))
        .stdout(predicate::str::contains("\"discovered\": 2"))
        .stdout(predicate::str::contains("\"groups\": 1"));
}

#[test]
fn test_scan_missing_root_fails_with_io_exit_code() {
    let (_tmp, _photos, data) = fixture();
    dvojnik()
        .args(["--data-dir"])
        .arg(&data)
        .args(["scan", "/definitely/not/here"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("Not found"));
}

// ============================================================================
// Groups / Merge / Undo Flow
// ============================================================================

#[test]
fn test_groups_after_scan_lists_one_group() {
    let (_tmp, photos, data) = fixture();
    dvojnik()
        .args(["--data-dir"])
        .arg(&data)
        .arg("scan")
        .arg(&photos)
        .arg("--json")
        .assert()
        .success();

    dvojnik()
        .args(["--data-dir"])
        .arg(&data)
        .args(["groups", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("identical content (checksum match)"))
        .stdout(predicate::str::contains("\"confidence\": 1.0"));
}

#[test]
fn test_merge_dry_run_then_undo_flow() {
    let (_tmp, photos, data) = fixture();
    dvojnik()
        .args(["--data-dir"])
        .arg(&data)
        .arg("scan")
        .arg(&photos)
        .arg("--json")
        .assert()
        .success();

    let output = dvojnik()
        .args(["--data-dir"])
        .arg(&data)
        .args(["groups", "--json"])
        .output()
        .unwrap();
    let text = String::from_utf8(output.stdout).unwrap();
    let envelope: serde_json::Value = serde_json::from_str(&text).unwrap();
    let group_id = envelope["data"][0]["group_id"].as_str().unwrap().to_string();

    // Dry run leaves both files in place and logs nothing.
    dvojnik()
        .args(["--data-dir"])
        .arg(&data)
        .args(["merge", &group_id, "--dry-run", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"status\": \"committed\""));
    assert!(photos.join("a_copy.jpg").exists());

    // Real merge recycles the loser.
    dvojnik()
        .args(["--data-dir"])
        .arg(&data)
        .args(["merge", &group_id, "--json"])
        .assert()
        .success();
    assert!(photos.join("a.jpg").exists());
    assert!(!photos.join("a_copy.jpg").exists());

    // Transaction history shows the commit.
    dvojnik()
        .args(["--data-dir"])
        .arg(&data)
        .args(["tx", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("committed"));

    // Undo restores the loser.
    dvojnik()
        .args(["--data-dir"])
        .arg(&data)
        .args(["undo", "--json"])
        .assert()
        .success();
    assert!(photos.join("a_copy.jpg").exists());
}

#[test]
fn test_merge_unknown_group_is_user_error() {
    let (_tmp, _photos, data) = fixture();
    dvojnik()
        .args(["--data-dir"])
        .arg(&data)
        .args(["merge", &"0".repeat(32)])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("unknown group"));
}

#[test]
fn test_merge_malformed_group_id_is_user_error() {
    let (_tmp, _photos, data) = fixture();
    dvojnik()
        .args(["--data-dir"])
        .arg(&data)
        .args(["merge", "not-a-hex-id"])
        .assert()
        .failure()
        .code(1);
}

#[test]
fn test_undo_with_nothing_to_undo() {
    let (_tmp, _photos, data) = fixture();
    dvojnik()
        .args(["--data-dir"])
        .arg(&data)
        .args(["undo"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("no committed transaction"));
}

// ============================================================================
// Ignore Command Tests
// ============================================================================

#[test]
fn test_ignore_add_then_groups_empty() {
    let (_tmp, photos, data) = fixture();
    dvojnik()
        .args(["--data-dir"])
        .arg(&data)
        .arg("scan")
        .arg(&photos)
        .arg("--json")
        .assert()
        .success();

    let output = dvojnik()
        .args(["--data-dir"])
        .arg(&data)
        .args(["groups", "--json"])
        .output()
        .unwrap();
    let envelope: serde_json::Value =
        serde_json::from_str(&String::from_utf8(output.stdout).unwrap()).unwrap();
    let members = &envelope["data"][0]["members"];
    let a = members[0].as_str().unwrap();
    let b = members[1].as_str().unwrap();

    dvojnik()
        .args(["--data-dir"])
        .arg(&data)
        .args(["ignore", "add", a, b])
        .assert()
        .success()
        .stdout(predicate::str::contains("ignore pair added"));

    dvojnik()
        .args(["--data-dir"])
        .arg(&data)
        .args(["groups", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"data\": []"));
}

#[test]
fn test_ignore_malformed_id_fails() {
    let (_tmp, _photos, data) = fixture();
    dvojnik()
        .args(["--data-dir"])
        .arg(&data)
        .args(["ignore", "add", "xyz", "abc"])
        .assert()
        .failure()
        .code(1);
}
