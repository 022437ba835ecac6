//! CLI integration tests
//!
//! Drives the binary end-to-end against a temporary data directory.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn branchsync(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("branchsync").unwrap();
    cmd.arg("--data-dir").arg(dir.path());
    cmd
}

/// Extract the `(...)`-wrapped id from a creation message.
fn extract_id(output: &[u8]) -> String {
    let text = String::from_utf8_lossy(output);
    let start = text.rfind('(').expect("no id in output") + 1;
    let end = text.rfind(')').expect("no id in output");
    text[start..end].to_string()
}

#[test]
fn test_info_on_empty_store() {
    let dir = TempDir::new().unwrap();
    branchsync(&dir)
        .arg("info")
        .assert()
        .success()
        .stdout(predicate::str::contains("Ideas:      0"));
}

#[test]
fn test_idea_create_and_list() {
    let dir = TempDir::new().unwrap();

    branchsync(&dir)
        .args(["idea", "create", "Trip planning"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created idea Trip planning"));

    branchsync(&dir)
        .args(["idea", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Trip planning"));
}

#[test]
fn test_full_conversation_flow() {
    let dir = TempDir::new().unwrap();

    let output = branchsync(&dir)
        .args(["idea", "create", "Rust"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let idea_id = extract_id(&output.stdout);

    let output = branchsync(&dir)
        .args(["branch", "create", &idea_id, "main"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let branch_id = extract_id(&output.stdout);

    branchsync(&dir)
        .args([
            "bind",
            "add",
            &branch_id,
            "How do lifetimes work?",
            "They bound borrows.",
        ])
        .assert()
        .success();

    branchsync(&dir)
        .args(["branch", "messages", &branch_id])
        .assert()
        .success()
        .stdout(predicate::str::contains("[you] How do lifetimes work?"))
        .stdout(predicate::str::contains("[ai ] They bound borrows."));

    branchsync(&dir)
        .args(["snapshot", "create", &branch_id])
        .assert()
        .success()
        .stdout(predicate::str::contains("2 messages"));
}

#[test]
fn test_delete_idea_cascades() {
    let dir = TempDir::new().unwrap();

    let output = branchsync(&dir)
        .args(["idea", "create", "Ephemeral"])
        .output()
        .unwrap();
    let idea_id = extract_id(&output.stdout);

    branchsync(&dir)
        .args(["branch", "create", &idea_id, "main"])
        .assert()
        .success();

    branchsync(&dir)
        .args(["idea", "delete", &idea_id])
        .assert()
        .success();

    branchsync(&dir)
        .arg("info")
        .assert()
        .success()
        .stdout(predicate::str::contains("Ideas:      0"))
        .stdout(predicate::str::contains("Branches:   0"));
}

#[test]
fn test_invalid_id_is_reported() {
    let dir = TempDir::new().unwrap();
    branchsync(&dir)
        .args(["branch", "list", "not-a-ulid"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid idea id"));
}

#[test]
fn test_settings_roundtrip() {
    let dir = TempDir::new().unwrap();

    branchsync(&dir)
        .args(["settings", "set", "--model", "tiny", "--max-tokens", "128"])
        .assert()
        .success();

    branchsync(&dir)
        .args(["settings", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("selected model: tiny"))
        .stdout(predicate::str::contains("max tokens:     128"));
}
