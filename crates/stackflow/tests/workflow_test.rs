//! End-to-end runs of the CLI against the local provider

mod common;

use common::{SITE, TestProject};
use predicates::prelude::*;
use std::fs;

#[test]
fn test_plan_apply_converge_destroy() {
    let project = TestProject::new();
    project.write_stack_kdl(SITE);

    project
        .cmd()
        .arg("plan")
        .assert()
        .success()
        .stdout(predicate::str::contains("local_file.page[1]"))
        .stdout(predicate::str::contains("4 to create"));

    // Without --yes nothing happens
    project
        .cmd()
        .arg("apply")
        .assert()
        .success()
        .stdout(predicate::str::contains("run again with --yes"));
    assert!(!project.file("public").exists());

    project
        .cmd()
        .args(["apply", "--yes"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Apply complete:"))
        .stdout(predicate::str::contains("index_path"));
    assert_eq!(project.read("public/index.html"), "<h1>Hello</h1>");
    assert_eq!(project.read("public/page-1.html"), "page 1");

    project
        .cmd()
        .arg("plan")
        .assert()
        .success()
        .stdout(predicate::str::contains("No changes"));

    project
        .cmd()
        .args(["destroy", "--yes"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Apply complete:"));
    assert!(!project.file("public").exists());

    project
        .cmd()
        .args(["state", "list"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

#[test]
fn test_var_override_updates_in_place() {
    let project = TestProject::new();
    project.write_stack_kdl(SITE);
    project.cmd().args(["apply", "--yes"]).assert().success();

    project
        .cmd()
        .args(["--var", "title=Bye", "plan"])
        .assert()
        .success()
        .stdout(predicate::str::contains("~ local_file.index"))
        .stdout(predicate::str::contains("1 to update"));

    project
        .cmd()
        .args(["--var", "title=Bye", "apply", "--yes"])
        .assert()
        .success();
    assert_eq!(project.read("public/index.html"), "<h1>Bye</h1>");
}

#[test]
fn test_outputs_and_state_inspection() {
    let project = TestProject::new();
    project.write_stack_kdl(SITE);
    project.cmd().args(["apply", "--yes"]).assert().success();

    project
        .cmd()
        .args(["output", "index_path"])
        .assert()
        .success()
        .stdout("public/index.html\n");

    let output = project.cmd().args(["output", "--json"]).output().unwrap();
    assert!(output.status.success());
    let outputs: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(outputs["index_path"], "public/index.html");

    project
        .cmd()
        .args(["state", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("local_directory.public"))
        .stdout(predicate::str::contains("local_file.page[0]"));

    project
        .cmd()
        .args(["state", "show", "local_file.index"])
        .assert()
        .success()
        .stdout(predicate::str::contains("sha256"))
        .stdout(predicate::str::contains("depends on: local_directory.public"));

    // Forgetting leaves the file, and the next plan creates it again
    project
        .cmd()
        .args(["state", "rm", "local_file.page[1]"])
        .assert()
        .success();
    assert!(project.file("public/page-1.html").exists());
    project
        .cmd()
        .arg("plan")
        .assert()
        .success()
        .stdout(predicate::str::contains("+ local_file.page[1]"));
}

#[test]
fn test_saved_plan() {
    let project = TestProject::new();
    project.write_stack_kdl(SITE);

    project
        .cmd()
        .args(["plan", "--out", "site.plan.json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Saved plan"));
    assert!(project.file("site.plan.json").exists());

    project
        .cmd()
        .args(["apply", "site.plan.json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Apply complete:"));
    assert!(project.file("public/index.html").exists());
}

#[test]
fn test_stale_saved_plan_is_rejected() {
    let project = TestProject::new();
    project.write_stack_kdl(SITE);
    project
        .cmd()
        .args(["plan", "--out", "site.plan.json"])
        .assert()
        .success();

    project
        .cmd()
        .args(["--var", "title=Changed", "apply", "site.plan.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no longer matches"));
    assert!(!project.file("public").exists());
}

#[test]
fn test_refresh_reports_drift() {
    let project = TestProject::new();
    project.write_stack_kdl(SITE);
    project.cmd().args(["apply", "--yes"]).assert().success();

    fs::write(project.file("public/page-0.html"), "edited by hand").unwrap();
    fs::remove_file(project.file("public/page-1.html")).unwrap();

    project
        .cmd()
        .arg("refresh")
        .assert()
        .success()
        .stdout(predicate::str::contains("~ local_file.page[0]"))
        .stdout(predicate::str::contains("local_file.page[1] (no longer exists)"));

    project
        .cmd()
        .arg("plan")
        .assert()
        .success()
        .stdout(predicate::str::contains("1 to create, 1 to update"));
}

#[test]
fn test_lock_busy_and_force_unlock() {
    let project = TestProject::new();
    project.write_stack_kdl(SITE);
    let state_dir = project.file(".stackflow");
    fs::create_dir_all(&state_dir).unwrap();
    fs::write(
        state_dir.join("lock.json"),
        r#"{"id":"held-1","owner":"ci@runner","operation":"apply","acquiredAt":"2020-01-01T00:00:00Z"}"#,
    )
    .unwrap();

    project
        .cmd()
        .arg("plan")
        .assert()
        .failure()
        .stderr(predicate::str::contains("locked by ci@runner"))
        .stderr(predicate::str::contains("force-unlock"))
        .stderr(predicate::str::contains("Retry once"));

    project
        .cmd()
        .args(["force-unlock", "other-id"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Lock id mismatch"));

    project
        .cmd()
        .args(["force-unlock", "held-1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("released"));

    project.cmd().arg("plan").assert().success();
}

#[test]
fn test_truncated_lock_file_can_be_broken() {
    let project = TestProject::new();
    project.write_stack_kdl(SITE);
    let state_dir = project.file(".stackflow");
    fs::create_dir_all(&state_dir).unwrap();
    fs::write(state_dir.join("lock.json"), "").unwrap();

    project
        .cmd()
        .arg("plan")
        .assert()
        .failure()
        .stderr(predicate::str::contains("lock id unreadable"));

    project
        .cmd()
        .args(["force-unlock", "unreadable"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Lock unreadable released"));
    assert!(!state_dir.join("lock.json").exists());

    project.cmd().arg("plan").assert().success();
}

#[test]
fn test_failed_apply_exits_nonzero() {
    let project = TestProject::new();
    // A file where the directory should go makes the create fail
    fs::write(project.file("blocked"), "not a directory").unwrap();
    project.write_stack_kdl(
        r#"
        resource "local_directory" "blocked" {
            path "blocked"
        }
        resource "local_file" "inside" {
            path "${local_directory.blocked.path}/file.txt"
            content "x"
        }
        resource "local_file" "independent" {
            path "independent.txt"
            content "ok"
        }
        "#,
    );

    project
        .cmd()
        .args(["apply", "--yes"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("Apply incomplete:"))
        .stdout(predicate::str::contains("skipped"))
        .stderr(predicate::str::contains("apply did not complete"));
    assert_eq!(project.read("independent.txt"), "ok");

    project
        .cmd()
        .args(["state", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("local_file.independent"))
        .stdout(predicate::str::contains("local_directory.blocked").not());
}

#[test]
fn test_settings_state_dir() {
    let project = TestProject::new();
    project.write_stack_kdl(SITE);
    project.write_settings("state_dir: .state\nparallelism: 1\n");

    project.cmd().args(["apply", "--yes"]).assert().success();
    assert!(project.file(".state/state.json").exists());
    assert!(!project.file(".stackflow/state.json").exists());
}
