use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn pitwall(root: &Path) -> Command {
    let mut cmd = Command::cargo_bin("pitwall").unwrap();
    cmd.arg("--root").arg(root);
    cmd
}

// Policy used by most tests: no cooldown, generous hourly cap, updates
// off so nothing reaches for the network.
const TEST_POLICY: &str = "schema = 1\n\
    mode = \"redirect\"\n\
    \n\
    [recursion]\n\
    cooldown_seconds = 0\n\
    max_auto_actions_per_hour = 100\n\
    \n\
    [updates]\n\
    enabled = false\n";

fn init_project(root: &Path) {
    pitwall(root).arg("init").assert().success();
    fs::write(root.join(".taskgraph/pitwall-policy.toml"), TEST_POLICY).unwrap();
}

fn add_task(root: &Path, id: &str, title: &str, description: &str) {
    let record = serde_json::json!({
        "type": "task",
        "id": id,
        "title": title,
        "description": description,
        "status": "open",
        "created_at": "2026-03-01T00:00:00Z",
    });
    let path = root.join(".taskgraph/graph.jsonl");
    let mut contents = fs::read_to_string(&path).unwrap_or_default();
    contents.push_str(&record.to_string());
    contents.push('\n');
    fs::write(&path, contents).unwrap();
}

#[cfg(unix)]
fn install_wrapper(root: &Path, lane: &str, script: &str) {
    use std::os::unix::fs::PermissionsExt;
    let path = root.join(".taskgraph").join(lane);
    fs::write(&path, script).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
}

fn graph_records(root: &Path) -> Vec<serde_json::Value> {
    fs::read_to_string(root.join(".taskgraph/graph.jsonl"))
        .unwrap_or_default()
        .lines()
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect()
}

#[test]
fn init_is_idempotent() {
    let dir = TempDir::new().unwrap();
    pitwall(dir.path())
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("created: .taskgraph/graph.jsonl"));
    pitwall(dir.path())
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("exists:  .taskgraph/graph.jsonl"));
    assert!(dir.path().join(".taskgraph/pitwall-policy.toml").is_file());
    assert!(dir.path().join(".taskgraph/.pitwall").is_dir());
}

#[test]
fn check_requires_init() {
    let dir = TempDir::new().unwrap();
    pitwall(dir.path())
        .args(["check", "--task", "t1"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("not initialized"));
}

#[cfg(unix)]
#[test]
fn check_requires_baseline_wrapper() {
    let dir = TempDir::new().unwrap();
    init_project(dir.path());
    add_task(dir.path(), "t1", "target", "");
    pitwall(dir.path())
        .args(["check", "--task", "t1"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("not installed"));
}

#[cfg(unix)]
#[test]
fn check_unknown_task_is_a_usage_error() {
    let dir = TempDir::new().unwrap();
    init_project(dir.path());
    install_wrapper(dir.path(), "core", "#!/bin/sh\nexit 0\n");
    pitwall(dir.path())
        .args(["check", "--task", "ghost"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("task not found"));
}

#[cfg(unix)]
#[test]
fn clean_check_exits_zero() {
    let dir = TempDir::new().unwrap();
    init_project(dir.path());
    add_task(dir.path(), "t1", "target", "");
    install_wrapper(dir.path(), "core", "#!/bin/sh\nexit 0\n");

    pitwall(dir.path())
        .args(["check", "--task", "t1", "--json"])
        .assert()
        .code(0);
}

#[cfg(unix)]
#[test]
fn check_json_reports_plan_and_status() {
    let dir = TempDir::new().unwrap();
    init_project(dir.path());
    add_task(dir.path(), "t1", "target", "");
    install_wrapper(dir.path(), "core", "#!/bin/sh\nexit 0\n");

    let output = pitwall(dir.path())
        .args(["check", "--task", "t1", "--json"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0));
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["task_id"], "t1");
    assert_eq!(report["status"], "clean");
    assert_eq!(report["plan"]["selected"][0], "core");
}

#[cfg(unix)]
#[test]
fn findings_create_a_followup_once() {
    let dir = TempDir::new().unwrap();
    init_project(dir.path());
    add_task(dir.path(), "t1", "target", "```spec\nschema = 1\n```");
    install_wrapper(dir.path(), "core", "#!/bin/sh\nexit 0\n");
    install_wrapper(
        dir.path(),
        "spec",
        "#!/bin/sh\nprintf '%s' '{\"findings\":[{\"kind\":\"gap\",\"fingerprint\":\"fp-it\",\"detail\":\"missing section\"}]}'\nexit 3\n",
    );

    pitwall(dir.path())
        .args(["check", "--task", "t1"])
        .assert()
        .code(3)
        .stdout(predicate::str::contains("created follow-up: followup-spec-t1-"));

    // Same evidence again: still findings, but no second follow-up.
    pitwall(dir.path())
        .args(["check", "--task", "t1"])
        .assert()
        .code(3);

    let followups: Vec<_> = graph_records(dir.path())
        .into_iter()
        .filter(|r| {
            r["id"]
                .as_str()
                .is_some_and(|id| id.starts_with("followup-spec-t1-"))
        })
        .collect();
    assert_eq!(followups.len(), 1);
    assert!(dir
        .path()
        .join(".taskgraph/.pitwall/action-ledger.jsonl")
        .is_file());
}

#[cfg(unix)]
#[test]
fn lane_failure_exits_one() {
    let dir = TempDir::new().unwrap();
    init_project(dir.path());
    add_task(dir.path(), "t1", "target", "");
    install_wrapper(dir.path(), "core", "#!/bin/sh\nexit 7\n");

    pitwall(dir.path())
        .args(["check", "--task", "t1"])
        .assert()
        .code(1);
}

#[cfg(unix)]
#[test]
fn run_prints_next_actions() {
    let dir = TempDir::new().unwrap();
    init_project(dir.path());
    add_task(dir.path(), "t1", "target", "");
    install_wrapper(dir.path(), "core", "#!/bin/sh\nexit 0\n");

    pitwall(dir.path())
        .args(["run", "--task", "t1"])
        .assert()
        .code(0)
        .stdout(predicate::str::contains("Next actions:"));
}

#[test]
fn queue_json_lists_ready_followups() {
    let dir = TempDir::new().unwrap();
    init_project(dir.path());
    add_task(dir.path(), "followup-spec-t1-aabbccdd", "spec: missing section", "");

    let output = pitwall(dir.path())
        .args(["queue", "--json"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0));
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["ready"][0]["task_id"], "followup-spec-t1-aabbccdd");
    assert!(report["scoreboard"]["ready_followups"].is_number());
}

#[cfg(unix)]
#[test]
fn doctor_flags_missing_baseline_then_recovers() {
    let dir = TempDir::new().unwrap();
    init_project(dir.path());

    let output = pitwall(dir.path())
        .args(["doctor", "--json"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(3));
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["status"], "risk");

    install_wrapper(dir.path(), "core", "#!/bin/sh\nexit 0\n");
    pitwall(dir.path())
        .args(["doctor"])
        .assert()
        .code(0)
        .stdout(predicate::str::contains("Doctor status: healthy"));
}

#[test]
fn doctor_fix_restores_the_policy_file() {
    let dir = TempDir::new().unwrap();
    init_project(dir.path());
    fs::remove_file(dir.path().join(".taskgraph/pitwall-policy.toml")).unwrap();

    pitwall(dir.path()).args(["doctor", "--fix"]).assert().code(3);
    assert!(dir.path().join(".taskgraph/pitwall-policy.toml").is_file());
}

#[test]
fn compact_apply_defers_overflow() {
    let dir = TempDir::new().unwrap();
    init_project(dir.path());
    for i in 0..4 {
        add_task(
            dir.path(),
            &format!("followup-data-t1-aabbcc0{i}"),
            &format!("data gap {i}"),
            "",
        );
    }

    let output = pitwall(dir.path())
        .args(["compact", "--max-ready", "2", "--json"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0));
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["applied"], false);
    assert_eq!(report["plan"]["defer_task_ids"].as_array().unwrap().len(), 2);

    let output = pitwall(dir.path())
        .args(["compact", "--apply", "--max-ready", "2", "--json"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0));
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["applied"], true);
    assert_eq!(report["applied_deferred"].as_array().unwrap().len(), 2);
    let before = report["scoreboard_before"]["ready_followups"].as_u64().unwrap();
    let after = report["scoreboard_after"]["ready_followups"].as_u64().unwrap();
    assert!(after < before);
}

#[test]
fn compact_apply_abandons_duplicates_without_deleting() {
    let dir = TempDir::new().unwrap();
    init_project(dir.path());
    add_task(dir.path(), "followup-data-t1-aaaaaaaa", "data gap in orders", "");
    add_task(dir.path(), "followup-data-t2-bbbbbbbb", "data gap in orders", "");

    let output = pitwall(dir.path())
        .args(["compact", "--apply", "--json"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0));
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["applied"], true);
    assert_eq!(
        report["applied_abandoned"],
        serde_json::json!(["followup-data-t2-bbbbbbbb"])
    );

    // The graph is append-only: both records survive, and the duplicate's
    // last record marks it abandoned.
    let records = graph_records(dir.path());
    assert!(records.iter().any(|r| r["id"] == "followup-data-t1-aaaaaaaa"));
    let last_t2 = records
        .iter()
        .filter(|r| r["id"] == "followup-data-t2-bbbbbbbb")
        .next_back()
        .unwrap();
    assert_eq!(last_t2["status"], "abandoned");
}

#[test]
fn updates_respects_disabled_policy() {
    let dir = TempDir::new().unwrap();
    init_project(dir.path());
    pitwall(dir.path())
        .arg("updates")
        .assert()
        .code(0)
        .stdout(predicate::str::contains("disabled"));
}

#[test]
fn orchestrate_single_cycle_on_empty_queue() {
    let dir = TempDir::new().unwrap();
    init_project(dir.path());
    pitwall(dir.path())
        .args(["orchestrate", "--max-cycles", "1", "--interval", "1"])
        .assert()
        .code(0)
        .stdout(predicate::str::contains("Cycle 1: checked 0 task(s)"));
}
