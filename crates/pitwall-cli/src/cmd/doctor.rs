use crate::output::print_json;
use pitwall_core::graph::{JsonlStore, TaskStore};
use pitwall_core::health::{scoreboard, Scoreboard};
use pitwall_core::io;
use pitwall_core::lanes::{all_lane_names, BASELINE_LANE};
use pitwall_core::paths;
use pitwall_core::policy::Policy;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(serde::Serialize)]
struct Issue {
    severity: &'static str,
    kind: &'static str,
    message: String,
}

#[derive(serde::Serialize)]
struct DoctorReport {
    status: &'static str,
    wrappers: BTreeMap<String, bool>,
    scoreboard: Scoreboard,
    issues: Vec<Issue>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    notes: Vec<String>,
}

pub fn run(root: &Path, fix: bool, json: bool) -> anyhow::Result<i32> {
    let graph_dir = paths::find_taskgraph_dir(Some(root))?;
    let mut notes: Vec<String> = Vec::new();

    if fix {
        io::ensure_dir(&paths::state_dir(&graph_dir))?;
        io::ensure_dir(&graph_dir.join(paths::LOGS_DIR))?;
        if Policy::ensure(&graph_dir)? {
            notes.push(format!("created default {}", paths::POLICY_FILE));
        }
    }

    let policy = Policy::load(&graph_dir);
    let tasks = JsonlStore::open(&graph_dir)?.all()?;
    let board = scoreboard(&tasks, &policy, chrono::Utc::now());

    let wrappers: BTreeMap<String, bool> = all_lane_names()
        .iter()
        .map(|lane| {
            let installed = paths::lane_wrapper_path(&graph_dir, lane).is_file();
            (lane.to_string(), installed)
        })
        .collect();

    let mut issues: Vec<Issue> = Vec::new();

    if !wrappers.get(BASELINE_LANE).copied().unwrap_or(false) {
        issues.push(Issue {
            severity: "high",
            kind: "wrapper_missing",
            message: format!("baseline lane wrapper .taskgraph/{BASELINE_LANE} is not installed"),
        });
    }

    if !paths::policy_path(&graph_dir).is_file() {
        issues.push(Issue {
            severity: "medium",
            kind: "policy_missing",
            message: format!(
                "{} not found; defaults are in effect (run 'pitwall doctor --fix')",
                paths::POLICY_FILE
            ),
        });
    }

    if board.contract_coverage < 0.9 {
        issues.push(Issue {
            severity: if board.contract_coverage < 0.7 { "high" } else { "medium" },
            kind: "contract_coverage",
            message: format!("active contract coverage is {:.2}", board.contract_coverage),
        });
    }

    if (board.max_rebuild_depth as i64) > policy.loop_safety.max_rebuild_depth {
        issues.push(Issue {
            severity: "high",
            kind: "loop_depth",
            message: format!(
                "max rebuild depth {} exceeds policy limit {}",
                board.max_rebuild_depth, policy.loop_safety.max_rebuild_depth
            ),
        });
    }

    if (board.ready_followups as i64) > policy.loop_safety.max_ready_followups {
        issues.push(Issue {
            severity: "high",
            kind: "queue_pressure",
            message: format!(
                "ready follow-up queue {} exceeds policy limit {}",
                board.ready_followups, policy.loop_safety.max_ready_followups
            ),
        });
    }

    if !board.duplicate_groups.is_empty() {
        issues.push(Issue {
            severity: "medium",
            kind: "duplicate_followups",
            message: format!(
                "{} duplicate open follow-up groups detected",
                board.duplicate_groups.len()
            ),
        });
    }

    let status = if issues.iter().any(|i| i.severity == "high") {
        "risk"
    } else if !issues.is_empty() {
        "watch"
    } else {
        "healthy"
    };

    let report = DoctorReport {
        status,
        wrappers,
        scoreboard: board,
        issues,
        notes,
    };

    if json {
        print_json(&report)?;
    } else {
        println!("Doctor status: {}", report.status);
        println!(
            "Scoreboard: active={} active_followups={} ready={} contract_coverage={:.2}",
            report.scoreboard.active_tasks,
            report.scoreboard.active_followups,
            report.scoreboard.ready_followups,
            report.scoreboard.contract_coverage
        );
        if report.issues.is_empty() {
            println!("Issues: none");
        } else {
            println!("Issues:");
            for issue in &report.issues {
                println!("- [{}] {}: {}", issue.severity, issue.kind, issue.message);
            }
        }
        for note in &report.notes {
            println!("note: {note}");
        }
    }

    Ok(if report.status == "healthy" { 0 } else { 3 })
}
