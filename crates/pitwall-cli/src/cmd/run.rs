use crate::output::print_json;
use pitwall_core::graph::{JsonlStore, TaskStore};
use pitwall_core::health::{duplicate_groups, rank_ready, scoreboard};
use pitwall_core::paths;
use pitwall_core::policy::Policy;
use pitwall_core::router::Strategy;
use std::path::Path;

/// One-shot operation: a full-effect check, then the ranked next queue,
/// duplicate groups, and the scoreboard.
pub fn run(root: &Path, task_id: &str, max_next: usize, json: bool) -> anyhow::Result<i32> {
    let report = super::check::execute(root, task_id, Strategy::Auto, true, true)?;

    let graph_dir = paths::find_taskgraph_dir(Some(root))?;
    let policy = Policy::load(&graph_dir);
    let tasks = JsonlStore::open(&graph_dir)?.all()?;
    let now = chrono::Utc::now();

    let next_actions = rank_ready(&tasks, &policy, now, max_next.max(1));
    let duplicates = duplicate_groups(&tasks);
    let board = scoreboard(&tasks, &policy, now);

    if json {
        #[derive(serde::Serialize)]
        struct RunOutput<'a> {
            exit_code: i32,
            check: &'a pitwall_core::check::CheckReport,
            next_actions: &'a [pitwall_core::health::QueueEntry],
            duplicate_groups: &'a [pitwall_core::health::DuplicateGroup],
            scoreboard: &'a pitwall_core::health::Scoreboard,
        }
        print_json(&RunOutput {
            exit_code: report.exit_code,
            check: &report,
            next_actions: &next_actions,
            duplicate_groups: &duplicates,
            scoreboard: &board,
        })?;
        return Ok(report.exit_code);
    }

    super::check::render_text(&report);

    println!("\nNext actions:");
    if next_actions.is_empty() {
        println!("- none");
    }
    for item in &next_actions {
        println!("- {} [p={}] {}", item.task_id, item.priority, item.title);
    }
    if !duplicates.is_empty() {
        println!("Duplicate follow-up groups: {}", duplicates.len());
    }
    Ok(report.exit_code)
}
