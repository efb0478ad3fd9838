use crate::output::print_json;
use pitwall_core::graph::{JsonlStore, TaskStore};
use pitwall_core::health::{duplicate_groups, rank_ready, scoreboard};
use pitwall_core::paths;
use pitwall_core::policy::Policy;
use std::path::Path;

pub fn run(root: &Path, limit: usize, json: bool) -> anyhow::Result<i32> {
    let graph_dir = paths::find_taskgraph_dir(Some(root))?;
    let policy = Policy::load(&graph_dir);
    let tasks = JsonlStore::open(&graph_dir)?.all()?;
    let now = chrono::Utc::now();

    let ready = rank_ready(&tasks, &policy, now, limit.max(1));
    let duplicates = duplicate_groups(&tasks);
    let board = scoreboard(&tasks, &policy, now);

    if json {
        #[derive(serde::Serialize)]
        struct QueueOutput<'a> {
            ready: &'a [pitwall_core::health::QueueEntry],
            duplicate_groups: &'a [pitwall_core::health::DuplicateGroup],
            scoreboard: &'a pitwall_core::health::Scoreboard,
        }
        print_json(&QueueOutput {
            ready: &ready,
            duplicate_groups: &duplicates,
            scoreboard: &board,
        })?;
        return Ok(0);
    }

    println!("Ready follow-up queue: {}", ready.len());
    for item in &ready {
        println!("- {} [p={}] {}", item.task_id, item.priority, item.title);
    }

    if !duplicates.is_empty() {
        println!("\nDuplicate follow-up groups: {}", duplicates.len());
        for group in duplicates.iter().take(5) {
            let sample = group
                .task_ids
                .iter()
                .take(4)
                .cloned()
                .collect::<Vec<_>>()
                .join(", ");
            println!("- {} ({}): {}", group.key, group.count, sample);
        }
    }
    Ok(0)
}
