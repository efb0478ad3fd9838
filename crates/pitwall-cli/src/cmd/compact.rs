use crate::output::print_json;
use pitwall_core::graph::{JsonlStore, TaskStatus, TaskStore};
use pitwall_core::health::{compact_plan, scoreboard};
use pitwall_core::paths;
use pitwall_core::policy::Policy;
use std::path::Path;

/// Compaction never deletes anything: duplicates and over-depth chains
/// are abandoned, ready-queue overflow is rescheduled.
pub fn run(
    root: &Path,
    apply: bool,
    max_ready: Option<usize>,
    defer_hours: i64,
    json: bool,
) -> anyhow::Result<i32> {
    let graph_dir = paths::find_taskgraph_dir(Some(root))?;
    let policy = Policy::load(&graph_dir);
    let mut store = JsonlStore::open(&graph_dir)?;
    let tasks = store.all()?;
    let now = chrono::Utc::now();

    let max_ready = max_ready.unwrap_or(policy.loop_safety.max_ready_followups.max(0) as usize);
    let defer_hours = defer_hours.max(1);

    let plan = compact_plan(&tasks, &policy, max_ready, now);
    let score_before = scoreboard(&tasks, &policy, now);

    let mut applied_abandoned: Vec<String> = Vec::new();
    let mut applied_deferred: Vec<String> = Vec::new();
    let mut errors: Vec<String> = Vec::new();

    if apply {
        for task_id in &plan.abandon_task_ids {
            match store.set_status(task_id, TaskStatus::Abandoned) {
                Ok(()) => applied_abandoned.push(task_id.clone()),
                Err(e) => errors.push(format!("abandon {task_id}: {e}")),
            }
        }
        let not_before = now + chrono::Duration::hours(defer_hours);
        for task_id in &plan.defer_task_ids {
            match store.reschedule(task_id, not_before) {
                Ok(()) => applied_deferred.push(task_id.clone()),
                Err(e) => errors.push(format!("reschedule {task_id}: {e}")),
            }
        }
    }

    let after_tasks = store.all()?;
    let score_after = scoreboard(&after_tasks, &policy, now);

    if json {
        #[derive(serde::Serialize)]
        struct CompactOutput<'a> {
            applied: bool,
            defer_hours: i64,
            plan: &'a pitwall_core::health::CompactPlan,
            applied_abandoned: &'a [String],
            applied_deferred: &'a [String],
            errors: &'a [String],
            scoreboard_before: &'a pitwall_core::health::Scoreboard,
            scoreboard_after: &'a pitwall_core::health::Scoreboard,
        }
        print_json(&CompactOutput {
            applied: apply,
            defer_hours,
            plan: &plan,
            applied_abandoned: &applied_abandoned,
            applied_deferred: &applied_deferred,
            errors: &errors,
            scoreboard_before: &score_before,
            scoreboard_after: &score_after,
        })?;
    } else {
        println!("Applied: {apply}");
        println!(
            "Plan: abandon={} defer={} (ready {} -> target {})",
            plan.abandon_task_ids.len(),
            plan.defer_task_ids.len(),
            plan.ready_before,
            plan.max_ready
        );
        if apply {
            println!(
                "Applied abandon={} defer={}",
                applied_abandoned.len(),
                applied_deferred.len()
            );
        }
        if !errors.is_empty() {
            println!("Errors:");
            for error in errors.iter().take(8) {
                println!("- {error}");
            }
        }
        println!(
            "Scoreboard: {:?} -> {:?}, ready {} -> {}",
            score_before.status,
            score_after.status,
            score_before.ready_followups,
            score_after.ready_followups
        );
    }

    Ok(if errors.is_empty() { 0 } else { 1 })
}
