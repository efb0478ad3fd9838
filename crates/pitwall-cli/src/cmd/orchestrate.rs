use crate::output::print_json;
use pitwall_core::engine::AggregateStatus;
use pitwall_core::graph::{JsonlStore, TaskStore};
use pitwall_core::health::rank_ready;
use pitwall_core::paths;
use pitwall_core::policy::Policy;
use pitwall_core::router::Strategy;
use std::path::Path;
use std::time::Duration;

/// Continuous loop: each cycle ranks the ready follow-up queue and runs
/// a full check per task, one task's lane sequence at a time. State
/// locks are per file, so concurrent invocations stay safe.
pub fn run(
    root: &Path,
    interval: u64,
    max_cycles: u64,
    write_log: bool,
    create_followups: bool,
    json: bool,
) -> anyhow::Result<i32> {
    let mut cycle: u64 = 0;
    loop {
        cycle += 1;

        let graph_dir = paths::find_taskgraph_dir(Some(root))?;
        let policy = Policy::load(&graph_dir);
        let tasks = JsonlStore::open(&graph_dir)?.all()?;
        let queue = rank_ready(
            &tasks,
            &policy,
            chrono::Utc::now(),
            policy.loop_safety.max_ready_followups.max(1) as usize,
        );

        tracing::info!(cycle, tasks = queue.len(), "orchestrate cycle");

        let mut cycle_results: Vec<CycleResult> = Vec::new();
        for entry in &queue {
            match super::check::execute(
                root,
                &entry.task_id,
                Strategy::Auto,
                write_log,
                create_followups,
            ) {
                Ok(report) => {
                    cycle_results.push(CycleResult {
                        task_id: entry.task_id.clone(),
                        status: Some(report.status),
                        exit_code: report.exit_code,
                        error: None,
                    });
                }
                // One bad task never stops the loop.
                Err(e) => {
                    tracing::warn!(task = %entry.task_id, "check failed: {e:#}");
                    cycle_results.push(CycleResult {
                        task_id: entry.task_id.clone(),
                        status: None,
                        exit_code: 1,
                        error: Some(format!("{e:#}")),
                    });
                }
            }
        }

        if json {
            #[derive(serde::Serialize)]
            struct CycleOutput<'a> {
                cycle: u64,
                checked: usize,
                results: &'a [CycleResult],
            }
            print_json(&CycleOutput {
                cycle,
                checked: cycle_results.len(),
                results: &cycle_results,
            })?;
        } else {
            println!("Cycle {cycle}: checked {} task(s)", cycle_results.len());
            for result in &cycle_results {
                match (&result.status, &result.error) {
                    (Some(status), _) => {
                        println!("- {} -> {:?} (exit {})", result.task_id, status, result.exit_code)
                    }
                    (None, Some(error)) => println!("- {} -> error: {error}", result.task_id),
                    (None, None) => {}
                }
            }
        }

        if max_cycles > 0 && cycle >= max_cycles {
            return Ok(0);
        }
        std::thread::sleep(Duration::from_secs(interval));
    }
}

#[derive(serde::Serialize)]
struct CycleResult {
    task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<AggregateStatus>,
    exit_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}
