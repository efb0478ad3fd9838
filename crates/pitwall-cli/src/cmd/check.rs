use crate::fetch::GithubFetcher;
use crate::output::{print_json, print_table};
use anyhow::Context;
use pitwall_core::check::{run_check, CheckOptions, CheckReport, UpdatePreflight};
use pitwall_core::engine::{LaneOutcome, ProcessRunner};
use pitwall_core::graph::JsonlStore;
use pitwall_core::lanes::{LaneRegistry, BASELINE_LANE};
use pitwall_core::ledger::ActionLedger;
use pitwall_core::paths;
use pitwall_core::policy::Policy;
use pitwall_core::router::Strategy;
use pitwall_core::updates::ReviewConfig;
use pitwall_core::PitwallError;
use std::path::Path;

/// Shared by `check`, `run`, and `orchestrate`: one full orchestrated
/// check of a single task.
pub(crate) fn execute(
    root: &Path,
    task_id: &str,
    strategy: Strategy,
    write_log: bool,
    create_followups: bool,
) -> anyhow::Result<CheckReport> {
    let graph_dir = paths::find_taskgraph_dir(Some(root))?;
    let project_dir = graph_dir
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| root.to_path_buf());

    let policy = Policy::load(&graph_dir);
    let mut store = JsonlStore::open(&graph_dir)?;
    let registry = LaneRegistry::discover(&graph_dir, &policy);
    if !registry.is_installed(BASELINE_LANE) {
        return Err(PitwallError::BaselineMissing(BASELINE_LANE.to_string()).into());
    }

    if policy.contracts.auto_ensure {
        auto_ensure_contracts(&project_dir, &registry);
    }

    let mut ledger = ActionLedger::load(&graph_dir);
    let mut runner = ProcessRunner::new(&project_dir);

    let sources = ReviewConfig::load(&graph_dir, None)
        .context("failed to read ecosystem review config")?
        .into_sources();
    let fetcher = GithubFetcher::new();
    let preflight = UpdatePreflight {
        graph_dir: &graph_dir,
        sources: &sources,
        fetcher: &fetcher,
        force: false,
    };

    let opts = CheckOptions {
        strategy,
        force_write_log: write_log,
        force_create_followups: create_followups,
        now: chrono::Utc::now(),
    };
    let report = run_check(
        &mut store,
        &registry,
        &policy,
        &mut ledger,
        &mut runner,
        Some(&preflight),
        task_id,
        &opts,
    )?;
    Ok(report)
}

/// Best-effort `ensure-contracts --apply` through the baseline wrapper
/// before the lane suite. Failure never blocks the check.
fn auto_ensure_contracts(project_dir: &Path, registry: &LaneRegistry) {
    let Some(bin) = registry
        .get(BASELINE_LANE)
        .and_then(|lane| lane.command_path.as_ref())
    else {
        return;
    };
    match std::process::Command::new(bin)
        .arg("ensure-contracts")
        .arg("--apply")
        .current_dir(project_dir)
        .output()
    {
        Ok(out) if out.status.success() => {}
        Ok(out) => {
            let stderr = String::from_utf8_lossy(&out.stderr);
            tracing::warn!("contract auto-ensure failed; continuing: {}", stderr.trim());
        }
        Err(e) => tracing::warn!("contract auto-ensure failed; continuing: {e}"),
    }
}

pub fn run(
    root: &Path,
    task_id: &str,
    lane_strategy: &str,
    write_log: bool,
    create_followups: bool,
    json: bool,
) -> anyhow::Result<i32> {
    let strategy: Strategy = lane_strategy.parse::<Strategy>()?;
    let report = execute(root, task_id, strategy, write_log, create_followups)?;

    if json {
        print_json(&report)?;
        return Ok(report.exit_code);
    }

    render_text(&report);
    Ok(report.exit_code)
}

pub(crate) fn render_text(report: &CheckReport) {
    println!(
        "Check {}: mode={} effective={} strategy={:?}",
        report.task_id,
        report.mode,
        report.effective_mode,
        report.plan.strategy
    );
    if report.plan.full_suite {
        println!(
            "note: full lane suite selected ({})",
            report.plan.full_suite_reasons.join(", ")
        );
    }

    let rows: Vec<Vec<String>> = report
        .results
        .iter()
        .map(|r| {
            let status = match &r.outcome {
                LaneOutcome::Clean => "clean".to_string(),
                LaneOutcome::Findings(rep) => format!("findings ({})", rep.findings.len()),
                LaneOutcome::Failed(f) => format!("failed: {}", f.reason),
            };
            vec![r.lane.clone(), status, format!("{}ms", r.duration_ms)]
        })
        .collect();
    print_table(&["LANE", "STATUS", "DURATION"], &rows);

    for note in &report.gate_notes {
        println!("note: {note}");
    }
    for warning in &report.warnings {
        println!("warning: {warning}");
    }
    for created in &report.created_followups {
        if created.created {
            println!("created follow-up: {}", created.task_id);
        }
    }
    if let Some(id) = &report.breaker_task_id {
        println!("breaker task: {id}");
    }
    if let Some(updates) = &report.updates {
        if updates.has_anything() {
            println!("ecosystem updates detected (run 'pitwall updates' for details)");
        }
    }
}
