//! One full check of a task: parse fences, guard, preflight updates,
//! select lanes, run them in order, gate findings, escalate.
//!
//! Lanes run strictly in plan order, each at most once, and results are
//! checkpointed as they arrive. Gating happens right after each lane so
//! a tripped circuit breaker constrains the remainder of the run.

use crate::engine::{aggregate, AggregateStatus, LaneOutcome, LaneRunner, RunResult};
use crate::error::{PitwallError, Result};
use crate::fence::parse_fences;
use crate::followup::{breaker_id, create_followup, ensure_breaker_task, ensure_updates_task, CreatedFollowup};
use crate::graph::TaskStore;
use crate::lanes::{LaneRegistry, BASELINE_LANE};
use crate::ledger::{ActionKind, ActionLedger, ActionRecord};
use crate::policy::{EffectFlags, Mode, Policy};
use crate::router::{select_lanes, LanePlan, Strategy};
use crate::safety::{circuit_breaker_tripped, evaluate_loop_safety, GateDecision, LoopSafetyVerdict, SafetyGate};
use crate::updates::{check_updates, summarize_updates, UpdateFetcher, UpdateReport, UpdateSources};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct CheckOptions {
    pub strategy: Strategy,
    pub force_write_log: bool,
    pub force_create_followups: bool,
    pub now: DateTime<Utc>,
}

impl CheckOptions {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            strategy: Strategy::Auto,
            force_write_log: false,
            force_create_followups: false,
            now,
        }
    }
}

/// Update-monitor context for the preflight; checks without one skip it.
pub struct UpdatePreflight<'a> {
    pub graph_dir: &'a Path,
    pub sources: &'a UpdateSources,
    pub fetcher: &'a dyn UpdateFetcher,
    pub force: bool,
}

#[derive(Debug, Serialize)]
pub struct CheckReport {
    pub task_id: String,
    pub mode: Mode,
    pub effective_mode: Mode,
    pub safety: LoopSafetyVerdict,
    pub plan: LanePlan,
    pub results: Vec<RunResult>,
    pub status: AggregateStatus,
    pub exit_code: i32,
    pub gate_notes: Vec<String>,
    pub created_followups: Vec<CreatedFollowup>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breaker_task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updates: Option<UpdateReport>,
    pub warnings: Vec<String>,
}

#[allow(clippy::too_many_arguments)]
pub fn run_check(
    store: &mut dyn TaskStore,
    registry: &LaneRegistry,
    policy: &Policy,
    ledger: &mut ActionLedger,
    runner: &mut dyn LaneRunner,
    updates_ctx: Option<&UpdatePreflight<'_>>,
    task_id: &str,
    opts: &CheckOptions,
) -> Result<CheckReport> {
    let task = store
        .get(task_id)?
        .ok_or_else(|| PitwallError::TaskNotFound(task_id.to_string()))?;
    let now = opts.now;

    let mut warnings: Vec<String> = Vec::new();
    warnings.extend(ledger.load_warnings.iter().cloned());

    let fences = parse_fences(&task.description);
    warnings.extend(fences.warnings.iter().cloned());

    let tasks = store.all()?;
    let safety = evaluate_loop_safety(&tasks, task_id, policy, now);
    let effective_mode = safety.effective_mode;

    let mut gate_notes: Vec<String> = Vec::new();
    if safety.downgraded {
        gate_notes.push(format!(
            "automation downgraded to {}: {}",
            effective_mode,
            safety.breaches.join("; ")
        ));
    }

    // A task whose automation has been rejected into the ground starts
    // the run already in breaker mode.
    let mut forced_breaker = circuit_breaker_tripped(ledger, task_id, policy);
    if forced_breaker {
        gate_notes.push("circuit breaker tripped before run".to_string());
    }

    let mode_for = |forced: bool| if forced { Mode::Breaker } else { effective_mode };
    let flags_for = |mode: Mode, lane: &str| -> EffectFlags {
        let base = mode.effect_flags(lane);
        EffectFlags {
            write_log: base.write_log || opts.force_write_log,
            create_followups: base.create_followups || opts.force_create_followups,
        }
    };

    let mut created_followups: Vec<CreatedFollowup> = Vec::new();

    // Update preflight runs before any lane so fresh ecosystem movement
    // is visible in the same pass.
    let mut update_report = None;
    if let Some(ctx) = updates_ctx {
        if policy.updates.enabled {
            let report = check_updates(
                ctx.graph_dir,
                ctx.sources,
                ctx.fetcher,
                policy.updates.check_interval_seconds,
                ctx.force,
                now,
            )?;
            if report.has_anything() {
                let flags = flags_for(mode_for(forced_breaker), BASELINE_LANE);
                let summary = summarize_updates(&report);
                if flags.write_log {
                    store.append_log(task_id, &summary)?;
                }
                if flags.create_followups || policy.updates.create_followup {
                    created_followups.push(ensure_updates_task(store, task_id, &summary, now)?);
                }
            }
            update_report = Some(report);
        }
    }

    let plan = select_lanes(&fences, registry, opts.strategy);
    warnings.extend(plan.warnings.iter().cloned());

    let gate = SafetyGate { policy };
    let mut results: Vec<RunResult> = Vec::new();

    for lane_name in &plan.selected {
        let Some(descriptor) = registry.get(lane_name) else {
            continue;
        };
        let mode = mode_for(forced_breaker);
        let flags = flags_for(mode, lane_name);
        let result = runner.run(descriptor, task_id, flags);

        if let LaneOutcome::Findings(report) = &result.outcome {
            if flags.create_followups {
                for finding in &report.findings {
                    match gate.check(ledger, store, task_id, lane_name, &finding.fingerprint, now)? {
                        GateDecision::Permit => {
                            // Record before acting: a crash between the
                            // two leaves a ledger entry, not a runaway.
                            ledger.append(ActionRecord {
                                task_id: task_id.to_string(),
                                lane: lane_name.clone(),
                                fingerprint: finding.fingerprint.clone(),
                                at: now,
                                kind: ActionKind::Followup,
                            })?;
                            created_followups.push(create_followup(
                                store, task_id, lane_name, finding, now,
                            )?);
                        }
                        GateDecision::Reject { reason } => {
                            ledger.append(ActionRecord {
                                task_id: task_id.to_string(),
                                lane: lane_name.clone(),
                                fingerprint: finding.fingerprint.clone(),
                                at: now,
                                kind: ActionKind::Rejected,
                            })?;
                            gate_notes.push(format!("{lane_name}: rejected ({reason})"));
                            if !forced_breaker && circuit_breaker_tripped(ledger, task_id, policy) {
                                forced_breaker = true;
                                gate_notes.push("circuit breaker tripped".to_string());
                            }
                        }
                    }
                }
            }
        }
        results.push(result);
    }

    let status = aggregate(&results);

    // Breaker escalation: persistent findings under breaker mode raise
    // exactly one escalation task per origin. Keyed on findings being
    // present, not on the aggregate, so an unrelated lane failure in the
    // same run cannot mask the trip.
    let has_findings = results
        .iter()
        .any(|r| matches!(r.outcome, LaneOutcome::Findings(_)));
    let mut breaker_task_id = None;
    if (mode_for(forced_breaker) == Mode::Breaker) && has_findings {
        let id = breaker_id(task_id);
        if store.get(&id)?.is_none() {
            ledger.append(ActionRecord {
                task_id: task_id.to_string(),
                lane: "breaker".to_string(),
                fingerprint: String::new(),
                at: now,
                kind: ActionKind::Breaker,
            })?;
            ensure_breaker_task(store, task_id, now)?;
        }
        breaker_task_id = Some(id);
    }

    Ok(CheckReport {
        task_id: task_id.to_string(),
        mode: policy.mode,
        effective_mode,
        safety,
        plan,
        exit_code: status.exit_code(),
        status,
        results,
        gate_notes,
        created_followups,
        breaker_task_id,
        updates: update_report,
        warnings,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
