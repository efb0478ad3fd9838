//! Loop safety: the pre-run guard and the per-candidate action gate.
//!
//! The guard looks at the graph as a whole (chain depth, queue pressure,
//! blocker cycles) and can downgrade the effective mode for the run. The
//! gate looks at one candidate action and enforces cooldown, the rolling
//! hourly cap, and the new-evidence requirement, in that order. Mode
//! changes are monotonic within a run: only ever downward.

use crate::followup::followup_id;
use crate::graph::{Task, TaskStore};
use crate::health::{detect_cycle_from, rank_ready, rebuild_depth};
use crate::ledger::ActionLedger;
use crate::policy::{Mode, Policy};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize)]
pub struct LoopSafetyVerdict {
    pub breaches: Vec<String>,
    pub effective_mode: Mode,
    pub downgraded: bool,
}

/// Evaluate graph-level safety for a run against `task_id`. Breaches
/// downgrade redirect/heal/breaker to advise when the policy says to
/// block follow-up creation; observe is already the floor.
pub fn evaluate_loop_safety(
    tasks: &[Task],
    task_id: &str,
    policy: &Policy,
    now: DateTime<Utc>,
) -> LoopSafetyVerdict {
    let mut breaches = Vec::new();

    let depth = rebuild_depth(task_id);
    let depth_limit = policy.loop_safety.max_rebuild_depth.max(0) as usize;
    if depth > depth_limit {
        breaches.push(format!(
            "rebuild depth {depth} exceeds limit {depth_limit}"
        ));
    }

    let ready = rank_ready(tasks, policy, now, 10_000).len();
    let ready_limit = policy.loop_safety.max_ready_followups.max(0) as usize;
    if ready > ready_limit {
        breaches.push(format!(
            "ready follow-up queue {ready} exceeds limit {ready_limit}"
        ));
    }

    let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
    if detect_cycle_from(task_id, &by_id) {
        breaches.push("blocked-by cycle reachable from task".to_string());
    }

    let downgraded = !breaches.is_empty()
        && policy.loop_safety.block_followup_creation
        && policy.mode != Mode::Observe
        && policy.mode != Mode::Advise;
    let effective_mode = if downgraded { Mode::Advise } else { policy.mode };

    LoopSafetyVerdict {
        breaches,
        effective_mode,
        downgraded,
    }
}

// ---------------------------------------------------------------------------
// SafetyGate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "lowercase")]
pub enum GateDecision {
    Permit,
    Reject { reason: String },
}

pub struct SafetyGate<'a> {
    pub policy: &'a Policy,
}

impl SafetyGate<'_> {
    /// Check one candidate action. Order matters: cooldown, then the
    /// rolling hourly cap, then require-new-evidence.
    pub fn check(
        &self,
        ledger: &ActionLedger,
        store: &dyn TaskStore,
        task_id: &str,
        lane: &str,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> crate::error::Result<GateDecision> {
        let rec = &self.policy.recursion;

        if rec.cooldown_seconds > 0 {
            if let Some(last) = ledger.last_action_at(task_id) {
                let elapsed = (now - last).num_seconds();
                if elapsed < rec.cooldown_seconds {
                    return Ok(GateDecision::Reject {
                        reason: format!(
                            "cooldown active ({}s of {}s elapsed)",
                            elapsed.max(0),
                            rec.cooldown_seconds
                        ),
                    });
                }
            }
        }

        if ledger.actions_in_last_hour(task_id, now) >= rec.max_auto_actions_per_hour {
            return Ok(GateDecision::Reject {
                reason: format!(
                    "hourly action cap reached ({} per hour)",
                    rec.max_auto_actions_per_hour
                ),
            });
        }

        if rec.require_new_evidence && ledger.has_fingerprint(task_id, lane, fingerprint) {
            let existing = followup_id(lane, task_id, fingerprint);
            let still_active = store
                .get(&existing)?
                .map(|t| t.is_active())
                .unwrap_or(false);
            if still_active {
                return Ok(GateDecision::Reject {
                    reason: format!("evidence already tracked by active task {existing}"),
                });
            }
        }

        Ok(GateDecision::Permit)
    }
}

/// The circuit breaker trips when a task's trailing consecutive
/// rejections reach the policy threshold.
pub fn circuit_breaker_tripped(ledger: &ActionLedger, task_id: &str, policy: &Policy) -> bool {
    ledger.trailing_rejections(task_id) >= policy.recursion.circuit_breaker_after
}

/// Cooldown expiry for reporting: when the next action may run.
pub fn cooldown_until(ledger: &ActionLedger, task_id: &str, policy: &Policy) -> Option<DateTime<Utc>> {
    ledger
        .last_action_at(task_id)
        .map(|last| last + Duration::seconds(policy.recursion.cooldown_seconds))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MemoryStore;
    use crate::ledger::{ActionKind, ActionRecord};

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn action(task: &str, lane: &str, fp: &str, at: &str, kind: ActionKind) -> ActionRecord {
        ActionRecord {
            task_id: task.to_string(),
            lane: lane.to_string(),
            fingerprint: fp.to_string(),
            at: ts(at),
            kind,
        }
    }

    #[test]
    fn cooldown_window_edges() {
        let policy = Policy::default();
        let gate = SafetyGate { policy: &policy };
        let store = MemoryStore::new();
        let mut ledger = ActionLedger::in_memory();
        ledger
            .append(action("t1", "spec", "fp0", "2026-03-01T12:00:00Z", ActionKind::Followup))
            .unwrap();

        // 900s after the last action: still cooling down.
        let at_900 = gate
            .check(&ledger, &store, "t1", "spec", "fp1", ts("2026-03-01T12:15:00Z"))
            .unwrap();
        assert!(matches!(at_900, GateDecision::Reject { .. }));

        // 1801s after: cooldown over. The hourly cap still has room
        // (one action in the window, cap is two).
        let at_1801 = gate
            .check(&ledger, &store, "t1", "spec", "fp1", ts("2026-03-01T12:30:01Z"))
            .unwrap();
        assert_eq!(at_1801, GateDecision::Permit);
    }

    #[test]
    fn hourly_cap_rejects_the_third_action() {
        let mut policy = Policy::default();
        policy.recursion.cooldown_seconds = 0;
        let gate = SafetyGate { policy: &policy };
        let store = MemoryStore::new();
        let mut ledger = ActionLedger::in_memory();
        ledger
            .append(action("t1", "spec", "a", "2026-03-01T12:00:00Z", ActionKind::Followup))
            .unwrap();
        ledger
            .append(action("t1", "data", "b", "2026-03-01T12:20:00Z", ActionKind::Followup))
            .unwrap();

        let third = gate
            .check(&ledger, &store, "t1", "arch", "c", ts("2026-03-01T12:40:00Z"))
            .unwrap();
        match third {
            GateDecision::Reject { reason } => assert!(reason.contains("hourly")),
            other => panic!("expected rejection, got {other:?}"),
        }

        // Once the oldest action ages out of the rolling window the cap
        // frees up again.
        let later = gate
            .check(&ledger, &store, "t1", "arch", "c", ts("2026-03-01T13:10:00Z"))
            .unwrap();
        assert_eq!(later, GateDecision::Permit);
    }

    #[test]
    fn repeated_evidence_with_active_followup_is_rejected() {
        let mut policy = Policy::default();
        policy.recursion.cooldown_seconds = 0;
        policy.recursion.max_auto_actions_per_hour = 100;
        let gate = SafetyGate { policy: &policy };
        let mut store = MemoryStore::new();
        let mut ledger = ActionLedger::in_memory();
        ledger
            .append(action("t1", "spec", "fp1", "2026-03-01T10:00:00Z", ActionKind::Followup))
            .unwrap();
        store
            .create(Task::new(followup_id("spec", "t1", "fp1"), "tracked"))
            .unwrap();

        let again = gate
            .check(&ledger, &store, "t1", "spec", "fp1", ts("2026-03-01T14:00:00Z"))
            .unwrap();
        assert!(matches!(again, GateDecision::Reject { .. }));

        // Resolved follow-up: the same fingerprint may act again.
        store
            .set_status(&followup_id("spec", "t1", "fp1"), crate::graph::TaskStatus::Done)
            .unwrap();
        let resolved = gate
            .check(&ledger, &store, "t1", "spec", "fp1", ts("2026-03-01T14:00:00Z"))
            .unwrap();
        assert_eq!(resolved, GateDecision::Permit);

        // Fresh evidence was never blocked.
        let fresh = gate
            .check(&ledger, &store, "t1", "spec", "fp2", ts("2026-03-01T14:00:00Z"))
            .unwrap();
        assert_eq!(fresh, GateDecision::Permit);
    }

    #[test]
    fn guard_downgrades_on_depth_breach() {
        let policy = Policy::default();
        let deep = "rebuild-rebuild-rebuild-t1-aa-bb-cc";
        let verdict = evaluate_loop_safety(&[], deep, &policy, Utc::now());
        assert!(verdict.downgraded);
        assert_eq!(verdict.effective_mode, Mode::Advise);
        assert_eq!(verdict.breaches.len(), 1);
    }

    #[test]
    fn guard_respects_observe_floor() {
        let mut policy = Policy::default();
        policy.mode = Mode::Observe;
        let verdict = evaluate_loop_safety(&[], "rebuild-rebuild-rebuild-x-a-b-c", &policy, Utc::now());
        assert!(!verdict.downgraded);
        assert_eq!(verdict.effective_mode, Mode::Observe);
    }

    #[test]
    fn guard_detects_queue_pressure() {
        let mut policy = Policy::default();
        policy.loop_safety.max_ready_followups = 1;
        let tasks = vec![
            Task::new("followup-spec-t1-aaaaaaaa", "one"),
            Task::new("followup-data-t2-bbbbbbbb", "two"),
        ];
        let verdict = evaluate_loop_safety(&tasks, "t1", &policy, Utc::now());
        assert!(verdict.downgraded);
        assert!(verdict.breaches[0].contains("queue"));
    }

    #[test]
    fn clean_graph_keeps_policy_mode() {
        let verdict = evaluate_loop_safety(&[], "t1", &Policy::default(), Utc::now());
        assert!(!verdict.downgraded);
        assert_eq!(verdict.effective_mode, Mode::Redirect);
        assert!(verdict.breaches.is_empty());
    }

    #[test]
    fn circuit_breaker_threshold() {
        let policy = Policy::default();
        let mut ledger = ActionLedger::in_memory();
        for _ in 0..2 {
            ledger
                .append(action("t1", "spec", "x", "2026-03-01T10:00:00Z", ActionKind::Rejected))
                .unwrap();
        }
        assert!(!circuit_breaker_tripped(&ledger, "t1", &policy));
        ledger
            .append(action("t1", "spec", "x", "2026-03-01T10:01:00Z", ActionKind::Rejected))
            .unwrap();
        assert!(circuit_breaker_tripped(&ledger, "t1", &policy));
    }
}
