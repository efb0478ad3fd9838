//! Queue ranking, duplicate detection, and the health scoreboard.
//!
//! Everything here is a pure function over a task snapshot plus an
//! explicit `now`, so the doctor and queue views are reproducible.

use crate::graph::{Task, TaskStatus};
use crate::policy::Policy;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::OnceLock;

fn followup_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(followup-|rebuild-|breaker-)").unwrap())
}

fn chained_rebuild_prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^(rebuild [a-z]+:\s*)+").unwrap())
}

pub fn is_followup_task(task: &Task) -> bool {
    if followup_id_re().is_match(&task.id) {
        return true;
    }
    task.tags.iter().any(|t| {
        matches!(
            t.to_ascii_lowercase().as_str(),
            "followup" | "breaker" | "rebuild" | "updates"
        )
    })
}

/// Chain depth encoded in a rebuild follow-up id.
pub fn rebuild_depth(task_id: &str) -> usize {
    task_id.matches("rebuild-").count()
}

pub fn blockers_done(task: &Task, by_id: &HashMap<&str, &Task>) -> bool {
    task.blocked_by.iter().all(|blocker_id| {
        by_id
            .get(blocker_id.as_str())
            .map(|b| b.status == TaskStatus::Done)
            .unwrap_or(false)
    })
}

/// Whether following `blocked_by` edges from `task_id` reaches a cycle.
pub fn detect_cycle_from(task_id: &str, by_id: &HashMap<&str, &Task>) -> bool {
    fn dfs(
        cur: &str,
        by_id: &HashMap<&str, &Task>,
        visited: &mut HashSet<String>,
        stack: &mut HashSet<String>,
    ) -> bool {
        if stack.contains(cur) {
            return true;
        }
        if !visited.insert(cur.to_string()) {
            return false;
        }
        stack.insert(cur.to_string());
        if let Some(node) = by_id.get(cur) {
            for blocker in &node.blocked_by {
                if dfs(blocker, by_id, visited, stack) {
                    return true;
                }
            }
        }
        stack.remove(cur);
        false
    }
    if task_id.is_empty() {
        return false;
    }
    dfs(task_id, by_id, &mut HashSet::new(), &mut HashSet::new())
}

/// Normalized dedup key: lowercased title with chained `rebuild <step>:`
/// prefixes stripped; the id when there is no title.
pub fn normalize_key(task: &Task) -> String {
    let mut title = task.title.trim().to_ascii_lowercase();
    if !title.is_empty() {
        title = chained_rebuild_prefix_re().replace(&title, "").to_string();
        title = title.split_whitespace().collect::<Vec<_>>().join(" ");
    }
    if title.is_empty() {
        task.id.trim().to_ascii_lowercase()
    } else {
        title
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateGroup {
    pub key: String,
    pub count: usize,
    pub task_ids: Vec<String>,
}

pub fn duplicate_groups(tasks: &[Task]) -> Vec<DuplicateGroup> {
    let mut groups: BTreeMap<String, Vec<&Task>> = BTreeMap::new();
    for task in tasks {
        if !is_followup_task(task) || !task.is_active() {
            continue;
        }
        let key = normalize_key(task);
        if key.is_empty() {
            continue;
        }
        groups.entry(key).or_default().push(task);
    }
    let mut out: Vec<DuplicateGroup> = groups
        .into_iter()
        .filter(|(_, members)| members.len() > 1)
        .map(|(key, members)| DuplicateGroup {
            count: members.len(),
            task_ids: members.iter().map(|t| t.id.clone()).collect(),
            key,
        })
        .collect();
    out.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
    out
}

// ---------------------------------------------------------------------------
// Ready queue
// ---------------------------------------------------------------------------

/// Breaker escalations outrank everything; the rest rank by their lane's
/// position in policy order.
pub fn queue_priority(task: &Task, policy: &Policy) -> i64 {
    if task.id.starts_with("breaker-") {
        return 100;
    }
    let lane = if task.id.starts_with("rebuild-") {
        Some("rebuild".to_string())
    } else {
        task.id
            .strip_prefix("followup-")
            .and_then(|rest| rest.split('-').next())
            .map(str::to_string)
    };
    match lane {
        Some(lane) => 90 - policy.lane_rank(&lane) as i64,
        None => 50,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueEntry {
    pub task_id: String,
    pub title: String,
    pub status: TaskStatus,
    pub priority: i64,
    pub created_at: Option<DateTime<Utc>>,
    pub blocked_by: Vec<String>,
}

/// Active follow-up tasks whose blockers are done and whose `not_before`
/// has passed, best-first.
pub fn rank_ready(
    tasks: &[Task],
    policy: &Policy,
    now: DateTime<Utc>,
    limit: usize,
) -> Vec<QueueEntry> {
    let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
    let mut ready: Vec<&Task> = tasks
        .iter()
        .filter(|t| is_followup_task(t) && t.is_active())
        .filter(|t| t.not_before.map(|nb| nb <= now).unwrap_or(true))
        .filter(|t| blockers_done(t, &by_id))
        .collect();
    ready.sort_by(|a, b| {
        queue_priority(b, policy)
            .cmp(&queue_priority(a, policy))
            .then_with(|| a.created_epoch().cmp(&b.created_epoch()))
            .then_with(|| a.id.cmp(&b.id))
    });
    ready
        .into_iter()
        .take(limit.max(1))
        .map(|t| QueueEntry {
            task_id: t.id.clone(),
            title: t.title.clone(),
            status: t.status,
            priority: queue_priority(t, policy),
            created_at: t.created_at,
            blocked_by: t.blocked_by.clone(),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Scoreboard
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Watch,
    Risk,
}

#[derive(Debug, Clone, Serialize)]
pub struct Scoreboard {
    pub status: HealthStatus,
    pub tasks_total: usize,
    pub active_tasks: usize,
    pub followups_total: usize,
    pub active_followups: usize,
    pub ready_followups: usize,
    pub contract_coverage: f64,
    pub followup_ratio: f64,
    pub max_rebuild_depth: usize,
    pub duplicate_groups: Vec<DuplicateGroup>,
}

pub fn scoreboard(tasks: &[Task], policy: &Policy, now: DateTime<Utc>) -> Scoreboard {
    let active: Vec<&Task> = tasks.iter().filter(|t| t.is_active()).collect();
    let followups: Vec<&Task> = tasks.iter().filter(|t| is_followup_task(t)).collect();
    let active_followups = followups.iter().filter(|t| t.is_active()).count();
    let ready = rank_ready(tasks, policy, now, 10_000).len();

    let with_contract = active
        .iter()
        .filter(|t| t.description.contains("```contract"))
        .count();
    let contract_coverage = if active.is_empty() {
        1.0
    } else {
        with_contract as f64 / active.len() as f64
    };
    let followup_ratio = if active.is_empty() {
        0.0
    } else {
        active_followups as f64 / active.len() as f64
    };

    let max_depth = followups
        .iter()
        .filter(|t| t.is_active() && t.id.starts_with("rebuild-"))
        .map(|t| rebuild_depth(&t.id))
        .max()
        .unwrap_or(0);

    let dups = duplicate_groups(tasks);
    let status = if contract_coverage < 0.7 || ready > 20 || max_depth > 2 {
        HealthStatus::Risk
    } else if contract_coverage < 0.9 || ready > 8 || max_depth > 1 || !dups.is_empty() {
        HealthStatus::Watch
    } else {
        HealthStatus::Healthy
    };

    Scoreboard {
        status,
        tasks_total: tasks.len(),
        active_tasks: active.len(),
        followups_total: followups.len(),
        active_followups,
        ready_followups: ready,
        contract_coverage: (contract_coverage * 10_000.0).round() / 10_000.0,
        followup_ratio: (followup_ratio * 10_000.0).round() / 10_000.0,
        max_rebuild_depth: max_depth,
        duplicate_groups: dups,
    }
}

// ---------------------------------------------------------------------------
// Compact plan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct CompactGroup {
    pub key: String,
    pub keep_task_id: String,
    pub abandon_task_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompactPlan {
    pub duplicate_groups: Vec<CompactGroup>,
    pub depth_exceeded_task_ids: Vec<String>,
    pub abandon_task_ids: Vec<String>,
    pub defer_task_ids: Vec<String>,
    pub ready_before: usize,
    pub max_ready: usize,
    pub max_rebuild_depth: usize,
}

/// Dry plan for `compact`: duplicates keep the in-progress (else oldest)
/// member, over-depth rebuild chains are abandoned unless in progress,
/// and ready-queue overflow is deferred. Nothing is ever deleted.
pub fn compact_plan(
    tasks: &[Task],
    policy: &Policy,
    max_ready: usize,
    now: DateTime<Utc>,
) -> CompactPlan {
    let mut grouped: BTreeMap<String, Vec<&Task>> = BTreeMap::new();
    for task in tasks {
        if !is_followup_task(task) || !task.is_active() {
            continue;
        }
        grouped.entry(normalize_key(task)).or_default().push(task);
    }

    let mut duplicate_groups = Vec::new();
    let mut abandon: HashSet<String> = HashSet::new();
    for (key, mut members) in grouped {
        if members.len() <= 1 {
            continue;
        }
        members.sort_by(|a, b| {
            let a_rank = if a.status == TaskStatus::InProgress { 0 } else { 1 };
            let b_rank = if b.status == TaskStatus::InProgress { 0 } else { 1 };
            a_rank
                .cmp(&b_rank)
                .then_with(|| a.created_epoch().cmp(&b.created_epoch()))
                .then_with(|| a.id.cmp(&b.id))
        });
        let keep = members[0].id.clone();
        let drop: Vec<String> = members[1..].iter().map(|t| t.id.clone()).collect();
        abandon.extend(drop.iter().cloned());
        duplicate_groups.push(CompactGroup {
            key,
            keep_task_id: keep,
            abandon_task_ids: drop,
        });
    }

    let depth_limit = policy.loop_safety.max_rebuild_depth.max(0) as usize;
    let mut depth_exceeded: Vec<String> = tasks
        .iter()
        .filter(|t| is_followup_task(t) && t.is_active())
        .filter(|t| t.id.starts_with("rebuild-"))
        .filter(|t| rebuild_depth(&t.id) > depth_limit)
        .filter(|t| t.status != TaskStatus::InProgress)
        .map(|t| t.id.clone())
        .collect();
    depth_exceeded.sort();
    depth_exceeded.dedup();
    abandon.extend(depth_exceeded.iter().cloned());

    let ready = rank_ready(tasks, policy, now, 10_000);
    let defer: Vec<String> = ready
        .iter()
        .skip(max_ready)
        .map(|e| e.task_id.clone())
        .filter(|id| !abandon.contains(id))
        .collect();

    let mut abandon_ids: Vec<String> = abandon.into_iter().collect();
    abandon_ids.sort();

    CompactPlan {
        duplicate_groups,
        depth_exceeded_task_ids: depth_exceeded,
        abandon_task_ids: abandon_ids,
        defer_task_ids: defer,
        ready_before: ready.len(),
        max_ready,
        max_rebuild_depth: depth_limit,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, title: &str) -> Task {
        let mut t = Task::new(id, title);
        t.created_at = Some("2026-03-01T00:00:00Z".parse().unwrap());
        t
    }

    fn now() -> DateTime<Utc> {
        "2026-03-02T00:00:00Z".parse().unwrap()
    }

    #[test]
    fn followup_detection() {
        assert!(is_followup_task(&task("followup-spec-t1-ab12cd34", "x")));
        assert!(is_followup_task(&task("rebuild-t1-ab12cd34", "x")));
        assert!(is_followup_task(&task("breaker-t1", "x")));
        let mut tagged = task("t9", "regular");
        assert!(!is_followup_task(&tagged));
        tagged.tags.push("followup".to_string());
        assert!(is_followup_task(&tagged));
    }

    #[test]
    fn rebuild_depth_counts_prefix_occurrences() {
        assert_eq!(rebuild_depth("t1"), 0);
        assert_eq!(rebuild_depth("rebuild-t1-aa"), 1);
        assert_eq!(rebuild_depth("rebuild-rebuild-t1-aa-bb"), 2);
    }

    #[test]
    fn normalize_key_strips_chained_prefixes() {
        let a = task("followup-spec-a-11111111", "Rebuild build: fix the login flow");
        let b = task("followup-spec-b-22222222", "rebuild exec: rebuild build:   fix  the login flow");
        assert_eq!(normalize_key(&a), "fix the login flow");
        assert_eq!(normalize_key(&a), normalize_key(&b));
    }

    #[test]
    fn cycle_detection() {
        let mut a = task("a", "a");
        a.blocked_by = vec!["b".to_string()];
        let mut b = task("b", "b");
        b.blocked_by = vec!["a".to_string()];
        let c = task("c", "c");
        let tasks = [a, b, c];
        let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
        assert!(detect_cycle_from("a", &by_id));
        assert!(!detect_cycle_from("c", &by_id));
    }

    #[test]
    fn ready_queue_ordering() {
        let mut breaker = task("breaker-t1", "breaker: t1");
        breaker.blocked_by = vec!["t1".to_string()];
        let mut origin = task("t1", "origin");
        origin.status = TaskStatus::Done;
        let older = {
            let mut t = task("followup-spec-t1-aaaaaaaa", "older spec fix");
            t.created_at = Some("2026-02-01T00:00:00Z".parse().unwrap());
            t
        };
        let newer = task("followup-spec-t2-bbbbbbbb", "newer spec fix");
        let rebuild = task("rebuild-t1-cccccccc", "rebuild pass");

        let tasks = vec![origin, breaker, newer, older, rebuild];
        let ranked = rank_ready(&tasks, &Policy::default(), now(), 10);
        let ids: Vec<&str> = ranked.iter().map(|e| e.task_id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "breaker-t1",
                "followup-spec-t1-aaaaaaaa",
                "followup-spec-t2-bbbbbbbb",
                "rebuild-t1-cccccccc",
            ]
        );
    }

    #[test]
    fn ready_queue_skips_blocked_and_deferred() {
        let mut blocked = task("followup-spec-t1-aaaaaaaa", "blocked");
        blocked.blocked_by = vec!["t1".to_string()];
        let open_blocker = task("t1", "origin still open");
        let mut deferred = task("followup-data-t2-bbbbbbbb", "deferred");
        deferred.not_before = Some("2026-03-03T00:00:00Z".parse().unwrap());
        let ready = task("followup-arch-t3-cccccccc", "ready");

        let tasks = vec![blocked, open_blocker, deferred, ready];
        let ranked = rank_ready(&tasks, &Policy::default(), now(), 10);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].task_id, "followup-arch-t3-cccccccc");
    }

    #[test]
    fn scoreboard_thresholds() {
        // One active task, no contract fence: coverage 0.0 -> risk.
        let tasks = vec![task("t1", "bare")];
        let board = scoreboard(&tasks, &Policy::default(), now());
        assert_eq!(board.status, HealthStatus::Risk);

        // Contracted task and no follow-ups -> healthy.
        let mut contracted = task("t1", "covered");
        contracted.description = "```contract\nschema = 1\n```".to_string();
        let board = scoreboard(&[contracted.clone()], &Policy::default(), now());
        assert_eq!(board.status, HealthStatus::Healthy);

        // Depth 2 rebuild chain -> watch.
        let mut deep = task("rebuild-rebuild-t1-aa-bb", "deep chain");
        deep.description = "```contract\nschema = 1\n```".to_string();
        let board = scoreboard(&[contracted, deep], &Policy::default(), now());
        assert_eq!(board.status, HealthStatus::Watch);
        assert_eq!(board.max_rebuild_depth, 2);
    }

    #[test]
    fn compact_plan_keeps_in_progress_and_defers_overflow() {
        let mut keep = task("followup-spec-t1-aaaaaaaa", "fix parser");
        keep.status = TaskStatus::InProgress;
        let dup = task("followup-spec-t2-bbbbbbbb", "fix parser");
        let deep = task("rebuild-rebuild-rebuild-t1-aa-bb-cc", "too deep");
        let extra1 = task("followup-data-t3-cccccccc", "data fix");
        let extra2 = task("followup-arch-t4-dddddddd", "arch fix");

        let tasks = vec![keep, dup, deep, extra1, extra2];
        let plan = compact_plan(&tasks, &Policy::default(), 1, now());

        assert_eq!(plan.duplicate_groups.len(), 1);
        assert_eq!(plan.duplicate_groups[0].keep_task_id, "followup-spec-t1-aaaaaaaa");
        assert!(plan
            .abandon_task_ids
            .contains(&"followup-spec-t2-bbbbbbbb".to_string()));
        assert!(plan
            .abandon_task_ids
            .contains(&"rebuild-rebuild-rebuild-t1-aa-bb-cc".to_string()));
        // In-progress keeper is not ready-queue material but overflow past
        // max_ready=1 gets deferred, minus anything already abandoned.
        assert!(!plan.defer_task_ids.is_empty());
        for id in &plan.defer_task_ids {
            assert!(!plan.abandon_task_ids.contains(id));
        }
    }
}
