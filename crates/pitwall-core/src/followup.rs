//! Follow-up task creation with deterministic ids.
//!
//! The id is a pure function of (lane, origin task, finding fingerprint),
//! so the same evidence always maps to the same task and existence of the
//! id is the whole dedup check. No timestamps or counters ever leak into
//! an id.

use crate::engine::Finding;
use crate::error::Result;
use crate::graph::{Task, TaskStore};
use crate::lanes::REBUILD_LANE;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// First 8 hex chars of sha256(fingerprint).
pub fn fingerprint_tag(fingerprint: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(fingerprint.as_bytes());
    let digest = hasher.finalize();
    digest[..4].iter().map(|b| format!("{b:02x}")).collect()
}

/// Rebuild-lane follow-ups use a `rebuild-` prefix so chained generations
/// accumulate a countable depth in the id itself.
pub fn followup_id(lane: &str, origin: &str, fingerprint: &str) -> String {
    let tag = fingerprint_tag(fingerprint);
    if lane == REBUILD_LANE {
        format!("rebuild-{origin}-{tag}")
    } else {
        format!("followup-{lane}-{origin}-{tag}")
    }
}

pub fn breaker_id(origin: &str) -> String {
    format!("breaker-{origin}")
}

pub fn updates_task_id(origin: &str) -> String {
    format!("followup-updates-{origin}")
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedFollowup {
    pub task_id: String,
    pub lane: String,
    pub created: bool,
}

/// Idempotent: when the deterministic id already exists the store is left
/// untouched, whatever status the existing task is in.
pub fn create_followup(
    store: &mut dyn TaskStore,
    origin: &str,
    lane: &str,
    finding: &Finding,
    now: DateTime<Utc>,
) -> Result<CreatedFollowup> {
    let task_id = followup_id(lane, origin, &finding.fingerprint);
    let mut task = Task::new(&task_id, format!("{lane}: {} ({origin})", finding.kind));
    task.description = format!(
        "Finding reported by the {lane} lane.\n\n\
         Origin task: {origin}\n\
         Kind: {kind}\n\
         Fingerprint: {fp}\n\n\
         {detail}\n",
        kind = finding.kind,
        fp = finding.fingerprint,
        detail = finding.detail,
    );
    task.tags = vec!["followup".to_string(), lane.to_string()];
    task.created_at = Some(now);
    let created = store.create(task)?;
    Ok(CreatedFollowup {
        task_id,
        lane: lane.to_string(),
        created,
    })
}

/// Ensure the single escalation task for an origin whose automation keeps
/// getting rejected. Blocked by the origin so it surfaces for a human
/// instead of feeding back into the queue.
pub fn ensure_breaker_task(
    store: &mut dyn TaskStore,
    origin: &str,
    now: DateTime<Utc>,
) -> Result<CreatedFollowup> {
    let task_id = breaker_id(origin);
    let mut task = Task::new(&task_id, format!("breaker: {origin}"));
    task.description = format!(
        "Circuit-breaker escalation for repeated findings.\n\n\
         Origin task: {origin}\n\
         Triggered at: {now}\n\n\
         Run a bounded recovery pass:\n\
         - review open follow-up tasks\n\
         - tighten the contract touch scope\n\
         - close or merge stale remediation tasks\n\
         - re-run the check with --write-log --create-followups\n",
        now = now.to_rfc3339(),
    );
    task.tags = vec!["followup".to_string(), "breaker".to_string()];
    task.blocked_by = vec![origin.to_string()];
    task.created_at = Some(now);
    let created = store.create(task)?;
    Ok(CreatedFollowup {
        task_id,
        lane: "breaker".to_string(),
        created,
    })
}

/// Advisory evaluation task pointing at fresh ecosystem updates. One per
/// origin task; re-checks fold into the existing task.
pub fn ensure_updates_task(
    store: &mut dyn TaskStore,
    origin: &str,
    summary: &str,
    now: DateTime<Utc>,
) -> Result<CreatedFollowup> {
    let task_id = updates_task_id(origin);
    let mut task = Task::new(&task_id, format!("evaluate ecosystem updates ({origin})"));
    task.description = format!(
        "Ecosystem updates observed while checking {origin}.\n\n\
         {summary}\n\n\
         Decide adopt now vs defer and log the rationale. Nothing is\n\
         applied automatically.\n",
    );
    task.tags = vec!["followup".to_string(), "updates".to_string()];
    task.created_at = Some(now);
    let created = store.create(task)?;
    Ok(CreatedFollowup {
        task_id,
        lane: "updates".to_string(),
        created,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
