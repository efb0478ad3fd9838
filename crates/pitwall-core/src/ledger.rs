//! Append-only action ledger at `.taskgraph/.pitwall/action-ledger.jsonl`.
//!
//! Every automated action (and every rejection of one) is recorded here.
//! The file is never rewritten; rate-limit queries replay it in memory.
//! An unreadable ledger degrades to an empty one with a loud note, which
//! errs toward allowing actions rather than wedging the scheduler.

use crate::error::Result;
use crate::io::{append_text, FileLock};
use crate::paths;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Followup,
    Breaker,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub task_id: String,
    pub lane: String,
    pub fingerprint: String,
    pub at: DateTime<Utc>,
    pub kind: ActionKind,
}

#[derive(Debug, Default)]
pub struct ActionLedger {
    records: Vec<ActionRecord>,
    path: Option<PathBuf>,
    pub load_warnings: Vec<String>,
}

impl ActionLedger {
    /// Load from the graph's state dir. A missing file is an empty
    /// ledger; unreadable content is skipped and noted.
    pub fn load(graph_dir: &Path) -> ActionLedger {
        let path = paths::ledger_path(graph_dir);
        let mut ledger = ActionLedger {
            path: Some(path.clone()),
            ..Default::default()
        };
        let text = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return ledger,
            Err(e) => {
                ledger
                    .load_warnings
                    .push(format!("action ledger unreadable ({e}); treating as empty"));
                return ledger;
            }
        };
        let mut skipped = 0usize;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<ActionRecord>(line) {
                Ok(record) => ledger.records.push(record),
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            ledger
                .load_warnings
                .push(format!("action ledger: skipped {skipped} corrupt line(s)"));
        }
        ledger
    }

    /// Ledger with no backing file, for tests and dry runs.
    pub fn in_memory() -> ActionLedger {
        ActionLedger::default()
    }

    pub fn records(&self) -> &[ActionRecord] {
        &self.records
    }

    /// Append a record, taking the ledger file lock when file-backed.
    pub fn append(&mut self, record: ActionRecord) -> Result<()> {
        if let Some(path) = &self.path {
            let _lock = FileLock::acquire(path)?;
            let mut line = serde_json::to_string(&record)?;
            line.push('\n');
            append_text(path, &line)?;
        }
        self.records.push(record);
        Ok(())
    }

    // -- rate-limit queries -------------------------------------------------

    /// Timestamp of the most recent performed action (rejections do not
    /// reset the cooldown clock).
    pub fn last_action_at(&self, task_id: &str) -> Option<DateTime<Utc>> {
        self.records
            .iter()
            .filter(|r| r.task_id == task_id && r.kind != ActionKind::Rejected)
            .map(|r| r.at)
            .max()
    }

    /// Performed actions for a task inside the rolling hour ending at `now`.
    pub fn actions_in_last_hour(&self, task_id: &str, now: DateTime<Utc>) -> i64 {
        let window_start = now - Duration::hours(1);
        self.records
            .iter()
            .filter(|r| {
                r.task_id == task_id
                    && r.kind != ActionKind::Rejected
                    && r.at > window_start
                    && r.at <= now
            })
            .count() as i64
    }

    /// Whether this exact evidence has already driven an action.
    pub fn has_fingerprint(&self, task_id: &str, lane: &str, fingerprint: &str) -> bool {
        self.records.iter().any(|r| {
            r.task_id == task_id
                && r.lane == lane
                && r.fingerprint == fingerprint
                && r.kind != ActionKind::Rejected
        })
    }

    /// Length of the unbroken run of rejections at the tail of this
    /// task's history.
    pub fn trailing_rejections(&self, task_id: &str) -> i64 {
        self.records
            .iter()
            .rev()
            .filter(|r| r.task_id == task_id)
            .take_while(|r| r.kind == ActionKind::Rejected)
            .count() as i64
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
