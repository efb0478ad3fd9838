use crate::error::{PitwallError, Result};
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory and file constants
// ---------------------------------------------------------------------------

pub const TASKGRAPH_DIR: &str = ".taskgraph";
pub const GRAPH_FILE: &str = "graph.jsonl";
pub const LOGS_DIR: &str = "logs";

pub const POLICY_FILE: &str = "pitwall-policy.toml";

/// pitwall's own state lives under `.taskgraph/.pitwall/`.
pub const STATE_DIR: &str = ".pitwall";
pub const LEDGER_FILE: &str = "action-ledger.jsonl";
pub const UPDATE_STATE_FILE: &str = "update-state.json";
pub const REVIEW_CONFIG_FILE: &str = "ecosystem-review.json";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn taskgraph_dir(root: &Path) -> PathBuf {
    root.join(TASKGRAPH_DIR)
}

pub fn graph_path(graph_dir: &Path) -> PathBuf {
    graph_dir.join(GRAPH_FILE)
}

pub fn log_path(graph_dir: &Path, task_id: &str) -> PathBuf {
    // Task ids come from the graph, but sanitize anyway since they become
    // file names.
    let safe: String = task_id
        .chars()
        .map(|c| if c == '/' || c == '\\' || c == '.' { '_' } else { c })
        .collect();
    graph_dir.join(LOGS_DIR).join(format!("{safe}.log"))
}

pub fn policy_path(graph_dir: &Path) -> PathBuf {
    graph_dir.join(POLICY_FILE)
}

pub fn state_dir(graph_dir: &Path) -> PathBuf {
    graph_dir.join(STATE_DIR)
}

pub fn ledger_path(graph_dir: &Path) -> PathBuf {
    state_dir(graph_dir).join(LEDGER_FILE)
}

pub fn update_state_path(graph_dir: &Path) -> PathBuf {
    state_dir(graph_dir).join(UPDATE_STATE_FILE)
}

pub fn review_config_path(graph_dir: &Path) -> PathBuf {
    state_dir(graph_dir).join(REVIEW_CONFIG_FILE)
}

pub fn lane_wrapper_path(graph_dir: &Path, lane: &str) -> PathBuf {
    graph_dir.join(lane)
}

/// Locate the task graph directory.
///
/// `explicit` may be either a project root or the `.taskgraph` directory
/// itself; otherwise walk upward from `cwd` looking for
/// `.taskgraph/graph.jsonl`.
pub fn find_taskgraph_dir(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(p) = explicit {
        let candidate = if p.file_name().and_then(|n| n.to_str()) == Some(TASKGRAPH_DIR) {
            p.to_path_buf()
        } else {
            p.join(TASKGRAPH_DIR)
        };
        if graph_path(&candidate).exists() {
            return Ok(candidate);
        }
        return Err(PitwallError::NotInitialized);
    }

    let cwd = std::env::current_dir()?;
    let mut dir = cwd.as_path();
    loop {
        let candidate = dir.join(TASKGRAPH_DIR);
        if graph_path(&candidate).exists() {
            return Ok(candidate);
        }
        match dir.parent() {
            Some(p) => dir = p,
            None => return Err(PitwallError::NotInitialized),
        }
    }
}
