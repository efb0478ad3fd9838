//! Lane execution: spawning check tools and collecting their verdicts.
//!
//! Exit code 0 means clean, 3 means findings; anything else (including a
//! timeout or spawn failure) is a lane failure. Failures are isolated so
//! one broken wrapper never hides the verdicts of the lanes after it.

use crate::lanes::LaneDescriptor;
use crate::policy::EffectFlags;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

pub const EXIT_CLEAN: i32 = 0;
pub const EXIT_FINDINGS: i32 = 3;
pub const DEFAULT_LANE_TIMEOUT: Duration = Duration::from_secs(600);

const MAX_STDERR: usize = 4000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Finding {
    pub kind: String,
    pub fingerprint: String,
    #[serde(default)]
    pub detail: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LaneReport {
    #[serde(default)]
    pub findings: Vec<Finding>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LaneFailure {
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stderr: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", content = "report", rename_all = "lowercase")]
pub enum LaneOutcome {
    Clean,
    Findings(LaneReport),
    Failed(LaneFailure),
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub lane: String,
    #[serde(flatten)]
    pub outcome: LaneOutcome,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateStatus {
    Clean,
    Findings,
    Failed,
}

impl AggregateStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            AggregateStatus::Clean => 0,
            AggregateStatus::Findings => 3,
            AggregateStatus::Failed => 1,
        }
    }
}

/// Failed dominates findings, findings dominate clean.
pub fn aggregate(results: &[RunResult]) -> AggregateStatus {
    let mut status = AggregateStatus::Clean;
    for result in results {
        match &result.outcome {
            LaneOutcome::Failed(_) => return AggregateStatus::Failed,
            LaneOutcome::Findings(_) => status = AggregateStatus::Findings,
            LaneOutcome::Clean => {}
        }
    }
    status
}

// ---------------------------------------------------------------------------
// LaneRunner
// ---------------------------------------------------------------------------

pub trait LaneRunner {
    fn run(&mut self, lane: &LaneDescriptor, task_id: &str, flags: EffectFlags) -> RunResult;
}

/// Invokes `<wrapper> check --task <id> [--write-log] [--create-followups]
/// --json` with a bounded wait.
pub struct ProcessRunner {
    pub project_dir: PathBuf,
    pub timeout: Duration,
}

impl ProcessRunner {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            timeout: DEFAULT_LANE_TIMEOUT,
        }
    }
}

impl LaneRunner for ProcessRunner {
    fn run(&mut self, lane: &LaneDescriptor, task_id: &str, flags: EffectFlags) -> RunResult {
        let started = Instant::now();
        let Some(bin) = lane.command_path.as_ref() else {
            return RunResult {
                lane: lane.name.clone(),
                outcome: LaneOutcome::Failed(LaneFailure {
                    reason: "no wrapper installed".to_string(),
                    exit_code: None,
                    stderr: String::new(),
                }),
                duration_ms: 0,
            };
        };

        let mut cmd = Command::new(bin);
        cmd.arg("check").arg("--task").arg(task_id);
        if flags.write_log {
            cmd.arg("--write-log");
        }
        if flags.create_followups {
            cmd.arg("--create-followups");
        }
        cmd.arg("--json");

        let outcome = run_with_timeout(cmd, &self.project_dir, self.timeout);
        RunResult {
            lane: lane.name.clone(),
            outcome,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// Dedicated threads read stdout/stderr (avoiding pipe-buffer deadlocks);
/// a waiter thread plus `mpsc::recv_timeout` bounds the wait without
/// busy-waiting. On timeout the child is killed by PID and the waiter
/// unblocks once it exits.
fn run_with_timeout(mut cmd: Command, cwd: &std::path::Path, timeout: Duration) -> LaneOutcome {
    let mut child = match cmd
        .current_dir(cwd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(c) => c,
        Err(e) => {
            return LaneOutcome::Failed(LaneFailure {
                reason: format!("failed to spawn: {e}"),
                exit_code: None,
                stderr: String::new(),
            })
        }
    };

    let child_pid = child.id();
    let stdout_handle = child.stdout.take();
    let stderr_handle = child.stderr.take();

    let stdout_thread = std::thread::spawn(move || -> String {
        let mut buf = String::new();
        if let Some(mut r) = stdout_handle {
            use std::io::Read;
            let _ = r.read_to_string(&mut buf);
        }
        buf
    });
    let stderr_thread = std::thread::spawn(move || -> String {
        let mut buf = String::new();
        if let Some(mut r) = stderr_handle {
            use std::io::Read;
            let _ = r.read_to_string(&mut buf);
        }
        buf
    });

    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(child.wait());
    });

    let wait_result = match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(_) => {
            kill_process(child_pid);
            return LaneOutcome::Failed(LaneFailure {
                reason: format!("timed out after {}s", timeout.as_secs()),
                exit_code: None,
                stderr: String::new(),
            });
        }
    };

    let stdout_buf = stdout_thread.join().unwrap_or_default();
    let stderr_buf = stderr_thread.join().unwrap_or_default();

    let status = match wait_result {
        Ok(s) => s,
        Err(e) => {
            return LaneOutcome::Failed(LaneFailure {
                reason: format!("wait failed: {e}"),
                exit_code: None,
                stderr: cap(&stderr_buf),
            })
        }
    };

    match status.code() {
        Some(EXIT_CLEAN) => LaneOutcome::Clean,
        Some(EXIT_FINDINGS) => LaneOutcome::Findings(parse_report(&stdout_buf)),
        code => LaneOutcome::Failed(LaneFailure {
            reason: match code {
                Some(n) => format!("exit code {n}"),
                None => "killed by signal".to_string(),
            },
            exit_code: code,
            stderr: cap(&stderr_buf),
        }),
    }
}

/// Lane wrappers that predate the JSON report emit free text on findings.
/// Keep the verdict usable by synthesizing one finding whose fingerprint
/// is the content hash of the output.
fn parse_report(stdout: &str) -> LaneReport {
    if let Ok(report) = serde_json::from_str::<LaneReport>(stdout) {
        return report;
    }
    let mut hasher = Sha256::new();
    hasher.update(stdout.as_bytes());
    let digest = hasher.finalize();
    let fingerprint: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    LaneReport {
        findings: vec![Finding {
            kind: "unstructured-report".to_string(),
            fingerprint,
            detail: cap(stdout),
        }],
    }
}

fn cap(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= MAX_STDERR {
        return trimmed.to_string();
    }
    let mut cut = trimmed.len() - MAX_STDERR;
    while !trimmed.is_char_boundary(cut) {
        cut += 1;
    }
    trimmed[cut..].to_string()
}

/// Best-effort SIGKILL by PID; errors are ignored.
fn kill_process(pid: u32) {
    let _ = Command::new("kill")
        .arg("-9")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
