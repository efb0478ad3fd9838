//! Read/write access to the external task graph.
//!
//! The graph lives at `.taskgraph/graph.jsonl`: line-oriented JSON records
//! with a `type` discriminator. Re-emitting a task record with the same id
//! supersedes the earlier line, so loads are last-wins. All mutation goes
//! through [`TaskStore`] so the scheduling logic can run against the
//! file-backed store or an in-memory one.

use crate::error::{PitwallError, Result};
use crate::io::{append_text, FileLock};
use crate::paths;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    #[default]
    Open,
    InProgress,
    Done,
    Abandoned,
}

impl TaskStatus {
    pub fn is_active(self) -> bool {
        !matches!(self, TaskStatus::Done | TaskStatus::Abandoned)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Open => "open",
            TaskStatus::InProgress => "in-progress",
            TaskStatus::Done => "done",
            TaskStatus::Abandoned => "abandoned",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub blocked_by: Vec<String>,
    #[serde(default, deserialize_with = "de_lenient_datetime")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "de_lenient_datetime")]
    pub not_before: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            status: TaskStatus::Open,
            tags: Vec::new(),
            blocked_by: Vec::new(),
            created_at: Some(Utc::now()),
            not_before: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn created_epoch(&self) -> i64 {
        self.created_at.map(|t| t.timestamp()).unwrap_or(0)
    }
}

/// Timestamps written by other tools are not always well-formed. Treat
/// anything unparseable as absent rather than dropping the whole record.
fn de_lenient_datetime<'de, D>(de: D) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(de)?;
    Ok(raw
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc)))
}

// ---------------------------------------------------------------------------
// TaskStore
// ---------------------------------------------------------------------------

pub trait TaskStore {
    fn get(&self, id: &str) -> Result<Option<Task>>;
    fn all(&self) -> Result<Vec<Task>>;
    /// Idempotent create. Returns false without touching anything when a
    /// task with this id already exists, in any status.
    fn create(&mut self, task: Task) -> Result<bool>;
    fn append_log(&mut self, id: &str, line: &str) -> Result<()>;
    fn set_status(&mut self, id: &str, status: TaskStatus) -> Result<()>;
    fn reschedule(&mut self, id: &str, not_before: DateTime<Utc>) -> Result<()>;
}

// ---------------------------------------------------------------------------
// JsonlStore
// ---------------------------------------------------------------------------

/// File-backed store over `.taskgraph/graph.jsonl`.
pub struct JsonlStore {
    graph_dir: PathBuf,
}

impl JsonlStore {
    pub fn open(graph_dir: impl Into<PathBuf>) -> Result<Self> {
        let graph_dir = graph_dir.into();
        if !graph_dir.join(paths::GRAPH_FILE).exists() {
            return Err(PitwallError::NotInitialized);
        }
        Ok(Self { graph_dir })
    }

    pub fn graph_dir(&self) -> &Path {
        &self.graph_dir
    }

    fn graph_path(&self) -> PathBuf {
        self.graph_dir.join(paths::GRAPH_FILE)
    }

    fn load(&self) -> Result<BTreeMap<String, Task>> {
        let text = std::fs::read_to_string(self.graph_path())?;
        let mut tasks = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
                continue;
            };
            if value.get("type").and_then(|v| v.as_str()) != Some("task") {
                continue;
            }
            let Ok(task) = serde_json::from_value::<Task>(value) else {
                continue;
            };
            tasks.insert(task.id.clone(), task);
        }
        Ok(tasks)
    }

    fn append_record(&self, task: &Task) -> Result<()> {
        let mut value = serde_json::to_value(task)?;
        value["type"] = serde_json::Value::String("task".to_string());
        append_text(&self.graph_path(), &format!("{value}\n"))
    }

    fn modify(&mut self, id: &str, apply: impl FnOnce(&mut Task)) -> Result<()> {
        let _lock = FileLock::acquire(&self.graph_path())?;
        let tasks = self.load()?;
        let mut task = tasks
            .get(id)
            .cloned()
            .ok_or_else(|| PitwallError::TaskNotFound(id.to_string()))?;
        apply(&mut task);
        self.append_record(&task)
    }
}

impl TaskStore for JsonlStore {
    fn get(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.load()?.get(id).cloned())
    }

    fn all(&self) -> Result<Vec<Task>> {
        Ok(self.load()?.into_values().collect())
    }

    fn create(&mut self, task: Task) -> Result<bool> {
        let _lock = FileLock::acquire(&self.graph_path())?;
        if self.load()?.contains_key(&task.id) {
            return Ok(false);
        }
        self.append_record(&task)?;
        Ok(true)
    }

    fn append_log(&mut self, id: &str, line: &str) -> Result<()> {
        let path = paths::log_path(&self.graph_dir, id);
        let mut text = line.to_string();
        if !text.ends_with('\n') {
            text.push('\n');
        }
        append_text(&path, &text)
    }

    fn set_status(&mut self, id: &str, status: TaskStatus) -> Result<()> {
        self.modify(id, |t| t.status = status)
    }

    fn reschedule(&mut self, id: &str, not_before: DateTime<Utc>) -> Result<()> {
        self.modify(id, |t| t.not_before = Some(not_before))
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// In-process store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    pub tasks: BTreeMap<String, Task>,
    pub logs: BTreeMap<String, Vec<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tasks(tasks: impl IntoIterator<Item = Task>) -> Self {
        let mut store = Self::new();
        for task in tasks {
            store.tasks.insert(task.id.clone(), task);
        }
        store
    }
}

impl TaskStore for MemoryStore {
    fn get(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.tasks.get(id).cloned())
    }

    fn all(&self) -> Result<Vec<Task>> {
        Ok(self.tasks.values().cloned().collect())
    }

    fn create(&mut self, task: Task) -> Result<bool> {
        if self.tasks.contains_key(&task.id) {
            return Ok(false);
        }
        self.tasks.insert(task.id.clone(), task);
        Ok(true)
    }

    fn append_log(&mut self, id: &str, line: &str) -> Result<()> {
        self.logs
            .entry(id.to_string())
            .or_default()
            .push(line.to_string());
        Ok(())
    }

    fn set_status(&mut self, id: &str, status: TaskStatus) -> Result<()> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| PitwallError::TaskNotFound(id.to_string()))?;
        task.status = status;
        Ok(())
    }

    fn reschedule(&mut self, id: &str, not_before: DateTime<Utc>) -> Result<()> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| PitwallError::TaskNotFound(id.to_string()))?;
        task.not_before = Some(not_before);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
