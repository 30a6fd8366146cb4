//! Task snapshots consumed by the planner.
//!
//! A [`TaskSnapshot`] is an immutable, id-ordered view of every task the
//! coordinator may schedule. Snapshots come from a [`TaskSource`]; the
//! bundled [`FrontmatterTaskSource`] reads markdown task files.

pub mod annotation;
pub mod frontmatter;

pub use annotation::{OrchestrationAnnotation, parse_duration};
pub use frontmatter::FrontmatterTaskSource;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Completion state of a task as recorded in the backlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Done,
}

impl TaskStatus {
    /// Parse a backlog status, accepting the common spellings.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "to do" | "todo" | "to_do" | "pending" => Some(Self::Pending),
            "in progress" | "in_progress" | "in-progress" | "doing" => Some(Self::InProgress),
            "done" | "complete" | "completed" => Some(Self::Done),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "To Do"),
            TaskStatus::InProgress => write!(f, "In Progress"),
            TaskStatus::Done => write!(f, "Done"),
        }
    }
}

/// A single task with its raw frontmatter.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub id: String,
    pub status: TaskStatus,
    pub path: Option<PathBuf>,
    /// Frontmatter fields, including the `orchestration` block if present
    pub metadata: Map<String, Value>,
}

impl TaskRecord {
    pub fn new(id: impl Into<String>, status: TaskStatus, metadata: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            status,
            path: None,
            metadata,
        }
    }
}

/// Immutable set of tasks keyed by id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskSnapshot {
    tasks: BTreeMap<String, TaskRecord>,
}

impl TaskSnapshot {
    /// Build a snapshot. A later record with a repeated id replaces the earlier one.
    pub fn new(records: impl IntoIterator<Item = TaskRecord>) -> Self {
        let tasks = records.into_iter().map(|r| (r.id.clone(), r)).collect();
        Self { tasks }
    }

    pub fn get(&self, task_id: &str) -> Option<&TaskRecord> {
        self.tasks.get(task_id)
    }

    /// Tasks in id order.
    pub fn iter(&self) -> impl Iterator<Item = &TaskRecord> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Provider of task snapshots.
pub trait TaskSource {
    fn load_snapshot(&self) -> Result<TaskSnapshot>;
}

impl TaskSource for TaskSnapshot {
    fn load_snapshot(&self) -> Result<TaskSnapshot> {
        Ok(self.clone())
    }
}
