//! Orchestration annotations on task frontmatter.
//!
//! A task opts into scheduling with an `orchestration` block:
//!
//! ```yaml
//! orchestration:
//!   bootstrap_stage: 1
//!   parallel_group: 2
//!   stage_group_id: s1-group-2
//!   depends_on: [task-001, s1-group-1]
//!   estimated_duration: 30m
//! ```
//!
//! Extraction is strict for single-task lookups (errors propagate) and
//! tolerant during bulk planning (bad tasks are skipped and logged).

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

use super::{TaskRecord, TaskStatus};
use crate::errors::MetadataError;

static DURATION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(\d+(?:\.\d+)?)\s*(s|sec|secs|second|seconds|m|min|mins|minute|minutes|h|hr|hrs|hour|hours)?$",
    )
    .unwrap()
});

/// Normalized orchestration metadata for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestrationAnnotation {
    pub task_id: String,
    pub stage_group_id: String,
    pub bootstrap_stage: u32,
    pub phase: u32,
    pub parallel_stage: u32,
    pub agent_type: String,
    pub sandbox: String,
    /// Task ids or group ids this task waits on
    pub depends_on: Vec<String>,
    pub skills: Vec<String>,
    pub context_ref: Option<String>,
    pub estimated_duration: Option<u64>,
    pub task_status: TaskStatus,
}

impl OrchestrationAnnotation {
    /// Extract the annotation of `task`, failing on anything missing or invalid.
    pub fn extract(task: &TaskRecord) -> Result<Self, MetadataError> {
        let block = match task.metadata.get("orchestration") {
            Some(Value::Object(block)) => block,
            Some(Value::Null) | None => {
                return Err(MetadataError::MissingAnnotation {
                    task_id: task.id.clone(),
                });
            }
            Some(_) => {
                return Err(invalid(task, "orchestration", "must be a mapping"));
            }
        };

        let bootstrap_stage = required_positive(task, block, &["bootstrap_stage"], "bootstrap_stage")?;
        let parallel_stage = required_positive(
            task,
            block,
            &["parallel_group", "parallel_stage"],
            "parallel_group",
        )?;
        let phase = match block.get("phase") {
            None | Some(Value::Null) => 1,
            Some(value) => positive(task, value, "phase")?,
        };

        let stage_group_id = block
            .get("stage_group_id")
            .and_then(scalar_text)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| format!("s{bootstrap_stage}-group-{parallel_stage}"));

        let agent_type = text_or(block.get("agent_type"), "default");
        let sandbox = text_or(block.get("sandbox"), "read-only");
        let depends_on = string_list(task, block.get("depends_on"), "depends_on")?;
        let skills = string_list(task, block.get("skills"), "skills")?;

        let context_ref = task
            .metadata
            .get("context_ref")
            .or_else(|| block.get("context_ref"))
            .and_then(scalar_text)
            .filter(|s| !s.is_empty());

        Ok(Self {
            task_id: task.id.clone(),
            stage_group_id,
            bootstrap_stage,
            phase,
            parallel_stage,
            agent_type,
            sandbox,
            depends_on,
            skills,
            context_ref,
            estimated_duration: block.get("estimated_duration").and_then(parse_duration),
            task_status: task.status,
        })
    }

    /// Extract the annotation, logging and returning `None` on any problem.
    pub fn extract_tolerant(task: &TaskRecord) -> Option<Self> {
        match Self::extract(task) {
            Ok(annotation) => Some(annotation),
            Err(MetadataError::MissingAnnotation { .. }) => {
                tracing::debug!(task_id = %task.id, "Task has no orchestration block");
                None
            }
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "Skipping task with invalid orchestration metadata");
                None
            }
        }
    }
}

/// Parse an estimated duration into whole seconds.
///
/// Numbers are seconds. Strings take an optional unit (`s`, `m`, `h` and
/// their long forms), case-insensitive. Anything else is unknown.
pub fn parse_duration(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| whole_seconds(n.as_f64()?)),
        Value::String(s) => {
            let caps = DURATION_PATTERN.captures(s.trim())?;
            let amount: f64 = caps.get(1)?.as_str().parse().ok()?;
            let unit = caps
                .get(2)
                .map(|m| m.as_str().to_lowercase())
                .unwrap_or_default();
            let factor = if unit.starts_with('h') {
                3600.0
            } else if unit.starts_with('m') {
                60.0
            } else {
                1.0
            };
            whole_seconds(amount * factor)
        }
        _ => None,
    }
}

/// Truncate to whole seconds; negative, non-finite or out-of-range is unknown.
fn whole_seconds(secs: f64) -> Option<u64> {
    let secs = secs.trunc();
    (secs.is_finite() && secs >= 0.0 && secs < u64::MAX as f64).then_some(secs as u64)
}

fn invalid(task: &TaskRecord, field: &'static str, message: impl Into<String>) -> MetadataError {
    MetadataError::InvalidField {
        task_id: task.id.clone(),
        field,
        message: message.into(),
    }
}

fn required_positive(
    task: &TaskRecord,
    block: &Map<String, Value>,
    keys: &[&str],
    field: &'static str,
) -> Result<u32, MetadataError> {
    let value = keys
        .iter()
        .find_map(|k| block.get(*k).filter(|v| !v.is_null()))
        .ok_or_else(|| MetadataError::MissingField {
            task_id: task.id.clone(),
            field,
        })?;
    positive(task, value, field)
}

/// Integer coercion: ints, floats (truncated) and digit strings; never booleans.
fn positive(task: &TaskRecord, value: &Value, field: &'static str) -> Result<u32, MetadataError> {
    let number = match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
        Value::String(s) => {
            let s = s.trim();
            if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) {
                s.parse::<i64>().ok()
            } else {
                None
            }
        }
        _ => None,
    }
    .ok_or_else(|| invalid(task, field, "must be an integer"))?;

    u32::try_from(number)
        .ok()
        .filter(|n| *n >= 1)
        .ok_or_else(|| invalid(task, field, format!("must be >= 1, got {number}")))
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn text_or(value: Option<&Value>, default: &str) -> String {
    value
        .and_then(scalar_text)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn string_list(
    task: &TaskRecord,
    value: Option<&Value>,
    field: &'static str,
) -> Result<Vec<String>, MetadataError> {
    let items = match value {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(items)) => items,
        Some(_) => return Err(invalid(task, field, "must be a list of strings")),
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) if s.trim().is_empty() => None,
            Value::String(s) => Some(Ok(s.trim().to_string())),
            _ => Some(Err(invalid(task, field, "entries must be strings"))),
        })
        .collect()
}
