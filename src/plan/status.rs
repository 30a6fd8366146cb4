//! Group status evaluation from session entries.
//!
//! The derived status is independent of the status persisted on the group:
//! it is recomputed from the session index each time. Only the latest entry
//! (by `created_at`) for each member task counts.

use conductor_common::{ExecutionGroup, ExecutionPlan, GroupStatus, SessionIndex};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::errors::CoordinatorError;

/// Normalized state of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Classify a free-form session status. Unrecognized values count as running.
pub fn classify_session_status(raw: &str) -> SessionState {
    match raw.trim().to_lowercase().as_str() {
        "completed" | "complete" | "done" | "success" | "succeeded" => SessionState::Completed,
        "failed" | "error" | "halted" => SessionState::Failed,
        "running" | "in_progress" | "in progress" | "active" => SessionState::Running,
        "pending" | "queued" | "waiting" | "new" | "scheduled" => SessionState::Pending,
        _ => SessionState::Running,
    }
}

/// Aggregated status of a group with the reasoning behind it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupStatusSummary {
    pub group_id: String,
    pub status: GroupStatus,
    pub reason: String,
    pub pending_tasks: Vec<String>,
    pub running_tasks: Vec<String>,
    pub completed_tasks: Vec<String>,
    pub failed_tasks: Vec<String>,
    /// Tasks or groups holding this group back
    pub blocking: Vec<String>,
    pub depends_on: Vec<String>,
}

impl GroupStatusSummary {
    fn new(group: &ExecutionGroup, status: GroupStatus, reason: String) -> Self {
        Self {
            group_id: group.group_id().to_string(),
            status,
            reason,
            pending_tasks: Vec::new(),
            running_tasks: Vec::new(),
            completed_tasks: Vec::new(),
            failed_tasks: Vec::new(),
            blocking: Vec::new(),
            depends_on: group.depends_on().to_vec(),
        }
    }
}

/// Latest state of each member task, keyed by task id.
fn member_states(group: &ExecutionGroup, index: &SessionIndex) -> BTreeMap<String, SessionState> {
    let mut states: BTreeMap<String, SessionState> = group
        .task_ids()
        .iter()
        .map(|t| (t.clone(), SessionState::Pending))
        .collect();
    for entry in index.entries_for_group(group.group_id()) {
        if let Some(state) = states.get_mut(&entry.task_id) {
            *state = classify_session_status(&entry.status);
        }
    }
    states
}

/// Evaluate the status of `group_id` within `plan`.
pub fn get_group_status(
    group_id: &str,
    index: &SessionIndex,
    plan: &ExecutionPlan,
) -> Result<GroupStatusSummary, CoordinatorError> {
    let group_id = group_id.trim();
    if group_id.is_empty() {
        return Err(CoordinatorError::InvalidArgument(
            "group_id is required".to_string(),
        ));
    }
    let group = plan
        .group(group_id)
        .ok_or_else(|| CoordinatorError::UnknownGroup(group_id.to_string()))?;

    let mut unmet = Vec::new();
    let mut blocking = Vec::new();
    for dep_id in group.depends_on() {
        let Some(dep) = plan.group(dep_id) else {
            unmet.push(dep_id.clone());
            blocking.push(dep_id.clone());
            continue;
        };
        if dep.task_ids().is_empty() {
            if dep.status != GroupStatus::Completed {
                unmet.push(dep_id.clone());
                blocking.push(dep_id.clone());
            }
            continue;
        }
        let outstanding: Vec<String> = member_states(dep, index)
            .into_iter()
            .filter(|(_, state)| *state != SessionState::Completed)
            .map(|(task_id, _)| task_id)
            .collect();
        if !outstanding.is_empty() {
            unmet.push(dep_id.clone());
            blocking.extend(outstanding);
        }
    }

    if !unmet.is_empty() {
        unmet.sort();
        let mut summary = GroupStatusSummary::new(
            group,
            GroupStatus::Blocked,
            format!("waiting on dependency group(s): {}", unmet.join(", ")),
        );
        summary.blocking = blocking;
        return Ok(summary);
    }

    let states = member_states(group, index);
    let of = |wanted: SessionState| -> Vec<String> {
        states
            .iter()
            .filter(|(_, s)| **s == wanted)
            .map(|(t, _)| t.clone())
            .collect()
    };
    let pending = of(SessionState::Pending);
    let running = of(SessionState::Running);
    let completed = of(SessionState::Completed);
    let failed = of(SessionState::Failed);
    let total = group.task_ids().len();
    let has_sessions = !index.entries_for_group(group.group_id()).is_empty();

    let (status, reason) = if !failed.is_empty() {
        (GroupStatus::Failed, format!("{} task(s) failed", failed.len()))
    } else if total == 0 {
        if group.status == GroupStatus::Running {
            (GroupStatus::Running, "0 task(s) scheduled".to_string())
        } else {
            (GroupStatus::Pending, "no tasks scheduled".to_string())
        }
    } else if completed.len() == total {
        (GroupStatus::Completed, format!("all {total} task(s) completed"))
    } else if !running.is_empty() || !completed.is_empty() {
        let active = running.len() + completed.len();
        (
            GroupStatus::Running,
            format!("{active} of {total} task(s) in progress"),
        )
    } else if group.status == GroupStatus::Running && !has_sessions {
        (GroupStatus::Running, format!("{total} task(s) scheduled"))
    } else {
        (GroupStatus::Pending, "no sessions started".to_string())
    };

    let mut summary = GroupStatusSummary::new(group, status, reason);
    summary.pending_tasks = pending;
    summary.running_tasks = running;
    summary.completed_tasks = completed;
    summary.failed_tasks = failed;
    Ok(summary)
}
