//! Coordination entrypoint.
//!
//! [`handle_completion`] is invoked once per finished worker session. It
//! records the session, updates the owning group, asks the planner for the
//! next wave and persists the result, all under the state lock. The returned
//! [`CompletionOutcome`] tells the caller what to run next.

use chrono::{DateTime, Utc};
use conductor_common::{ExecutionPlan, GroupStatus, SessionIndex, SessionIndexEntry};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::config::Config;
use crate::errors::CoordinatorError;
use crate::plan::{BlockedGroup, GroupStatusSummary, PlanOutcome, build_next_plan, get_group_status};
use crate::state::{StateLock, StateSource, StateStore};
use crate::tasks::{OrchestrationAnnotation, TaskSnapshot, TaskSource};

/// Exit statuses that count as success.
const SUCCESS_STATUSES: &[&str] = &["completed", "complete", "success", "succeeded", "ok"];

/// Trim and lowercase an exit status; an empty status means success.
pub fn normalize_exit_status(raw: &str) -> String {
    let normalized = raw.trim().to_lowercase();
    if normalized.is_empty() {
        "completed".to_string()
    } else {
        normalized
    }
}

pub fn is_success_status(status: &str) -> bool {
    SUCCESS_STATUSES.contains(&normalize_exit_status(status).as_str())
}

/// A worker session finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionSignal {
    pub session_id: String,
    pub task_id: String,
    pub group_id: String,
    pub subagent_type: String,
    pub exit_status: String,
}

/// What the caller should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContinuationSignal {
    NextGroup(String),
    Complete,
    Halt,
}

impl std::fmt::Display for ContinuationSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContinuationSignal::NextGroup(id) => write!(f, "execute_plan:group-{id}"),
            ContinuationSignal::Complete => write!(f, "execute_plan:complete"),
            ContinuationSignal::Halt => write!(f, "execute_plan:halt"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompletionStatus {
    NextGroup,
    Complete,
    Failed,
}

/// Machine-readable result of [`handle_completion`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionOutcome {
    pub status: CompletionStatus,
    pub signal: String,
    pub next_group_id: Option<String>,
    pub session_id: String,
    pub group_id: String,
    pub task_id: String,
    pub exit_status: String,
    pub completed_groups: Vec<String>,
    pub blocked_groups: Vec<BlockedGroup>,
    pub state_path: PathBuf,
    pub execution_plan_path: PathBuf,
    pub session_index_path: PathBuf,
    #[serde(skip)]
    pub plan: ExecutionPlan,
}

impl CompletionOutcome {
    pub fn continuation(&self) -> ContinuationSignal {
        match (&self.status, &self.next_group_id) {
            (CompletionStatus::Failed, _) => ContinuationSignal::Halt,
            (CompletionStatus::NextGroup, Some(id)) => ContinuationSignal::NextGroup(id.clone()),
            _ => ContinuationSignal::Complete,
        }
    }
}

/// Groups whose every member task either reports done or has a successful
/// latest session in that group.
pub fn fully_completed_groups(snapshot: &TaskSnapshot, index: &SessionIndex) -> BTreeSet<String> {
    let mut latest: BTreeMap<(&str, &str), &str> = BTreeMap::new();
    for entry in index.sorted_entries() {
        if let Some(group_id) = entry.group_id.as_deref() {
            latest.insert((group_id, entry.task_id.as_str()), entry.status.as_str());
        }
    }

    let mut members: BTreeMap<String, Vec<(String, bool)>> = BTreeMap::new();
    for annotation in snapshot.iter().filter_map(OrchestrationAnnotation::extract_tolerant) {
        let done = annotation.task_status.is_done();
        members
            .entry(annotation.stage_group_id)
            .or_default()
            .push((annotation.task_id, done));
    }

    members
        .into_iter()
        .filter(|(group_id, tasks)| {
            tasks.iter().all(|(task_id, done)| {
                *done
                    || latest
                        .get(&(group_id.as_str(), task_id.as_str()))
                        .is_some_and(|status| is_success_status(status))
            })
        })
        .map(|(group_id, _)| group_id)
        .collect()
}

fn require(value: &str, name: &str) -> Result<String, CoordinatorError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(CoordinatorError::InvalidArgument(format!("{name} is required")));
    }
    Ok(trimmed.to_string())
}

/// Record a finished session and compute the next wave.
pub fn handle_completion(
    config: &Config,
    tasks: &dyn TaskSource,
    signal: &CompletionSignal,
) -> Result<CompletionOutcome, CoordinatorError> {
    handle_completion_at(config, tasks, signal, Utc::now())
}

/// [`handle_completion`] with an explicit clock.
pub fn handle_completion_at(
    config: &Config,
    tasks: &dyn TaskSource,
    signal: &CompletionSignal,
    now: DateTime<Utc>,
) -> Result<CompletionOutcome, CoordinatorError> {
    let session_id = require(&signal.session_id, "session_id")?;
    let task_id = require(&signal.task_id, "task_id")?;
    let group_id = require(&signal.group_id, "group_id")?;
    let exit_status = normalize_exit_status(&signal.exit_status);
    let success = is_success_status(&exit_status);

    let snapshot = tasks.load_snapshot()?;
    let task = snapshot
        .get(&task_id)
        .ok_or_else(|| CoordinatorError::UnknownTask(task_id.clone()))?;
    let target_stage = OrchestrationAnnotation::extract(task)?.bootstrap_stage;

    let lock = StateLock::new(&config.state_path(), &config.lock)?;
    let mut guard = lock.acquire()?;
    let store = StateStore::new(config);
    let state = store.load()?;
    let mut plan = state.plan;
    let mut index = state.index;

    let mut entry = SessionIndexEntry::new(&session_id, &task_id, now)
        .with_status(&exit_status)
        .with_group(&group_id);
    entry.updated_at = Some(now);
    if !signal.subagent_type.trim().is_empty() {
        entry.subagent_type = Some(signal.subagent_type.trim().to_string());
    }
    index.upsert(entry);

    let completed = fully_completed_groups(&snapshot, &index);

    match plan.group_mut(&group_id) {
        Some(group) => {
            group.status = if !success {
                GroupStatus::Failed
            } else if completed.contains(&group_id) {
                GroupStatus::Completed
            } else {
                GroupStatus::Running
            };
            group.started_at = group.started_at.or(Some(now));
            if group.status.is_terminal() {
                group.completed_at = Some(now);
            }
        }
        None => {
            tracing::warn!(group_id = %group_id, "Completed session's group is not in the current plan");
        }
    }

    let next = build_next_plan(Some(&plan), &completed, target_stage, &snapshot)?;
    let persisted = if success {
        next.plan.clone().unwrap_or_default()
    } else {
        plan
    };

    if let Some(delay) = config.save_delay {
        tracing::debug!(delay_ms = delay.as_millis() as u64, "Pausing before save");
        std::thread::sleep(delay);
    }
    store.save(&guard, &persisted, &index)?;
    guard.release()?;

    let next_group_id = if success {
        persisted
            .groups()
            .iter()
            .find(|g| g.status != GroupStatus::Completed && !completed.contains(g.group_id()))
            .map(|g| g.group_id().to_string())
    } else {
        None
    };
    let status = match (&next_group_id, success) {
        (_, false) => CompletionStatus::Failed,
        (Some(_), true) => CompletionStatus::NextGroup,
        (None, true) => CompletionStatus::Complete,
    };
    if success && next_group_id.is_none() && !next.blocked.is_empty() {
        let blocked: Vec<&str> = next.blocked.iter().map(|b| b.group_id.as_str()).collect();
        tracing::warn!(?blocked, "No ready groups remain but some are blocked");
    }

    let mut outcome = CompletionOutcome {
        status,
        signal: String::new(),
        next_group_id,
        session_id,
        group_id,
        task_id,
        exit_status,
        completed_groups: completed.into_iter().collect(),
        blocked_groups: next.blocked,
        state_path: store.state_path().to_path_buf(),
        execution_plan_path: store.plan_mirror().to_path_buf(),
        session_index_path: store.index_mirror().to_path_buf(),
        plan: persisted,
    };
    outcome.signal = outcome.continuation().to_string();
    tracing::info!(
        session_id = %outcome.session_id,
        group_id = %outcome.group_id,
        signal = %outcome.signal,
        "Recorded session completion"
    );
    Ok(outcome)
}

/// Preview the next wave for `target_stage` without taking the lock or writing.
pub fn preview_next_plan(
    config: &Config,
    tasks: &dyn TaskSource,
    target_stage: u32,
) -> Result<PlanOutcome, CoordinatorError> {
    if target_stage < 1 {
        return Err(CoordinatorError::InvalidArgument(
            "bootstrap stage must be >= 1".to_string(),
        ));
    }
    let snapshot = tasks.load_snapshot()?;
    let state = StateStore::new(config).load()?;
    let completed = fully_completed_groups(&snapshot, &state.index);
    let current = (!state.plan.is_empty()).then_some(&state.plan);
    Ok(build_next_plan(current, &completed, target_stage, &snapshot)?)
}

/// Evaluate one group of the persisted plan. Reads without the lock.
pub fn evaluate_group(config: &Config, group_id: &str) -> Result<GroupStatusSummary, CoordinatorError> {
    let state = StateStore::new(config).load()?;
    get_group_status(group_id, &state.index, &state.plan)
}

/// Write empty plan and index artifacts.
///
/// Refuses to overwrite existing coordination state unless `force` is set.
/// Keys of the unified document owned by other processes are kept.
pub fn initialize_state(config: &Config, force: bool) -> Result<Vec<PathBuf>, CoordinatorError> {
    let lock = StateLock::new(&config.state_path(), &config.lock)?;
    let mut guard = lock.acquire()?;
    let store = StateStore::new(config);

    if !force {
        let state = store.load()?;
        if state.plan_source != StateSource::Empty || state.index_source != StateSource::Empty {
            return Err(CoordinatorError::InvalidArgument(format!(
                "coordination state already exists in {} (use --force to reset)",
                config.state_dir.display()
            )));
        }
    }

    let report = store.save(&guard, &ExecutionPlan::default(), &SessionIndex::default())?;
    guard.release()?;

    let mut written = vec![store.state_path().to_path_buf()];
    written.extend(report.mirrors_written);
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::BlockReason;
    use crate::tasks::{TaskRecord, TaskStatus};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    fn make_config() -> (Config, TempDir) {
        let dir = tempdir().unwrap();
        let config = Config::for_dirs(dir.path().join("state"), dir.path().join("tasks"));
        (config, dir)
    }

    fn task(id: &str, status: TaskStatus, group: &str, parallel: u32, deps: &[&str]) -> TaskRecord {
        let mut metadata = serde_json::Map::new();
        metadata.insert(
            "orchestration".to_string(),
            json!({
                "bootstrap_stage": 1,
                "parallel_group": parallel,
                "stage_group_id": group,
                "depends_on": deps,
            }),
        );
        TaskRecord::new(id, status, metadata)
    }

    fn signal(session: &str, task: &str, group: &str, exit: &str) -> CompletionSignal {
        CompletionSignal {
            session_id: session.to_string(),
            task_id: task.to_string(),
            group_id: group.to_string(),
            subagent_type: "implementer".to_string(),
            exit_status: exit.to_string(),
        }
    }

    fn seed_plan(config: &Config, snapshot: &TaskSnapshot) {
        let outcome = preview_next_plan(config, snapshot, 1).unwrap();
        let lock = StateLock::new(&config.state_path(), &config.lock).unwrap();
        let guard = lock.acquire().unwrap();
        StateStore::new(config)
            .save(&guard, &outcome.plan.unwrap(), &SessionIndex::default())
            .unwrap();
    }

    #[test]
    fn test_normalize_exit_status() {
        assert_eq!(normalize_exit_status("  OK "), "ok");
        assert_eq!(normalize_exit_status(""), "completed");
        assert!(is_success_status("Succeeded"));
        assert!(!is_success_status("failed"));
        assert!(!is_success_status("done"));
    }

    #[test]
    fn test_signal_strings() {
        assert_eq!(
            ContinuationSignal::NextGroup("g2".into()).to_string(),
            "execute_plan:group-g2"
        );
        assert_eq!(ContinuationSignal::Complete.to_string(), "execute_plan:complete");
        assert_eq!(ContinuationSignal::Halt.to_string(), "execute_plan:halt");
    }

    #[test]
    fn test_completion_advances_to_next_wave() {
        let (config, _dir) = make_config();
        let snapshot = TaskSnapshot::new([
            task("T1", TaskStatus::InProgress, "g1", 1, &[]),
            task("T2", TaskStatus::Pending, "g2", 1, &["g1"]),
        ]);
        seed_plan(&config, &snapshot);

        let outcome = handle_completion(&config, &snapshot, &signal("s1", "T1", "g1", "completed")).unwrap();
        assert_eq!(outcome.status, CompletionStatus::NextGroup);
        assert_eq!(outcome.signal, "execute_plan:group-g2");
        assert_eq!(outcome.completed_groups, vec!["g1"]);

        let state = StateStore::new(&config).load().unwrap();
        assert_eq!(state.plan.group_ids().collect::<Vec<_>>(), vec!["g2"]);
        let entry = state.index.get("s1").unwrap();
        assert_eq!(entry.status, "completed");
        assert_eq!(entry.group_id.as_deref(), Some("g1"));
        assert_eq!(entry.subagent_type.as_deref(), Some("implementer"));
    }

    #[test]
    fn test_partial_group_keeps_current_plan() {
        let (config, _dir) = make_config();
        let snapshot = TaskSnapshot::new([
            task("T1", TaskStatus::InProgress, "g1", 1, &[]),
            task("T2", TaskStatus::InProgress, "g1", 1, &[]),
        ]);
        seed_plan(&config, &snapshot);

        let outcome = handle_completion(&config, &snapshot, &signal("s1", "T1", "g1", "")).unwrap();
        assert_eq!(outcome.signal, "execute_plan:group-g1");

        let state = StateStore::new(&config).load().unwrap();
        let g1 = state.plan.group("g1").unwrap();
        assert_eq!(g1.status, GroupStatus::Running);
        assert!(g1.started_at.is_some());
        assert!(g1.completed_at.is_none());

        let outcome = handle_completion(&config, &snapshot, &signal("s2", "T2", "g1", "success")).unwrap();
        assert_eq!(outcome.status, CompletionStatus::Complete);
        assert_eq!(outcome.signal, "execute_plan:complete");
        assert!(StateStore::new(&config).load().unwrap().plan.is_empty());
    }

    #[test]
    fn test_failure_halts_and_keeps_plan() {
        let (config, _dir) = make_config();
        let snapshot = TaskSnapshot::new([task("T1", TaskStatus::InProgress, "g1", 1, &[])]);
        seed_plan(&config, &snapshot);

        let outcome = handle_completion(&config, &snapshot, &signal("s1", "T1", "g1", "FAILED")).unwrap();
        assert_eq!(outcome.status, CompletionStatus::Failed);
        assert_eq!(outcome.signal, "execute_plan:halt");
        assert!(outcome.next_group_id.is_none());

        let state = StateStore::new(&config).load().unwrap();
        let g1 = state.plan.group("g1").unwrap();
        assert_eq!(g1.status, GroupStatus::Failed);
        assert!(g1.completed_at.is_some());
    }

    #[test]
    fn test_repeated_session_updates_in_place() {
        let (config, _dir) = make_config();
        let snapshot = TaskSnapshot::new([
            task("T1", TaskStatus::InProgress, "g1", 1, &[]),
            task("T2", TaskStatus::Pending, "g1", 1, &[]),
        ]);
        seed_plan(&config, &snapshot);

        let first = Utc::now();
        handle_completion_at(&config, &snapshot, &signal("s1", "T1", "g1", "failed"), first).unwrap();
        let later = first + chrono::Duration::seconds(30);
        handle_completion_at(&config, &snapshot, &signal("s1", "T1", "g1", "ok"), later).unwrap();

        let index = StateStore::new(&config).load().unwrap().index;
        assert_eq!(index.entries.len(), 1);
        assert_eq!(index.entries[0].status, "ok");
        assert_eq!(index.entries[0].created_at, first);
        assert_eq!(index.entries[0].updated_at, Some(later));
    }

    #[test]
    fn test_unknown_task_is_rejected_before_locking() {
        let (config, _dir) = make_config();
        let snapshot = TaskSnapshot::new([task("T1", TaskStatus::Pending, "g1", 1, &[])]);
        let err = handle_completion(&config, &snapshot, &signal("s1", "T404", "g1", "ok")).unwrap_err();
        assert!(matches!(err, CoordinatorError::UnknownTask(id) if id == "T404"));
        assert!(!config.state_path().exists());
    }

    #[test]
    fn test_task_without_annotation_is_rejected() {
        let (config, _dir) = make_config();
        let snapshot = TaskSnapshot::new([TaskRecord::new(
            "T1",
            TaskStatus::Pending,
            serde_json::Map::new(),
        )]);
        let err = handle_completion(&config, &snapshot, &signal("s1", "T1", "g1", "ok")).unwrap_err();
        assert!(matches!(err, CoordinatorError::Metadata(_)));
    }

    #[test]
    fn test_blank_arguments_are_rejected() {
        let (config, _dir) = make_config();
        let snapshot = TaskSnapshot::default();
        let err = handle_completion(&config, &snapshot, &signal(" ", "T1", "g1", "ok")).unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidArgument(_)));
    }

    #[test]
    fn test_lock_timeout_aborts_without_writing() {
        let (mut config, _dir) = make_config();
        config.lock.timeout_ms = 50;
        let snapshot = TaskSnapshot::new([task("T1", TaskStatus::Pending, "g1", 1, &[])]);

        let lock = StateLock::new(&config.state_path(), &config.lock).unwrap();
        std::fs::create_dir(lock.lock_dir()).unwrap();
        std::fs::write(
            lock.lock_dir().join("lock_info.json"),
            json!({"pid": std::os::unix::process::parent_id(), "timestamp": Utc::now().timestamp() as f64, "host": "elsewhere"}).to_string(),
        )
        .unwrap();

        let err = handle_completion(&config, &snapshot, &signal("s1", "T1", "g1", "ok")).unwrap_err();
        assert!(matches!(err, CoordinatorError::Lock(_)));
        assert!(!config.state_path().exists());
    }

    #[test]
    fn test_save_delay_is_honored() {
        let (mut config, _dir) = make_config();
        config.save_delay = Some(Duration::from_millis(100));
        let snapshot = TaskSnapshot::new([task("T1", TaskStatus::Pending, "g1", 1, &[])]);
        let started = std::time::Instant::now();
        handle_completion(&config, &snapshot, &signal("s1", "T1", "g1", "ok")).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn test_fully_completed_groups_requires_every_member() {
        let snapshot = TaskSnapshot::new([
            task("T1", TaskStatus::Pending, "g1", 1, &[]),
            task("T2", TaskStatus::Done, "g1", 1, &[]),
            task("T3", TaskStatus::Pending, "g2", 1, &[]),
            task("T4", TaskStatus::Pending, "g2", 1, &[]),
        ]);
        let now = Utc::now();
        let index = SessionIndex::new(vec![
            SessionIndexEntry::new("s1", "T1", now).with_group("g1").with_status("ok"),
            SessionIndexEntry::new("s3", "T3", now).with_group("g2").with_status("completed"),
            SessionIndexEntry::new("s4", "T4", now).with_group("g2").with_status("failed"),
        ]);
        let completed = fully_completed_groups(&snapshot, &index);
        assert_eq!(completed.into_iter().collect::<Vec<_>>(), vec!["g1"]);
    }

    #[test]
    fn test_preview_reports_blocked_groups() {
        let (config, _dir) = make_config();
        let snapshot = TaskSnapshot::new([task("T1", TaskStatus::Pending, "g1", 1, &["missing"])]);
        let outcome = preview_next_plan(&config, &snapshot, 1).unwrap();
        assert!(outcome.plan.is_none());
        assert!(matches!(
            outcome.blocked[0].reason,
            BlockReason::UnresolvedTokens { .. }
        ));
        assert!(!config.state_path().exists());
    }

    #[test]
    fn test_evaluate_group_reads_persisted_state() {
        let (config, _dir) = make_config();
        let snapshot = TaskSnapshot::new([task("T1", TaskStatus::Pending, "g1", 1, &[])]);
        seed_plan(&config, &snapshot);
        let summary = evaluate_group(&config, "g1").unwrap();
        assert_eq!(summary.status, GroupStatus::Pending);
        assert!(matches!(
            evaluate_group(&config, "g9"),
            Err(CoordinatorError::UnknownGroup(_))
        ));
    }

    #[test]
    fn test_initialize_state_refuses_overwrite() {
        let (config, _dir) = make_config();
        let written = initialize_state(&config, false).unwrap();
        assert_eq!(written.len(), 3);
        assert!(config.state_path().exists());

        let snapshot = TaskSnapshot::new([task("T1", TaskStatus::Pending, "g1", 1, &[])]);
        seed_plan(&config, &snapshot);
        assert!(matches!(
            initialize_state(&config, false),
            Err(CoordinatorError::InvalidArgument(_))
        ));
        initialize_state(&config, true).unwrap();
        assert!(StateStore::new(&config).load().unwrap().plan.is_empty());
    }
}
