//! Execution plan types.
//!
//! An [`ExecutionPlan`] is the current wave of work: an ordered list of
//! [`ExecutionGroup`]s whose ids are unique. Groups are validated on
//! construction and on deserialization, so a plan loaded from disk upholds the
//! same invariants as one built in memory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::error::ModelError;

/// Persisted status of an execution group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    /// Queued but not yet started
    #[default]
    Pending,
    /// At least one member session is underway
    Running,
    /// Every member finished successfully
    Completed,
    /// Waiting on an unmet dependency
    Blocked,
    /// A member failed
    Failed,
}

impl GroupStatus {
    /// Check if the status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Blocked => "blocked",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A set of tasks scheduled together within one wave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ExecutionGroupBuilder")]
pub struct ExecutionGroup {
    group_id: String,
    task_ids: Vec<String>,
    parallel: bool,
    pub agent_type: String,
    pub sandbox: String,
    bootstrap_stage: u32,
    phase: u32,
    stage: u32,
    depends_on: Vec<String>,
    /// Sum of member estimates in seconds, if any member reported one
    pub estimated_duration: Option<u64>,
    /// Task id to context package reference
    pub context_refs: BTreeMap<String, String>,
    pub status: GroupStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionGroup {
    /// Start building a group with the given id and members.
    pub fn builder<I, S>(group_id: impl Into<String>, task_ids: I) -> ExecutionGroupBuilder
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ExecutionGroupBuilder {
            group_id: group_id.into(),
            task_ids: task_ids.into_iter().map(Into::into).collect(),
            ..ExecutionGroupBuilder::default()
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Member task ids, duplicate-free, in insertion order.
    pub fn task_ids(&self) -> &[String] {
        &self.task_ids
    }

    /// True when the group has more than one member.
    pub fn is_parallel(&self) -> bool {
        self.parallel
    }

    pub fn bootstrap_stage(&self) -> u32 {
        self.bootstrap_stage
    }

    pub fn phase(&self) -> u32 {
        self.phase
    }

    /// Parallel stage within the bootstrap stage.
    pub fn stage(&self) -> u32 {
        self.stage
    }

    /// Other groups this one waits on. Never contains the group's own id.
    pub fn depends_on(&self) -> &[String] {
        &self.depends_on
    }

    /// Check whether `task_id` is a member of this group.
    pub fn contains_task(&self, task_id: &str) -> bool {
        self.task_ids.iter().any(|t| t == task_id)
    }
}

/// Unvalidated group fields. Also the wire shape accepted on deserialization.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionGroupBuilder {
    group_id: String,
    #[serde(default)]
    task_ids: Vec<String>,
    #[serde(default = "default_agent_type")]
    agent_type: String,
    #[serde(default = "default_sandbox")]
    sandbox: String,
    #[serde(default = "default_stage")]
    bootstrap_stage: u32,
    #[serde(default = "default_stage")]
    phase: u32,
    #[serde(default = "default_stage")]
    stage: u32,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    estimated_duration: Option<u64>,
    #[serde(default)]
    context_refs: BTreeMap<String, String>,
    #[serde(default)]
    status: GroupStatus,
    #[serde(default)]
    started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    completed_at: Option<DateTime<Utc>>,
}

fn default_agent_type() -> String {
    "default".to_string()
}

fn default_sandbox() -> String {
    "read-only".to_string()
}

fn default_stage() -> u32 {
    1
}

impl Default for ExecutionGroupBuilder {
    fn default() -> Self {
        Self {
            group_id: String::new(),
            task_ids: Vec::new(),
            agent_type: default_agent_type(),
            sandbox: default_sandbox(),
            bootstrap_stage: default_stage(),
            phase: default_stage(),
            stage: default_stage(),
            depends_on: Vec::new(),
            estimated_duration: None,
            context_refs: BTreeMap::new(),
            status: GroupStatus::default(),
            started_at: None,
            completed_at: None,
        }
    }
}

impl ExecutionGroupBuilder {
    pub fn agent_type(mut self, agent_type: impl Into<String>) -> Self {
        self.agent_type = agent_type.into();
        self
    }

    pub fn sandbox(mut self, sandbox: impl Into<String>) -> Self {
        self.sandbox = sandbox.into();
        self
    }

    pub fn bootstrap_stage(mut self, bootstrap_stage: u32) -> Self {
        self.bootstrap_stage = bootstrap_stage;
        self
    }

    pub fn phase(mut self, phase: u32) -> Self {
        self.phase = phase;
        self
    }

    pub fn stage(mut self, stage: u32) -> Self {
        self.stage = stage;
        self
    }

    pub fn depends_on<I, S>(mut self, depends_on: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = depends_on.into_iter().map(Into::into).collect();
        self
    }

    pub fn estimated_duration(mut self, seconds: Option<u64>) -> Self {
        self.estimated_duration = seconds;
        self
    }

    pub fn context_refs(mut self, context_refs: BTreeMap<String, String>) -> Self {
        self.context_refs = context_refs;
        self
    }

    pub fn status(mut self, status: GroupStatus) -> Self {
        self.status = status;
        self
    }

    /// Validate and produce the group.
    ///
    /// Dependencies are trimmed; blank, duplicate or self-referencing entries
    /// are rejected. Member ids keep their first-seen order with repeats
    /// dropped.
    pub fn build(self) -> Result<ExecutionGroup, ModelError> {
        let group_id = self.group_id.trim().to_string();
        if group_id.is_empty() {
            return Err(ModelError::BlankGroupId);
        }

        for (field, value) in [
            ("bootstrap_stage", self.bootstrap_stage),
            ("phase", self.phase),
            ("stage", self.stage),
        ] {
            if value < 1 {
                return Err(ModelError::NonPositive {
                    group_id,
                    field,
                    value,
                });
            }
        }

        let mut seen = HashSet::new();
        let mut depends_on = Vec::with_capacity(self.depends_on.len());
        for dep in &self.depends_on {
            let dep = dep.trim();
            if dep.is_empty() {
                return Err(ModelError::BlankDependency { group_id });
            }
            if dep == group_id {
                return Err(ModelError::SelfDependency { group_id });
            }
            if !seen.insert(dep) {
                return Err(ModelError::DuplicateDependency {
                    group_id,
                    dependency: dep.to_string(),
                });
            }
            depends_on.push(dep.to_string());
        }

        let mut members = HashSet::new();
        let task_ids: Vec<String> = self
            .task_ids
            .into_iter()
            .filter(|t| members.insert(t.clone()))
            .collect();

        Ok(ExecutionGroup {
            parallel: task_ids.len() > 1,
            group_id,
            task_ids,
            agent_type: self.agent_type,
            sandbox: self.sandbox,
            bootstrap_stage: self.bootstrap_stage,
            phase: self.phase,
            stage: self.stage,
            depends_on,
            estimated_duration: self.estimated_duration,
            context_refs: self.context_refs,
            status: self.status,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

impl TryFrom<ExecutionGroupBuilder> for ExecutionGroup {
    type Error = ModelError;

    fn try_from(builder: ExecutionGroupBuilder) -> Result<Self, Self::Error> {
        builder.build()
    }
}

/// An ordered list of groups with unique ids.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PlanRecord")]
pub struct ExecutionPlan {
    groups: Vec<ExecutionGroup>,
}

#[derive(Deserialize)]
struct PlanRecord {
    #[serde(default)]
    groups: Vec<ExecutionGroup>,
}

impl TryFrom<PlanRecord> for ExecutionPlan {
    type Error = ModelError;

    fn try_from(record: PlanRecord) -> Result<Self, Self::Error> {
        ExecutionPlan::new(record.groups)
    }
}

impl ExecutionPlan {
    /// Create a plan, rejecting duplicate group ids.
    pub fn new(groups: Vec<ExecutionGroup>) -> Result<Self, ModelError> {
        let mut seen = HashSet::new();
        for group in &groups {
            if !seen.insert(group.group_id.as_str()) {
                return Err(ModelError::DuplicateGroup(group.group_id.clone()));
            }
        }
        Ok(Self { groups })
    }

    pub fn groups(&self) -> &[ExecutionGroup] {
        &self.groups
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Look up a group by id.
    pub fn group(&self, group_id: &str) -> Option<&ExecutionGroup> {
        self.groups.iter().find(|g| g.group_id == group_id)
    }

    /// Mutable lookup. Identity, membership and dependencies stay read-only.
    pub fn group_mut(&mut self, group_id: &str) -> Option<&mut ExecutionGroup> {
        self.groups.iter_mut().find(|g| g.group_id == group_id)
    }

    /// Find the group a task belongs to.
    pub fn group_for_task(&self, task_id: &str) -> Option<&ExecutionGroup> {
        self.groups.iter().find(|g| g.contains_task(task_id))
    }

    pub fn group_ids(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(|g| g.group_id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn group(id: &str) -> ExecutionGroup {
        ExecutionGroup::builder(id, ["t1"]).build().unwrap()
    }

    #[test]
    fn test_builder_defaults() {
        let g = ExecutionGroup::builder("g1", ["a", "b"]).build().unwrap();
        assert!(g.parallel);
        assert_eq!(g.agent_type, "default");
        assert_eq!(g.sandbox, "read-only");
        assert_eq!((g.bootstrap_stage, g.phase, g.stage), (1, 1, 1));
        assert_eq!(g.status, GroupStatus::Pending);
        assert!(g.depends_on.is_empty());
    }

    #[test]
    fn test_single_member_is_not_parallel() {
        assert!(!group("g1").parallel);
    }

    #[test]
    fn test_duplicate_members_collapse() {
        let g = ExecutionGroup::builder("g1", ["a", "b", "a"]).build().unwrap();
        assert_eq!(g.task_ids, vec!["a", "b"]);
    }

    #[test]
    fn test_self_dependency_rejected() {
        let err = ExecutionGroup::builder("g1", ["a"])
            .depends_on(["g1"])
            .build()
            .unwrap_err();
        assert!(matches!(err, ModelError::SelfDependency { .. }));
    }

    #[test]
    fn test_duplicate_dependency_rejected() {
        let err = ExecutionGroup::builder("g2", ["a"])
            .depends_on(["g1", " g1 "])
            .build()
            .unwrap_err();
        match err {
            ModelError::DuplicateDependency { dependency, .. } => assert_eq!(dependency, "g1"),
            other => panic!("Expected DuplicateDependency, got {other:?}"),
        }
    }

    #[test]
    fn test_blank_dependency_rejected() {
        let err = ExecutionGroup::builder("g2", ["a"])
            .depends_on(["  "])
            .build()
            .unwrap_err();
        assert!(matches!(err, ModelError::BlankDependency { .. }));
    }

    #[test]
    fn test_zero_stage_rejected() {
        let err = ExecutionGroup::builder("g1", ["a"]).stage(0).build().unwrap_err();
        assert!(matches!(
            err,
            ModelError::NonPositive { field: "stage", .. }
        ));
        let err = ExecutionGroup::builder("g1", ["a"]).phase(0).build().unwrap_err();
        assert!(matches!(
            err,
            ModelError::NonPositive { field: "phase", .. }
        ));
    }

    #[test]
    fn test_plan_rejects_duplicate_group_ids() {
        let err = ExecutionPlan::new(vec![group("g1"), group("g1")]).unwrap_err();
        assert_eq!(err, ModelError::DuplicateGroup("g1".to_string()));
    }

    #[test]
    fn test_plan_lookup() {
        let plan = ExecutionPlan::new(vec![group("g1"), group("g2")]).unwrap();
        assert_eq!(plan.len(), 2);
        assert!(plan.group("g2").is_some());
        assert!(plan.group("g3").is_none());
        assert_eq!(plan.group_for_task("t1").unwrap().group_id, "g1");
    }

    #[test]
    fn test_group_mut_only_touches_progress() {
        let g2 = ExecutionGroup::builder("g2", ["t2"]).depends_on(["g1"]).build().unwrap();
        let mut plan = ExecutionPlan::new(vec![group("g1"), g2]).unwrap();
        let now = Utc::now();

        let g = plan.group_mut("g2").unwrap();
        g.status = GroupStatus::Completed;
        g.started_at = Some(now);
        g.completed_at = Some(now);

        let g = plan.group("g2").unwrap();
        assert_eq!(g.group_id(), "g2");
        assert_eq!(g.task_ids(), ["t2"]);
        assert_eq!(g.depends_on(), ["g1"]);
        assert!(g.status.is_terminal());
        assert_eq!(g.completed_at, Some(now));
        assert_eq!(plan.group_ids().collect::<Vec<_>>(), vec!["g1", "g2"]);
    }

    #[test]
    fn test_deserialize_applies_defaults() {
        let plan: ExecutionPlan = serde_json::from_value(json!({
            "groups": [{"group_id": "g1", "task_ids": ["a", "b"], "parallel": false}]
        }))
        .unwrap();
        let g = &plan.groups()[0];
        assert!(g.parallel);
        assert_eq!(g.sandbox, "read-only");
        assert_eq!(g.status, GroupStatus::Pending);
    }

    #[test]
    fn test_deserialize_validates_groups() {
        let result: Result<ExecutionPlan, _> = serde_json::from_value(json!({
            "groups": [{"group_id": "g1", "task_ids": [], "depends_on": ["g1"]}]
        }));
        assert!(result.is_err());

        let result: Result<ExecutionPlan, _> = serde_json::from_value(json!({
            "groups": [
                {"group_id": "g1", "task_ids": []},
                {"group_id": "g1", "task_ids": []}
            ]
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_serialized_shape() {
        let g = ExecutionGroup::builder("g2", ["a"])
            .depends_on(["g1"])
            .status(GroupStatus::Running)
            .build()
            .unwrap();
        let value = serde_json::to_value(&g).unwrap();
        assert_eq!(value["status"], "running");
        assert_eq!(value["depends_on"], json!(["g1"]));
        assert_eq!(value["estimated_duration"], serde_json::Value::Null);
        assert_eq!(value["parallel"], false);
    }

    #[test]
    fn test_status_terminal() {
        assert!(GroupStatus::Completed.is_terminal());
        assert!(GroupStatus::Failed.is_terminal());
        assert!(!GroupStatus::Blocked.is_terminal());
        assert_eq!(GroupStatus::Blocked.to_string(), "blocked");
    }
}
