//! Next-wave planning.
//!
//! Tasks are bucketed into groups by `stage_group_id`. A group is ready when
//! every dependency token resolves to a completed group. Only ready groups at
//! the lowest parallel stage are emitted, so one wave never mixes stages.

use conductor_common::{ExecutionGroup, ExecutionPlan, GroupStatus, ModelError};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::tasks::{OrchestrationAnnotation, TaskSnapshot, TaskStatus};

/// Why a group was held back from the next wave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockReason {
    /// Tokens that name neither a known task nor a known group
    UnresolvedTokens { tokens: Vec<String> },
    /// A dependency resolves back to the group itself
    SelfDependency { tokens: Vec<String> },
    /// Resolved dependency groups that are not completed yet
    WaitingOn { groups: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockedGroup {
    pub group_id: String,
    pub reason: BlockReason,
}

/// Result of a planning round.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PlanOutcome {
    /// The next wave, or `None` when nothing is ready
    pub plan: Option<ExecutionPlan>,
    /// True when the current plan was returned unchanged
    pub reused: bool,
    /// Groups in the target stage that are not ready, in id order
    pub blocked: Vec<BlockedGroup>,
    /// Resolved dependency groups of each emitted group
    pub dependencies: BTreeMap<String, Vec<String>>,
}

impl PlanOutcome {
    /// No plan and nothing blocked: the stage has no remaining work.
    pub fn is_exhausted(&self) -> bool {
        self.plan.is_none() && self.blocked.is_empty()
    }
}

struct Bucket<'a> {
    bootstrap_stage: u32,
    phase: u32,
    stage: u32,
    agent_type: String,
    sandbox: String,
    members: Vec<&'a OrchestrationAnnotation>,
    tokens: BTreeSet<String>,
}

enum Admission {
    Ready(Vec<String>),
    Blocked(BlockReason),
}

/// Compute the next wave of groups for `target_stage`.
///
/// The current plan is reused unchanged while it still holds an uncompleted
/// group for the target stage. Otherwise the plan is rebuilt from
/// `snapshot`; tasks with missing or malformed annotations are skipped.
pub fn build_next_plan(
    current: Option<&ExecutionPlan>,
    completed: &BTreeSet<String>,
    target_stage: u32,
    snapshot: &TaskSnapshot,
) -> Result<PlanOutcome, ModelError> {
    let completed: BTreeSet<&str> = completed.iter().map(|g| g.trim()).collect();

    if let Some(plan) = current {
        let in_flight = plan
            .groups()
            .iter()
            .any(|g| g.bootstrap_stage() == target_stage && !completed.contains(g.group_id()));
        if in_flight {
            tracing::debug!(target_stage, "Reusing current plan");
            return Ok(PlanOutcome {
                plan: Some(plan.clone()),
                reused: true,
                ..PlanOutcome::default()
            });
        }
    }

    let annotations: Vec<OrchestrationAnnotation> = snapshot
        .iter()
        .filter_map(OrchestrationAnnotation::extract_tolerant)
        .collect();
    if annotations.is_empty() {
        return Ok(PlanOutcome::default());
    }

    let group_of_task: HashMap<&str, &str> = annotations
        .iter()
        .map(|a| (a.task_id.as_str(), a.stage_group_id.as_str()))
        .collect();

    let mut buckets: BTreeMap<&str, Bucket<'_>> = BTreeMap::new();
    for annotation in &annotations {
        let bucket = buckets
            .entry(annotation.stage_group_id.as_str())
            .or_insert_with(|| Bucket {
                bootstrap_stage: annotation.bootstrap_stage,
                phase: annotation.phase,
                stage: annotation.parallel_stage,
                agent_type: annotation.agent_type.clone(),
                sandbox: annotation.sandbox.clone(),
                members: Vec::new(),
                tokens: BTreeSet::new(),
            });
        bucket.members.push(annotation);
        bucket.tokens.extend(annotation.depends_on.iter().cloned());
    }

    let mut ready: Vec<(&str, &Bucket<'_>, Vec<String>)> = Vec::new();
    let mut blocked = Vec::new();
    for (&group_id, bucket) in &buckets {
        if bucket.bootstrap_stage != target_stage || completed.contains(group_id) {
            continue;
        }
        if bucket.members.iter().all(|m| m.task_status.is_done()) {
            continue;
        }

        match admit(group_id, bucket, &group_of_task, &buckets, &completed) {
            Admission::Ready(deps) => ready.push((group_id, bucket, deps)),
            Admission::Blocked(reason) => {
                tracing::debug!(group_id, ?reason, "Group not ready");
                blocked.push(BlockedGroup {
                    group_id: group_id.to_string(),
                    reason,
                });
            }
        }
    }

    let Some(min_stage) = ready.iter().map(|(_, b, _)| b.stage).min() else {
        tracing::debug!(target_stage, blocked = blocked.len(), "No ready groups");
        return Ok(PlanOutcome {
            blocked,
            ..PlanOutcome::default()
        });
    };
    ready.retain(|(_, b, _)| b.stage == min_stage);
    ready.sort_by(|(a_id, a, _), (b_id, b, _)| (a.stage, a_id).cmp(&(b.stage, b_id)));

    let mut groups = Vec::with_capacity(ready.len());
    let mut dependencies = BTreeMap::new();
    for (group_id, bucket, deps) in ready {
        groups.push(to_group(group_id, bucket)?);
        dependencies.insert(group_id.to_string(), deps);
    }
    let plan = ExecutionPlan::new(groups)?;

    tracing::info!(
        target_stage,
        stage = min_stage,
        groups = ?plan.group_ids().collect::<Vec<_>>(),
        "Built next wave"
    );
    Ok(PlanOutcome {
        plan: Some(plan),
        reused: false,
        blocked,
        dependencies,
    })
}

fn admit(
    group_id: &str,
    bucket: &Bucket<'_>,
    group_of_task: &HashMap<&str, &str>,
    buckets: &BTreeMap<&str, Bucket<'_>>,
    completed: &BTreeSet<&str>,
) -> Admission {
    let mut resolved = BTreeSet::new();
    let mut unresolved = Vec::new();
    let mut self_tokens = Vec::new();

    for token in bucket.tokens.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
        let dep = match group_of_task.get(token) {
            Some(dep) => *dep,
            None if buckets.contains_key(token) => token,
            None => {
                unresolved.push(token.to_string());
                continue;
            }
        };
        if dep == group_id {
            self_tokens.push(token.to_string());
        } else {
            resolved.insert(dep.to_string());
        }
    }

    if !unresolved.is_empty() {
        return Admission::Blocked(BlockReason::UnresolvedTokens { tokens: unresolved });
    }
    if !self_tokens.is_empty() {
        return Admission::Blocked(BlockReason::SelfDependency {
            tokens: self_tokens,
        });
    }
    let outstanding: Vec<String> = resolved
        .iter()
        .filter(|dep| !completed.contains(dep.as_str()))
        .cloned()
        .collect();
    if !outstanding.is_empty() {
        return Admission::Blocked(BlockReason::WaitingOn {
            groups: outstanding,
        });
    }
    Admission::Ready(resolved.into_iter().collect())
}

fn to_group(group_id: &str, bucket: &Bucket<'_>) -> Result<ExecutionGroup, ModelError> {
    let mut members: Vec<&OrchestrationAnnotation> = bucket.members.clone();
    members.sort_by(|a, b| a.task_id.cmp(&b.task_id));

    let status = if members.iter().any(|m| m.task_status != TaskStatus::Pending) {
        GroupStatus::Running
    } else {
        GroupStatus::Pending
    };

    let estimates: Vec<u64> = members.iter().filter_map(|m| m.estimated_duration).collect();
    let estimated_duration = (!estimates.is_empty())
        .then(|| estimates.iter().fold(0u64, |total, secs| total.saturating_add(*secs)));

    let context_refs: BTreeMap<String, String> = members
        .iter()
        .filter_map(|m| m.context_ref.clone().map(|r| (m.task_id.clone(), r)))
        .collect();

    ExecutionGroup::builder(group_id, members.iter().map(|m| m.task_id.clone()))
        .agent_type(bucket.agent_type.clone())
        .sandbox(bucket.sandbox.clone())
        .bootstrap_stage(bucket.bootstrap_stage)
        .phase(bucket.phase)
        .stage(bucket.stage)
        .estimated_duration(estimated_duration)
        .context_refs(context_refs)
        .status(status)
        .build()
}
