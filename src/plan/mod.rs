//! Wave planning and group status evaluation.
//!
//! ## Architecture
//!
//! 1. **Builder** - Turns a task snapshot into the next ready wave of groups
//! 2. **Status** - Derives a group's status from the session index
//!
//! ## Example
//!
//! ```no_run
//! use conductor::plan::build_next_plan;
//! use conductor::tasks::{FrontmatterTaskSource, TaskSource};
//! use std::collections::BTreeSet;
//!
//! # fn example() -> anyhow::Result<()> {
//! let snapshot = FrontmatterTaskSource::new("backlog/tasks").load_snapshot()?;
//! let completed: BTreeSet<String> = ["s1-group-1".to_string()].into();
//!
//! let outcome = build_next_plan(None, &completed, 1, &snapshot)?;
//! for blocked in &outcome.blocked {
//!     println!("{} not ready: {:?}", blocked.group_id, blocked.reason);
//! }
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod status;

pub use builder::{BlockReason, BlockedGroup, PlanOutcome, build_next_plan};
pub use status::{GroupStatusSummary, SessionState, classify_session_status, get_group_status};

/// Short stable digest of a plan for log correlation.
pub fn plan_digest(plan: &conductor_common::ExecutionPlan) -> String {
    use sha2::{Digest, Sha256};

    let bytes = serde_json::to_vec(plan).unwrap_or_default();
    let hash = Sha256::digest(&bytes);
    format!("{:x}", hash)[..12].to_string()
}
