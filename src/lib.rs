pub mod config;
pub mod coordinator;
pub mod errors;
pub mod logging;
pub mod memory;
pub mod plan;
pub mod state;
pub mod tasks;

pub use conductor_common::{ExecutionGroup, ExecutionPlan, GroupStatus, SessionIndex, SessionIndexEntry};
