//! Shared domain types for conductor.
//!
//! These types describe the coordination document shared between conductor
//! and the session runtime: the execution plan (groups of tasks scheduled as
//! one wave) and the session index (one entry per worker session).

pub mod error;
pub mod plan;
pub mod session;

pub use error::ModelError;
pub use plan::{ExecutionGroup, ExecutionPlan, GroupStatus};
pub use session::{SessionIndex, SessionIndexEntry};
