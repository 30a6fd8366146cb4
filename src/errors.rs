//! Typed error hierarchy for conductor.
//!
//! Four enums cover the subsystems:
//! - `LockError`: acquiring or releasing the shared state lock
//! - `PersistenceError`: reading and writing the coordination document
//! - `MetadataError`: orchestration annotations on task files
//! - `CoordinatorError`: everything surfaced by the top-level operations

use std::path::PathBuf;
use std::time::Duration;

use conductor_common::ModelError;
use thiserror::Error;

/// Errors from the directory-based state lock.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Timed out after {waited:?} waiting for lock {path}")]
    Timeout { path: PathBuf, waited: Duration },

    #[error("Lock {path} is already held by this process")]
    Reentrant { path: PathBuf },

    #[error("Lock I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from loading or saving the coordination document.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed JSON in {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Expected a JSON object in {path}")]
    NotAnObject { path: PathBuf },

    #[error("Invalid {section} in {path}: {source}")]
    InvalidSection {
        path: PathBuf,
        section: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize state: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// Errors from orchestration annotations on a task.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetadataError {
    #[error("Task {task_id} has no orchestration metadata")]
    MissingAnnotation { task_id: String },

    #[error("Task {task_id} is missing orchestration field '{field}'")]
    MissingField { task_id: String, field: &'static str },

    #[error("Task {task_id} has invalid orchestration field '{field}': {message}")]
    InvalidField {
        task_id: String,
        field: &'static str,
        message: String,
    },
}

/// Errors surfaced by coordination operations.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Task {0} not found in task snapshot")]
    UnknownTask(String),

    #[error("Group {0} not found in execution plan")]
    UnknownGroup(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
