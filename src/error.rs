use std::sync::Arc;

use thiserror::Error;

use crate::task::TaskId;

/// Errors which abort a whole [`Tasks::run`](crate::Tasks::run).
///
/// Ordinary action failures never show up here, they are recorded as a
/// [`Status::Failed`](crate::Status::Failed) result inside the returned
/// [`TaskRun`](crate::TaskRun).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("Task cycle detected at: {0}")]
    Cycle(TaskId),

    #[error("Invalid task id: {0:?}")]
    InvalidTaskId(String),

    #[error("Task run was cancelled")]
    Cancelled,

    #[error("Invalid path: {0:?}")]
    InvalidPath(String),

    #[error("Task '{task}' has {count} outputs; requested index {index}")]
    OutputIndex {
        task: TaskId,
        count: usize,
        index: usize,
    },

    #[error("Scope not registered: {0}")]
    UnknownScope(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[cfg(feature = "live")]
    #[error("Error while watching for file changes:\n{0}")]
    Watch(#[from] notify::Error),
}

/// The cause attached to a failed [`TaskResult`](crate::TaskResult).
///
/// Cheap to clone, the same failure is shared between the run result and the
/// listeners that observe it.
#[derive(Debug, Error, Clone)]
pub enum Failure {
    /// The task action returned an error or panicked.
    #[error("{0}")]
    Action(Arc<anyhow::Error>),

    /// One of the dependencies failed. The original cause is not nested, see
    /// the dependency's own result for it.
    #[error("Dependency failed: {0}")]
    Dependency(TaskId),

    /// A dependency owned by another scope could not be evaluated.
    #[error("External dependency did not report result: {0}")]
    Unreported(TaskId),

    /// The action succeeded but its fingerprint could not be committed.
    #[error("Couldn't persist task state.\n{0}")]
    Persist(Arc<StoreError>),
}

impl Failure {
    pub(crate) fn action(err: impl Into<anyhow::Error>) -> Self {
        Self::Action(Arc::new(err.into()))
    }
}

/// Errors raised by a [`StateStore`](crate::StateStore).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Couldn't access the state store.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Couldn't encode the state store: {0}")]
    Encode(String),

    #[error("Couldn't decode the state store: {0}")]
    Decode(String),
}

/// Errors raised while encoding or decoding one persisted task record.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Record is truncated")]
    Truncated,

    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u32),

    #[error("Couldn't decode record: {0}")]
    Decode(String),

    #[error("Couldn't encode record: {0}")]
    Encode(String),
}
