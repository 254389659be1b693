use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use crate::error::Failure;
use crate::task::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// The action ran and succeeded.
    Executed,
    /// The persisted fingerprint matched, the action was skipped.
    UpToDate,
    /// The action, or one of the dependencies, failed.
    Failed,
}

/// Outcome of evaluating one task.
#[derive(Debug, Clone)]
pub struct TaskResult {
    id: TaskId,
    status: Status,
    started: SystemTime,
    finished: SystemTime,
    cause: Option<Failure>,
}

impl TaskResult {
    pub(crate) fn executed(id: TaskId, started: SystemTime) -> Self {
        Self::finish(id, Status::Executed, started, None)
    }

    pub(crate) fn up_to_date(id: TaskId, started: SystemTime) -> Self {
        Self::finish(id, Status::UpToDate, started, None)
    }

    pub(crate) fn failed(id: TaskId, started: SystemTime, cause: Failure) -> Self {
        Self::finish(id, Status::Failed, started, Some(cause))
    }

    fn finish(id: TaskId, status: Status, started: SystemTime, cause: Option<Failure>) -> Self {
        Self {
            id,
            status,
            started,
            finished: SystemTime::now(),
            cause,
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn is_failed(&self) -> bool {
        self.status == Status::Failed
    }

    pub fn started(&self) -> SystemTime {
        self.started
    }

    pub fn finished(&self) -> SystemTime {
        self.finished
    }

    pub fn duration(&self) -> Duration {
        self.finished
            .duration_since(self.started)
            .unwrap_or_default()
    }

    /// Present exactly when the task failed.
    pub fn cause(&self) -> Option<&Failure> {
        self.cause.as_ref()
    }
}

/// Results of one [`Tasks::run`](crate::Tasks::run), keyed by task id.
///
/// Covers the requested task and every dependency visited on the way, in the
/// order they finished. Tasks owned by other scopes are not included.
#[derive(Debug, Clone, Default)]
pub struct TaskRun {
    results: HashMap<TaskId, TaskResult>,
    order: Vec<TaskId>,
}

impl TaskRun {
    pub(crate) fn insert(&mut self, result: TaskResult) {
        let id = result.id.clone();
        if self.results.insert(id.clone(), result).is_none() {
            self.order.push(id);
        }
    }

    pub fn get(&self, id: &str) -> Option<&TaskResult> {
        self.results.get(id)
    }

    pub fn status(&self, id: &str) -> Option<Status> {
        self.get(id).map(TaskResult::status)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.results.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskResult> {
        self.order.iter().filter_map(|id| self.results.get(id))
    }

    pub fn failed(&self) -> impl Iterator<Item = &TaskResult> {
        self.iter().filter(|result| result.is_failed())
    }

    pub fn is_success(&self) -> bool {
        self.failed().next().is_none()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
