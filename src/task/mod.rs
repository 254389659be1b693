mod builder;
mod options;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::cancel::CancellationToken;
use crate::fingerprint::{FingerprintMode, SnapshotMode};
use crate::scope::Scope;
use crate::vfs::FileHandle;

pub(crate) use self::builder::Defined;
pub use self::builder::{ConfigureContext, TaskBuilder, TaskDefinition};
pub use self::options::{Options, OptionsBuilder};

pub type TaskId = Arc<str>;

/// Identifies a task across scopes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskRef {
    scope: Arc<str>,
    id: TaskId,
}

impl TaskRef {
    pub fn new(scope: impl Into<Arc<str>>, id: impl Into<TaskId>) -> Self {
        Self {
            scope: scope.into(),
            id: id.into(),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }
}

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope, self.id)
    }
}

/// A file declared as output of a task.
///
/// Declaring it as input of another task implies a dependency on the producer.
#[derive(Debug, Clone)]
pub struct TaskOutput {
    producer: TaskRef,
    file: FileHandle,
}

impl TaskOutput {
    pub fn producer(&self) -> &TaskRef {
        &self.producer
    }

    pub fn file(&self) -> &FileHandle {
        &self.file
    }
}

/// The work a task performs when it is not up-to-date.
pub trait TaskAction: Send + Sync {
    fn execute(&self, ctx: &TaskContext) -> anyhow::Result<()>;
}

impl<F> TaskAction for F
where
    F: Fn(&TaskContext) -> anyhow::Result<()> + Send + Sync,
{
    fn execute(&self, ctx: &TaskContext) -> anyhow::Result<()> {
        self(ctx)
    }
}

/// Everything an action may look at while it runs.
pub struct TaskContext {
    pub(crate) scope: Arc<Scope>,
    pub(crate) task: Arc<Task>,
    pub(crate) token: CancellationToken,
}

impl TaskContext {
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn options(&self) -> &Options {
        &self.task.options
    }

    /// Cancellation of the surrounding run, long actions should poll it.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// An immutable, registered unit of work.
pub struct Task {
    pub(crate) scope: Arc<str>,
    pub(crate) id: TaskId,
    pub(crate) cacheable: bool,
    pub(crate) inputs: Vec<FileHandle>,
    pub(crate) input_trees: Vec<FileHandle>,
    pub(crate) output_inputs: Vec<TaskOutput>,
    pub(crate) outputs: Vec<TaskOutput>,
    pub(crate) output_trees: Vec<FileHandle>,
    pub(crate) dependencies: Vec<TaskRef>,
    pub(crate) options: Options,
    pub(crate) fingerprint: FingerprintMode,
    pub(crate) action: Arc<dyn TaskAction>,
}

impl Task {
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn scope_id(&self) -> &str {
        &self.scope
    }

    pub fn task_ref(&self) -> TaskRef {
        TaskRef {
            scope: self.scope.clone(),
            id: self.id.clone(),
        }
    }

    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn fingerprint(&self) -> FingerprintMode {
        self.fingerprint
    }

    /// Explicit dependencies followed by the ones implied through consumed
    /// outputs, without duplicates.
    pub fn dependencies(&self) -> &[TaskRef] {
        &self.dependencies
    }

    pub fn outputs(&self) -> &[TaskOutput] {
        &self.outputs
    }

    pub fn output(&self, index: usize) -> Option<&TaskOutput> {
        self.outputs.get(index)
    }

    pub(crate) fn input_refs(&self) -> Vec<(SnapshotMode, &FileHandle)> {
        let direct = self.inputs.iter().map(|file| (SnapshotMode::Single, file));
        let trees = self.input_trees.iter().map(|file| (SnapshotMode::Tree, file));
        let consumed = self
            .output_inputs
            .iter()
            .map(|output| (SnapshotMode::Single, &output.file));

        direct.chain(trees).chain(consumed).collect()
    }

    pub(crate) fn output_refs(&self) -> Vec<(SnapshotMode, &FileHandle)> {
        let direct = self
            .outputs
            .iter()
            .map(|output| (SnapshotMode::Single, &output.file));
        let trees = self.output_trees.iter().map(|file| (SnapshotMode::Tree, file));

        direct.chain(trees).collect()
    }

    /// Every path this task declares, the key set of the dirty index.
    pub fn referenced_paths(&self) -> BTreeSet<String> {
        self.input_refs()
            .into_iter()
            .chain(self.output_refs())
            .map(|(_, file)| file.path().to_string())
            .collect()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("scope", &self.scope)
            .field("id", &self.id)
            .field("cacheable", &self.cacheable)
            .field("fingerprint", &self.fingerprint)
            .field("dependencies", &self.dependencies)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
