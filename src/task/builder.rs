use std::sync::Arc;

use crate::Tasks;
use crate::error::EngineError;
use crate::fingerprint::FingerprintMode;
use crate::scope::Scope;
use crate::vfs::FileHandle;

use super::{OptionsBuilder, Task, TaskAction, TaskContext, TaskOutput, TaskRef};

/// Fluent declaration of a task, finished by [`TaskBuilder::register`].
#[must_use = "a task is only declared once `register` is called"]
pub struct TaskBuilder<'a> {
    tasks: &'a Tasks,
    id: String,
    cacheable: bool,
    fingerprint: FingerprintMode,
    inputs: Vec<FileHandle>,
    input_trees: Vec<FileHandle>,
    output_inputs: Vec<TaskOutput>,
    outputs: Vec<FileHandle>,
    output_trees: Vec<FileHandle>,
    dependencies: Vec<TaskRef>,
    options: OptionsBuilder,
}

impl<'a> TaskBuilder<'a> {
    pub(crate) fn new(tasks: &'a Tasks, id: &str, fingerprint: FingerprintMode) -> Self {
        Self {
            tasks,
            id: id.trim().to_string(),
            cacheable: true,
            fingerprint,
            inputs: Vec::new(),
            input_trees: Vec::new(),
            output_inputs: Vec::new(),
            outputs: Vec::new(),
            output_trees: Vec::new(),
            dependencies: Vec::new(),
            options: OptionsBuilder::default(),
        }
    }

    pub fn fingerprint(mut self, mode: FingerprintMode) -> Self {
        self.fingerprint = mode;
        self
    }

    /// Runs `task` before this one. It may belong to another scope.
    pub fn depends_on(mut self, task: &Task) -> Self {
        self.add_dependency(task.task_ref());
        self
    }

    pub fn input(mut self, file: FileHandle) -> Self {
        self.inputs.push(file);
        self
    }

    pub fn inputs(mut self, files: impl IntoIterator<Item = FileHandle>) -> Self {
        self.inputs.extend(files);
        self
    }

    /// Fingerprints `root` together with all of its descendants.
    pub fn input_tree(mut self, root: FileHandle) -> Self {
        self.input_trees.push(root);
        self
    }

    /// Consumes the output of another task, which also becomes a dependency.
    pub fn input_from(mut self, output: &TaskOutput) -> Self {
        self.add_dependency(output.producer.clone());
        self.output_inputs.push(output.clone());
        self
    }

    pub fn output(mut self, file: FileHandle) -> Self {
        self.outputs.push(file);
        self
    }

    pub fn outputs(mut self, files: impl IntoIterator<Item = FileHandle>) -> Self {
        self.outputs.extend(files);
        self
    }

    pub fn output_tree(mut self, root: FileHandle) -> Self {
        self.output_trees.push(root);
        self
    }

    pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.put(key, value);
        self
    }

    /// Same as [`TaskBuilder::option`].
    pub fn param(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.option(key, value)
    }

    pub fn options(mut self, configure: impl FnOnce(&mut OptionsBuilder)) -> Self {
        configure(&mut self.options);
        self
    }

    /// Non-cacheable tasks execute on every run.
    pub fn cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    /// Finalizes the task, replacing any task registered under the same id.
    pub fn register<F>(self, action: F) -> Result<Arc<Task>, EngineError>
    where
        F: Fn(&TaskContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register_action(Arc::new(action))
    }

    pub(crate) fn register_action(
        self,
        action: Arc<dyn TaskAction>,
    ) -> Result<Arc<Task>, EngineError> {
        if self.id.is_empty() {
            return Err(EngineError::InvalidTaskId(self.id));
        }

        let scope: Arc<str> = Arc::from(self.tasks.scope().id());
        let id: Arc<str> = Arc::from(self.id);
        let producer = TaskRef::new(scope.clone(), id.clone());

        let outputs = self
            .outputs
            .into_iter()
            .map(|file| TaskOutput {
                producer: producer.clone(),
                file,
            })
            .collect();

        let task = Task {
            scope,
            id,
            cacheable: self.cacheable,
            inputs: self.inputs,
            input_trees: self.input_trees,
            output_inputs: self.output_inputs,
            outputs,
            output_trees: self.output_trees,
            dependencies: self.dependencies,
            options: self.options.build(),
            fingerprint: self.fingerprint,
            action,
        };

        Ok(self.tasks.replace(task))
    }

    fn add_dependency(&mut self, dependency: TaskRef) {
        if !self.dependencies.contains(&dependency) {
            self.dependencies.push(dependency);
        }
    }
}

/// A task declared as a type rather than through closures.
///
/// ```ignore
/// struct Compile;
///
/// impl TaskDefinition for Compile {
///     fn id(&self) -> &str {
///         "compile"
///     }
///
///     fn configure<'a>(
///         &self,
///         builder: TaskBuilder<'a>,
///         ctx: &ConfigureContext<'_>,
///     ) -> Result<TaskBuilder<'a>, EngineError> {
///         Ok(builder
///             .input_tree(ctx.file("src")?)
///             .output_tree(ctx.file("build/classes")?))
///     }
///
///     fn execute(&self, ctx: &TaskContext) -> anyhow::Result<()> {
///         Ok(())
///     }
/// }
/// ```
pub trait TaskDefinition: Send + Sync + 'static {
    fn id(&self) -> &str;

    fn configure<'a>(
        &self,
        builder: TaskBuilder<'a>,
        ctx: &ConfigureContext<'_>,
    ) -> Result<TaskBuilder<'a>, EngineError> {
        let _ = ctx;
        Ok(builder)
    }

    fn execute(&self, ctx: &TaskContext) -> anyhow::Result<()>;
}

pub(crate) struct Defined<D>(pub(crate) D);

impl<D: TaskDefinition> TaskAction for Defined<D> {
    fn execute(&self, ctx: &TaskContext) -> anyhow::Result<()> {
        self.0.execute(ctx)
    }
}

/// Lookups available while a [`TaskDefinition`] configures itself.
pub struct ConfigureContext<'a> {
    pub(crate) tasks: &'a Tasks,
}

impl ConfigureContext<'_> {
    pub fn scope(&self) -> &Arc<Scope> {
        self.tasks.scope()
    }

    pub fn task(&self, id: &str) -> Option<Arc<Task>> {
        self.tasks.get_task(id)
    }

    pub fn require_task(&self, id: &str) -> Result<Arc<Task>, EngineError> {
        self.task(id)
            .ok_or_else(|| EngineError::UnknownTask(Arc::from(id)))
    }

    pub fn require_output(&self, id: &str, index: usize) -> Result<TaskOutput, EngineError> {
        let task = self.require_task(id)?;
        task.output(index)
            .cloned()
            .ok_or_else(|| EngineError::OutputIndex {
                task: task.id.clone(),
                count: task.outputs.len(),
                index,
            })
    }

    pub fn file(&self, path: &str) -> Result<FileHandle, EngineError> {
        self.tasks.file(path)
    }

    pub fn files<'p>(
        &self,
        paths: impl IntoIterator<Item = &'p str>,
    ) -> Result<Vec<FileHandle>, EngineError> {
        self.tasks.files(paths)
    }

    /// Output `index` of a task owned by any registered scope.
    pub fn output(&self, scope: &str, id: &str, index: usize) -> Result<TaskOutput, EngineError> {
        self.tasks.output(scope, id, index)
    }
}
