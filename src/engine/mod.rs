//! The task registry and the graph walk which evaluates it.

mod graph;
mod index;
mod listener;
mod result;

#[cfg(test)]
mod tests;

use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{Level, debug, info, warn};

use crate::cancel::CancellationToken;
use crate::config::Config;
use crate::error::{EngineError, Failure, StoreError};
use crate::fingerprint::{snapshot_all, snapshots_match};
use crate::registry::ScopeResolver;
use crate::scheduler::{JobError, Outcome, Pending, Priority, Scheduler};
use crate::scope::Scope;
use crate::state::{FileStore, StateStore, TaskState};
use crate::task::{
    ConfigureContext, Defined, Task, TaskBuilder, TaskContext, TaskDefinition, TaskId, TaskOutput,
    TaskRef,
};
use crate::utils::{lock, panic_message, read, write};
use crate::vfs::{FileEvents, FileHandle, LocalFile, Subscription};

use self::index::PathIndex;
pub use self::graph::TaskGraph;
pub use self::listener::{ProgressListener, TaskListener};
pub use self::result::{Status, TaskResult, TaskRun};

/// The incremental task engine of one [`Scope`].
///
/// Holds the registered tasks, the reverse path index used for invalidation,
/// and the persisted fingerprints of previous executions.
pub struct Tasks {
    scope: Arc<Scope>,
    config: Config,
    store: Mutex<Box<dyn StateStore>>,
    registry: RwLock<HashMap<TaskId, Arc<Task>>>,
    index: Arc<PathIndex>,
    listeners: RwLock<Vec<Arc<dyn TaskListener>>>,
    scheduler: Option<Arc<Scheduler>>,
    resolver: Option<Arc<dyn ScopeResolver>>,
    subscription: Mutex<Option<Subscription>>,
}

/// State of one synchronous walk.
struct Walk<'a> {
    run: TaskRun,
    visiting: HashSet<TaskId>,
    token: &'a CancellationToken,
}

impl Tasks {
    pub fn new(scope: Arc<Scope>, store: impl StateStore + 'static) -> Self {
        Self {
            scope,
            config: Config::default(),
            store: Mutex::new(Box::new(store)),
            registry: RwLock::new(HashMap::new()),
            index: Arc::new(PathIndex::default()),
            listeners: RwLock::new(Vec::new()),
            scheduler: None,
            resolver: None,
            subscription: Mutex::new(None),
        }
    }

    /// Opens the file-backed state store in the cache directory of `scope`.
    pub fn open(scope: Arc<Scope>, config: Config) -> Result<Self, EngineError> {
        let store = FileStore::open(scope.cache_dir().join(&config.state_file))?;
        Ok(Self::new(scope, store).with_config(config))
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Lets [`Tasks::run_async`] go through the lanes of `scheduler`.
    pub fn with_scheduler(mut self, scheduler: Arc<Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Enables dependencies on tasks owned by other scopes.
    pub fn with_resolver(mut self, resolver: Arc<dyn ScopeResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn scope(&self) -> &Arc<Scope> {
        &self.scope
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Starts declaring the task `id`.
    pub fn task(&self, id: &str) -> TaskBuilder<'_> {
        TaskBuilder::new(self, id, self.config.fingerprint)
    }

    /// Declares a task described by a [`TaskDefinition`].
    pub fn define<D: TaskDefinition>(&self, definition: D) -> Result<Arc<Task>, EngineError> {
        let builder = self.task(definition.id());
        let builder = definition.configure(builder, &ConfigureContext { tasks: self })?;
        builder.register_action(Arc::new(Defined(definition)))
    }

    pub fn get_task(&self, id: &str) -> Option<Arc<Task>> {
        read(&self.registry).get(id.trim()).cloned()
    }

    /// Every registered task, in no particular order.
    pub fn tasks(&self) -> Vec<Arc<Task>> {
        read(&self.registry).values().cloned().collect()
    }

    pub(crate) fn replace(&self, task: Task) -> Arc<Task> {
        let task = Arc::new(task);
        let mut registry = write(&self.registry);

        if let Some(previous) = registry.insert(task.id().clone(), task.clone()) {
            debug!(task = %task.id(), "replacing task");
            self.index.remove(&previous);
        }
        self.index.add(&task);

        task
    }

    /// Forgets the task `id`. Its persisted state is kept.
    pub fn unregister(&self, id: &str) -> Option<Arc<Task>> {
        let mut registry = write(&self.registry);
        let task = registry.remove(id.trim())?;
        self.index.remove(&task);
        Some(task)
    }

    pub fn graph(&self) -> TaskGraph {
        TaskGraph::build(self.scope.id(), self.tasks())
    }

    /// Resolves `path` against the scope root.
    ///
    /// Backslashes count as separators, `.` and `..` segments are applied,
    /// absolute paths and URIs are taken as they are.
    pub fn resolve_path(&self, path: &str) -> Result<Utf8PathBuf, EngineError> {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return Err(EngineError::InvalidPath(path.to_string()));
        }

        let mut normal = trimmed.replace('\\', "/");
        while let Some(rest) = normal.strip_prefix("./") {
            normal = rest.to_string();
        }

        if normal.starts_with('/') || normal.contains("://") || Utf8Path::new(&normal).is_absolute()
        {
            return Ok(Utf8PathBuf::from(normal));
        }

        let mut current = self.scope.root().to_path_buf();
        for segment in normal.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    current.pop();
                }
                segment => current.push(segment),
            }
        }

        Ok(current)
    }

    pub fn file(&self, path: &str) -> Result<FileHandle, EngineError> {
        Ok(LocalFile::handle(self.resolve_path(path)?))
    }

    pub fn files<'p>(
        &self,
        paths: impl IntoIterator<Item = &'p str>,
    ) -> Result<Vec<FileHandle>, EngineError> {
        paths.into_iter().map(|path| self.file(path)).collect()
    }

    /// Output `index` of task `id`, which may be owned by another scope.
    pub fn output(&self, scope: &str, id: &str, index: usize) -> Result<TaskOutput, EngineError> {
        let scope = scope.trim();

        let task = if scope == self.scope.id() {
            self.get_task(id)
        } else {
            let resolver = self
                .resolver
                .as_ref()
                .ok_or_else(|| EngineError::UnknownScope(scope.to_string()))?;
            let owner = resolver
                .resolve(scope)
                .ok_or_else(|| EngineError::UnknownScope(scope.to_string()))?;
            owner.get_task(id)
        };

        let task = task.ok_or_else(|| EngineError::UnknownTask(Arc::from(id.trim())))?;
        task.output(index)
            .cloned()
            .ok_or_else(|| EngineError::OutputIndex {
                task: task.id().clone(),
                count: task.outputs().len(),
                index,
            })
    }

    /// Registers `listener`, adding the same instance twice has no effect.
    pub fn add_listener(&self, listener: Arc<dyn TaskListener>) {
        let mut listeners = write(&self.listeners);
        if !listeners.iter().any(|other| same_listener(other, &listener)) {
            listeners.push(listener);
        }
    }

    pub fn remove_listener(&self, listener: &Arc<dyn TaskListener>) {
        write(&self.listeners).retain(|other| !same_listener(other, listener));
    }

    /// Marks tasks dirty whenever `events` reports a change to one of their
    /// declared paths. Replaces any earlier subscription.
    pub fn listen(&self, events: &Arc<FileEvents>) {
        let index = self.index.clone();
        let subscription = events.subscribe(move |event| {
            for path in event.paths() {
                let marked = index.mark_dirty(path.as_str());
                if marked > 0 {
                    debug!(path = %path, marked, "invalidated tasks");
                }
            }
        });

        *lock(&self.subscription) = Some(subscription);
    }

    /// Invalidates the tasks declaring `path` as if a change had been observed.
    pub fn invalidate(&self, path: &str) -> usize {
        self.index.mark_dirty(path)
    }

    pub fn is_dirty(&self, id: &str) -> bool {
        self.index.is_dirty(id)
    }

    /// Ids of the tasks declaring exactly `path`.
    pub fn owners_of(&self, path: &str) -> Vec<TaskId> {
        self.index.owners(path)
    }

    /// Stops listening for file changes.
    pub fn dispose(&self) {
        if lock(&self.subscription).take().is_some() {
            debug!(scope = %self.scope.id(), "stopped listening for file changes");
        }
    }

    /// Evaluates `task` and, first, everything it depends on.
    ///
    /// Action failures are reported inside the returned [`TaskRun`]. Errors
    /// are reserved for a malformed graph.
    pub fn run(&self, task: &Task) -> Result<TaskRun, EngineError> {
        self.run_with(task, &CancellationToken::none())
    }

    pub fn run_id(&self, id: &str) -> Result<TaskRun, EngineError> {
        let task = self
            .get_task(id)
            .ok_or_else(|| EngineError::UnknownTask(Arc::from(id.trim())))?;
        self.run(&task)
    }

    /// Like [`Tasks::run`], stopping before the next task once `token` is
    /// cancelled.
    pub fn run_with(&self, task: &Task, token: &CancellationToken) -> Result<TaskRun, EngineError> {
        let span = tracing::span!(Level::INFO, "run", scope = %self.scope.id(), task = %task.id());
        let _enter = span.enter();

        let mut walk = Walk {
            run: TaskRun::default(),
            visiting: HashSet::new(),
            token,
        };

        self.visit(task.id(), &mut walk)?;
        Ok(walk.run)
    }

    /// Runs `task` off the calling thread.
    ///
    /// With a scheduler the walk is submitted to the configured lane keyed by
    /// task id, so a newer request for the same task supersedes an older one.
    /// Without one it runs on the rayon pool.
    pub fn run_async(self: &Arc<Self>, task: Arc<Task>) -> Pending<TaskRun> {
        let this = self.clone();

        if let Some(scheduler) = &self.scheduler {
            return scheduler.submit_latest(
                &self.config.lane,
                task.id().to_string(),
                Priority::Background,
                move |ctx| {
                    this.run_with(&task, ctx.token()).map_err(|err| match err {
                        EngineError::Cancelled => JobError::Cancelled,
                        err => JobError::Failed(err.into()),
                    })
                },
            );
        }

        if !self.scope.is_open() {
            return Pending::ready(Outcome::Closed);
        }

        let (sender, pending) = Pending::channel();
        rayon::spawn(move || {
            let outcome = match this.run(&task) {
                Ok(run) => Outcome::Completed(run),
                Err(err) => Outcome::Failed(err.into()),
            };
            let _ = sender.send(outcome);
        });

        pending
    }

    fn visit(&self, id: &TaskId, walk: &mut Walk<'_>) -> Result<(), EngineError> {
        if walk.run.contains(id) {
            return Ok(());
        }

        let task = self
            .get_task(id)
            .ok_or_else(|| EngineError::UnknownTask(id.clone()))?;

        if !walk.visiting.insert(id.clone()) {
            return Err(EngineError::Cycle(id.clone()));
        }

        if walk.token.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let result = self.evaluate(&task, walk)?;
        walk.visiting.remove(id);
        walk.run.insert(result);

        Ok(())
    }

    fn evaluate(&self, task: &Arc<Task>, walk: &mut Walk<'_>) -> Result<TaskResult, EngineError> {
        let mut failed = None;

        for dependency in task.dependencies() {
            let status = if dependency.scope() == self.scope.id() {
                self.visit(dependency.id(), walk)?;
                walk.run.status(dependency.id())
            } else {
                Some(self.run_external(dependency, walk.token)?.status())
            };

            if status == Some(Status::Failed) && failed.is_none() {
                failed = Some(dependency.id().clone());
            }
        }

        self.notify(|listener| listener.on_started(task));
        let started = SystemTime::now();

        let result = if let Some(dependency) = failed {
            debug!(task = %task.id(), %dependency, "skipping, dependency failed");
            TaskResult::failed(task.id().clone(), started, Failure::Dependency(dependency))
        } else if let Some(reason) = self.stale_reason(task) {
            debug!(task = %task.id(), reason, "task is stale");
            self.execute(task, started, walk.token)
        } else {
            debug!(task = %task.id(), "task is up-to-date");
            self.index.clear_dirty(task.id());
            TaskResult::up_to_date(task.id().clone(), started)
        };

        self.notify(|listener| listener.on_finished(task, &result));
        Ok(result)
    }

    /// Delegates to the engine owning `dependency`. Its results stay in that
    /// engine's run, only the dependency's own result comes back. Cancellation
    /// of that run aborts this one too.
    fn run_external(
        &self,
        dependency: &TaskRef,
        token: &CancellationToken,
    ) -> Result<TaskResult, EngineError> {
        let started = SystemTime::now();
        let unreported = || {
            TaskResult::failed(
                dependency.id().clone(),
                started,
                Failure::Unreported(dependency.id().clone()),
            )
        };

        let Some((owner, task)) = self
            .resolver
            .as_ref()
            .and_then(|resolver| resolver.resolve_task(dependency.scope(), dependency.id()))
        else {
            warn!(%dependency, "couldn't resolve external dependency");
            return Ok(unreported());
        };

        match owner.run_with(&task, token) {
            Ok(run) => Ok(run.get(dependency.id()).cloned().unwrap_or_else(unreported)),
            Err(EngineError::Cancelled) => Err(EngineError::Cancelled),
            Err(err) => {
                warn!(%dependency, "external dependency aborted: {err}");
                Ok(TaskResult::failed(dependency.id().clone(), started, Failure::action(err)))
            }
        }
    }

    /// Why `task` has to execute, `None` when it is up-to-date.
    fn stale_reason(&self, task: &Task) -> Option<&'static str> {
        if !task.is_cacheable() {
            return Some("not cacheable");
        }

        if self.index.is_dirty(task.id()) {
            return Some("dirty");
        }

        let stored = match lock(&self.store).get(task.id()) {
            Ok(Some(stored)) => stored,
            Ok(None) => return Some("never executed"),
            Err(err) => {
                warn!(task = %task.id(), "couldn't read task state: {err}");
                return Some("unreadable state");
            }
        };

        let state = match TaskState::decode(&stored) {
            Ok(state) => state,
            Err(err) => {
                debug!(task = %task.id(), "discarding task state: {err}");
                return Some("unreadable state");
            }
        };

        if !state.options_match(task.options()) {
            return Some("options changed");
        }

        let inputs = snapshot_all(task.fingerprint(), task.input_refs());
        if !snapshots_match(&state.inputs, &inputs) {
            return Some("inputs changed");
        }

        let outputs = snapshot_all(task.fingerprint(), task.output_refs());
        if !outputs.iter().all(|entry| entry.exists) {
            return Some("outputs missing");
        }

        if !snapshots_match(&state.outputs, &outputs) {
            return Some("outputs changed");
        }

        None
    }

    fn execute(&self, task: &Arc<Task>, started: SystemTime, token: &CancellationToken) -> TaskResult {
        let ctx = TaskContext {
            scope: self.scope.clone(),
            task: task.clone(),
            token: token.clone(),
        };

        info!(task = %task.id(), "executing");
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| task.action.execute(&ctx)));

        let failure = match outcome {
            Ok(Ok(())) => match self.persist(task) {
                Ok(()) => {
                    self.index.clear_dirty(task.id());
                    return TaskResult::executed(task.id().clone(), started);
                }
                Err(err) => {
                    warn!(task = %task.id(), "couldn't persist task state: {err}");
                    Failure::Persist(Arc::new(err))
                }
            },
            Ok(Err(err)) => {
                warn!(task = %task.id(), "task failed: {err}");
                Failure::action(err)
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(task = %task.id(), "task {message}");
                Failure::action(anyhow::anyhow!(message))
            }
        };

        TaskResult::failed(task.id().clone(), started, failure)
    }

    fn persist(&self, task: &Task) -> Result<(), StoreError> {
        if !task.is_cacheable() {
            return Ok(());
        }

        let inputs = snapshot_all(task.fingerprint(), task.input_refs());
        let outputs = snapshot_all(task.fingerprint(), task.output_refs());
        let bytes = TaskState::new(task.options(), inputs, outputs)
            .encode()
            .map_err(|err| StoreError::Encode(err.to_string()))?;

        let mut store = lock(&self.store);
        store.put(task.id(), bytes)?;
        store.commit()
    }

    fn notify(&self, f: impl Fn(&dyn TaskListener)) {
        let listeners = read(&self.listeners).clone();

        for listener in &listeners {
            if panic::catch_unwind(AssertUnwindSafe(|| f(listener.as_ref()))).is_err() {
                debug!("ignoring panicking task listener");
            }
        }
    }
}

impl std::fmt::Debug for Tasks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tasks")
            .field("scope", &self.scope.id())
            .field("tasks", &read(&self.registry).len())
            .finish_non_exhaustive()
    }
}

fn same_listener(a: &Arc<dyn TaskListener>, b: &Arc<dyn TaskListener>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
