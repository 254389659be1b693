use std::fs;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use camino::{Utf8Path, Utf8PathBuf};
use filetime::FileTime;
use tempfile::TempDir;

use super::*;
use crate::cancel::CancellationSource;
use crate::fingerprint::FingerprintMode;
use crate::registry::ScopeRegistry;
use crate::state::MemoryStore;
use crate::vfs::FileEvent;

struct Project {
    _dir: TempDir,
    root: Utf8PathBuf,
    store: MemoryStore,
    tasks: Tasks,
}

impl Project {
    fn new(id: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let scope = Arc::new(Scope::new(id, root.clone(), root.join(".cache")));
        let store = MemoryStore::new();
        let tasks = Tasks::new(scope, store.clone());

        Self {
            _dir: dir,
            root,
            store,
            tasks,
        }
    }

    fn write(&self, path: &str, content: &str) -> Utf8PathBuf {
        let path = self.root.join(path);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    /// Rewrites `path` with `content` and moves its mtime by `seconds`.
    fn touch(&self, path: &str, content: &str, seconds: i64) {
        let path = self.write(path, content);
        let mtime = FileTime::from_unix_time(1_600_000_000 + seconds, 0);
        filetime::set_file_mtime(&path, mtime).unwrap();
    }
}

fn counting(counter: &Arc<AtomicUsize>) -> impl Fn(&TaskContext) -> anyhow::Result<()> + use<> {
    let counter = counter.clone();
    move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Copies `from` into `to`, counting executions.
fn copying(
    counter: &Arc<AtomicUsize>,
    from: Utf8PathBuf,
    to: Utf8PathBuf,
) -> impl Fn(&TaskContext) -> anyhow::Result<()> + use<> {
    let counter = counter.clone();
    move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        fs::create_dir_all(to.parent().unwrap_or(Utf8Path::new(".")))?;
        fs::copy(&from, &to)?;
        Ok(())
    }
}

fn status(run: &TaskRun, id: &str) -> Status {
    run.status(id).unwrap()
}

#[test]
fn test_idempotence() {
    let project = Project::new("app");
    project.write("src/a.txt", "hello");
    let counter = Arc::new(AtomicUsize::new(0));

    let task = project
        .tasks
        .task("copy")
        .input(project.tasks.file("src/a.txt").unwrap())
        .output(project.tasks.file("out/a.txt").unwrap())
        .register(copying(
            &counter,
            project.root.join("src/a.txt"),
            project.root.join("out/a.txt"),
        ))
        .unwrap();

    let first = project.tasks.run(&task).unwrap();
    assert_eq!(status(&first, "copy"), Status::Executed);

    let second = project.tasks.run(&task).unwrap();
    assert_eq!(status(&second, "copy"), Status::UpToDate);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(project.store.committed_len(), 1);
}

#[test]
fn test_option_change_executes() {
    let project = Project::new("app");
    let counter = Arc::new(AtomicUsize::new(0));

    let register = |target: &str| {
        project
            .tasks
            .task("javac")
            .option("target", target)
            .param("debug", "true")
            .register(counting(&counter))
            .unwrap()
    };

    let task = register("17");
    assert_eq!(status(&project.tasks.run(&task).unwrap(), "javac"), Status::Executed);
    assert_eq!(status(&project.tasks.run(&task).unwrap(), "javac"), Status::UpToDate);

    let task = register("21");
    assert_eq!(status(&project.tasks.run(&task).unwrap(), "javac"), Status::Executed);
    assert_eq!(status(&project.tasks.run(&task).unwrap(), "javac"), Status::UpToDate);
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[test]
fn test_options_reach_the_action() {
    let project = Project::new("app");
    let seen = Arc::new(Mutex::new(None));

    let sink = seen.clone();
    let task = project
        .tasks
        .task("configure")
        .options(|options| {
            options.put_i64("jobs", 4).put_bool("offline", true);
        })
        .register(move |ctx| {
            let options = ctx.options();
            *sink.lock().unwrap() = Some((options.get_i64("jobs", 1), options.get_bool("offline", false)));
            assert_eq!(ctx.scope().id(), "app");
            assert_eq!(&**ctx.task().id(), "configure");
            Ok(())
        })
        .unwrap();

    project.tasks.run(&task).unwrap();
    assert_eq!(*seen.lock().unwrap(), Some((4, true)));
}

#[test]
fn test_input_change_executes() {
    let project = Project::new("app");
    project.write("src/a.txt", "one");
    let counter = Arc::new(AtomicUsize::new(0));

    let task = project
        .tasks
        .task("read")
        .input(project.tasks.file("src/a.txt").unwrap())
        .register(counting(&counter))
        .unwrap();

    project.tasks.run(&task).unwrap();
    project.write("src/a.txt", "three");

    assert_eq!(status(&project.tasks.run(&task).unwrap(), "read"), Status::Executed);
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[test]
fn test_content_hash_ignores_touch() {
    let project = Project::new("app");
    project.touch("src/A.java", "class A {}", 0);

    let task = project
        .tasks
        .task("javac")
        .fingerprint(FingerprintMode::ContentHash)
        .input(project.tasks.file("src/A.java").unwrap())
        .register(|_| Ok(()))
        .unwrap();

    assert_eq!(status(&project.tasks.run(&task).unwrap(), "javac"), Status::Executed);

    project.touch("src/A.java", "class A {}", 10);
    assert_eq!(status(&project.tasks.run(&task).unwrap(), "javac"), Status::UpToDate);

    project.touch("src/A.java", "class B {}", 10);
    assert_eq!(status(&project.tasks.run(&task).unwrap(), "javac"), Status::Executed);
}

#[test]
fn test_metadata_sees_touch() {
    let project = Project::new("app");
    project.touch("src/A.java", "class A {}", 0);

    let task = project
        .tasks
        .task("javac")
        .fingerprint(FingerprintMode::Metadata)
        .input(project.tasks.file("src/A.java").unwrap())
        .register(|_| Ok(()))
        .unwrap();

    assert_eq!(status(&project.tasks.run(&task).unwrap(), "javac"), Status::Executed);

    project.touch("src/A.java", "class A {}", 10);
    assert_eq!(status(&project.tasks.run(&task).unwrap(), "javac"), Status::Executed);
}

#[test]
fn test_missing_output_executes() {
    let project = Project::new("app");
    project.write("src/a.txt", "hello");
    let counter = Arc::new(AtomicUsize::new(0));

    let task = project
        .tasks
        .task("copy")
        .input(project.tasks.file("src/a.txt").unwrap())
        .output(project.tasks.file("out/a.txt").unwrap())
        .register(copying(
            &counter,
            project.root.join("src/a.txt"),
            project.root.join("out/a.txt"),
        ))
        .unwrap();

    project.tasks.run(&task).unwrap();
    fs::remove_file(project.root.join("out/a.txt")).unwrap();

    assert_eq!(status(&project.tasks.run(&task).unwrap(), "copy"), Status::Executed);
    assert!(project.root.join("out/a.txt").exists());
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[test]
fn test_changed_output_executes() {
    let project = Project::new("app");
    project.write("src/a.txt", "hello");
    let counter = Arc::new(AtomicUsize::new(0));

    let task = project
        .tasks
        .task("copy")
        .input(project.tasks.file("src/a.txt").unwrap())
        .output(project.tasks.file("out/a.txt").unwrap())
        .register(copying(
            &counter,
            project.root.join("src/a.txt"),
            project.root.join("out/a.txt"),
        ))
        .unwrap();

    assert_eq!(status(&project.tasks.run(&task).unwrap(), "copy"), Status::Executed);

    project.write("out/a.txt", "edited by hand");
    assert_eq!(status(&project.tasks.run(&task).unwrap(), "copy"), Status::Executed);
    assert_eq!(fs::read_to_string(project.root.join("out/a.txt")).unwrap(), "hello");

    assert_eq!(status(&project.tasks.run(&task).unwrap(), "copy"), Status::UpToDate);
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[test]
fn test_changed_output_content_executes() {
    let project = Project::new("app");
    project.touch("src/a.txt", "hello", 0);
    let counter = Arc::new(AtomicUsize::new(0));

    let task = project
        .tasks
        .task("copy")
        .fingerprint(FingerprintMode::ContentHash)
        .input(project.tasks.file("src/a.txt").unwrap())
        .output(project.tasks.file("out/a.txt").unwrap())
        .register(copying(
            &counter,
            project.root.join("src/a.txt"),
            project.root.join("out/a.txt"),
        ))
        .unwrap();

    project.tasks.run(&task).unwrap();

    // Same length, different bytes.
    project.touch("out/a.txt", "HELLO", 20);
    assert_eq!(status(&project.tasks.run(&task).unwrap(), "copy"), Status::Executed);
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[test]
fn test_cycle_is_an_error() {
    let project = Project::new("app");

    let a = project.tasks.task("a").register(|_| Ok(())).unwrap();
    let b = project.tasks.task("b").depends_on(&a).register(|_| Ok(())).unwrap();
    let a = project.tasks.task("a").depends_on(&b).register(|_| Ok(())).unwrap();

    match project.tasks.run(&a) {
        Err(EngineError::Cycle(id)) => assert_eq!(&*id, "a"),
        other => panic!("expected a cycle, got {other:?}"),
    }
}

#[test]
fn test_unknown_tasks() {
    let project = Project::new("app");
    assert!(matches!(project.tasks.run_id("nope"), Err(EngineError::UnknownTask(_))));

    let ghost = project.tasks.task("ghost").register(|_| Ok(())).unwrap();
    let user = project.tasks.task("user").depends_on(&ghost).register(|_| Ok(())).unwrap();
    project.tasks.unregister("ghost");

    assert!(matches!(project.tasks.run(&user), Err(EngineError::UnknownTask(id)) if &*id == "ghost"));
    assert!(matches!(project.tasks.task("  ").register(|_| Ok(())), Err(EngineError::InvalidTaskId(_))));
}

#[test]
fn test_dirty_propagation() {
    let project = Project::new("app");
    let events = FileEvents::new();
    project.tasks.listen(&events);

    let input = project.write("src/A.txt", "same");
    let counter = Arc::new(AtomicUsize::new(0));

    let task = project
        .tasks
        .task("t")
        .input(project.tasks.file("src/A.txt").unwrap())
        .register(counting(&counter))
        .unwrap();

    assert_eq!(status(&project.tasks.run(&task).unwrap(), "t"), Status::Executed);
    assert_eq!(status(&project.tasks.run(&task).unwrap(), "t"), Status::UpToDate);

    events.publish(&FileEvent::Changed(input.clone()));
    assert!(project.tasks.is_dirty("t"));

    assert_eq!(status(&project.tasks.run(&task).unwrap(), "t"), Status::Executed);
    assert!(!project.tasks.is_dirty("t"));
    assert_eq!(status(&project.tasks.run(&task).unwrap(), "t"), Status::UpToDate);
    assert_eq!(counter.load(Ordering::SeqCst), 2);

    project.tasks.dispose();
    assert_eq!(events.subscriber_count(), 0);
    events.publish(&FileEvent::Changed(input));
    assert!(!project.tasks.is_dirty("t"));
}

#[test]
fn test_change_inside_tree_marks_dirty() {
    let project = Project::new("app");
    project.write("src/pkg/A.java", "a");

    project
        .tasks
        .task("javac")
        .input_tree(project.tasks.file("src").unwrap())
        .register(|_| Ok(()))
        .unwrap();

    let marked = project.tasks.invalidate(project.root.join("src/pkg/A.java").as_str());
    assert_eq!(marked, 1);
    assert!(project.tasks.is_dirty("javac"));
}

#[test]
fn test_tree_inputs() {
    let project = Project::new("app");
    project.write("src/a.txt", "a");
    let counter = Arc::new(AtomicUsize::new(0));

    let task = project
        .tasks
        .task("bundle")
        .input_tree(project.tasks.file("src").unwrap())
        .register(counting(&counter))
        .unwrap();

    project.tasks.run(&task).unwrap();
    assert_eq!(status(&project.tasks.run(&task).unwrap(), "bundle"), Status::UpToDate);

    project.write("src/nested/b.txt", "b");
    assert_eq!(status(&project.tasks.run(&task).unwrap(), "bundle"), Status::Executed);
    assert_eq!(status(&project.tasks.run(&task).unwrap(), "bundle"), Status::UpToDate);
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[test]
fn test_failure_only_fails_dependents() {
    let project = Project::new("app");
    let tasks = &project.tasks;
    let counter = Arc::new(AtomicUsize::new(0));

    let a = tasks
        .task("a")
        .register(|_| Err(anyhow::anyhow!("a exploded")))
        .unwrap();
    let b = tasks.task("b").depends_on(&a).register(counting(&counter)).unwrap();
    let c = tasks.task("c").register(counting(&counter)).unwrap();
    let d = tasks
        .task("d")
        .depends_on(&b)
        .depends_on(&c)
        .register(counting(&counter))
        .unwrap();

    let run = tasks.run(&d).unwrap();
    assert_eq!(run.len(), 4);
    assert_eq!(status(&run, "a"), Status::Failed);
    assert_eq!(status(&run, "b"), Status::Failed);
    assert_eq!(status(&run, "c"), Status::Executed);
    assert_eq!(status(&run, "d"), Status::Failed);

    let cause = |id: &str| run.get(id).and_then(|r| r.cause()).map(ToString::to_string);
    assert_eq!(cause("a").as_deref(), Some("a exploded"));
    assert_eq!(cause("b").as_deref(), Some("Dependency failed: a"));
    assert_eq!(cause("d").as_deref(), Some("Dependency failed: b"));
    assert_eq!(cause("c"), None);

    // Only `c` ran, and nothing was persisted for `a`.
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert!(project.store.get("a").unwrap().is_none());
}

#[test]
fn test_failed_task_is_retried() {
    let project = Project::new("app");
    let fail = Arc::new(AtomicBool::new(true));

    let flag = fail.clone();
    let task = project
        .tasks
        .task("flaky")
        .register(move |_| {
            if flag.load(Ordering::SeqCst) {
                anyhow::bail!("not yet");
            }
            Ok(())
        })
        .unwrap();

    assert_eq!(status(&project.tasks.run(&task).unwrap(), "flaky"), Status::Failed);
    fail.store(false, Ordering::SeqCst);
    assert_eq!(status(&project.tasks.run(&task).unwrap(), "flaky"), Status::Executed);
    assert_eq!(status(&project.tasks.run(&task).unwrap(), "flaky"), Status::UpToDate);
}

#[test]
fn test_panicking_action_fails() {
    let project = Project::new("app");
    let task = project
        .tasks
        .task("boom")
        .register(|_| panic!("kaboom"))
        .unwrap();

    let run = project.tasks.run(&task).unwrap();
    let result = run.get("boom").unwrap();
    assert_eq!(result.status(), Status::Failed);
    assert!(result.cause().unwrap().to_string().contains("kaboom"));
}

#[test]
fn test_non_cacheable_always_executes() {
    let project = Project::new("app");
    let counter = Arc::new(AtomicUsize::new(0));
    let task = project
        .tasks
        .task("clean")
        .cacheable(false)
        .register(counting(&counter))
        .unwrap();

    for _ in 0..3 {
        assert_eq!(status(&project.tasks.run(&task).unwrap(), "clean"), Status::Executed);
    }
    assert_eq!(counter.load(Ordering::SeqCst), 3);
    assert_eq!(project.store.committed_len(), 0);
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl TaskListener for Recorder {
    fn on_started(&self, task: &Task) {
        self.events.lock().unwrap().push(format!("start {}", task.id()));
    }

    fn on_finished(&self, task: &Task, result: &TaskResult) {
        self.events
            .lock()
            .unwrap()
            .push(format!("finish {} {:?}", task.id(), result.status()));
    }
}

struct Panicking;

impl TaskListener for Panicking {
    fn on_started(&self, _: &Task) {
        panic!("broken listener");
    }
}

#[test]
fn test_listeners() {
    let project = Project::new("app");
    let recorder = Arc::new(Recorder::default());
    let listener: Arc<dyn TaskListener> = recorder.clone();

    project.tasks.add_listener(listener.clone());
    project.tasks.add_listener(listener.clone());
    project.tasks.add_listener(Arc::new(Panicking));

    let a = project.tasks.task("a").register(|_| Ok(())).unwrap();
    let b = project.tasks.task("b").depends_on(&a).register(|_| Ok(())).unwrap();

    project.tasks.run(&b).unwrap();
    project.tasks.run(&b).unwrap();

    assert_eq!(
        *recorder.events.lock().unwrap(),
        [
            "start a",
            "finish a Executed",
            "start b",
            "finish b Executed",
            "start a",
            "finish a UpToDate",
            "start b",
            "finish b UpToDate",
        ]
    );

    project.tasks.remove_listener(&listener);
    project.tasks.run(&b).unwrap();
    assert_eq!(recorder.events.lock().unwrap().len(), 8);
}

#[test]
fn test_progress_listener_counts() {
    let project = Project::new("app");
    let progress = Arc::new(ProgressListener::hidden());
    project.tasks.add_listener(progress.clone());

    let a = project.tasks.task("a").register(|_| Ok(())).unwrap();
    let b = project
        .tasks
        .task("b")
        .depends_on(&a)
        .register(|_| Err(anyhow::anyhow!("nope")))
        .unwrap();

    project.tasks.run(&b).unwrap();
    progress.finish();

    assert_eq!(progress.evaluated(), 2);
    assert_eq!(progress.executed(), 1);
    assert_eq!(progress.failed(), 1);
}

struct Generate;

impl TaskDefinition for Generate {
    fn id(&self) -> &str {
        "generate"
    }

    fn configure<'a>(
        &self,
        builder: TaskBuilder<'a>,
        ctx: &ConfigureContext<'_>,
    ) -> Result<TaskBuilder<'a>, EngineError> {
        Ok(builder.output(ctx.file("gen/Version.java")?))
    }

    fn execute(&self, ctx: &TaskContext) -> anyhow::Result<()> {
        let out = ctx.scope().root().join("gen/Version.java");
        fs::create_dir_all(out.parent().unwrap_or(ctx.scope().root()))?;
        fs::write(out, "class Version {}")?;
        Ok(())
    }
}

struct Compile;

impl TaskDefinition for Compile {
    fn id(&self) -> &str {
        "compile"
    }

    fn configure<'a>(
        &self,
        builder: TaskBuilder<'a>,
        ctx: &ConfigureContext<'_>,
    ) -> Result<TaskBuilder<'a>, EngineError> {
        let generated = ctx.require_output("generate", 0)?;
        Ok(builder.input_from(&generated).option("release", "17"))
    }

    fn execute(&self, ctx: &TaskContext) -> anyhow::Result<()> {
        anyhow::ensure!(ctx.options().get("release") == Some("17"));
        Ok(())
    }
}

#[test]
fn test_task_definitions() {
    let project = Project::new("app");

    let missing = project.tasks.define(Compile);
    assert!(matches!(missing, Err(EngineError::UnknownTask(_))));

    project.tasks.define(Generate).unwrap();
    let compile = project.tasks.define(Compile).unwrap();
    assert_eq!(compile.dependencies(), [TaskRef::new("app", "generate")]);

    let run = project.tasks.run(&compile).unwrap();
    assert_eq!(status(&run, "generate"), Status::Executed);
    assert_eq!(status(&run, "compile"), Status::Executed);

    let run = project.tasks.run(&compile).unwrap();
    assert!(run.iter().all(|r| r.status() == Status::UpToDate));

    let ctx = ConfigureContext { tasks: &project.tasks };
    match ctx.require_output("generate", 3) {
        Err(err @ EngineError::OutputIndex { .. }) => {
            assert_eq!(err.to_string(), "Task 'generate' has 1 outputs; requested index 3");
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[test]
fn test_cross_scope_failure_is_summarized() {
    let registry = ScopeRegistry::new();
    let p1 = Project::new("p1");
    let p2 = Project::new("p2");

    let lib = Arc::new(Tasks::new(p1.tasks.scope().clone(), MemoryStore::new()));
    let app = Arc::new(
        Tasks::new(p2.tasks.scope().clone(), MemoryStore::new()).with_resolver(registry.clone()),
    );
    registry.register(&lib);
    registry.register(&app);

    let long_error = "error: cannot find symbol\n".repeat(100);
    let message = long_error.clone();
    lib.task("x")
        .output(lib.file("build/x.jar").unwrap())
        .register(move |_| Err(anyhow::anyhow!(message.clone())))
        .unwrap();

    let counter = Arc::new(AtomicUsize::new(0));
    let jar = app.output("p1", "x", 0).unwrap();
    let y = app
        .task("y")
        .input_from(&jar)
        .register(counting(&counter))
        .unwrap();

    let run = app.run(&y).unwrap();
    let result = run.get("y").unwrap();
    assert_eq!(result.status(), Status::Failed);
    assert!(matches!(result.cause(), Some(Failure::Dependency(id)) if &**id == "x"));

    let cause = result.cause().unwrap().to_string();
    assert_eq!(cause, "Dependency failed: x");
    assert!(!cause.contains("cannot find symbol"));

    assert!(!run.contains("x"));
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[test]
fn test_cross_scope_cancellation_aborts_run() {
    let registry = ScopeRegistry::new();
    let p1 = Project::new("p1");
    let p2 = Project::new("p2");

    let lib = Arc::new(Tasks::new(p1.tasks.scope().clone(), MemoryStore::new()));
    let app = Arc::new(
        Tasks::new(p2.tasks.scope().clone(), MemoryStore::new()).with_resolver(registry.clone()),
    );
    registry.register(&lib);
    registry.register(&app);

    let x = lib.task("x").register(|_| Ok(())).unwrap();

    // Cancels the run right before the external dependency is visited.
    let source = CancellationSource::new();
    let canceller = source.clone();
    let prepare = app
        .task("prepare")
        .register(move |_| {
            canceller.cancel();
            Ok(())
        })
        .unwrap();

    let counter = Arc::new(AtomicUsize::new(0));
    let y = app
        .task("y")
        .depends_on(&prepare)
        .depends_on(&x)
        .register(counting(&counter))
        .unwrap();

    assert!(matches!(
        app.run_with(&y, &source.token()),
        Err(EngineError::Cancelled)
    ));
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[test]
fn test_cross_scope_success() {
    let registry = ScopeRegistry::new();
    let p1 = Project::new("p1");
    let p2 = Project::new("p2");

    let lib = Arc::new(Tasks::new(p1.tasks.scope().clone(), p1.store.clone()));
    let app = Arc::new(
        Tasks::new(p2.tasks.scope().clone(), p2.store.clone()).with_resolver(registry.clone()),
    );
    registry.register(&lib);

    let x_counter = Arc::new(AtomicUsize::new(0));
    let jar_path = p1.root.join("build/x.jar");
    let jar_out = jar_path.clone();
    let counter = x_counter.clone();
    let x = lib
        .task("x")
        .output(lib.file("build/x.jar").unwrap())
        .register(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            fs::create_dir_all(jar_out.parent().unwrap())?;
            fs::write(&jar_out, "jar")?;
            Ok(())
        })
        .unwrap();

    let y_counter = Arc::new(AtomicUsize::new(0));
    let y = app
        .task("y")
        .input_from(x.output(0).unwrap())
        .register(counting(&y_counter))
        .unwrap();

    assert_eq!(status(&app.run(&y).unwrap(), "y"), Status::Executed);
    assert_eq!(status(&app.run(&y).unwrap(), "y"), Status::UpToDate);
    assert!(jar_path.exists());
    assert_eq!(x_counter.load(Ordering::SeqCst), 1);
    assert_eq!(y_counter.load(Ordering::SeqCst), 1);
}

#[test]
fn test_unresolvable_external_dependency() {
    let p1 = Project::new("p1");
    let p2 = Project::new("p2");

    let x = p1.tasks.task("x").register(|_| Ok(())).unwrap();
    let y = p2.tasks.task("y").depends_on(&x).register(|_| Ok(())).unwrap();

    let run = p2.tasks.run(&y).unwrap();
    assert_eq!(status(&run, "y"), Status::Failed);
    assert_eq!(
        run.get("y").unwrap().cause().unwrap().to_string(),
        "Dependency failed: x"
    );
}

#[test]
fn test_output_lookup() {
    let registry = ScopeRegistry::new();
    let p1 = Project::new("p1");
    let lib = Arc::new(Tasks::new(p1.tasks.scope().clone(), MemoryStore::new()));
    registry.register(&lib);

    let p2 = Project::new("p2");
    let app = Tasks::new(p2.tasks.scope().clone(), MemoryStore::new()).with_resolver(registry.clone());

    lib.task("x")
        .outputs(lib.files(["a.jar", "b.jar"]).unwrap())
        .register(|_| Ok(()))
        .unwrap();

    let second = app.output("p1", "x", 1).unwrap();
    assert_eq!(second.producer(), &TaskRef::new("p1", "x"));
    assert_eq!(second.file().path(), p1.root.join("b.jar").as_str());

    assert!(matches!(app.output("p1", "x", 2), Err(EngineError::OutputIndex { count: 2, index: 2, .. })));
    assert!(matches!(app.output("p1", "y", 0), Err(EngineError::UnknownTask(_))));
    assert!(matches!(app.output("p9", "x", 0), Err(EngineError::UnknownScope(_))));
}

#[test]
fn test_state_survives_restart() {
    let project = Project::new("app");
    project.write("src/a.txt", "a");

    let declare = |tasks: &Tasks| {
        tasks
            .task("read")
            .input(tasks.file("src/a.txt").unwrap())
            .register(|_| Ok(()))
            .unwrap()
    };

    let task = declare(&project.tasks);
    assert_eq!(status(&project.tasks.run(&task).unwrap(), "read"), Status::Executed);

    let restarted = Tasks::new(project.tasks.scope().clone(), project.store.clone());
    let task = declare(&restarted);
    assert_eq!(status(&restarted.run(&task).unwrap(), "read"), Status::UpToDate);
}

#[test]
fn test_unknown_record_version_is_a_miss() {
    let project = Project::new("app");
    let a = project.tasks.task("a").register(|_| Ok(())).unwrap();
    let b = project.tasks.task("b").register(|_| Ok(())).unwrap();

    project.tasks.run(&a).unwrap();
    project.tasks.run(&b).unwrap();

    let mut future = 99u32.to_be_bytes().to_vec();
    future.extend_from_slice(b"from the future");
    project.store.insert_committed("a", future);

    assert_eq!(status(&project.tasks.run(&a).unwrap(), "a"), Status::Executed);
    assert_eq!(status(&project.tasks.run(&b).unwrap(), "b"), Status::UpToDate);
    assert_eq!(status(&project.tasks.run(&a).unwrap(), "a"), Status::UpToDate);
}

#[test]
fn test_replacing_reindexes_paths() {
    let project = Project::new("app");
    let a = project.tasks.file("a.txt").unwrap();
    let b = project.tasks.file("b.txt").unwrap();

    project.tasks.task("t").input(a.clone()).register(|_| Ok(())).unwrap();
    assert_eq!(project.tasks.owners_of(a.path()), [Arc::<str>::from("t")]);

    project.tasks.task("t").input(b.clone()).register(|_| Ok(())).unwrap();
    assert!(project.tasks.owners_of(a.path()).is_empty());
    assert_eq!(project.tasks.owners_of(b.path()), [Arc::<str>::from("t")]);
}

#[test]
fn test_path_resolution() {
    let project = Project::new("app");
    let tasks = &project.tasks;
    let root = &project.root;

    assert_eq!(tasks.resolve_path("./src\\a.txt").unwrap(), root.join("src/a.txt"));
    assert_eq!(tasks.resolve_path("src/./x/../b.txt").unwrap(), root.join("src/b.txt"));
    assert_eq!(tasks.resolve_path("/opt/jdk").unwrap(), Utf8PathBuf::from("/opt/jdk"));
    assert_eq!(tasks.resolve_path("jar:file:///x.jar!/A.class").unwrap().as_str(), "jar:file:///x.jar!/A.class");
    assert_eq!(tasks.resolve_path(".").unwrap(), *root);
    assert!(matches!(tasks.resolve_path("   "), Err(EngineError::InvalidPath(_))));
}

#[test]
fn test_cancelled_walk() {
    let project = Project::new("app");
    let counter = Arc::new(AtomicUsize::new(0));
    let task = project.tasks.task("t").register(counting(&counter)).unwrap();

    let source = CancellationSource::cancelled();
    assert!(matches!(
        project.tasks.run_with(&task, &source.token()),
        Err(EngineError::Cancelled)
    ));
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[test]
fn test_run_async_on_scheduler() {
    let project = Project::new("app");
    let scope = project.tasks.scope().clone();
    let scheduler = Arc::new(Scheduler::new(scope.clone()));
    let tasks = Arc::new(Tasks::new(scope, MemoryStore::new()).with_scheduler(scheduler));

    let task = tasks.task("t").register(|_| Ok(())).unwrap();
    let run = tasks.run_async(task.clone()).wait().value().unwrap();
    assert_eq!(status(&run, "t"), Status::Executed);

    let run = tasks.run_async(task).wait().value().unwrap();
    assert_eq!(status(&run, "t"), Status::UpToDate);
}

#[test]
fn test_run_async_without_scheduler() {
    let project = Project::new("app");
    let tasks = Arc::new(Tasks::new(project.tasks.scope().clone(), MemoryStore::new()));

    let task = tasks.task("t").register(|_| Ok(())).unwrap();
    let outcome = tasks.run_async(task).wait_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(status(&outcome.value().unwrap(), "t"), Status::Executed);
}

#[test]
fn test_run_async_on_closed_scope() {
    let project = Project::new("app");
    let tasks = Arc::new(Tasks::new(project.tasks.scope().clone(), MemoryStore::new()));
    let task = tasks.task("t").register(|_| Ok(())).unwrap();

    tasks.scope().close();
    assert!(tasks.run_async(task).wait().is_closed());
}

#[test]
fn test_open_uses_file_store() {
    let project = Project::new("app");
    project.write("src/a.txt", "a");
    let config = Config {
        state_file: "state/kiln.db".into(),
        ..Config::default()
    };

    {
        let tasks = Tasks::open(project.tasks.scope().clone(), config.clone()).unwrap();
        let task = tasks
            .task("read")
            .input(tasks.file("src/a.txt").unwrap())
            .register(|_| Ok(()))
            .unwrap();
        assert_eq!(status(&tasks.run(&task).unwrap(), "read"), Status::Executed);
    }

    assert!(project.root.join(".cache/state/kiln.db").exists());

    let tasks = Tasks::open(project.tasks.scope().clone(), config).unwrap();
    let task = tasks
        .task("read")
        .input(tasks.file("src/a.txt").unwrap())
        .register(|_| Ok(()))
        .unwrap();
    assert_eq!(status(&tasks.run(&task).unwrap(), "read"), Status::UpToDate);
}

#[test]
fn test_failed_commit_is_not_up_to_date() {
    let project = Project::new("app");
    project.write("src/a.txt", "a");
    let counter = Arc::new(AtomicUsize::new(0));

    let tasks = Tasks::open(project.tasks.scope().clone(), Config::default()).unwrap();
    let task = tasks
        .task("read")
        .input(tasks.file("src/a.txt").unwrap())
        .register(counting(&counter))
        .unwrap();

    // The cache directory can't be created anymore.
    project.write(".cache", "");

    for _ in 0..2 {
        let run = tasks.run(&task).unwrap();
        let result = run.get("read").unwrap();
        assert_eq!(result.status(), Status::Failed);
        assert!(matches!(result.cause(), Some(Failure::Persist(_))));
    }
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[test]
fn test_results_carry_timestamps() {
    let project = Project::new("app");
    let before = SystemTime::now();
    let task = project.tasks.task("t").register(|_| Ok(())).unwrap();

    let run = project.tasks.run(&task).unwrap();
    let result = run.get("t").unwrap();
    assert!(result.started() >= before);
    assert!(result.finished() >= result.started());
    assert!(result.cause().is_none());
}
