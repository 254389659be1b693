use std::collections::BTreeSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::task::Task;
use crate::utils::{format_active, lock};

use super::result::{Status, TaskResult};

/// Observes task evaluation.
///
/// Callbacks run on the thread of the run. A panicking listener is ignored
/// and never affects the run.
pub trait TaskListener: Send + Sync {
    fn on_started(&self, task: &Task) {
        let _ = task;
    }

    fn on_finished(&self, task: &Task, result: &TaskResult) {
        let _ = (task, result);
    }
}

/// Shows the currently evaluated tasks on a progress bar.
pub struct ProgressListener {
    bar: ProgressBar,
    active: Mutex<BTreeSet<String>>,
    executed: AtomicU64,
    failed: AtomicU64,
    start: Instant,
}

impl ProgressListener {
    pub fn new() -> Self {
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed}] {pos} tasks {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());

        Self::with_bar(ProgressBar::no_length().with_style(style))
    }

    /// Same as [`ProgressListener::new`], drawing nothing.
    pub fn hidden() -> Self {
        Self::with_bar(ProgressBar::hidden())
    }

    fn with_bar(bar: ProgressBar) -> Self {
        Self {
            bar,
            active: Mutex::new(BTreeSet::new()),
            executed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            start: Instant::now(),
        }
    }

    pub fn evaluated(&self) -> u64 {
        self.bar.position()
    }

    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Replaces the bar with a summary line.
    pub fn finish(&self) {
        let summary = format!(
            "{} executed, {} failed in {:.2?}",
            self.executed(),
            self.failed(),
            self.start.elapsed()
        );

        let summary = if self.failed() > 0 {
            style(summary).red().to_string()
        } else {
            style(summary).green().to_string()
        };

        self.bar.finish_with_message(summary);
    }
}

impl Default for ProgressListener {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskListener for ProgressListener {
    fn on_started(&self, task: &Task) {
        let mut active = lock(&self.active);
        active.insert(task.id().to_string());
        self.bar.set_message(format_active(&active));
    }

    fn on_finished(&self, task: &Task, result: &TaskResult) {
        match result.status() {
            Status::Executed => self.executed.fetch_add(1, Ordering::Relaxed),
            Status::Failed => self.failed.fetch_add(1, Ordering::Relaxed),
            Status::UpToDate => 0,
        };

        let mut active = lock(&self.active);
        active.remove(&**task.id());
        self.bar.set_message(format_active(&active));
        self.bar.inc(1);
    }
}
