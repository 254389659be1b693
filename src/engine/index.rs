use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use camino::Utf8Path;

use crate::task::{Task, TaskId};
use crate::utils::{read, write};

/// Reverse index from declared paths to the tasks declaring them, together
/// with the set of tasks invalidated by file changes.
#[derive(Debug, Default)]
pub(crate) struct PathIndex {
    paths: RwLock<HashMap<String, HashSet<TaskId>>>,
    dirty: RwLock<HashSet<TaskId>>,
}

impl PathIndex {
    pub(crate) fn add(&self, task: &Task) {
        let mut paths = write(&self.paths);
        for path in task.referenced_paths() {
            paths.entry(path).or_default().insert(task.id().clone());
        }
    }

    pub(crate) fn remove(&self, task: &Task) {
        let mut paths = write(&self.paths);
        for path in task.referenced_paths() {
            if let Some(owners) = paths.get_mut(&path) {
                owners.remove(task.id());
                if owners.is_empty() {
                    paths.remove(&path);
                }
            }
        }
    }

    /// Marks every task declaring `path`, or a folder containing it, as dirty.
    /// Returns how many tasks were marked.
    pub(crate) fn mark_dirty(&self, path: &str) -> usize {
        let owners: Vec<TaskId> = {
            let paths = read(&self.paths);
            Utf8Path::new(path)
                .ancestors()
                .filter_map(|ancestor| paths.get(ancestor.as_str()))
                .flatten()
                .cloned()
                .collect()
        };

        if owners.is_empty() {
            return 0;
        }

        let mut dirty = write(&self.dirty);
        owners.into_iter().filter(|id| dirty.insert(id.clone())).count()
    }

    pub(crate) fn is_dirty(&self, id: &str) -> bool {
        read(&self.dirty).contains(id)
    }

    pub(crate) fn clear_dirty(&self, id: &str) {
        write(&self.dirty).remove(id);
    }

    pub(crate) fn owners(&self, path: &str) -> Vec<TaskId> {
        let mut owners: Vec<_> = read(&self.paths)
            .get(path)
            .map(|owners| owners.iter().cloned().collect())
            .unwrap_or_default();
        owners.sort();
        owners
    }
}
