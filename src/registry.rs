use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use crate::Tasks;
use crate::task::Task;
use crate::utils::{read, write};

/// Finds the engine owning another scope.
pub trait ScopeResolver: Send + Sync {
    fn resolve(&self, scope: &str) -> Option<Arc<Tasks>>;

    /// The engine of `scope` together with its task `id`.
    fn resolve_task(&self, scope: &str, id: &str) -> Option<(Arc<Tasks>, Arc<Task>)> {
        let tasks = self.resolve(scope)?;
        let task = tasks.get_task(id)?;
        Some((tasks, task))
    }
}

/// [`ScopeResolver`] over engines registered by scope id.
///
/// Only weak references are kept, an engine which has been dropped simply
/// stops resolving.
#[derive(Default)]
pub struct ScopeRegistry {
    scopes: RwLock<HashMap<String, Weak<Tasks>>>,
}

impl ScopeRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, tasks: &Arc<Tasks>) {
        write(&self.scopes).insert(tasks.scope().id().to_string(), Arc::downgrade(tasks));
    }

    pub fn unregister(&self, scope: &str) {
        write(&self.scopes).remove(scope.trim());
    }

    pub fn scope_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = read(&self.scopes)
            .iter()
            .filter(|(_, tasks)| tasks.strong_count() > 0)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

impl ScopeResolver for ScopeRegistry {
    fn resolve(&self, scope: &str) -> Option<Arc<Tasks>> {
        read(&self.scopes).get(scope.trim())?.upgrade()
    }
}
