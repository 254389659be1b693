use std::sync::atomic::{AtomicBool, Ordering};

use camino::{Utf8Path, Utf8PathBuf};

/// The owner of a task registry: a project root, a cache directory for
/// persisted state, and a lifecycle flag.
///
/// Every scope gets its own [`Tasks`](crate::Tasks) and
/// [`Scheduler`](crate::Scheduler); nothing is shared process-wide.
#[derive(Debug)]
pub struct Scope {
    id: String,
    root: Utf8PathBuf,
    cache_dir: Utf8PathBuf,
    open: AtomicBool,
}

impl Scope {
    pub fn new(
        id: impl Into<String>,
        root: impl Into<Utf8PathBuf>,
        cache_dir: impl Into<Utf8PathBuf>,
    ) -> Self {
        Self {
            id: id.into(),
            root: root.into(),
            cache_dir: cache_dir.into(),
            open: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Directory against which relative task paths are resolved.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Directory holding persisted task state.
    pub fn cache_dir(&self) -> &Utf8Path {
        &self.cache_dir
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Marks the scope as closed. Pending scheduler submissions resolve to
    /// [`Outcome::Closed`](crate::Outcome::Closed) from now on.
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}
