//! Bridge from the operating system file watcher to [`FileEvents`].

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{DebounceEventResult, Debouncer, RecommendedCache, new_debouncer};
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::vfs::{FileEvent, FileEvents};

const DEBOUNCE: Duration = Duration::from_millis(250);

/// Publishes changes below `root` until dropped.
pub struct Watcher {
    root: Utf8PathBuf,
    _debouncer: Debouncer<RecommendedWatcher, RecommendedCache>,
}

impl Watcher {
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher").field("root", &self.root).finish()
    }
}

/// Watches `root` recursively and publishes debounced changes on `events`.
pub fn watch(root: impl Into<Utf8PathBuf>, events: Arc<FileEvents>) -> Result<Watcher, EngineError> {
    let root = root.into();

    let handler = move |result: DebounceEventResult| match result {
        Ok(batch) => {
            for debounced in batch {
                for event in translate(&debounced.event) {
                    events.publish(&event);
                }
            }
        }
        Err(errors) => {
            for err in errors {
                warn!("file watcher error: {err}");
            }
        }
    };

    let mut debouncer = new_debouncer(DEBOUNCE, None, handler)?;
    debouncer.watch(root.as_std_path(), RecursiveMode::Recursive)?;
    debug!(root = %root, "watching for file changes");

    Ok(Watcher {
        root,
        _debouncer: debouncer,
    })
}

fn translate(event: &Event) -> Vec<FileEvent> {
    let paths: Vec<Utf8PathBuf> = event.paths.iter().filter_map(|path| utf8(path)).collect();

    match event.kind {
        EventKind::Create(_) => paths.into_iter().map(FileEvent::Created).collect(),
        EventKind::Remove(_) => paths.into_iter().map(FileEvent::Deleted).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() == 2 => {
            let mut paths = paths.into_iter();
            match (paths.next(), paths.next()) {
                (Some(from), Some(to)) => vec![FileEvent::Renamed { from, to }],
                _ => Vec::new(),
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            paths.into_iter().map(FileEvent::Deleted).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            paths.into_iter().map(FileEvent::Created).collect()
        }
        EventKind::Modify(_) => paths.into_iter().map(FileEvent::Changed).collect(),
        _ => Vec::new(),
    }
}

fn utf8(path: &Path) -> Option<Utf8PathBuf> {
    match Utf8PathBuf::try_from(path.to_path_buf()) {
        Ok(path) => Some(path),
        Err(_) => {
            debug!(path = ?path, "ignoring non UTF-8 path");
            None
        }
    }
}
