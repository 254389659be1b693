//! The file view tasks are fingerprinted against, and the change notifications
//! that invalidate them.

use std::fmt::Debug;
use std::fs;
use std::io::{self, Read};
use std::sync::{Arc, Mutex, Weak};
use std::time::UNIX_EPOCH;

use camino::{Utf8Path, Utf8PathBuf};

use crate::utils::lock;

/// A file or folder as seen by the snapshot engine.
///
/// Metadata accessors report the view as of the last [`FileRef::refresh`].
pub trait FileRef: Send + Sync + Debug {
    /// Stable key used in snapshots and in the path index.
    fn path(&self) -> &str;

    fn exists(&self) -> bool;

    fn is_folder(&self) -> bool;

    /// Modification time in milliseconds since the Unix epoch, `0` if unknown.
    fn last_modified(&self) -> i64;

    fn length(&self) -> i64;

    /// Drops any cached view of the underlying file.
    fn refresh(&self) {}

    /// Direct children, empty for regular files and missing paths.
    fn children(&self) -> Vec<FileHandle>;

    /// Opens the content for reading, only called when a digest is needed.
    fn open(&self) -> io::Result<Box<dyn Read + Send>>;
}

pub type FileHandle = Arc<dyn FileRef>;

/// [`FileRef`] backed directly by the local filesystem.
///
/// Nothing is cached, so every accessor observes the current state.
#[derive(Debug, Clone)]
pub struct LocalFile {
    path: Utf8PathBuf,
}

impl LocalFile {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn handle(path: impl Into<Utf8PathBuf>) -> FileHandle {
        Arc::new(Self::new(path))
    }

    pub fn as_path(&self) -> &Utf8Path {
        &self.path
    }

    fn metadata(&self) -> Option<fs::Metadata> {
        fs::metadata(&self.path).ok()
    }
}

impl FileRef for LocalFile {
    fn path(&self) -> &str {
        self.path.as_str()
    }

    fn exists(&self) -> bool {
        self.path.exists()
    }

    fn is_folder(&self) -> bool {
        self.path.is_dir()
    }

    fn last_modified(&self) -> i64 {
        self.metadata()
            .and_then(|meta| meta.modified().ok())
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|since| since.as_millis() as i64)
            .unwrap_or(0)
    }

    fn length(&self) -> i64 {
        self.metadata()
            .filter(|meta| meta.is_file())
            .map(|meta| meta.len() as i64)
            .unwrap_or(0)
    }

    fn children(&self) -> Vec<FileHandle> {
        let Ok(entries) = self.path.read_dir_utf8() else {
            return Vec::new();
        };

        entries
            .filter_map(Result::ok)
            .map(|entry| LocalFile::handle(entry.into_path()))
            .collect()
    }

    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(fs::File::open(&self.path)?))
    }
}

/// A change observed on the file system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEvent {
    Created(Utf8PathBuf),
    Deleted(Utf8PathBuf),
    Changed(Utf8PathBuf),
    Renamed { from: Utf8PathBuf, to: Utf8PathBuf },
}

impl FileEvent {
    /// Every path touched by this event.
    pub fn paths(&self) -> Vec<&Utf8Path> {
        match self {
            Self::Created(path) | Self::Deleted(path) | Self::Changed(path) => vec![path.as_path()],
            Self::Renamed { from, to } => vec![from.as_path(), to.as_path()],
        }
    }
}

type Handler = dyn Fn(&FileEvent) + Send + Sync;

/// Broadcast channel for [`FileEvent`]s.
///
/// Handlers are invoked synchronously on the publishing thread.
#[derive(Default)]
pub struct FileEvents {
    handlers: Mutex<Vec<(u64, Arc<Handler>)>>,
    next: Mutex<u64>,
}

impl FileEvents {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers `handler` until the returned [`Subscription`] is dropped.
    pub fn subscribe<F>(self: &Arc<Self>, handler: F) -> Subscription
    where
        F: Fn(&FileEvent) + Send + Sync + 'static,
    {
        let id = {
            let mut next = lock(&self.next);
            *next += 1;
            *next
        };

        lock(&self.handlers).push((id, Arc::new(handler)));

        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    pub fn publish(&self, event: &FileEvent) {
        // Handlers may (un)subscribe, so they must not run under the lock.
        let handlers: Vec<_> = lock(&self.handlers)
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();

        for handler in handlers {
            handler(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.handlers).len()
    }

    fn unsubscribe(&self, id: u64) {
        lock(&self.handlers).retain(|(other, _)| *other != id);
    }
}

impl Debug for FileEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileEvents")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Keeps a [`FileEvents`] handler registered while alive.
#[derive(Debug)]
pub struct Subscription {
    bus: Weak<FileEvents>,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn utf8(dir: &tempfile::TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()
    }

    #[test]
    fn test_local_file_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let root = utf8(&dir);
        fs::write(root.join("a.txt"), "hello").unwrap();

        let file = LocalFile::new(root.join("a.txt"));
        assert!(file.exists());
        assert!(!file.is_folder());
        assert_eq!(file.length(), 5);
        assert!(file.last_modified() > 0);

        let mut content = String::new();
        file.open().unwrap().read_to_string(&mut content).unwrap();
        assert_eq!(content, "hello");

        let missing = LocalFile::new(root.join("nope"));
        assert!(!missing.exists());
        assert_eq!(missing.length(), 0);
        assert_eq!(missing.last_modified(), 0);
        assert!(missing.children().is_empty());
    }

    #[test]
    fn test_local_folder_children() {
        let dir = tempfile::tempdir().unwrap();
        let root = utf8(&dir);
        fs::create_dir(root.join("sub")).unwrap();
        fs::write(root.join("a.txt"), "a").unwrap();

        let folder = LocalFile::new(root.clone());
        assert!(folder.is_folder());
        assert_eq!(folder.length(), 0);

        let mut names: Vec<_> = folder
            .children()
            .iter()
            .map(|child| child.path().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec![root.join("a.txt").to_string(), root.join("sub").to_string()]);
    }

    #[test]
    fn test_subscription_lifecycle() {
        let bus = FileEvents::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let counter = seen.clone();
        let subscription = bus.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(&FileEvent::Changed("/src/a.txt".into()));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(), 1);

        drop(subscription);
        bus.publish(&FileEvent::Changed("/src/a.txt".into()));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_renamed_paths() {
        let event = FileEvent::Renamed {
            from: "/a".into(),
            to: "/b".into(),
        };
        assert_eq!(event.paths(), vec![Utf8Path::new("/a"), Utf8Path::new("/b")]);
    }
}
