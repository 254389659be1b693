#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod cancel;
mod config;
mod engine;
mod error;
mod fingerprint;
mod registry;
mod scheduler;
mod scope;
mod state;
mod task;
mod utils;
mod vfs;
#[cfg(feature = "live")]
mod watch;

pub use crate::cancel::{CancellationSource, CancellationToken, Cancelled};
pub use crate::config::Config;
pub use crate::engine::{
    ProgressListener, Status, TaskGraph, TaskListener, TaskResult, TaskRun, Tasks,
};
pub use crate::error::{EngineError, Failure, StateError, StoreError};
pub use crate::fingerprint::{FingerprintMode, SnapshotEntry, SnapshotMode, snapshots_match};
pub use crate::registry::{ScopeRegistry, ScopeResolver};
pub use crate::scheduler::{JobContext, JobError, Outcome, Pending, Priority, Scheduler};
pub use crate::scope::Scope;
pub use crate::state::{FileStore, MemoryStore, StateStore, TaskState};
pub use crate::task::{
    ConfigureContext, Options, OptionsBuilder, Task, TaskAction, TaskBuilder, TaskContext,
    TaskDefinition, TaskId, TaskOutput, TaskRef,
};
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
pub use crate::vfs::{FileEvent, FileEvents, FileHandle, FileRef, LocalFile, Subscription};
#[cfg(feature = "live")]
pub use crate::watch::{Watcher, watch};
