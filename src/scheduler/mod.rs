//! Latest-only execution lanes.
//!
//! A lane is a named worker thread, every unit submitted to it runs strictly
//! after the previous one. Inside a lane work is further grouped into slots by
//! key, and only the newest submission to a slot is ever allowed to publish a
//! result. Older submissions resolve to [`Outcome::Cancelled`], whether they
//! were still queued or already finished.

mod lane;
mod pending;

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, trace};

use crate::cancel::{CancellationSource, CancellationToken, Cancelled};
use crate::scope::Scope;
use crate::utils::{lock, panic_message};

use self::lane::{Job, Lane};
pub use self::pending::{Outcome, Pending};

/// Priority class of a submission.
///
/// Any submission cancels the token of the unit it supersedes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Priority {
    #[default]
    Background,
    /// Additionally interrupts whatever is running in the same slot, even a
    /// unit which is no longer the latest one.
    User,
}

/// Error returned from a scheduled action.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job was cancelled")]
    Cancelled,

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl From<Cancelled> for JobError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

/// Passed to every scheduled action.
#[derive(Debug, Clone)]
pub struct JobContext {
    token: CancellationToken,
    priority: Priority,
    submitted_at: Instant,
}

impl JobContext {
    /// Token to poll at safe suspension points.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Shorthand for `self.token().check()`.
    pub fn check(&self) -> Result<(), Cancelled> {
        self.token.check()
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn submitted_at(&self) -> Instant {
        self.submitted_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SlotKey {
    lane: String,
    key: String,
}

/// One submission to a slot.
struct Unit {
    seq: u64,
    source: CancellationSource,
}

impl Unit {
    fn new(seq: u64) -> Self {
        Self {
            seq,
            source: CancellationSource::new(),
        }
    }
}

#[derive(Default)]
struct Slot {
    seq: AtomicU64,
    latest: Mutex<Option<Arc<Unit>>>,
    running: Mutex<Option<Arc<Unit>>>,
}

impl Slot {
    fn is_current(&self, unit: &Unit) -> bool {
        self.seq.load(Ordering::Acquire) == unit.seq
    }

    /// Invalidates everything submitted so far.
    fn invalidate(&self) {
        let mut latest = lock(&self.latest);
        self.seq.fetch_add(1, Ordering::AcqRel);
        if let Some(unit) = latest.take() {
            unit.source.cancel();
        }
        drop(latest);

        if let Some(unit) = lock(&self.running).as_ref() {
            unit.source.cancel();
        }
    }
}

type Slots = Mutex<HashMap<SlotKey, Arc<Slot>>>;

/// Per-scope executor for latest-only work.
///
/// Lanes are spawned lazily on first use. Dropping the scheduler disposes it.
pub struct Scheduler {
    scope: Arc<Scope>,
    lanes: Mutex<HashMap<String, Lane>>,
    slots: Arc<Slots>,
    disposed: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(scope: Arc<Scope>) -> Self {
        Self {
            scope,
            lanes: Mutex::new(HashMap::new()),
            slots: Arc::new(Mutex::new(HashMap::new())),
            disposed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn scope(&self) -> &Arc<Scope> {
        &self.scope
    }

    /// Submits `action` to the slot `(lane, key)`, superseding every earlier
    /// submission to the same slot.
    ///
    /// Superseded submissions which have not started yet never run their body.
    /// One that is already running has its token cancelled and should stop at
    /// its next poll, its result is discarded and it resolves to
    /// [`Outcome::Cancelled`] either way.
    ///
    /// Only the newest outcome of a slot is ever observable. Callers which need
    /// the outcome of every request must give each request its own key.
    pub fn submit_latest<T, F>(
        &self,
        lane: &str,
        key: impl Into<String>,
        priority: Priority,
        action: F,
    ) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(&JobContext) -> Result<T, JobError> + Send + 'static,
    {
        if self.disposed.load(Ordering::Acquire) || !self.scope.is_open() {
            return Pending::ready(Outcome::Closed);
        }

        let key = SlotKey {
            lane: lane.to_string(),
            key: key.into(),
        };

        // The sequence is allocated under both locks: a finishing unit can't
        // prune the slot in between, and installation order matches sequence
        // order.
        let (slot, unit) = {
            let mut slots = lock(&self.slots);
            let slot = slots.entry(key.clone()).or_default().clone();

            let mut latest = lock(&slot.latest);
            let seq = slot.seq.fetch_add(1, Ordering::AcqRel) + 1;
            let unit = Arc::new(Unit::new(seq));

            if let Some(previous) = latest.replace(unit.clone())
                && previous.source.cancel()
            {
                trace!(lane = %key.lane, key = %key.key, seq = previous.seq, "superseded unit");
            }

            drop(latest);
            drop(slots);
            (slot, unit)
        };

        if priority == Priority::User
            && let Some(running) = lock(&slot.running).as_ref()
            && running.source.cancel()
        {
            debug!(lane = %key.lane, key = %key.key, seq = running.seq, "interrupting running unit");
        }

        let (sender, pending) = Pending::channel();
        let submitted_at = Instant::now();
        let scope = self.scope.clone();
        let disposed = self.disposed.clone();
        let slots = self.slots.clone();
        let slot_key = key.clone();

        let job: Job = Box::new(move || {
            let outcome = execute(&scope, &disposed, &slot, &unit, priority, submitted_at, action);
            release(&slots, &slot_key, &slot, &unit);
            // Nobody may be waiting anymore.
            let _ = sender.send(outcome);
        });

        let mut lanes = lock(&self.lanes);
        if !lanes.contains_key(&key.lane) {
            match Lane::spawn(&key.lane) {
                Ok(worker) => {
                    lanes.insert(key.lane.clone(), worker);
                }
                Err(err) => return Pending::ready(Outcome::Failed(err.into())),
            }
        }

        // A rejected job is dropped together with its sender, which resolves
        // the handle as cancelled.
        if let Some(worker) = lanes.get(&key.lane) {
            let _ = worker.submit(job);
        }
        pending
    }

    /// Invalidates all queued and running work for `(lane, key)` and forgets
    /// the slot. Does not wait for a running body to stop.
    pub fn cancel(&self, lane: &str, key: &str) {
        let key = SlotKey {
            lane: lane.to_string(),
            key: key.to_string(),
        };

        if let Some(slot) = lock(&self.slots).remove(&key) {
            debug!(lane = %key.lane, key = %key.key, "cancelling slot");
            slot.invalidate();
        }
    }

    /// Stops every lane worker and drops all slots. In-flight actions are asked
    /// to stop, queued ones resolve as cancelled and later submissions resolve
    /// as closed.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        for (_, slot) in lock(&self.slots).drain() {
            slot.invalidate();
        }

        // Dropping the senders lets every worker exit after draining its queue.
        lock(&self.lanes).clear();
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        lock(&self.slots).len()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("scope", &self.scope.id())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

/// Forgets the slot once its latest unit is done, unless it was replaced or
/// resubmitted meanwhile.
fn release(slots: &Slots, key: &SlotKey, slot: &Arc<Slot>, unit: &Unit) {
    let mut slots = lock(slots);
    if slot.is_current(unit)
        && let Some(registered) = slots.get(key)
        && Arc::ptr_eq(registered, slot)
    {
        slots.remove(key);
    }
}

fn execute<T, F>(
    scope: &Scope,
    disposed: &AtomicBool,
    slot: &Slot,
    unit: &Arc<Unit>,
    priority: Priority,
    submitted_at: Instant,
    action: F,
) -> Outcome<T>
where
    F: FnOnce(&JobContext) -> Result<T, JobError>,
{
    if !scope.is_open() {
        return Outcome::Closed;
    }

    if disposed.load(Ordering::Acquire) || !slot.is_current(unit) {
        unit.source.cancel();
        return Outcome::Cancelled;
    }

    *lock(&slot.running) = Some(unit.clone());

    let ctx = JobContext {
        token: unit.source.token(),
        priority,
        submitted_at,
    };

    let result = panic::catch_unwind(AssertUnwindSafe(|| -> Result<T, JobError> {
        ctx.check()?;
        action(&ctx)
    }));

    {
        let mut running = lock(&slot.running);
        if running.as_ref().is_some_and(|r| Arc::ptr_eq(r, unit)) {
            *running = None;
        }
    }

    match result {
        Err(payload) => Outcome::Failed(anyhow::anyhow!(panic_message(payload.as_ref()))),
        Ok(Err(JobError::Cancelled)) => {
            unit.source.cancel();
            Outcome::Cancelled
        }
        // An action interrupted halfway may surface the interruption as an
        // ordinary error.
        Ok(Err(JobError::Failed(_))) if unit.source.is_cancelled() => Outcome::Cancelled,
        Ok(Err(JobError::Failed(err))) => Outcome::Failed(err),
        Ok(Ok(value)) => {
            if disposed.load(Ordering::Acquire) || !slot.is_current(unit) {
                unit.source.cancel();
                Outcome::Cancelled
            } else {
                Outcome::Completed(value)
            }
        }
    }
}
