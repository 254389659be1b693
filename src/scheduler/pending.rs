use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

/// How a scheduled unit of work ended.
#[derive(Debug)]
pub enum Outcome<T> {
    /// The action ran and its result was the newest one for its slot.
    Completed(T),
    /// The action was superseded, explicitly cancelled, or observed its token.
    Cancelled,
    /// The action returned an error or panicked.
    Failed(anyhow::Error),
    /// The owning scope was closed, nothing was executed.
    Closed,
}

impl<T> Outcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// The produced value, if the action completed.
    pub fn value(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            _ => None,
        }
    }
}

/// Handle to the eventual [`Outcome`] of a submitted unit of work.
///
/// There is no built-in timeout; use [`Pending::wait_timeout`] to compose one.
/// The outcome is delivered exactly once, after it has been taken any further
/// polling reports [`Outcome::Cancelled`].
#[derive(Debug)]
pub struct Pending<T> {
    receiver: Receiver<Outcome<T>>,
}

impl<T> Pending<T> {
    pub(crate) fn channel() -> (Sender<Outcome<T>>, Self) {
        let (sender, receiver) = mpsc::channel();
        (sender, Self { receiver })
    }

    /// A handle which is already resolved.
    pub fn ready(outcome: Outcome<T>) -> Self {
        let (sender, pending) = Self::channel();
        // The receiver is alive right here, sending cannot fail.
        let _ = sender.send(outcome);
        pending
    }

    /// Blocks until the work resolves. A unit dropped without reporting (for
    /// example when its lane was disposed) counts as cancelled.
    pub fn wait(self) -> Outcome<T> {
        self.receiver.recv().unwrap_or(Outcome::Cancelled)
    }

    /// Blocks for at most `timeout`, `None` means still running.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Outcome<T>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Outcome::Cancelled),
        }
    }

    /// Non-blocking poll, `None` means still running.
    pub fn try_wait(&self) -> Option<Outcome<T>> {
        match self.receiver.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Outcome::Cancelled),
        }
    }
}
