//! Cooperative cancellation.
//!
//! A [`CancellationSource`] is owned by whoever may cancel the work, the
//! matching [`CancellationToken`] is handed to the work itself, which polls it
//! at points where stopping is safe. Once cancelled, a source never resets.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

/// Returned from [`CancellationToken::check`] when the work should stop.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("Operation was cancelled")]
pub struct Cancelled;

/// The settable side of a cancellation pair.
#[derive(Debug, Clone, Default)]
pub struct CancellationSource {
    flag: Arc<AtomicBool>,
}

impl CancellationSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// A source which is already cancelled.
    pub fn cancelled() -> Self {
        let source = Self::new();
        source.cancel();
        source
    }

    /// Requests cancellation. Returns `true` only for the call which actually
    /// flipped the state.
    pub fn cancel(&self) -> bool {
        self.flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            flag: Some(self.flag.clone()),
        }
    }
}

/// The read-only side of a cancellation pair.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Option<Arc<AtomicBool>>,
}

impl CancellationToken {
    /// A token that can never be cancelled.
    pub fn none() -> Self {
        Self { flag: None }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    /// Polls the token, use with `?` at safe suspension points.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}
