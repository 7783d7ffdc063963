//! Exclusive call guard for state-mutating entry points.
//!
//! The execution model serializes transactions, but reentrant calls into
//! the same component during an in-flight operation must still be
//! rejected. Every mutating entry point engages the guard on entry and
//! releases it on every exit path.

use std::cell::Cell;
use thiserror::Error;

/// A reentrant call reached a component while an operation was in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("reentrant call rejected: an operation is already in progress")]
pub struct ReentrancyError;

/// One-slot exclusive lock. Not a thread-safety primitive — it exists to
/// catch reentrant call chains within the serialized execution model.
#[derive(Debug, Clone, Default)]
pub struct CallGuard {
    engaged: Cell<bool>,
}

impl CallGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engages the guard, failing if it is already held.
    pub fn try_engage(&self) -> Result<(), ReentrancyError> {
        if self.engaged.replace(true) {
            return Err(ReentrancyError);
        }
        Ok(())
    }

    /// Releases the guard. Callers pair this with `try_engage` on every
    /// exit path, error paths included.
    pub fn release(&self) {
        self.engaged.set(false);
    }
}
