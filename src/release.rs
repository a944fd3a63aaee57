//! Release chain
//!
//! Every multi-step acquisition in the executor (root mount, local mount,
//! mount stubs, generated spec files) registers its undo action here. The
//! chain runs the actions newest-first, keeps going past failures and only
//! ever runs an action once.

use crate::error::ExecutorError;
use std::fmt;

/// A single no-argument release action
pub type ReleaseFn = Box<dyn FnOnce() -> crate::Result<()> + Send + 'static>;

struct Action {
    name: String,
    release: ReleaseFn,
}

/// Ordered list of release actions
#[derive(Default)]
pub struct ReleaseChain {
    actions: Vec<Action>,
}

impl ReleaseChain {
    /// Create an empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a release action
    pub fn acquire<F>(&mut self, name: impl Into<String>, release: F)
    where
        F: FnOnce() -> crate::Result<()> + Send + 'static,
    {
        self.actions.push(Action {
            name: name.into(),
            release: Box::new(release),
        });
    }

    /// Register an already boxed release action
    pub fn acquire_boxed(&mut self, name: impl Into<String>, release: ReleaseFn) {
        self.actions.push(Action {
            name: name.into(),
            release,
        });
    }

    /// Number of actions still pending
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Names of the pending actions in registration order
    pub fn names(&self) -> Vec<&str> {
        self.actions.iter().map(|a| a.name.as_str()).collect()
    }

    /// Run every pending action in reverse registration order.
    ///
    /// Failures are logged and collected; they do not stop the remaining
    /// actions. A second call is a no-op that returns no errors.
    pub fn release_all(&mut self) -> Vec<ExecutorError> {
        let mut errors = Vec::new();
        while let Some(action) = self.actions.pop() {
            tracing::debug!(action = %action.name, "releasing");
            if let Err(e) = (action.release)() {
                tracing::warn!(action = %action.name, error = %e, "release action failed");
                errors.push(e);
            }
        }
        errors
    }
}

impl Drop for ReleaseChain {
    fn drop(&mut self) {
        if !self.actions.is_empty() {
            tracing::debug!(pending = self.actions.len(), "release chain dropped with pending actions");
            self.release_all();
        }
    }
}

impl fmt::Debug for ReleaseChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReleaseChain")
            .field("actions", &self.names())
            .finish()
    }
}
