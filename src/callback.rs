//! User callback slots.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

type Handler<A> = Arc<dyn Fn(A) + Send + Sync>;

/// A replaceable callback.
///
/// The handler is cloned out of the slot before it runs, so a callback may
/// load or unload itself (or any other slot) without deadlocking.
pub struct Callback<A> {
    slot: Mutex<Option<Handler<A>>>,
}

impl<A> Callback<A> {
    /// Creates an empty slot.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Installs `handler`, replacing any previous one.
    pub fn load(&self, handler: impl Fn(A) + Send + Sync + 'static) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    /// Removes the installed handler.
    pub fn unload(&self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Returns true if a handler is installed.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Invokes the handler, if any. Returns true if it ran.
    pub fn call(&self, arg: A) -> bool {
        let handler = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        handler.is_some_and(|handler| {
            handler(arg);
            true
        })
    }
}

impl<A> Default for Callback<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> fmt::Debug for Callback<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("loaded", &self.is_loaded())
            .finish()
    }
}
