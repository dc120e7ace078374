//! Awaitable state cell with bounded waits.
//!
//! Every suspension point in the crate (exchange, connect, disconnect,
//! discovery) waits on a [`Signal`] with an explicit timeout.

use std::time::Duration;

use tokio::sync::watch;

/// A value that can be modified by one side and awaited by the other.
#[derive(Debug)]
pub struct Signal<T> {
    tx: watch::Sender<T>,
}

impl<T: Clone> Signal<T> {
    /// Creates a signal holding `value`.
    #[must_use]
    pub fn new(value: T) -> Self {
        Self {
            tx: watch::Sender::new(value),
        }
    }

    /// Returns a copy of the current value.
    #[must_use]
    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Replaces the value and wakes waiters.
    pub fn set(&self, value: T) {
        self.tx.send_replace(value);
    }

    /// Modifies the value in place and wakes waiters.
    pub fn modify(&self, f: impl FnOnce(&mut T)) {
        self.tx.send_modify(f);
    }

    /// Waits until `predicate` holds or `timeout` elapses.
    ///
    /// The predicate is checked against the current value first, so a
    /// transition that already happened is not missed. Returns `true` if the
    /// predicate was satisfied.
    pub async fn wait_for(&self, timeout: Duration, predicate: impl FnMut(&T) -> bool) -> bool {
        let mut rx = self.tx.subscribe();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(predicate)).await,
            Ok(Ok(_))
        )
    }
}
