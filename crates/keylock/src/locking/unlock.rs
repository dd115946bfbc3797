//! The unlock capability handed out by a successful acquisition
//!
//! An [`Unlock`] is bound to the lock instance of one key at acquisition
//! time. Whoever owns the value may release the hold; the registry does not
//! check identity.

use super::event::{EventSender, LockEvent, publish};
use super::types::saturating_millis;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::OwnedMutexGuard;
use tracing::trace;

/// A one-shot capability that releases exactly one hold on a key
///
/// Releasing consumes the value, so a second release cannot be expressed.
/// Dropping the value also releases; call [`Unlock::leak`] to keep the key
/// held for the rest of the process instead.
#[must_use = "dropping an Unlock releases the key immediately"]
pub struct Unlock<K: Clone> {
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
    acquired_at: Instant,
    events: EventSender<K>,
}

impl<K: Clone> Unlock<K> {
    pub(crate) fn new(key: K, guard: OwnedMutexGuard<()>, events: EventSender<K>) -> Self {
        Self {
            key,
            guard: Some(guard),
            acquired_at: Instant::now(),
            events,
        }
    }

    /// The key this capability releases
    pub fn key(&self) -> &K {
        &self.key
    }

    /// How long the hold has lasted so far
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Release the hold
    pub fn unlock(mut self) {
        self.release();
    }

    /// Give up the capability without releasing
    ///
    /// The key's lock is never released and its allocation lives for the
    /// rest of the process, even if the registry is dropped. Every later
    /// `acquire` on the key waits forever, every bounded wait times out, and
    /// `prune` never evicts it.
    pub fn leak(mut self) {
        if let Some(guard) = self.guard.take() {
            trace!("Leaking lock hold");
            std::mem::forget(guard);
        }
    }

    fn release(&mut self) {
        if let Some(guard) = self.guard.take() {
            let held = self.acquired_at.elapsed();
            trace!(held_ms = saturating_millis(held), "Lock released");
            // Published while still held, so no subscriber can see the next
            // holder's `acquired` ahead of this `released`.
            publish(&self.events, || LockEvent::released(self.key.clone(), held));
            drop(guard);
        }
    }
}

impl<K: Clone> Drop for Unlock<K> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<K: Clone + fmt::Debug> fmt::Debug for Unlock<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unlock")
            .field("key", &self.key)
            .field("held", &self.guard.is_some())
            .field("held_for", &self.held_for())
            .finish()
    }
}

impl<K: Clone + fmt::Display> fmt::Display for Unlock<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unlock[{}]", self.key)
    }
}
