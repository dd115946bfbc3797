//! The key lock registry
//!
//! The registry maps every key it has seen to its own async mutex. The map
//! itself sits behind a short-lived synchronous lock that is only taken to
//! look up or insert an entry (and by `prune`). It is never held across an
//! `.await`, so waiting on one key cannot delay any other key, including a
//! key that is being created for the first time.

use super::event::{EventSender, LockEvent, publish};
use super::types::{LockStatus, saturating_millis};
use super::unlock::Unlock;
use crate::config::KeyLockConfig;
use crate::error::{KeyLockError, LockResult};
use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard, broadcast};
use tracing::{debug, info, trace};

type LockMap<K> = HashMap<K, Arc<Mutex<()>>>;

/// A registry handing out an independent lock per key
///
/// Locks are created on first use and live as long as the registry unless
/// [`prune`](KeyLock::prune) is called. Cloning a `KeyLock` yields another
/// handle to the same registry.
pub struct KeyLock<K = String>
where
    K: Clone,
{
    inner: Arc<Inner<K>>,
}

struct Inner<K: Clone> {
    config: KeyLockConfig,

    /// key -> per-key binary lock
    locks: StdMutex<LockMap<K>>,

    events: EventSender<K>,
}

impl KeyLock<String> {
    /// Create an empty registry keyed by strings
    pub fn new() -> Self {
        Self::with_config(KeyLockConfig::default())
    }
}

impl<K> KeyLock<K>
where
    K: Eq + Hash + Clone + fmt::Debug,
{
    /// Create an empty registry with the given configuration
    pub fn with_config(config: KeyLockConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        Self {
            inner: Arc::new(Inner {
                locks: StdMutex::new(HashMap::with_capacity(config.initial_capacity)),
                config,
                events,
            }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &KeyLockConfig {
        &self.inner.config
    }

    /// Acquire the lock for `key`, waiting as long as it takes
    ///
    /// The returned capability releases the hold when unlocked or dropped.
    /// Waiters on the same key are not served in any promised order.
    pub async fn acquire<Q>(&self, key: &Q) -> Unlock<K>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + ?Sized,
    {
        let (key, lock) = self.provide(key);
        let start = Instant::now();
        let guard = lock.lock_owned().await;
        self.granted(key, guard, start)
    }

    /// Acquire the lock for `key`, giving up once `timeout` has elapsed
    ///
    /// A zero budget ([`IMMEDIATE`](super::IMMEDIATE)) is a pure
    /// non-blocking attempt and behaves exactly like
    /// [`try_acquire`](KeyLock::try_acquire). On timeout nothing is held
    /// and nothing is owed.
    pub async fn acquire_with_timeout<Q>(&self, key: &Q, timeout: Duration) -> LockResult<Unlock<K>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + ?Sized,
    {
        if timeout.is_zero() {
            return self.try_acquire(key);
        }

        let (key, lock) = self.provide(key);
        let start = Instant::now();

        // Dropping the pending acquire on expiry hands back anything it was
        // granted, so a timed-out caller can never end up owning the lock.
        match tokio::time::timeout(timeout, lock.lock_owned()).await {
            Ok(guard) => Ok(self.granted(key, guard, start)),
            Err(_) => Err(self.timed_out(key, start)),
        }
    }

    /// [`acquire_with_timeout`](KeyLock::acquire_with_timeout) using the
    /// configured default budget
    pub async fn acquire_with_default_timeout<Q>(&self, key: &Q) -> LockResult<Unlock<K>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + ?Sized,
    {
        self.acquire_with_timeout(key, self.inner.config.default_timeout())
            .await
    }

    /// Take the lock for `key` only if it is free right now
    pub fn try_acquire<Q>(&self, key: &Q) -> LockResult<Unlock<K>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + ?Sized,
    {
        let (key, lock) = self.provide(key);
        let start = Instant::now();

        match lock.try_lock_owned() {
            Ok(guard) => Ok(self.granted(key, guard, start)),
            Err(_) => Err(self.timed_out(key, start)),
        }
    }

    /// [`acquire`](KeyLock::acquire) for plain threads
    ///
    /// # Panics
    ///
    /// Panics when called from within an async execution context.
    pub fn blocking_acquire<Q>(&self, key: &Q) -> Unlock<K>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + ?Sized,
    {
        let (key, lock) = self.provide(key);
        let start = Instant::now();
        let guard = lock.blocking_lock_owned();
        self.granted(key, guard, start)
    }

    /// Number of keys currently registered
    pub fn len(&self) -> usize {
        self.lock_map().len()
    }

    /// Whether no key has been registered yet
    pub fn is_empty(&self) -> bool {
        self.lock_map().is_empty()
    }

    /// Whether `key` has a lock in the registry
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.lock_map().contains_key(key)
    }

    /// Snapshot of all registered keys, in no particular order
    pub fn keys(&self) -> Vec<K> {
        self.lock_map().keys().cloned().collect()
    }

    /// Status of `key`, or `None` if it was never registered
    ///
    /// This never touches the key's lock, so it cannot disturb a concurrent
    /// immediate attempt.
    pub fn status<Q>(&self, key: &Q) -> Option<LockStatus>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.lock_map().get(key).map(|lock| {
            if is_idle(lock) {
                LockStatus::Idle
            } else {
                LockStatus::InUse
            }
        })
    }

    /// Evict every idle key and return how many were removed
    ///
    /// A key is idle when no caller holds it, waits on it, or is between
    /// resolving and waiting on it. The next use of an evicted key creates
    /// a fresh lock. Nothing calls this implicitly.
    pub fn prune(&self) -> usize {
        let mut pruned = Vec::new();
        {
            let mut locks = self.lock_map();
            locks.retain(|key, lock| {
                if is_idle(lock) {
                    pruned.push(key.clone());
                    false
                } else {
                    true
                }
            });
        }

        if !pruned.is_empty() {
            info!(count = pruned.len(), "Pruned idle key locks");
        }
        let count = pruned.len();
        for key in pruned {
            publish(&self.inner.events, || LockEvent::pruned(key));
        }
        count
    }

    /// Subscribe to lock events
    ///
    /// Only events published after this call are received.
    pub fn subscribe(&self) -> broadcast::Receiver<LockEvent<K>> {
        self.inner.events.subscribe()
    }

    // ========== Internal Methods ==========

    fn lock_map(&self) -> MutexGuard<'_, LockMap<K>> {
        // Entries are inserted or removed whole, a panic elsewhere cannot
        // leave the map half-updated.
        self.inner
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up the lock for `key`, creating it if absent
    fn provide<Q>(&self, key: &Q) -> (K, Arc<Mutex<()>>)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + ?Sized,
    {
        let mut locks = self.lock_map();
        if let Some((existing, lock)) = locks.get_key_value(key) {
            return (existing.clone(), Arc::clone(lock));
        }

        let key = key.to_owned();
        let lock = Arc::new(Mutex::new(()));
        locks.insert(key.clone(), Arc::clone(&lock));
        drop(locks);

        debug!(key = ?key, "Created lock for new key");
        publish(&self.inner.events, || LockEvent::created(key.clone()));
        (key, lock)
    }

    fn granted(&self, key: K, guard: OwnedMutexGuard<()>, start: Instant) -> Unlock<K> {
        let waited = start.elapsed();
        trace!(key = ?key, waited_ms = saturating_millis(waited), "Lock acquired");
        publish(&self.inner.events, || LockEvent::acquired(key.clone(), waited));
        Unlock::new(key, guard, self.inner.events.clone())
    }

    fn timed_out(&self, key: K, start: Instant) -> KeyLockError {
        let waited = start.elapsed();
        debug!(key = ?key, waited_ms = saturating_millis(waited), "Lock wait timed out");
        publish(&self.inner.events, || LockEvent::timed_out(key, waited));
        KeyLockError::Timeout
    }
}

/// Nobody but the map references the lock
///
/// Holders and waiters each own a clone of the `Arc`, and new clones are
/// only made under the map lock.
fn is_idle(lock: &Arc<Mutex<()>>) -> bool {
    Arc::strong_count(lock) == 1
}

impl Default for KeyLock<String> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Clone> Clone for KeyLock<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: Clone> fmt::Debug for KeyLock<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys = self
            .inner
            .locks
            .lock()
            .map(|locks| locks.len())
            .unwrap_or_else(|poisoned| poisoned.into_inner().len());

        f.debug_struct("KeyLock")
            .field("keys", &keys)
            .field("config", &self.inner.config)
            .finish()
    }
}
